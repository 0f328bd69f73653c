use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Expr, Query};
use sea_orm::{ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter, Value};
use tracing::debug;

use crate::config::{StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::query::{bigint, col, column_value, read_i64, scope_filter};
use crate::strategy::Strategy;
use crate::traits::TreeEntity;
use crate::unit_of_work::{LoadedNodes, NodeHandle, TrackedNode, UnitOfWork};
use crate::wrapper::Identifier;

/// Where a node goes relative to its target.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Position {
    #[default]
    FirstChild,
    LastChild,
    PrevSibling,
    NextSibling,
}

impl Position {
    pub fn is_sibling(&self) -> bool {
        matches!(self, Position::PrevSibling | Position::NextSibling)
    }
}

impl FromStr for Position {
    type Err = TreeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|ch| !matches!(ch, '-' | '_' | ' '))
            .map(|ch| ch.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "firstchild" => Ok(Position::FirstChild),
            "lastchild" => Ok(Position::LastChild),
            "prevsibling" => Ok(Position::PrevSibling),
            "nextsibling" => Ok(Position::NextSibling),
            _ => Err(TreeError::invalid_argument(format!(
                "position {value:?} is not valid, use FirstChild, LastChild, PrevSibling or NextSibling"
            ))),
        }
    }
}

/// A position directive, optionally anchored to an explicit sibling.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePosition {
    pub position: Position,
    pub sibling: Option<NodeHandle>,
}

impl NodePosition {
    pub fn new(position: Position) -> Self {
        Self {
            position,
            sibling: None,
        }
    }

    pub fn next_to(position: Position, sibling: NodeHandle) -> Self {
        Self {
            position,
            sibling: Some(sibling),
        }
    }

    fn explicit_sibling(&self) -> Option<NodeHandle> {
        self.sibling.filter(|_| self.position.is_sibling())
    }
}

impl From<Position> for NodePosition {
    fn from(position: Position) -> Self {
        NodePosition::new(position)
    }
}

/// Nested set maintenance: every node owns a `[left, right]` interval enclosing
/// the intervals of its descendants.
pub struct NestedSet<E> {
    config: Arc<TreeConfig>,
    /// Nodes waiting for a parent or sibling to receive an interval, keyed by
    /// that node. Each entry keeps the parent it is positioned under.
    delayed: HashMap<NodeHandle, Vec<(NodeHandle, Option<NodeHandle>, NodePosition)>>,
    /// Highest right value per root scope seen in this flush.
    edges: HashMap<Option<Identifier>, i64>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: TreeEntity> NestedSet<E> {
    pub fn new(config: Arc<TreeConfig>) -> Self {
        Self {
            config,
            delayed: HashMap::new(),
            edges: HashMap::new(),
            _marker: PhantomData,
        }
    }

    fn scope_of(&self, uow: &UnitOfWork<E>, node: NodeHandle) -> Result<Option<Identifier>, TreeError> {
        match self.config.root() {
            Some(root) => Ok(Identifier::from_value(&uow.node(node)?.property(root)?)),
            None => Ok(None),
        }
    }

    /// Parent and position a flush should apply to `node`.
    async fn target<C: ConnectionTrait>(
        &self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
        default: Position,
    ) -> Result<(Option<NodeHandle>, NodePosition), TreeError> {
        let position = uow
            .node(node)?
            .position()
            .unwrap_or_else(|| NodePosition::new(default));
        if let Some(sibling) = position.explicit_sibling() {
            let parent = uow.parent_handle(conn, sibling).await?;
            uow.assign_parent(node, parent)?;
            return Ok((parent, position));
        }
        let parent = uow.parent_handle(conn, node).await?;
        Ok((parent, position))
    }

    /// Move `node` relative to `parent`, or make it a root when `parent` is `None`.
    ///
    /// Without an explicit sibling, sibling positions treat `parent` as the sibling.
    pub async fn update_node<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
        parent: Option<NodeHandle>,
        position: NodePosition,
    ) -> Result<(), TreeError> {
        let mut work = vec![(node, parent, position)];
        while let Some((node, parent, position)) = work.pop() {
            if !self.position_node(conn, uow, node, parent, position).await? {
                continue;
            }
            if let Some(waiting) = self.delayed.remove(&node) {
                for (child, parent, position) in waiting.into_iter().rev() {
                    work.push((child, parent, position));
                }
            }
        }
        Ok(())
    }

    /// Returns `false` when the node was delayed until its target has an interval.
    async fn position_node<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
        parent: Option<NodeHandle>,
        position: NodePosition,
    ) -> Result<bool, TreeError> {
        let config = self.config.clone();
        let (left_column, right_column) = config.require_left_right()?;

        let current = uow.node(node)?;
        let mut left = current.int_property(left_column)?;
        let mut right = current.int_property(right_column)?;
        let is_new = left == 0 && right == 0;
        if is_new {
            left = 1;
            right = 2;
        }
        let node_id = uow.require_id(node)?;
        let scope = self.scope_of(uow, node)?;
        let tree_size = right - left + 1;
        let mut level = config.level_base();
        let mut parent = parent;
        let new_scope;
        let start;

        if let Some(target) = parent {
            let target_node = uow.node(target)?;
            let parent_left = target_node.int_property(left_column)?;
            let parent_right = target_node.int_property(right_column)?;
            if parent_left == 0 && parent_right == 0 {
                debug!(node = %node_id, target = %target, "target has no interval yet, delaying node");
                self.delayed
                    .entry(target)
                    .or_default()
                    .push((node, Some(target), position));
                return Ok(false);
            }
            if let Some(level_column) = config.level() {
                level = target_node.int_property(level_column)?;
            }
            let parent_scope = self.scope_of(uow, target)?;
            if !is_new && scope == parent_scope && parent_left >= left && parent_right <= right {
                return Err(TreeError::unexpected(format!(
                    "cannot set child as parent to node: {node_id}"
                )));
            }

            start = match (position.position, position.explicit_sibling()) {
                (Position::FirstChild, _) => {
                    level += 1;
                    parent_left + 1
                }
                (Position::LastChild, _) => {
                    level += 1;
                    parent_right
                }
                (sibling_position, Some(sibling)) => {
                    let sibling_node = uow.node(sibling)?;
                    let sibling_left = sibling_node.int_property(left_column)?;
                    let sibling_right = sibling_node.int_property(right_column)?;
                    if sibling_left == 0 && sibling_right == 0 {
                        debug!(node = %node_id, sibling = %sibling, "sibling has no interval yet, delaying node");
                        self.delayed
                            .entry(sibling)
                            .or_default()
                            .push((node, parent, position));
                        return Ok(false);
                    }
                    level += 1;
                    if sibling_position == Position::PrevSibling {
                        sibling_left
                    } else {
                        sibling_right + 1
                    }
                }
                (sibling_position, None) => {
                    let grandparent = uow.parent_handle(conn, target).await?;
                    if grandparent.is_none() && (is_new || config.root().is_some()) {
                        return Err(TreeError::unexpected(
                            "cannot persist sibling for a root node, tree operation is not possible",
                        ));
                    }
                    uow.assign_parent(node, grandparent)?;
                    parent = grandparent;
                    if sibling_position == Position::PrevSibling {
                        parent_left
                    } else {
                        parent_right + 1
                    }
                }
            };

            self.shift_rl(conn, uow, start, tree_size, parent_scope.as_ref())
                .await?;
            if !is_new && scope == parent_scope {
                if left >= start {
                    left += tree_size;
                }
                if right >= start {
                    right += tree_size;
                }
            }
            new_scope = parent_scope;
        } else {
            let target_scope = match config.root() {
                None => None,
                Some(_) => {
                    let custom = if config.root_identifier_method() {
                        E::root_identifier(uow.node(node)?.model())
                    } else {
                        None
                    };
                    Some(custom.unwrap_or_else(|| node_id.clone()))
                }
            };
            let edge = match self.edges.get(&target_scope) {
                Some(edge) => *edge,
                None => self.max(conn, target_scope.as_ref()).await?,
            };
            start = edge + 1;
            self.edges.insert(target_scope.clone(), edge + tree_size);
            new_scope = target_scope;
        }

        let diff = start - left;
        debug!(
            entity = %config.entity_name(),
            node = %node_id,
            start,
            diff,
            "positioning nested set node"
        );

        if is_new {
            let mut columns = vec![
                (left_column.to_owned(), Value::from(left + diff)),
                (right_column.to_owned(), Value::from(right + diff)),
            ];
            if let Some(level_column) = config.level() {
                columns.push((level_column.to_owned(), Value::from(level)));
            }
            if let Some(root) = config.root() {
                columns.push((root.to_owned(), scope_value(new_scope.as_ref())));
            }
            columns.push((config.parent().to_owned(), parent_value(uow, parent)?));
            uow.write_columns(conn, node, columns).await?;
        } else {
            let level_delta = match config.level() {
                Some(level_column) => level - uow.node(node)?.int_property(level_column)?,
                None => 0,
            };
            self.shift_range_rl(
                conn,
                uow,
                left,
                right,
                diff,
                scope.as_ref(),
                new_scope.as_ref(),
                level_delta,
            )
            .await?;
            self.shift_rl(conn, uow, left, -tree_size, scope.as_ref())
                .await?;

            let stored = uow
                .node(node)?
                .original_property(config.parent())?
                .and_then(|value| Identifier::from_value(&value));
            let assigned = match parent {
                Some(parent) => Some(uow.require_id(parent)?),
                None => None,
            };
            if stored != assigned {
                let value = parent_value(uow, parent)?;
                uow.write_columns(conn, node, vec![(config.parent().to_owned(), value)])
                    .await?;
            }
        }

        Ok(true)
    }

    /// Shift every boundary `>= first` by `delta` within one root scope.
    pub async fn shift_rl<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        first: i64,
        delta: i64,
        scope: Option<&Identifier>,
    ) -> Result<(), TreeError> {
        let config = self.config.clone();
        let (left_column, right_column) = config.require_left_right()?;
        let filter = scope_filter::<E>(config.root(), scope)?;

        for column in [left_column, right_column] {
            let mut update = E::update_many()
                .col_expr(col(column), Expr::col(col(column)).add(delta))
                .filter(Expr::col(col(column)).gte(first));
            if let Some(filter) = filter.clone() {
                update = update.filter(filter);
            }
            update.exec(conn).await?;
        }

        uow.patch_loaded(&mut |loaded: &mut TrackedNode<E::Model>| {
            if let Some(root) = config.root() {
                if Identifier::from_value(&loaded.property(root)?).as_ref() != scope {
                    return Ok(());
                }
            }
            for column in [left_column, right_column] {
                let value = loaded.int_property(column)?;
                if value >= first {
                    loaded.set_synced(column, Value::from(value + delta))?;
                }
            }
            Ok(())
        })?;

        if let Some(edge) = self.edges.get_mut(&scope.cloned()) {
            if *edge >= first {
                *edge += delta;
            }
        }

        debug!(entity = %config.entity_name(), first, delta, "shifted nested set boundaries");
        Ok(())
    }

    /// Shift the interval range `[first, last]` by `delta`, moving it to
    /// `dest_scope` and adjusting levels by `level_delta`.
    #[allow(clippy::too_many_arguments)]
    pub async fn shift_range_rl<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        first: i64,
        last: i64,
        delta: i64,
        scope: Option<&Identifier>,
        dest_scope: Option<&Identifier>,
        level_delta: i64,
    ) -> Result<(), TreeError> {
        let config = self.config.clone();
        let (left_column, right_column) = config.require_left_right()?;
        let move_scope = config.root().filter(|_| scope != dest_scope);

        let mut update = E::update_many()
            .col_expr(col(left_column), Expr::col(col(left_column)).add(delta))
            .col_expr(col(right_column), Expr::col(col(right_column)).add(delta));
        if let Some(level) = config.level() {
            update = update.col_expr(col(level), Expr::col(col(level)).add(level_delta));
        }
        if let Some(root) = move_scope {
            let value = column_value::<E>(root, scope_value(dest_scope))?;
            update = update.col_expr(col(root), Expr::value(value));
        }
        update = update
            .filter(Expr::col(col(left_column)).gte(first))
            .filter(Expr::col(col(right_column)).lte(last));
        if let Some(filter) = scope_filter::<E>(config.root(), scope)? {
            update = update.filter(filter);
        }
        update.exec(conn).await?;

        uow.patch_loaded(&mut |loaded: &mut TrackedNode<E::Model>| {
            if let Some(root) = config.root() {
                if Identifier::from_value(&loaded.property(root)?).as_ref() != scope {
                    return Ok(());
                }
            }
            let left = loaded.int_property(left_column)?;
            let right = loaded.int_property(right_column)?;
            if left < first || right > last {
                return Ok(());
            }
            loaded.set_synced(left_column, Value::from(left + delta))?;
            loaded.set_synced(right_column, Value::from(right + delta))?;
            if let Some(level) = config.level() {
                let current = loaded.int_property(level)?;
                loaded.set_synced(level, Value::from(current + level_delta))?;
            }
            if let Some(root) = move_scope {
                loaded.set_synced(root, scope_value(dest_scope))?;
            }
            Ok(())
        })?;

        debug!(
            entity = %config.entity_name(),
            first,
            last,
            delta,
            level_delta,
            "shifted nested set range"
        );
        Ok(())
    }

    /// Highest right value stored in a root scope, `0` for an empty scope.
    pub async fn max<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: Option<&Identifier>,
    ) -> Result<i64, TreeError> {
        let (_, right_column) = self.config.require_left_right()?;
        let mut query = Query::select();
        query
            .expr_as(bigint(Expr::col(col(right_column)).max()), Alias::new("edge"))
            .from(E::default());
        if let Some(filter) = scope_filter::<E>(self.config.root(), scope)? {
            query.and_where(filter);
        }

        let backend = conn.get_database_backend();
        match conn.query_one(backend.build(&query)).await? {
            Some(row) => read_i64(&row, "edge"),
            None => Ok(0),
        }
    }
}

fn scope_value(scope: Option<&Identifier>) -> Value {
    scope.map_or(Value::BigInt(None), Identifier::to_value)
}

fn parent_value<E: TreeEntity>(
    uow: &UnitOfWork<E>,
    parent: Option<NodeHandle>,
) -> Result<Value, TreeError> {
    match parent {
        Some(parent) => Ok(uow.require_id(parent)?.to_value()),
        None => Ok(Value::BigInt(None)),
    }
}

#[async_trait]
impl<E: TreeEntity> Strategy<E> for NestedSet<E> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Nested
    }

    fn process_metadata_load(&self, config: &TreeConfig) -> Result<(), TreeError> {
        config.require_left_right().map(|_| ())
    }

    async fn process_scheduled_insertion(
        &mut self,
        _conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let (left_column, right_column) = self.config.require_left_right()?;
        let tracked = uow.node_mut(node)?;
        tracked.set_property(left_column, Value::from(0i64))?;
        tracked.set_property(right_column, Value::from(0i64))?;
        if let Some(level) = self.config.level() {
            tracked.set_property(level, Value::from(0i64))?;
        }
        Ok(())
    }

    async fn process_post_persist(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let (parent, position) = self.target(conn, uow, node, Position::LastChild).await?;
        self.update_node(conn, uow, node, parent, position).await
    }

    async fn process_scheduled_update(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let Some(change_set) = uow.change_set(node) else {
            return Ok(());
        };
        if let Some(root) = self.config.root() {
            if change_set.has_field(root) {
                return Err(TreeError::unexpected(
                    "Root cannot be changed manually, change parent instead",
                ));
            }
        }
        if change_set.parent().is_none() && !uow.node(node)?.is_repositioned() {
            return Ok(());
        }

        let (parent, position) = self.target(conn, uow, node, Position::FirstChild).await?;
        self.update_node(conn, uow, node, parent, position).await
    }

    async fn process_scheduled_delete(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        if uow.is_cascade_deleted(node) {
            return Ok(());
        }
        let (left_column, right_column) = self.config.require_left_right()?;
        let tracked = uow.node(node)?;
        let left = tracked.int_property(left_column)?;
        let right = tracked.int_property(right_column)?;
        if left == 0 || right == 0 {
            return Ok(());
        }
        let scope = self.scope_of(uow, node)?;
        let size = right - left + 1;

        if size > 2 {
            let mut select = E::find()
                .filter(Expr::col(col(left_column)).gt(left))
                .filter(Expr::col(col(left_column)).lt(right));
            if let Some(filter) = scope_filter::<E>(self.config.root(), scope.as_ref())? {
                select = select.filter(filter);
            }
            for descendant in uow.load(conn, select).await? {
                if descendant != node {
                    uow.schedule_cascade_delete(descendant)?;
                }
            }
        }

        self.shift_rl(conn, uow, right + 1, -size, scope.as_ref())
            .await
    }

    fn on_flush_end(&mut self) {
        self.delayed.clear();
        self.edges.clear();
    }
}
