use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::str::FromStr;

use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Select, Value,
};
use tracing::{debug, info, warn};

use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::lock::TreeTransaction;
use crate::query::{col, column_value, ensure_supported, id_value, scope_filter};
use crate::repository::Verification;
use crate::session::TreeSession;
use crate::strategy::{NestedSet, NodePosition, Position, Strategy};
use crate::traits::TreeEntity;
use crate::unit_of_work::{LoadedNodes, NodeHandle, TrackedNode, UnitOfWork};
use crate::wrapper::{column_of, primary_key, Identifier, NodeWrapper};

/// How far `move_up`/`move_down` go.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Steps {
    Count(u32),
    /// As far as the siblings allow.
    All,
}

impl From<u32> for Steps {
    fn from(count: u32) -> Self {
        Steps::Count(count)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Queries and maintenance operations for nested set trees.
#[derive(Debug, Default)]
pub struct NestedSetRepository<E: TreeEntity> {
    _marker: PhantomData<E>,
}

impl<E: TreeEntity> NestedSetRepository<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn config(&self) -> &'static TreeConfig {
        E::tree_config()
    }

    fn columns(&self) -> Result<(&'static str, &'static str), TreeError> {
        self.config().require_left_right()
    }

    fn scope(&self, model: &E::Model) -> Result<Option<Identifier>, TreeError> {
        match self.config().root() {
            Some(root) => Ok(Identifier::from_value(&model.property(root)?)),
            None => Ok(None),
        }
    }

    fn node_id(&self, model: &E::Model) -> Result<Identifier, TreeError> {
        model.identifier().ok_or_else(|| {
            TreeError::invalid_argument(format!(
                "node of {} has no identifier",
                self.config().entity_name()
            ))
        })
    }

    fn parent_filter(&self, parent: Option<&Identifier>) -> Result<SimpleExpr, TreeError> {
        let column = col(self.config().parent());
        match parent {
            Some(id) => Ok(Expr::col(column).eq(id_value::<E>(id)?)),
            None => Ok(Expr::col(column).is_null()),
        }
    }

    fn ordered(&self, select: Select<E>) -> Result<Select<E>, TreeError> {
        let (left, _) = self.columns()?;
        let mut select = select;
        if let Some(root) = self.config().root() {
            select = select.order_by_asc(column_of::<E>(root)?);
        }
        Ok(select.order_by_asc(column_of::<E>(left)?))
    }

    fn scoped(&self, select: Select<E>, model: &E::Model) -> Result<Select<E>, TreeError> {
        let scope = self.scope(model)?;
        match scope_filter::<E>(self.config().root(), scope.as_ref())? {
            Some(filter) => Ok(select.filter(filter)),
            None => Ok(select),
        }
    }

    pub async fn root_nodes(&self, conn: &DatabaseConnection) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let select = self.ordered(E::find().filter(self.parent_filter(None)?))?;
        Ok(select.all(conn).await?)
    }

    /// Children of `node`, or of the whole forest when `node` is `None`.
    pub async fn children(
        &self,
        conn: &DatabaseConnection,
        node: Option<&E::Model>,
        direct: bool,
        include_node: bool,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (left, right) = self.columns()?;
        let Some(node) = node else {
            let select = if direct {
                E::find().filter(self.parent_filter(None)?)
            } else {
                E::find()
            };
            return Ok(self.ordered(select)?.all(conn).await?);
        };

        if direct {
            let id = self.node_id(node)?;
            let select = self.ordered(E::find().filter(self.parent_filter(Some(&id))?))?;
            let mut children = select.all(conn).await?;
            if include_node {
                children.insert(0, node.clone());
            }
            return Ok(children);
        }

        let node_left = node.int_property(left)?;
        let node_right = node.int_property(right)?;
        let select = if include_node {
            E::find()
                .filter(Expr::col(col(left)).gte(node_left))
                .filter(Expr::col(col(right)).lte(node_right))
        } else {
            E::find()
                .filter(Expr::col(col(left)).gt(node_left))
                .filter(Expr::col(col(right)).lt(node_right))
        };
        let select = self.ordered(self.scoped(select, node)?)?;
        Ok(select.all(conn).await?)
    }

    /// Ancestors of `node` from the root down, ending with `node` itself.
    pub async fn path(
        &self,
        conn: &DatabaseConnection,
        node: &E::Model,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (left, right) = self.columns()?;
        let select = E::find()
            .filter(Expr::col(col(left)).lte(node.int_property(left)?))
            .filter(Expr::col(col(right)).gte(node.int_property(right)?));
        let select = self.ordered(self.scoped(select, node)?)?;
        Ok(select.all(conn).await?)
    }

    pub async fn child_count(
        &self,
        conn: &DatabaseConnection,
        node: Option<&E::Model>,
        direct: bool,
    ) -> Result<u64, TreeError> {
        ensure_supported(conn)?;
        let (left, right) = self.columns()?;
        match node {
            None if direct => Ok(E::find()
                .filter(self.parent_filter(None)?)
                .count(conn)
                .await?),
            None => Ok(E::find().count(conn).await?),
            Some(node) if direct => {
                let id = self.node_id(node)?;
                Ok(E::find()
                    .filter(self.parent_filter(Some(&id))?)
                    .count(conn)
                    .await?)
            }
            Some(node) => {
                let size = node.int_property(right)? - node.int_property(left)? - 1;
                Ok(u64::try_from(size / 2).unwrap_or(0))
            }
        }
    }

    /// Nodes without children, below `root` when given.
    pub async fn leafs(
        &self,
        conn: &DatabaseConnection,
        root: Option<&E::Model>,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (left, right) = self.columns()?;
        let mut select = E::find().filter(Expr::col(col(right)).eq(Expr::col(col(left)).add(1)));
        if let Some(root) = root {
            select = select
                .filter(Expr::col(col(left)).gt(root.int_property(left)?))
                .filter(Expr::col(col(right)).lt(root.int_property(right)?));
            select = self.scoped(select, root)?;
        }
        Ok(self.ordered(select)?.all(conn).await?)
    }

    fn siblings(&self, node: &E::Model) -> Result<Select<E>, TreeError> {
        let parent = Identifier::from_value(&node.property(self.config().parent())?);
        let select = E::find().filter(self.parent_filter(parent.as_ref())?);
        self.scoped(select, node)
    }

    pub async fn next_siblings(
        &self,
        conn: &DatabaseConnection,
        node: &E::Model,
        include_self: bool,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (left, _) = self.columns()?;
        let node_left = node.int_property(left)?;
        let bound = if include_self {
            Expr::col(col(left)).gte(node_left)
        } else {
            Expr::col(col(left)).gt(node_left)
        };
        let select = self.siblings(node)?.filter(bound);
        Ok(self.ordered(select)?.all(conn).await?)
    }

    pub async fn prev_siblings(
        &self,
        conn: &DatabaseConnection,
        node: &E::Model,
        include_self: bool,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (left, _) = self.columns()?;
        let node_left = node.int_property(left)?;
        let bound = if include_self {
            Expr::col(col(left)).lte(node_left)
        } else {
            Expr::col(col(left)).lt(node_left)
        };
        let select = self.siblings(node)?.filter(bound);
        Ok(self.ordered(select)?.all(conn).await?)
    }

    pub fn persist_as_first_child_of(
        &self,
        session: &mut TreeSession<E>,
        node: NodeHandle,
        parent: NodeHandle,
    ) -> Result<(), TreeError> {
        session.set_parent(node, Some(parent))?;
        session.set_position(node, Position::FirstChild, None)
    }

    pub fn persist_as_last_child_of(
        &self,
        session: &mut TreeSession<E>,
        node: NodeHandle,
        parent: NodeHandle,
    ) -> Result<(), TreeError> {
        session.set_parent(node, Some(parent))?;
        session.set_position(node, Position::LastChild, None)
    }

    pub fn persist_as_next_sibling_of(
        &self,
        session: &mut TreeSession<E>,
        node: NodeHandle,
        sibling: NodeHandle,
    ) -> Result<(), TreeError> {
        session.set_position(node, Position::NextSibling, Some(sibling))
    }

    pub fn persist_as_prev_sibling_of(
        &self,
        session: &mut TreeSession<E>,
        node: NodeHandle,
        sibling: NodeHandle,
    ) -> Result<(), TreeError> {
        session.set_position(node, Position::PrevSibling, Some(sibling))
    }

    /// Dispatch on a position name such as `"first-child"` or `"NextSibling"`.
    pub fn persist_as(
        &self,
        session: &mut TreeSession<E>,
        position: &str,
        node: NodeHandle,
        target: NodeHandle,
    ) -> Result<(), TreeError> {
        match Position::from_str(position)? {
            Position::FirstChild => self.persist_as_first_child_of(session, node, target),
            Position::LastChild => self.persist_as_last_child_of(session, node, target),
            Position::NextSibling => self.persist_as_next_sibling_of(session, node, target),
            Position::PrevSibling => self.persist_as_prev_sibling_of(session, node, target),
        }
    }

    /// Move `node` before its previous siblings. Returns whether it moved.
    pub async fn move_up(
        &self,
        db: &DatabaseConnection,
        session: &mut TreeSession<E>,
        node: NodeHandle,
        steps: Steps,
    ) -> Result<bool, TreeError> {
        self.move_among_siblings(db, session, node, steps, Direction::Up)
            .await
    }

    /// Move `node` after its next siblings. Returns whether it moved.
    pub async fn move_down(
        &self,
        db: &DatabaseConnection,
        session: &mut TreeSession<E>,
        node: NodeHandle,
        steps: Steps,
    ) -> Result<bool, TreeError> {
        self.move_among_siblings(db, session, node, steps, Direction::Down)
            .await
    }

    async fn move_among_siblings(
        &self,
        db: &DatabaseConnection,
        session: &mut TreeSession<E>,
        node: NodeHandle,
        steps: Steps,
        direction: Direction,
    ) -> Result<bool, TreeError> {
        ensure_supported(db)?;
        let lock = session.config().advisory_lock_strategy().clone();
        let config = session.config().clone();
        let uow = session.unit_of_work_mut()?;

        let txn = TreeTransaction::begin(&lock, db).await?;
        let mut strategy = NestedSet::<E>::new(config);
        let outcome = self
            .step_siblings(txn.connection(), uow, &mut strategy, node, steps, direction)
            .await;
        Strategy::<E>::on_flush_end(&mut strategy);

        match outcome {
            Ok(moved) => {
                if let Err(err) = txn.commit().await {
                    session.close();
                    return Err(err);
                }
                Ok(moved)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                session.close();
                Err(err)
            }
        }
    }

    async fn step_siblings(
        &self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        strategy: &mut NestedSet<E>,
        node: NodeHandle,
        steps: Steps,
        direction: Direction,
    ) -> Result<bool, TreeError> {
        let (left, right) = self.columns()?;
        let mut moved = 0u32;
        loop {
            if let Steps::Count(count) = steps {
                if moved >= count {
                    break;
                }
            }

            let current = uow.node(node)?.model().clone();
            let neighbour = match direction {
                Direction::Up => {
                    Expr::col(col(right)).eq(current.int_property(left)? - 1)
                }
                Direction::Down => {
                    Expr::col(col(left)).eq(current.int_property(right)? + 1)
                }
            };
            let select = self.scoped(E::find().filter(neighbour), &current)?;
            let Some(sibling) = select.one(conn).await? else {
                break;
            };
            let sibling = uow.register(sibling);
            let position = match direction {
                Direction::Up => Position::PrevSibling,
                Direction::Down => Position::NextSibling,
            };
            strategy
                .update_node(conn, uow, node, Some(sibling), NodePosition::new(position))
                .await?;
            moved += 1;
        }
        debug!(node = %node, moved, ?direction, "moved nested set node among siblings");
        Ok(moved > 0)
    }

    /// Delete `node` only, promoting its children one level up.
    ///
    /// Runs in its own transaction. On failure the session is closed.
    pub async fn remove_from_tree(
        &self,
        db: &DatabaseConnection,
        session: &mut TreeSession<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        ensure_supported(db)?;
        let lock = session.config().advisory_lock_strategy().clone();
        let config = session.config().clone();
        let uow = session.unit_of_work_mut()?;
        if uow.node(node)?.is_new() {
            return Err(TreeError::invalid_argument(format!(
                "node {node} is not stored yet and cannot be removed from the tree"
            )));
        }

        let txn = TreeTransaction::begin(&lock, db).await?;
        let mut strategy = NestedSet::<E>::new(config);
        let outcome = self
            .detach(txn.connection(), uow, &mut strategy, node)
            .await;
        let outcome = match outcome {
            Ok(()) => txn.commit().await,
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        };

        match outcome {
            Ok(()) => {
                uow.evict(node);
                Ok(())
            }
            Err(err) => {
                warn!(node = %node, error = %err, "remove from tree failed, closing session");
                session.close();
                Err(TreeError::TransactionFailed(Box::new(err)))
            }
        }
    }

    async fn detach(
        &self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        strategy: &mut NestedSet<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let config = self.config();
        let (left_column, right_column) = self.columns()?;
        let model = uow.node(node)?.model().clone();
        let id = self.node_id(&model)?;
        let left = model.int_property(left_column)?;
        let right = model.int_property(right_column)?;
        let scope = self.scope(&model)?;
        let parent = uow.stored_parent_id(node)?;

        if right == left + 1 {
            self.delete_row(conn, &id).await?;
            return strategy
                .shift_rl(conn, uow, right + 1, -2, scope.as_ref())
                .await;
        }

        if config.root().is_some() && parent.is_none() {
            let children = self
                .ordered(E::find().filter(self.parent_filter(Some(&id))?))?;
            for child in uow.load(conn, children).await? {
                let child_model = uow.node(child)?.model().clone();
                let child_left = child_model.int_property(left_column)?;
                let child_right = child_model.int_property(right_column)?;
                let child_id = self.node_id(&child_model)?;
                strategy
                    .shift_range_rl(
                        conn,
                        uow,
                        child_left,
                        child_right,
                        1 - child_left,
                        scope.as_ref(),
                        Some(&child_id),
                        -1,
                    )
                    .await?;
                uow.write_columns(
                    conn,
                    child,
                    vec![(config.parent().to_owned(), Value::BigInt(None))],
                )
                .await?;
            }
            return self.delete_row(conn, &id).await;
        }

        let new_parent = column_value::<E>(
            config.parent(),
            parent.as_ref().map_or(Value::BigInt(None), Identifier::to_value),
        )?;
        E::update_many()
            .col_expr(col(config.parent()), Expr::value(new_parent.clone()))
            .filter(self.parent_filter(Some(&id))?)
            .exec(conn)
            .await?;
        uow.patch_loaded(&mut |loaded: &mut TrackedNode<E::Model>| {
            if Identifier::from_value(&loaded.property(config.parent())?).as_ref() == Some(&id) {
                loaded.set_synced(config.parent(), new_parent.clone())?;
            }
            Ok(())
        })?;

        strategy
            .shift_range_rl(
                conn,
                uow,
                left + 1,
                right - 1,
                -1,
                scope.as_ref(),
                scope.as_ref(),
                -1,
            )
            .await?;
        self.delete_row(conn, &id).await?;
        strategy
            .shift_rl(conn, uow, right + 1, -2, scope.as_ref())
            .await
    }

    async fn delete_row(&self, conn: &DatabaseTransaction, id: &Identifier) -> Result<(), TreeError> {
        let pk = primary_key::<E>()?;
        let result = E::delete_many()
            .filter(pk.eq(id_value::<E>(id)?))
            .exec(conn)
            .await?;
        if result.rows_affected != 1 {
            return Err(TreeError::runtime(format!(
                "failed to delete node {id} of {}",
                self.config().entity_name()
            )));
        }
        Ok(())
    }

    /// Check every interval, parent link, root and level.
    pub async fn verify(&self, conn: &DatabaseConnection) -> Result<Verification, TreeError> {
        ensure_supported(conn)?;
        let config = self.config();
        let (left_column, right_column) = self.columns()?;
        let models = self.ordered(E::find())?.all(conn).await?;

        let mut nodes = Vec::with_capacity(models.len());
        for model in &models {
            nodes.push(NodeRow {
                id: self.node_id(model)?,
                parent: Identifier::from_value(&model.property(config.parent())?),
                left: model.int_property(left_column)?,
                right: model.int_property(right_column)?,
                level: config.level().map(|level| model.int_property(level)).transpose()?,
                scope: self.scope(model)?,
            });
        }
        let by_id: HashMap<&Identifier, &NodeRow> = nodes.iter().map(|row| (&row.id, row)).collect();

        let mut errors = Vec::new();
        let mut scopes: BTreeMap<Option<&Identifier>, Vec<&NodeRow>> = BTreeMap::new();
        for row in &nodes {
            scopes.entry(row.scope.as_ref()).or_default().push(row);
        }
        for (scope, rows) in &scopes {
            let suffix = match scope {
                Some(scope) => format!(" on tree root: {scope}"),
                None => String::new(),
            };
            let mut boundaries: HashMap<i64, usize> = HashMap::new();
            for row in rows {
                *boundaries.entry(row.left).or_default() += 1;
                *boundaries.entry(row.right).or_default() += 1;
            }
            let count = rows.len() as i64 * 2;
            for index in 1..=count {
                match boundaries.get(&index).copied().unwrap_or(0) {
                    0 => errors.push(format!("index [{index}], missing{suffix}")),
                    1 => {}
                    _ => errors.push(format!("index [{index}], duplicate{suffix}")),
                }
            }
        }

        for row in &nodes {
            let id = &row.id;
            if row.left >= row.right {
                errors.push(format!("node [{id}], left is greater than right"));
            }
            match row.parent.as_ref() {
                Some(parent_id) => {
                    let Some(parent) = by_id.get(parent_id) else {
                        errors.push(format!("node [{id}] has missing parent [{parent_id}]"));
                        continue;
                    };
                    if row.left < parent.left {
                        errors.push(format!(
                            "node [{id}] left is less than parent`s [{parent_id}] left value"
                        ));
                    }
                    if row.right > parent.right {
                        errors.push(format!(
                            "node [{id}] right is greater than parent`s [{parent_id}] right value"
                        ));
                    }
                    if config.root().is_some() && row.scope != parent.scope {
                        errors.push(format!(
                            "node [{id}] root is different from parent node [{parent_id}] root"
                        ));
                    }
                    if let (Some(level), Some(parent_level)) = (row.level, parent.level) {
                        if level != parent_level + 1 {
                            errors.push(format!(
                                "node [{id}] has invalid level {level}, expected {}",
                                parent_level + 1
                            ));
                        }
                    }
                }
                None => {
                    if let Some(level) = row.level {
                        if level != config.level_base() {
                            errors.push(format!(
                                "node [{id}] has invalid level {level}, expected {}",
                                config.level_base()
                            ));
                        }
                    }
                }
            }
        }

        for error in &errors {
            warn!(entity = %config.entity_name(), "{error}");
        }
        Ok(Verification::from_errors(errors))
    }

    /// Renumber every interval, level and root from the parent links.
    ///
    /// Returns the number of rows rewritten. Loaded nodes of `session` are patched.
    pub async fn recover(
        &self,
        db: &DatabaseConnection,
        session: &mut TreeSession<E>,
    ) -> Result<usize, TreeError> {
        ensure_supported(db)?;
        let config = self.config();
        let (left_column, right_column) = self.columns()?;
        let lock = session.config().advisory_lock_strategy().clone();
        let uow = session.unit_of_work_mut()?;

        let models = self.ordered(E::find())?.all(db).await?;
        let mut rows = Vec::with_capacity(models.len());
        for model in &models {
            rows.push(NodeRow {
                id: self.node_id(model)?,
                parent: Identifier::from_value(&model.property(config.parent())?),
                left: model.int_property(left_column)?,
                right: model.int_property(right_column)?,
                level: config.level().map(|level| model.int_property(level)).transpose()?,
                scope: self.scope(model)?,
            });
        }
        let custom_roots: HashMap<Identifier, Option<Identifier>> = if config.root_identifier_method() {
            models
                .iter()
                .filter_map(|model| model.identifier().map(|id| (id, E::root_identifier(model))))
                .collect()
        } else {
            HashMap::new()
        };

        let renumbered = renumber(config, &rows, &custom_roots)?;

        let changed: Vec<_> = rows
            .iter()
            .zip(renumbered.iter())
            .filter(|(row, fixed)| {
                row.left != fixed.left
                    || row.right != fixed.right
                    || (config.level().is_some() && row.level != fixed.level)
                    || (config.root().is_some() && row.scope != fixed.scope)
            })
            .map(|(_, fixed)| fixed)
            .collect();

        let txn = TreeTransaction::begin(&lock, db).await?;
        let outcome = self.write_recovered(txn.connection(), &changed).await;
        match outcome {
            Ok(()) => txn.commit().await?,
            Err(err) => {
                let _ = txn.rollback().await;
                return Err(err);
            }
        }

        for fixed in &changed {
            let Some(handle) = uow.handle_of(&fixed.id) else {
                continue;
            };
            for (column, value) in recovered_columns(config, fixed)? {
                uow.node_mut(handle)?.set_synced(&column, value)?;
            }
        }

        info!(
            entity = %config.entity_name(),
            nodes = rows.len(),
            updated = changed.len(),
            "recovered nested set"
        );
        Ok(changed.len())
    }

    async fn write_recovered(
        &self,
        conn: &DatabaseTransaction,
        changed: &[&NodeRow],
    ) -> Result<(), TreeError> {
        let config = self.config();
        let pk = primary_key::<E>()?;
        for fixed in changed {
            let mut update = E::update_many();
            for (column, value) in recovered_columns(config, fixed)? {
                let value = column_value::<E>(&column, value)?;
                update = update.col_expr(col(&column), Expr::value(value));
            }
            update
                .filter(pk.eq(id_value::<E>(&fixed.id)?))
                .exec(conn)
                .await?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct NodeRow {
    id: Identifier,
    parent: Option<Identifier>,
    left: i64,
    right: i64,
    level: Option<i64>,
    scope: Option<Identifier>,
}

fn recovered_columns(config: &TreeConfig, row: &NodeRow) -> Result<Vec<(String, Value)>, TreeError> {
    let (left, right) = config.require_left_right()?;
    let mut columns = vec![
        (left.to_owned(), Value::from(row.left)),
        (right.to_owned(), Value::from(row.right)),
    ];
    if let (Some(level), Some(value)) = (config.level(), row.level) {
        columns.push((level.to_owned(), Value::from(value)));
    }
    if let Some(root) = config.root() {
        let value = row.scope.as_ref().map_or(Value::BigInt(None), Identifier::to_value);
        columns.push((root.to_owned(), value));
    }
    Ok(columns)
}

/// Depth-first renumbering of `rows` following their parent links.
///
/// Siblings keep their current relative order. Nodes whose parent does not
/// exist are treated as roots.
fn renumber(
    config: &TreeConfig,
    rows: &[NodeRow],
    custom_roots: &HashMap<Identifier, Option<Identifier>>,
) -> Result<Vec<NodeRow>, TreeError> {
    let index: HashMap<&Identifier, usize> =
        rows.iter().enumerate().map(|(at, row)| (&row.id, at)).collect();

    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (at, row) in rows.iter().enumerate() {
        match row.parent.as_ref().and_then(|parent| index.get(parent)) {
            Some(parent) => children.entry(*parent).or_default().push(at),
            None => roots.push(at),
        }
    }
    let order = |at: &usize| (rows[*at].left, rows[*at].id.clone());
    roots.sort_by_key(order);
    for list in children.values_mut() {
        list.sort_by_key(order);
    }

    let mut fixed = rows.to_vec();
    let mut visited = HashSet::new();
    let mut counter = 0;
    for root in roots {
        let scope = config.root().map(|_| {
            custom_roots
                .get(&rows[root].id)
                .cloned()
                .flatten()
                .unwrap_or_else(|| rows[root].id.clone())
        });
        if config.root().is_some() {
            counter = 0;
        }

        let mut stack = vec![(root, config.level_base(), false)];
        while let Some((at, level, exiting)) = stack.pop() {
            counter += 1;
            if exiting {
                fixed[at].right = counter;
                continue;
            }
            if !visited.insert(at) {
                return Err(TreeError::invariant(format!(
                    "node [{}] is reachable twice, parent links form a cycle",
                    rows[at].id
                )));
            }
            fixed[at].left = counter;
            fixed[at].level = config.level().map(|_| level);
            fixed[at].scope = scope.clone();
            stack.push((at, level, true));
            if let Some(list) = children.get(&at) {
                for child in list.iter().rev() {
                    stack.push((*child, level + 1, false));
                }
            }
        }
    }

    if visited.len() != rows.len() {
        return Err(TreeError::invariant(format!(
            "{} nodes are unreachable from any root, parent links form a cycle",
            rows.len() - visited.len()
        )));
    }
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StrategyKind, TreeOptions};

    fn row(id: i64, parent: Option<i64>, left: i64) -> NodeRow {
        NodeRow {
            id: Identifier::Int(id),
            parent: parent.map(Identifier::Int),
            left,
            right: 0,
            level: None,
            scope: None,
        }
    }

    #[test]
    fn renumber_follows_parent_links() {
        let config = TreeOptions::default()
            .left("lft")
            .right("rgt")
            .level("lvl")
            .apply(TreeConfig::new(StrategyKind::Nested, "categories"));
        let rows = vec![row(1, None, 1), row(2, Some(1), 9), row(3, Some(1), 4), row(4, Some(3), 0)];

        let fixed = renumber(&config, &rows, &HashMap::new()).expect("renumber");
        let bounds: Vec<_> = fixed.iter().map(|row| (row.left, row.right, row.level)).collect();
        assert_eq!(
            bounds,
            vec![(1, 8, Some(0)), (6, 7, Some(1)), (2, 5, Some(1)), (3, 4, Some(2))]
        );
    }

    #[test]
    fn renumber_rejects_cycles() {
        let config = TreeOptions::default()
            .left("lft")
            .right("rgt")
            .apply(TreeConfig::new(StrategyKind::Nested, "categories"));
        let rows = vec![row(1, None, 1), row(2, Some(3), 2), row(3, Some(2), 3)];
        assert!(matches!(
            renumber(&config, &rows, &HashMap::new()),
            Err(TreeError::Invariant(_))
        ));
    }
}
