use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Condition, Expr, JoinType, Query, SimpleExpr};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter, Value,
};
use tracing::debug;

use crate::config::{StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::query::{bigint, col, column_value, id_value, read_i64, IdKind};
use crate::strategy::Strategy;
use crate::traits::TreeEntity;
use crate::unit_of_work::{NodeHandle, UnitOfWork};
use crate::wrapper::{primary_key, Identifier};

const PAIR_CHUNK: usize = 200;

/// Closure table maintenance: one `(ancestor, descendant, depth)` row per
/// ancestor/descendant pair, including a depth `0` row per node.
pub struct ClosureTable<E> {
    config: Arc<TreeConfig>,
    /// Inserted nodes whose closure rows are not written yet.
    pending_inserts: Vec<NodeHandle>,
    /// Parent changes waiting for a new parent to receive an identifier.
    pending_updates: Vec<(NodeHandle, Option<Identifier>, Option<NodeHandle>)>,
    /// Nodes whose level is recomputed from the closure rows.
    pending_levels: BTreeSet<Identifier>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: TreeEntity> ClosureTable<E> {
    pub fn new(config: Arc<TreeConfig>) -> Self {
        Self {
            config,
            pending_inserts: Vec::new(),
            pending_updates: Vec::new(),
            pending_levels: BTreeSet::new(),
            _marker: PhantomData,
        }
    }

    async fn insert_closures<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &UnitOfWork<E>,
        node: NodeHandle,
        parent: Option<NodeHandle>,
    ) -> Result<(), TreeError> {
        let closure = self.config.require_closure()?;
        let table = Alias::new(closure.table());
        let backend = conn.get_database_backend();
        let id = uow.require_id(node)?;
        let node_value = id_value::<E>(&id)?;

        let mut insert = Query::insert();
        insert
            .into_table(table.clone())
            .columns([
                col(closure.ancestor()),
                col(closure.descendant()),
                col(closure.depth()),
            ])
            .values([
                SimpleExpr::from(node_value.clone()),
                SimpleExpr::from(node_value.clone()),
                SimpleExpr::from(Value::Int(Some(0))),
            ])?;
        let result = conn.execute(backend.build(&insert)).await?;
        if result.rows_affected() != 1 {
            return Err(TreeError::runtime(format!(
                "failed to insert self closure for node {id}"
            )));
        }

        if let Some(parent) = parent {
            let parent_id = uow.require_id(parent)?;
            let mut select = Query::select();
            select
                .column(col(closure.ancestor()))
                .expr(Expr::val(node_value))
                .expr(Expr::col(col(closure.depth())).add(1))
                .from(table.clone())
                .and_where(Expr::col(col(closure.descendant())).eq(id_value::<E>(&parent_id)?));

            let mut insert = Query::insert();
            insert.into_table(table).columns([
                col(closure.ancestor()),
                col(closure.descendant()),
                col(closure.depth()),
            ]);
            insert.select_from(select)?;
            conn.execute(backend.build(&insert)).await?;
        }

        if self.config.level().is_some() {
            self.pending_levels.insert(id.clone());
        }
        debug!(entity = %self.config.entity_name(), node = %id, "inserted closure rows");
        Ok(())
    }

    /// Relink the closures of `node` and its subtree from `old_parent` to `new_parent`.
    pub async fn update_node<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &UnitOfWork<E>,
        node: NodeHandle,
        old_parent: Option<&Identifier>,
        new_parent: Option<NodeHandle>,
    ) -> Result<(), TreeError> {
        let closure = self.config.require_closure()?;
        let table = Alias::new(closure.table());
        let backend = conn.get_database_backend();
        let id_kind = IdKind::of::<E>()?;
        let node_id = uow.require_id(node)?;
        let node_value = id_value::<E>(&node_id)?;

        let parent_value = match new_parent {
            Some(parent) => {
                let parent_id = uow.require_id(parent)?;
                let parent_value = id_value::<E>(&parent_id)?;
                let mut count = Query::select();
                count
                    .expr_as(bigint(Expr::col(col(closure.ancestor())).count()), Alias::new("total"))
                    .from(table.clone())
                    .and_where(Expr::col(col(closure.ancestor())).eq(node_value.clone()))
                    .and_where(Expr::col(col(closure.descendant())).eq(parent_value.clone()));
                let cycles = match conn.query_one(backend.build(&count)).await? {
                    Some(row) => read_i64(&row, "total")?,
                    None => 0,
                };
                if cycles > 0 {
                    return Err(TreeError::unexpected(format!(
                        "cannot set child as parent to node: {node_id}"
                    )));
                }
                Some(parent_value)
            }
            None => None,
        };

        if old_parent.is_some() {
            let c1 = Alias::new("c1");
            let c2 = Alias::new("c2");
            let mut stale = Query::select();
            stale
                .expr_as(
                    id_kind.select(Expr::col((c2.clone(), col(closure.ancestor())))),
                    Alias::new("ancestor_id"),
                )
                .expr_as(
                    id_kind.select(Expr::col((c2.clone(), col(closure.descendant())))),
                    Alias::new("descendant_id"),
                )
                .from_as(table.clone(), c1.clone())
                .join_as(
                    JoinType::InnerJoin,
                    table.clone(),
                    c2.clone(),
                    Expr::col((c1.clone(), col(closure.descendant())))
                        .equals((c2.clone(), col(closure.descendant()))),
                )
                .and_where(Expr::col((c1.clone(), col(closure.ancestor()))).eq(node_value.clone()))
                .and_where(
                    Expr::col((c2.clone(), col(closure.depth())))
                        .gt(Expr::col((c1.clone(), col(closure.depth())))),
                );

            let mut pairs = Vec::new();
            for row in conn.query_all(backend.build(&stale)).await? {
                match (
                    id_kind.read(&row, "ancestor_id")?,
                    id_kind.read(&row, "descendant_id")?,
                ) {
                    (Some(ancestor), Some(descendant)) => pairs.push((ancestor, descendant)),
                    _ => continue,
                }
            }

            for chunk in pairs.chunks(PAIR_CHUNK) {
                let mut condition = Condition::any();
                for (ancestor, descendant) in chunk {
                    condition = condition.add(
                        Expr::col(col(closure.ancestor()))
                            .eq(id_value::<E>(ancestor)?)
                            .and(Expr::col(col(closure.descendant())).eq(id_value::<E>(descendant)?)),
                    );
                }
                let mut delete = Query::delete();
                delete.from_table(table.clone()).cond_where(condition);
                conn.execute(backend.build(&delete)).await.map_err(|err| {
                    TreeError::runtime(format!(
                        "failed to remove old closures of node {node_id}: {err}"
                    ))
                })?;
            }
            debug!(node = %node_id, removed = pairs.len(), "removed stale closure rows");
        }

        if let Some(parent_value) = parent_value {
            let c1 = Alias::new("c1");
            let c2 = Alias::new("c2");
            let mut select = Query::select();
            select
                .column((c1.clone(), col(closure.ancestor())))
                .column((c2.clone(), col(closure.descendant())))
                .expr(
                    Expr::col((c1.clone(), col(closure.depth())))
                        .add(Expr::col((c2.clone(), col(closure.depth()))))
                        .add(1),
                )
                .from_as(table.clone(), c1.clone())
                .join_as(
                    JoinType::InnerJoin,
                    table.clone(),
                    c2.clone(),
                    Expr::col((c2.clone(), col(closure.ancestor()))).eq(node_value.clone()),
                )
                .and_where(Expr::col((c1.clone(), col(closure.descendant()))).eq(parent_value));

            let mut insert = Query::insert();
            insert.into_table(table.clone()).columns([
                col(closure.ancestor()),
                col(closure.descendant()),
                col(closure.depth()),
            ]);
            insert.select_from(select)?;
            conn.execute(backend.build(&insert)).await?;
        }

        if self.config.level().is_some() {
            let mut subtree = Query::select();
            subtree
                .expr_as(id_kind.select(Expr::col(col(closure.descendant()))), Alias::new("node_id"))
                .from(table)
                .and_where(Expr::col(col(closure.ancestor())).eq(node_value));
            for row in conn.query_all(backend.build(&subtree)).await? {
                if let Some(id) = id_kind.read(&row, "node_id")? {
                    self.pending_levels.insert(id);
                }
            }
            self.pending_levels.insert(node_id.clone());
        }

        debug!(entity = %self.config.entity_name(), node = %node_id, "relinked closure rows");
        Ok(())
    }

    /// Write `MAX(depth) + 1` as the level of every pending node with one grouped query.
    async fn set_level_on_pending_nodes<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
    ) -> Result<(), TreeError> {
        let Some(level_column) = self.config.level() else {
            self.pending_levels.clear();
            return Ok(());
        };
        if self.pending_levels.is_empty() {
            return Ok(());
        }

        let closure = self.config.require_closure()?;
        let backend = conn.get_database_backend();
        let id_kind = IdKind::of::<E>()?;
        let pending = std::mem::take(&mut self.pending_levels);
        let values = pending
            .iter()
            .map(id_value::<E>)
            .collect::<Result<Vec<_>, _>>()?;

        let mut query = Query::select();
        query
            .expr_as(id_kind.select(Expr::col(col(closure.descendant()))), Alias::new("node_id"))
            .expr_as(
                bigint(Expr::col(col(closure.depth())).max().add(1)),
                Alias::new("node_level"),
            )
            .from(Alias::new(closure.table()))
            .and_where(Expr::col(col(closure.descendant())).is_in(values))
            .group_by_col(col(closure.descendant()));

        let mut levels: BTreeMap<i64, Vec<Identifier>> = BTreeMap::new();
        for row in conn.query_all(backend.build(&query)).await? {
            if let Some(id) = id_kind.read(&row, "node_id")? {
                levels.entry(read_i64(&row, "node_level")?).or_default().push(id);
            }
        }

        let pk = primary_key::<E>()?;
        for (level, ids) in levels {
            let values = ids
                .iter()
                .map(id_value::<E>)
                .collect::<Result<Vec<_>, _>>()?;
            E::update_many()
                .col_expr(
                    col(level_column),
                    Expr::value(column_value::<E>(level_column, Value::from(level))?),
                )
                .filter(pk.is_in(values))
                .exec(conn)
                .await?;

            for id in &ids {
                if let Some(handle) = uow.handle_of(id) {
                    uow.node_mut(handle)?
                        .set_synced(level_column, Value::from(level))?;
                }
            }
        }
        Ok(())
    }

    /// Identifiers of every descendant of `id`, excluding `id` itself.
    async fn descendant_ids<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &Identifier,
    ) -> Result<Vec<Identifier>, TreeError> {
        let closure = self.config.require_closure()?;
        let id_kind = IdKind::of::<E>()?;
        let mut query = Query::select();
        query
            .expr_as(id_kind.select(Expr::col(col(closure.descendant()))), Alias::new("node_id"))
            .from(Alias::new(closure.table()))
            .and_where(Expr::col(col(closure.ancestor())).eq(id_value::<E>(id)?))
            .and_where(Expr::col(col(closure.depth())).gt(0));

        let backend = conn.get_database_backend();
        let mut ids = Vec::new();
        for row in conn.query_all(backend.build(&query)).await? {
            if let Some(id) = id_kind.read(&row, "node_id")? {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl<E: TreeEntity> Strategy<E> for ClosureTable<E> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Closure
    }

    fn process_metadata_load(&self, config: &TreeConfig) -> Result<(), TreeError> {
        config.require_closure().map(|_| ())
    }

    async fn process_pre_persist(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        self.pending_inserts.push(node);
        Ok(())
    }

    async fn process_post_persist(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        for pending in &self.pending_inserts {
            if uow.id(*pending)?.is_none() {
                return Ok(());
            }
        }

        let mut queue: VecDeque<NodeHandle> = std::mem::take(&mut self.pending_inserts).into();
        let mut unresolved: HashSet<NodeHandle> = queue.iter().copied().collect();
        while !queue.is_empty() {
            let mut requeued = VecDeque::new();
            let mut progressed = false;
            while let Some(node) = queue.pop_front() {
                let parent = uow.parent_handle(conn, node).await?;
                if parent.is_some_and(|parent| unresolved.contains(&parent)) {
                    requeued.push_back(node);
                    continue;
                }
                self.insert_closures(conn, uow, node, parent).await?;
                unresolved.remove(&node);
                progressed = true;
            }
            if !requeued.is_empty() && !progressed {
                return Err(TreeError::unexpected(format!(
                    "{} nodes wait on parents that never receive closure rows",
                    requeued.len()
                )));
            }
            if !requeued.is_empty() {
                debug!(count = requeued.len(), "requeued nodes waiting for parent closures");
            }
            queue = requeued;
        }

        let mut waiting = Vec::new();
        for (node, old_parent, new_parent) in std::mem::take(&mut self.pending_updates) {
            let ready = match new_parent {
                Some(parent) => uow.id(parent)?.is_some(),
                None => true,
            };
            if ready {
                self.update_node(conn, uow, node, old_parent.as_ref(), new_parent)
                    .await?;
            } else {
                waiting.push((node, old_parent, new_parent));
            }
        }
        self.pending_updates = waiting;

        self.set_level_on_pending_nodes(conn, uow).await
    }

    async fn process_scheduled_update(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let Some(change) = uow
            .change_set(node)
            .and_then(|change_set| change_set.parent().cloned())
        else {
            return Ok(());
        };

        if let Some(parent) = change.new {
            if uow.id(parent)?.is_none() {
                debug!(node = %node, parent = %parent, "deferring closure update until parent insert");
                self.pending_updates.push((node, change.old, change.new));
                return Ok(());
            }
        }
        self.update_node(conn, uow, node, change.old.as_ref(), change.new)
            .await
    }

    async fn process_post_update(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        self.set_level_on_pending_nodes(conn, uow).await
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
        let id = uow.require_id(node)?;
        let descendants = self.descendant_ids(conn, &id).await?;
        if descendants.is_empty() {
            return Ok(());
        }

        let values = descendants
            .iter()
            .map(id_value::<E>)
            .collect::<Result<Vec<_>, _>>()?;
        let pk = primary_key::<E>()?;
        let select = E::find().filter(pk.is_in(values));
        for descendant in uow.load(conn, select).await? {
            uow.schedule_cascade_delete(descendant)?;
        }
        Ok(())
    }

    async fn process_post_remove(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let closure = self.config.require_closure()?;
        let id = uow.require_id(node)?;
        let value = id_value::<E>(&id)?;
        let mut delete = Query::delete();
        delete
            .from_table(Alias::new(closure.table()))
            .cond_where(
                Condition::any()
                    .add(Expr::col(col(closure.ancestor())).eq(value.clone()))
                    .add(Expr::col(col(closure.descendant())).eq(value)),
            );
        let backend = conn.get_database_backend();
        conn.execute(backend.build(&delete)).await?;
        Ok(())
    }

    fn on_flush_end(&mut self) {
        self.pending_inserts.clear();
        self.pending_updates.clear();
        self.pending_levels.clear();
    }
}
