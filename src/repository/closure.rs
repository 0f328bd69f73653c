use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;

use sea_orm::sea_query::{Alias, Condition, Expr, Order, Query, SimpleExpr};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Value,
};
use tracing::{info, warn};

use crate::config::{ClosureTable as ClosureLayout, TreeConfig};
use crate::error::TreeError;
use crate::lock::TreeTransaction;
use crate::query::{bigint, col, column_value, ensure_supported, id_value, read_i64, IdKind};
use crate::repository::{Verification, BATCH_SIZE};
use crate::session::TreeSession;
use crate::strategy::{ClosureTable, Strategy};
use crate::traits::TreeEntity;
use crate::unit_of_work::{NodeHandle, UnitOfWork};
use crate::wrapper::{primary_key, Identifier, NodeWrapper};

type Pair = (Identifier, Identifier);

/// Queries and consistency tools for closure table trees.
#[derive(Debug, Default)]
pub struct ClosureTableRepository<E: TreeEntity> {
    _marker: PhantomData<E>,
}

impl<E: TreeEntity> ClosureTableRepository<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn config(&self) -> &'static TreeConfig {
        E::tree_config()
    }

    fn closure(&self) -> Result<&'static ClosureLayout, TreeError> {
        self.config().require_closure()
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

    pub async fn root_nodes(&self, conn: &DatabaseConnection) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let pk = primary_key::<E>()?;
        Ok(E::find()
            .filter(self.parent_filter(None)?)
            .order_by_asc(pk)
            .all(conn)
            .await?)
    }

    /// Closure rows below `ancestor`, as `(descendant, depth)` ordered by depth.
    async fn descendants_of<C: ConnectionTrait>(
        &self,
        conn: &C,
        ancestor: &Identifier,
        min_depth: i64,
    ) -> Result<Vec<(Identifier, i64)>, TreeError> {
        let closure = self.closure()?;
        let id_kind = IdKind::of::<E>()?;
        let mut query = Query::select();
        query
            .expr_as(id_kind.select(Expr::col(col(closure.descendant()))), Alias::new("node_id"))
            .expr_as(bigint(Expr::col(col(closure.depth()))), Alias::new("node_depth"))
            .from(Alias::new(closure.table()))
            .and_where(Expr::col(col(closure.ancestor())).eq(id_value::<E>(ancestor)?))
            .and_where(Expr::col(col(closure.depth())).gte(min_depth))
            .order_by(col(closure.depth()), Order::Asc);

        let backend = conn.get_database_backend();
        let mut rows = Vec::new();
        for row in conn.query_all(backend.build(&query)).await? {
            if let Some(id) = id_kind.read(&row, "node_id")? {
                rows.push((id, read_i64(&row, "node_depth")?));
            }
        }
        Ok(rows)
    }

    /// Fetch the models of `ids` in the order given.
    async fn models_in_order(
        &self,
        conn: &DatabaseConnection,
        ids: &[Identifier],
    ) -> Result<Vec<E::Model>, TreeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let pk = primary_key::<E>()?;
        let mut by_id: HashMap<Identifier, E::Model> = HashMap::new();
        for chunk in ids.chunks(BATCH_SIZE) {
            let values = chunk
                .iter()
                .map(id_value::<E>)
                .collect::<Result<Vec<_>, _>>()?;
            for model in E::find().filter(pk.is_in(values)).all(conn).await? {
                if let Some(id) = model.identifier() {
                    by_id.insert(id, model);
                }
            }
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
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
        let pk = primary_key::<E>()?;
        let Some(node) = node else {
            let select = if direct {
                E::find().filter(self.parent_filter(None)?)
            } else {
                E::find()
            };
            return Ok(select.order_by_asc(pk).all(conn).await?);
        };

        let id = self.node_id(node)?;
        if direct {
            let mut children = E::find()
                .filter(self.parent_filter(Some(&id))?)
                .order_by_asc(pk)
                .all(conn)
                .await?;
            if include_node {
                children.insert(0, node.clone());
            }
            return Ok(children);
        }

        let min_depth = if include_node { 0 } else { 1 };
        let mut rows = self.descendants_of(conn, &id, min_depth).await?;
        rows.sort_by(|(a, depth_a), (b, depth_b)| depth_a.cmp(depth_b).then_with(|| a.cmp(b)));
        let ids: Vec<_> = rows.into_iter().map(|(id, _)| id).collect();
        self.models_in_order(conn, &ids).await
    }

    /// Ancestors of `node` from the root down, ending with `node` itself.
    pub async fn path(
        &self,
        conn: &DatabaseConnection,
        node: &E::Model,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let closure = self.closure()?;
        let id_kind = IdKind::of::<E>()?;
        let id = self.node_id(node)?;
        let mut query = Query::select();
        query
            .expr_as(id_kind.select(Expr::col(col(closure.ancestor()))), Alias::new("node_id"))
            .from(Alias::new(closure.table()))
            .and_where(Expr::col(col(closure.descendant())).eq(id_value::<E>(&id)?))
            .order_by(col(closure.depth()), Order::Desc);

        let backend = conn.get_database_backend();
        let mut ids = Vec::new();
        for row in conn.query_all(backend.build(&query)).await? {
            if let Some(id) = id_kind.read(&row, "node_id")? {
                ids.push(id);
            }
        }
        self.models_in_order(conn, &ids).await
    }

    pub async fn child_count(
        &self,
        conn: &DatabaseConnection,
        node: Option<&E::Model>,
        direct: bool,
    ) -> Result<u64, TreeError> {
        ensure_supported(conn)?;
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
                let id = self.node_id(node)?;
                Ok(self.descendants_of(conn, &id, 1).await?.len() as u64)
            }
        }
    }

    /// Delete `node` only, attaching its children to its parent.
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
        let mut strategy = ClosureTable::<E>::new(config);
        let outcome = self
            .detach(txn.connection(), uow, &mut strategy, node)
            .await;
        Strategy::<E>::on_flush_end(&mut strategy);
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
        strategy: &mut ClosureTable<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let config = self.config();
        let closure = self.closure()?;
        let id = uow.require_id(node)?;
        let new_parent = uow.parent_handle(conn, node).await?;
        let new_parent_value = match new_parent {
            Some(parent) => uow.require_id(parent)?.to_value(),
            None => Value::BigInt(None),
        };

        let children = E::find().filter(self.parent_filter(Some(&id))?);
        for child in uow.load(conn, children).await? {
            strategy
                .update_node(conn, uow, child, Some(&id), new_parent)
                .await?;
            uow.write_columns(
                conn,
                child,
                vec![(config.parent().to_owned(), new_parent_value.clone())],
            )
            .await?;
        }

        let value = id_value::<E>(&id)?;
        let mut delete = Query::delete();
        delete
            .from_table(Alias::new(closure.table()))
            .cond_where(
                Condition::any()
                    .add(Expr::col(col(closure.ancestor())).eq(value.clone()))
                    .add(Expr::col(col(closure.descendant())).eq(value.clone())),
            );
        let backend = conn.get_database_backend();
        conn.execute(backend.build(&delete)).await?;

        let pk = primary_key::<E>()?;
        let result = E::delete_many().filter(pk.eq(value)).exec(conn).await?;
        if result.rows_affected != 1 {
            return Err(TreeError::runtime(format!(
                "failed to delete node {id} of {}",
                config.entity_name()
            )));
        }

        strategy.process_post_update(conn, uow, node).await
    }

    /// Parent link of every node, keyed by identifier.
    async fn parent_links<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<Links, TreeError> {
        let config = self.config();
        let mut links = BTreeMap::new();
        for model in E::find().all(conn).await? {
            let id = self.node_id(&model)?;
            let parent = Identifier::from_value(&model.property(config.parent())?);
            let level = config
                .level()
                .map(|level| model.int_property(level))
                .transpose()?;
            links.insert(id, (parent, level));
        }
        Ok(links)
    }

    async fn stored_closures<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<BTreeMap<Pair, i64>, TreeError> {
        let closure = self.closure()?;
        let id_kind = IdKind::of::<E>()?;
        let mut query = Query::select();
        query
            .expr_as(id_kind.select(Expr::col(col(closure.ancestor()))), Alias::new("ancestor_id"))
            .expr_as(id_kind.select(Expr::col(col(closure.descendant()))), Alias::new("descendant_id"))
            .expr_as(bigint(Expr::col(col(closure.depth()))), Alias::new("node_depth"))
            .from(Alias::new(closure.table()));

        let backend = conn.get_database_backend();
        let mut stored = BTreeMap::new();
        for row in conn.query_all(backend.build(&query)).await? {
            if let (Some(ancestor), Some(descendant)) = (
                id_kind.read(&row, "ancestor_id")?,
                id_kind.read(&row, "descendant_id")?,
            ) {
                stored.insert((ancestor, descendant), read_i64(&row, "node_depth")?);
            }
        }
        Ok(stored)
    }

    /// Compare the closure table and levels against the parent links.
    pub async fn verify(&self, conn: &DatabaseConnection) -> Result<Verification, TreeError> {
        ensure_supported(conn)?;
        let links = self.parent_links(conn).await?;
        let expected = expected_closures(&links);
        let stored = self.stored_closures(conn).await?;
        let mut errors = Vec::new();

        for (pair, depth) in &expected {
            let (ancestor, descendant) = pair;
            match stored.get(pair) {
                None if ancestor == descendant => {
                    errors.push(format!("node [{descendant}] is missing its self closure"));
                }
                None => errors.push(format!(
                    "missing closure [{ancestor}, {descendant}] with depth {depth}"
                )),
                Some(actual) if actual != depth => errors.push(format!(
                    "closure [{ancestor}, {descendant}] has depth {actual}, expected {depth}"
                )),
                Some(_) => {}
            }
        }
        for (ancestor, descendant) in stored.keys() {
            if expected.contains_key(&(ancestor.clone(), descendant.clone())) {
                continue;
            }
            if !links.contains_key(ancestor) || !links.contains_key(descendant) {
                errors.push(format!(
                    "closure [{ancestor}, {descendant}] references a missing node"
                ));
            } else {
                errors.push(format!("invalid closure [{ancestor}, {descendant}]"));
            }
        }

        if self.config().level().is_some() {
            let mut depths: HashMap<&Identifier, i64> = HashMap::new();
            for ((_, descendant), depth) in &expected {
                let deepest = depths.entry(descendant).or_default();
                *deepest = (*deepest).max(*depth);
            }
            for (id, (_, level)) in &links {
                let depth = depths.get(id).copied().unwrap_or(0);
                if *level != Some(depth + 1) {
                    errors.push(format!(
                        "node [{id}] has invalid level {}, expected {}",
                        level.unwrap_or_default(),
                        depth + 1
                    ));
                }
            }
        }

        for error in &errors {
            warn!(entity = %self.config().entity_name(), "{error}");
        }
        Ok(Verification::from_errors(errors))
    }

    /// Rebuild the closure table and levels from the parent links.
    ///
    /// Returns the number of rows touched by the three steps.
    pub async fn recover(&self, db: &DatabaseConnection) -> Result<usize, TreeError> {
        let removed = self.cleanup_closure(db).await?;
        let inserted = self.rebuild_closure(db).await?;
        let levels = self.update_level_values(db).await?;
        info!(
            entity = %self.config().entity_name(),
            removed,
            inserted,
            levels,
            "recovered closure table"
        );
        Ok(removed + inserted + levels)
    }

    /// Delete closure rows the parent links do not imply, or whose depth is wrong.
    pub async fn cleanup_closure(&self, db: &DatabaseConnection) -> Result<usize, TreeError> {
        ensure_supported(db)?;
        let closure = self.closure()?;
        let links = self.parent_links(db).await?;
        let expected = expected_closures(&links);
        let stale: Vec<Pair> = self
            .stored_closures(db)
            .await?
            .into_iter()
            .filter(|(pair, depth)| expected.get(pair) != Some(depth))
            .map(|(pair, _)| pair)
            .collect();

        let lock = self.config().advisory_lock_strategy();
        for batch in stale.chunks(BATCH_SIZE) {
            let txn = TreeTransaction::begin(lock, db).await?;
            let outcome = self.delete_pairs(txn.connection(), closure, batch).await;
            match outcome {
                Ok(()) => txn.commit().await?,
                Err(err) => {
                    let _ = txn.rollback().await;
                    return Err(err);
                }
            }
        }
        info!(entity = %self.config().entity_name(), removed = stale.len(), "cleaned up closure table");
        Ok(stale.len())
    }

    async fn delete_pairs(
        &self,
        conn: &DatabaseTransaction,
        closure: &ClosureLayout,
        pairs: &[Pair],
    ) -> Result<(), TreeError> {
        let backend = conn.get_database_backend();
        for chunk in pairs.chunks(100) {
            let mut condition = Condition::any();
            for (ancestor, descendant) in chunk {
                condition = condition.add(
                    Expr::col(col(closure.ancestor()))
                        .eq(id_value::<E>(ancestor)?)
                        .and(Expr::col(col(closure.descendant())).eq(id_value::<E>(descendant)?)),
                );
            }
            let mut delete = Query::delete();
            delete
                .from_table(Alias::new(closure.table()))
                .cond_where(condition);
            conn.execute(backend.build(&delete)).await?;
        }
        Ok(())
    }

    /// Insert the closure rows the parent links imply but the table lacks.
    pub async fn rebuild_closure(&self, db: &DatabaseConnection) -> Result<usize, TreeError> {
        ensure_supported(db)?;
        let closure = self.closure()?;
        let links = self.parent_links(db).await?;
        let stored = self.stored_closures(db).await?;
        let missing: Vec<(Pair, i64)> = expected_closures(&links)
            .into_iter()
            .filter(|(pair, _)| !stored.contains_key(pair))
            .collect();

        let lock = self.config().advisory_lock_strategy();
        for batch in missing.chunks(BATCH_SIZE) {
            let txn = TreeTransaction::begin(lock, db).await?;
            let outcome = self.insert_rows(txn.connection(), closure, batch).await;
            match outcome {
                Ok(()) => txn.commit().await?,
                Err(err) => {
                    let _ = txn.rollback().await;
                    return Err(err);
                }
            }
        }
        info!(entity = %self.config().entity_name(), inserted = missing.len(), "rebuilt closure table");
        Ok(missing.len())
    }

    async fn insert_rows(
        &self,
        conn: &DatabaseTransaction,
        closure: &ClosureLayout,
        rows: &[(Pair, i64)],
    ) -> Result<(), TreeError> {
        let backend = conn.get_database_backend();
        for chunk in rows.chunks(100) {
            let mut insert = Query::insert();
            insert.into_table(Alias::new(closure.table())).columns([
                col(closure.ancestor()),
                col(closure.descendant()),
                col(closure.depth()),
            ]);
            for ((ancestor, descendant), depth) in chunk {
                insert.values([
                    SimpleExpr::from(id_value::<E>(ancestor)?),
                    SimpleExpr::from(id_value::<E>(descendant)?),
                    SimpleExpr::from(Value::from(*depth)),
                ])?;
            }
            conn.execute(backend.build(&insert)).await?;
        }
        Ok(())
    }

    /// Rewrite every level that differs from `MAX(depth) + 1`.
    pub async fn update_level_values(&self, db: &DatabaseConnection) -> Result<usize, TreeError> {
        ensure_supported(db)?;
        let Some(level_column) = self.config().level() else {
            return Ok(0);
        };
        let closure = self.closure()?;
        let id_kind = IdKind::of::<E>()?;
        let mut query = Query::select();
        query
            .expr_as(id_kind.select(Expr::col(col(closure.descendant()))), Alias::new("node_id"))
            .expr_as(
                bigint(Expr::col(col(closure.depth())).max().add(1)),
                Alias::new("node_level"),
            )
            .from(Alias::new(closure.table()))
            .group_by_col(col(closure.descendant()));

        let backend = db.get_database_backend();
        let mut computed = HashMap::new();
        for row in db.query_all(backend.build(&query)).await? {
            if let Some(id) = id_kind.read(&row, "node_id")? {
                computed.insert(id, read_i64(&row, "node_level")?);
            }
        }

        let mut outdated: BTreeMap<i64, Vec<Identifier>> = BTreeMap::new();
        for (id, (_, level)) in self.parent_links(db).await? {
            if let Some(expected) = computed.get(&id) {
                if level != Some(*expected) {
                    outdated.entry(*expected).or_default().push(id);
                }
            }
        }

        let pk = primary_key::<E>()?;
        let lock = self.config().advisory_lock_strategy();
        let mut updated = 0;
        for (level, ids) in outdated {
            for batch in ids.chunks(BATCH_SIZE) {
                let values = batch
                    .iter()
                    .map(id_value::<E>)
                    .collect::<Result<Vec<_>, _>>()?;
                let txn = TreeTransaction::begin(lock, db).await?;
                let outcome = E::update_many()
                    .col_expr(
                        col(level_column),
                        Expr::value(column_value::<E>(level_column, Value::from(level))?),
                    )
                    .filter(pk.is_in(values))
                    .exec(txn.connection())
                    .await;
                match outcome {
                    Ok(result) => {
                        txn.commit().await?;
                        updated += result.rows_affected as usize;
                    }
                    Err(err) => {
                        let _ = txn.rollback().await;
                        return Err(err.into());
                    }
                }
            }
        }
        info!(entity = %self.config().entity_name(), updated, "updated closure levels");
        Ok(updated)
    }
}

type Links = BTreeMap<Identifier, (Option<Identifier>, Option<i64>)>;

/// Closure rows implied by the parent links, with their depth.
fn expected_closures(links: &Links) -> BTreeMap<Pair, i64> {
    let mut expected = BTreeMap::new();
    for id in links.keys() {
        expected.insert((id.clone(), id.clone()), 0);
        let mut seen = HashSet::from([id.clone()]);
        let mut depth = 0;
        let mut current = links.get(id).and_then(|(parent, _)| parent.clone());
        while let Some(ancestor) = current {
            // A cycle would revisit the node or one of its ancestors.
            if !links.contains_key(&ancestor) || !seen.insert(ancestor.clone()) {
                break;
            }
            depth += 1;
            current = links.get(&ancestor).and_then(|(parent, _)| parent.clone());
            expected.insert((ancestor, id.clone()), depth);
        }
    }
    expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_closures_follow_parent_links() {
        let mut links = Links::new();
        links.insert(Identifier::Int(1), (None, None));
        links.insert(Identifier::Int(2), (Some(Identifier::Int(1)), None));
        links.insert(Identifier::Int(3), (Some(Identifier::Int(2)), None));

        let expected = expected_closures(&links);
        assert_eq!(expected.len(), 6);
        assert_eq!(expected.get(&(Identifier::Int(1), Identifier::Int(3))), Some(&2));
        assert_eq!(expected.get(&(Identifier::Int(2), Identifier::Int(3))), Some(&1));
        assert_eq!(expected.get(&(Identifier::Int(3), Identifier::Int(3))), Some(&0));
        assert_eq!(expected.get(&(Identifier::Int(3), Identifier::Int(1))), None);
    }

    #[test]
    fn expected_closures_stop_at_missing_parents_and_cycles() {
        let mut links = Links::new();
        links.insert(Identifier::Int(1), (Some(Identifier::Int(9)), None));
        links.insert(Identifier::Int(2), (Some(Identifier::Int(3)), None));
        links.insert(Identifier::Int(3), (Some(Identifier::Int(2)), None));

        let expected = expected_closures(&links);
        assert_eq!(expected.get(&(Identifier::Int(1), Identifier::Int(1))), Some(&0));
        assert!(!expected.keys().any(|(ancestor, _)| *ancestor == Identifier::Int(9)));
        assert_eq!(expected.get(&(Identifier::Int(2), Identifier::Int(2))), Some(&0));
        assert_eq!(expected.get(&(Identifier::Int(3), Identifier::Int(3))), Some(&0));
        assert_eq!(expected.get(&(Identifier::Int(3), Identifier::Int(2))), Some(&1));
        assert_eq!(expected.get(&(Identifier::Int(2), Identifier::Int(3))), Some(&1));
        assert_eq!(expected.len(), 5);
    }

    #[test]
    fn expected_closures_keep_depth_zero_for_self_parent() {
        let mut links = Links::new();
        links.insert(Identifier::Int(1), (Some(Identifier::Int(1)), None));
        links.insert(Identifier::Int(2), (Some(Identifier::Int(1)), None));

        let expected = expected_closures(&links);
        assert_eq!(expected.get(&(Identifier::Int(1), Identifier::Int(1))), Some(&0));
        assert_eq!(expected.get(&(Identifier::Int(1), Identifier::Int(2))), Some(&1));
        assert_eq!(expected.get(&(Identifier::Int(2), Identifier::Int(2))), Some(&0));
        assert_eq!(expected.len(), 3);
    }
}
