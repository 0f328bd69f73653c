use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::LikeExpr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, IdenStatic, QueryFilter,
    QueryOrder, Value,
};
use tracing::debug;

use crate::config::{StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::query::{id_value, like_prefix, LIKE_ESCAPE};
use crate::strategy::Strategy;
use crate::traits::TreeEntity;
use crate::unit_of_work::{NodeHandle, UnitOfWork};
use crate::wrapper::{
    column_of, column_type, is_text, primary_key, value_as_i64, value_as_string, NodeWrapper,
};

/// Materialized path maintenance: every node stores the delimited chain of
/// its ancestors' path components followed by its own.
pub struct MaterializedPath<E> {
    config: Arc<TreeConfig>,
    pending_inserts: Vec<NodeHandle>,
    /// Moved nodes whose new parent has no identifier yet.
    pending_updates: Vec<NodeHandle>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: TreeEntity> MaterializedPath<E> {
    pub fn new(config: Arc<TreeConfig>) -> Self {
        Self {
            config,
            pending_inserts: Vec::new(),
            pending_updates: Vec::new(),
            _marker: PhantomData,
        }
    }

    fn separator(&self) -> &str {
        self.config.path_separator()
    }

    /// `path` terminated by the separator, the prefix shared by every descendant.
    fn subtree_prefix(&self, path: &str) -> String {
        if path.ends_with(self.separator()) {
            path.to_owned()
        } else {
            format!("{path}{}", self.separator())
        }
    }

    fn stored_path(&self, uow: &UnitOfWork<E>, node: NodeHandle) -> Result<Option<String>, TreeError> {
        let (path, _) = self.config.require_path()?;
        let node = uow.node(node)?;
        let value = match node.original_property(path)? {
            Some(value) => value,
            None => node.property(path)?,
        };
        Ok(value_as_string(&value).filter(|path| !path.is_empty()))
    }

    fn component(&self, uow: &UnitOfWork<E>, node: NodeHandle) -> Result<String, TreeError> {
        let (_, source) = self.config.require_path()?;
        let value = uow.node(node)?.property(source)?;
        let text = value_as_string(&value)
            .or_else(|| value_as_i64(&value).map(|number| number.to_string()))
            .ok_or_else(|| {
                TreeError::runtime(format!(
                    "path source `{source}` of node {node} holds no value"
                ))
            })?;
        if text.contains(self.separator()) {
            return Err(TreeError::runtime(format!(
                "path source `{source}` value {text:?} contains the path separator {:?}",
                self.separator()
            )));
        }

        let source_is_id = primary_key::<E>()?.as_str() == source;
        let append = match self.config.path_append_id() {
            Some(append) => append,
            None => is_text(&column_type::<E>(source)?),
        };
        if append && !source_is_id {
            return Ok(format!("{text}-{}", uow.require_id(node)?));
        }
        Ok(text)
    }

    fn join(&self, parent_path: Option<&str>, component: &str) -> String {
        let separator = self.separator();
        let mut path = match parent_path {
            Some(parent) if !parent.is_empty() => self.subtree_prefix(parent),
            _ if self.config.path_starts_with_separator() => separator.to_owned(),
            _ => String::new(),
        };
        path.push_str(component);
        if self.config.path_ends_with_separator() {
            path.push_str(separator);
        }
        path
    }

    fn schedule_path(
        &self,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
        path: &str,
    ) -> Result<(), TreeError> {
        let (path_column, _) = self.config.require_path()?;
        uow.schedule_extra_update(node, path_column, Value::from(path.to_owned()))?;
        if let Some(level) = self.config.level() {
            let depth = path.matches(self.separator()).count() as i64;
            uow.schedule_extra_update(node, level, Value::from(depth))?;
        }
        if let Some(hash) = self.config.path_hash() {
            uow.schedule_extra_update(node, hash, Value::from(path_hash(path)))?;
        }
        Ok(())
    }

    /// Compute and schedule the path, level and hash of `node` from its parent.
    pub async fn update_node<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<String, TreeError> {
        let (path_column, _) = self.config.require_path()?;
        let parent = uow.parent_handle(conn, node).await?;
        let parent_path = match parent {
            Some(parent) => {
                let path = uow
                    .node(parent)?
                    .text_property(path_column)?
                    .unwrap_or_default();
                if let Some(own) = self.stored_path(uow, node)? {
                    if path.starts_with(&self.subtree_prefix(&own)) {
                        return Err(TreeError::unexpected(format!(
                            "cannot set child as parent to node: {}",
                            uow.require_id(node)?
                        )));
                    }
                }
                Some(path)
            }
            None => None,
        };

        let path = self.join(parent_path.as_deref(), &self.component(uow, node)?);
        self.schedule_path(uow, node, &path)?;
        debug!(entity = %self.config.entity_name(), node = %node, path = %path, "computed node path");
        Ok(path)
    }

    /// Rewrite the stored path prefix of every descendant of `node`.
    pub async fn update_children<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
        old_path: &str,
        new_path: &str,
    ) -> Result<usize, TreeError> {
        let (path_column, _) = self.config.require_path()?;
        let old_prefix = self.subtree_prefix(old_path);
        let new_prefix = self.subtree_prefix(new_path);
        let id = uow.require_id(node)?;
        let pk = primary_key::<E>()?;

        let select = E::find()
            .filter(
                column_of::<E>(path_column)?
                    .like(LikeExpr::new(like_prefix(&old_prefix)).escape(LIKE_ESCAPE)),
            )
            .filter(pk.ne(id_value::<E>(&id)?));

        let mut rewritten = 0;
        for child in uow.load(conn, select).await? {
            let Some(child_path) = self.stored_path(uow, child)? else {
                continue;
            };
            let Some(rest) = child_path.strip_prefix(&old_prefix) else {
                continue;
            };
            let path = format!("{new_prefix}{rest}");
            self.schedule_path(uow, child, &path)?;
            rewritten += 1;
        }
        debug!(node = %id, count = rewritten, "rewrote descendant paths");
        Ok(rewritten)
    }

    async fn relocate<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let old_path = self.stored_path(uow, node)?;
        let new_path = self.update_node(conn, uow, node).await?;
        match old_path {
            Some(old_path) if old_path != new_path => {
                self.update_children(conn, uow, node, &old_path, &new_path)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Schedule `node` and every row below its path for deletion.
    pub async fn remove_node<C: ConnectionTrait>(
        &self,
        conn: &C,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        if uow.node(node)?.is_new() {
            return uow.schedule_delete(node);
        }
        if !uow.is_scheduled_for_delete(node) {
            uow.schedule_delete(node)?;
        }
        let (path_column, _) = self.config.require_path()?;
        let Some(path) = self.stored_path(uow, node)? else {
            return Ok(());
        };
        let id = uow.require_id(node)?;
        let pk = primary_key::<E>()?;
        let prefix = self.subtree_prefix(&path);

        let mut select = E::find()
            .filter(
                column_of::<E>(path_column)?
                    .like(LikeExpr::new(like_prefix(&prefix)).escape(LIKE_ESCAPE)),
            )
            .filter(pk.ne(id_value::<E>(&id)?));
        if let Some(level) = self.config.level() {
            let own_level = uow.node(node)?.int_property(level)?;
            select = select.filter(column_of::<E>(level)?.gt(own_level));
        }

        // LIKE ignores ASCII case on some backends.
        for descendant in uow.load(conn, select).await? {
            let below = self
                .stored_path(uow, descendant)?
                .is_some_and(|stored| stored.starts_with(&prefix));
            if below {
                uow.schedule_cascade_delete(descendant)?;
            }
        }
        Ok(())
    }

    /// Every row below `path`, ordered by path so the result is a pre-order walk.
    pub async fn get_children<C: ConnectionTrait>(
        &self,
        conn: &C,
        path: &str,
    ) -> Result<Vec<E::Model>, TreeError> {
        let (path_column, _) = self.config.require_path()?;
        let column = column_of::<E>(path_column)?;
        let prefix = self.subtree_prefix(path);
        let models = E::find()
            .filter(column.like(LikeExpr::new(like_prefix(&prefix)).escape(LIKE_ESCAPE)))
            .filter(column.ne(path))
            .order_by_asc(column)
            .all(conn)
            .await?;
        let mut children = Vec::with_capacity(models.len());
        for model in models {
            let below = model
                .text_property(path_column)?
                .is_some_and(|stored| stored.starts_with(&prefix) && stored != path);
            if below {
                children.push(model);
            }
        }
        Ok(children)
    }
}

/// Lowercase hex CRC-32 of a path.
pub fn path_hash(path: &str) -> String {
    format!("{:08x}", crc32fast::hash(path.as_bytes()))
}

#[async_trait]
impl<E: TreeEntity> Strategy<E> for MaterializedPath<E> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MaterializedPath
    }

    fn process_metadata_load(&self, config: &TreeConfig) -> Result<(), TreeError> {
        if config.root().is_some() {
            return Err(TreeError::mapping(format!(
                "materialized path on {} does not support a root column",
                config.entity_name()
            )));
        }
        config.require_path().map(|_| ())
    }

    async fn process_scheduled_insertion(
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

        let mut remaining = std::mem::take(&mut self.pending_inserts);
        let mut unresolved: HashSet<NodeHandle> = remaining.iter().copied().collect();
        while !remaining.is_empty() {
            let mut requeued = Vec::new();
            let mut progressed = false;
            for node in remaining {
                let parent = uow.parent_handle(conn, node).await?;
                if parent.is_some_and(|parent| unresolved.contains(&parent)) {
                    requeued.push(node);
                    continue;
                }
                self.update_node(conn, uow, node).await?;
                unresolved.remove(&node);
                progressed = true;
            }
            if !requeued.is_empty() && !progressed {
                return Err(TreeError::unexpected(format!(
                    "{} nodes wait on parents that never receive a path",
                    requeued.len()
                )));
            }
            remaining = requeued;
        }

        for node in std::mem::take(&mut self.pending_updates) {
            self.relocate(conn, uow, node).await?;
        }
        Ok(())
    }

    async fn process_scheduled_update(
        &mut self,
        conn: &DatabaseTransaction,
        uow: &mut UnitOfWork<E>,
        node: NodeHandle,
    ) -> Result<(), TreeError> {
        let (_, source) = self.config.require_path()?;
        let Some(change_set) = uow.change_set(node) else {
            return Ok(());
        };
        if change_set.parent().is_none() && !change_set.has_field(source) {
            return Ok(());
        }

        if let Some(parent) = change_set.parent().and_then(|change| change.new) {
            if uow.id(parent)?.is_none() {
                debug!(node = %node, parent = %parent, "deferring path update until parent insert");
                self.pending_updates.push(node);
                return Ok(());
            }
        }
        self.relocate(conn, uow, node).await
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
        self.remove_node(conn, uow, node).await
    }

    fn on_flush_end(&mut self) {
        self.pending_inserts.clear();
        self.pending_updates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::path_hash;

    #[test]
    fn path_hash_is_lowercase_crc32() {
        assert_eq!(path_hash(""), "00000000");
        assert_eq!(path_hash("1/2/"), format!("{:08x}", crc32fast::hash(b"1/2/")));
        assert!(path_hash("1/").chars().all(|ch| !ch.is_ascii_uppercase()));
    }
}
