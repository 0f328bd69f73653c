use std::marker::PhantomData;
use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::query::{col, ensure_supported, id_value};
use crate::strategy::MaterializedPath;
use crate::traits::TreeEntity;
use crate::wrapper::{column_of, Identifier, NodeWrapper};

/// Queries for materialized path trees.
#[derive(Debug, Default)]
pub struct MaterializedPathRepository<E: TreeEntity> {
    _marker: PhantomData<E>,
}

impl<E: TreeEntity> MaterializedPathRepository<E> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn config(&self) -> &'static TreeConfig {
        E::tree_config()
    }

    fn strategy(&self) -> MaterializedPath<E> {
        MaterializedPath::new(Arc::new(self.config().clone()))
    }

    fn node_path(&self, node: &E::Model) -> Result<String, TreeError> {
        let (path, _) = self.config().require_path()?;
        node.text_property(path)?
            .filter(|path| !path.is_empty())
            .ok_or_else(|| TreeError::invalid_argument("node has no stored path"))
    }

    pub async fn root_nodes(&self, conn: &DatabaseConnection) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (path, _) = self.config().require_path()?;
        Ok(E::find()
            .filter(Expr::col(col(self.config().parent())).is_null())
            .order_by_asc(column_of::<E>(path)?)
            .all(conn)
            .await?)
    }

    /// Children of `node`, or of the whole forest when `node` is `None`, ordered by path.
    pub async fn children(
        &self,
        conn: &DatabaseConnection,
        node: Option<&E::Model>,
        direct: bool,
        include_node: bool,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (path, _) = self.config().require_path()?;
        let Some(node) = node else {
            return if direct {
                self.root_nodes(conn).await
            } else {
                Ok(E::find()
                    .order_by_asc(column_of::<E>(path)?)
                    .all(conn)
                    .await?)
            };
        };

        let mut children = if direct {
            let id = node.identifier().ok_or_else(|| {
                TreeError::invalid_argument("node has no identifier")
            })?;
            E::find()
                .filter(Expr::col(col(self.config().parent())).eq(id_value::<E>(&id)?))
                .order_by_asc(column_of::<E>(path)?)
                .all(conn)
                .await?
        } else {
            self.strategy()
                .get_children(conn, &self.node_path(node)?)
                .await?
        };
        if include_node {
            children.insert(0, node.clone());
        }
        Ok(children)
    }

    /// Ancestors of `node` from the root down, ending with `node` itself.
    pub async fn path(
        &self,
        conn: &DatabaseConnection,
        node: &E::Model,
    ) -> Result<Vec<E::Model>, TreeError> {
        ensure_supported(conn)?;
        let (path, _) = self.config().require_path()?;
        let prefixes = path_prefixes(self.config(), &self.node_path(node)?);
        let column = column_of::<E>(path)?;
        let mut ancestors = E::find()
            .filter(column.is_in(prefixes.iter().cloned()))
            .all(conn)
            .await?;
        ancestors.sort_by_key(|model| {
            let stored = model.text_property(path).ok().flatten().unwrap_or_default();
            prefixes.iter().position(|prefix| *prefix == stored)
        });
        Ok(ancestors)
    }

    /// `root` and all of its descendants in pre-order, or the whole forest.
    pub async fn tree(
        &self,
        conn: &DatabaseConnection,
        root: Option<&E::Model>,
    ) -> Result<Vec<E::Model>, TreeError> {
        self.children(conn, root, false, true).await
    }

    /// Identifier of every node below `node`.
    pub async fn descendant_ids(
        &self,
        conn: &DatabaseConnection,
        node: &E::Model,
    ) -> Result<Vec<Identifier>, TreeError> {
        ensure_supported(conn)?;
        let children = self
            .strategy()
            .get_children(conn, &self.node_path(node)?)
            .await?;
        Ok(children.iter().filter_map(NodeWrapper::identifier).collect())
    }
}

/// Every path from the root down to `path`, each a prefix of the next.
fn path_prefixes(config: &TreeConfig, path: &str) -> Vec<String> {
    let separator = config.path_separator();
    let trimmed = if config.path_starts_with_separator() {
        path.strip_prefix(separator).unwrap_or(path)
    } else {
        path
    };
    let trimmed = trimmed.strip_suffix(separator).unwrap_or(trimmed);

    let mut prefixes = Vec::new();
    let mut current = if config.path_starts_with_separator() {
        separator.to_owned()
    } else {
        String::new()
    };
    for component in trimmed.split(separator) {
        current.push_str(component);
        if config.path_ends_with_separator() {
            prefixes.push(format!("{current}{separator}"));
        } else {
            prefixes.push(current.clone());
        }
        current.push_str(separator);
    }
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StrategyKind, TreeOptions};

    fn config(starts: bool, ends: bool) -> TreeConfig {
        TreeOptions::default()
            .path("path")
            .path_source("id")
            .path_separator("/")
            .path_starts_with_separator(starts)
            .path_ends_with_separator(ends)
            .apply(TreeConfig::new(StrategyKind::MaterializedPath, "nodes"))
    }

    #[test]
    fn prefixes_follow_separator_flags() {
        assert_eq!(path_prefixes(&config(false, true), "1/2/3/"), ["1/", "1/2/", "1/2/3/"]);
        assert_eq!(path_prefixes(&config(true, false), "/1/2"), ["/1", "/1/2"]);
        assert_eq!(path_prefixes(&config(false, false), "a-1"), ["a-1"]);
    }
}
