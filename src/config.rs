use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::TreeError;
use crate::metadata;
use crate::traits::TreeEntity;

/// Algorithm used to keep a tree consistent in flat relational storage.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Nested,
    Closure,
    #[serde(alias = "materializedPath")]
    MaterializedPath,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Nested => "nested",
            StrategyKind::Closure => "closure",
            StrategyKind::MaterializedPath => "materialized_path",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = TreeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "nested" => Ok(Self::Nested),
            "closure" => Ok(Self::Closure),
            "materializedPath" | "materialized_path" | "materialized-path" => {
                Ok(Self::MaterializedPath)
            }
            other => Err(TreeError::mapping(format!(
                "tree strategy `{other}` is not supported"
            ))),
        }
    }
}

/// Layout of the ancestor/descendant/depth relation used by the closure strategy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClosureTable {
    table: String,
    ancestor: String,
    descendant: String,
    depth: String,
}

impl ClosureTable {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ancestor: "ancestor".to_string(),
            descendant: "descendant".to_string(),
            depth: "depth".to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ancestor(&self) -> &str {
        &self.ancestor
    }

    pub fn descendant(&self) -> &str {
        &self.descendant
    }

    pub fn depth(&self) -> &str {
        &self.depth
    }
}

/// Resolved per-entity tree configuration.
///
/// Field names refer to database column names of the node entity.
#[derive(Clone, Debug)]
pub struct TreeConfig {
    entity_name: String,
    strategy: StrategyKind,
    parent: String,
    left: Option<String>,
    right: Option<String>,
    root: Option<String>,
    level: Option<String>,
    level_base: i64,
    root_identifier_method: bool,
    path: Option<String>,
    path_source: Option<String>,
    path_hash: Option<String>,
    path_separator: String,
    path_append_id: Option<bool>,
    path_starts_with_separator: bool,
    path_ends_with_separator: bool,
    closure: Option<ClosureTable>,
    advisory_lock_strategy: AdvisoryLockStrategy,
}

impl TreeConfig {
    /// Create a configuration for the entity stored in `entity_name`.
    pub fn new(strategy: StrategyKind, entity_name: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        let closure = match strategy {
            StrategyKind::Closure => Some(ClosureTable::new(format!("{entity_name}_closure"))),
            _ => None,
        };

        Self {
            entity_name,
            strategy,
            parent: "parent_id".to_string(),
            left: None,
            right: None,
            root: None,
            level: None,
            level_base: 0,
            root_identifier_method: false,
            path: None,
            path_source: None,
            path_hash: None,
            path_separator: ",".to_string(),
            path_append_id: None,
            path_starts_with_separator: false,
            path_ends_with_separator: true,
            closure,
            advisory_lock_strategy: AdvisoryLockStrategy::Disabled,
        }
    }

    /// Merge options produced by [`TreeOptions`].
    pub(crate) fn apply_options(mut self, options: TreeOptions) -> Self {
        if let Some(parent) = options.parent {
            self.parent = parent;
        }
        if options.left.is_some() {
            self.left = options.left;
        }
        if options.right.is_some() {
            self.right = options.right;
        }
        if options.root.is_some() {
            self.root = options.root;
        }
        if options.level.is_some() {
            self.level = options.level;
        }
        if let Some(base) = options.level_base {
            self.level_base = base;
        }
        if let Some(flag) = options.root_identifier_method {
            self.root_identifier_method = flag;
        }
        if options.path.is_some() {
            self.path = options.path;
        }
        if options.path_source.is_some() {
            self.path_source = options.path_source;
        }
        if options.path_hash.is_some() {
            self.path_hash = options.path_hash;
        }
        if let Some(separator) = options.path_separator {
            self.path_separator = separator;
        }
        if options.path_append_id.is_some() {
            self.path_append_id = options.path_append_id;
        }
        if let Some(flag) = options.path_starts_with_separator {
            self.path_starts_with_separator = flag;
        }
        if let Some(flag) = options.path_ends_with_separator {
            self.path_ends_with_separator = flag;
        }
        if self.strategy == StrategyKind::Closure {
            let mut closure = self
                .closure
                .take()
                .unwrap_or_else(|| ClosureTable::new(format!("{}_closure", self.entity_name)));
            if let Some(table) = options.closure_table {
                closure.table = table;
            }
            if let Some(ancestor) = options.closure_ancestor {
                closure.ancestor = ancestor;
            }
            if let Some(descendant) = options.closure_descendant {
                closure.descendant = descendant;
            }
            if let Some(depth) = options.closure_depth {
                closure.depth = depth;
            }
            self.closure = Some(closure);
        }
        if options.activate_locking == Some(true) {
            self.advisory_lock_strategy = AdvisoryLockStrategy::Namespaced(
                AdvisoryLockKey::derived_from(&self.entity_name, self.strategy),
            );
        }
        self
    }

    /// Table name of the node entity, used as registry key.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Column storing the parent foreign key.
    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn left(&self) -> Option<&str> {
        self.left.as_deref()
    }

    pub fn right(&self) -> Option<&str> {
        self.right.as_deref()
    }

    /// Column discriminating disjoint trees sharing one table.
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    /// Level assigned to root nodes by the nested set strategy.
    pub fn level_base(&self) -> i64 {
        self.level_base
    }

    /// Whether the entity supplies its root scope through [`TreeEntity::root_identifier`].
    pub fn root_identifier_method(&self) -> bool {
        self.root_identifier_method
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn path_source(&self) -> Option<&str> {
        self.path_source.as_deref()
    }

    pub fn path_hash(&self) -> Option<&str> {
        self.path_hash.as_deref()
    }

    pub fn path_separator(&self) -> &str {
        &self.path_separator
    }

    /// `None` appends the identifier only when the path source is textual.
    pub fn path_append_id(&self) -> Option<bool> {
        self.path_append_id
    }

    pub fn path_starts_with_separator(&self) -> bool {
        self.path_starts_with_separator
    }

    pub fn path_ends_with_separator(&self) -> bool {
        self.path_ends_with_separator
    }

    pub fn closure(&self) -> Option<&ClosureTable> {
        self.closure.as_ref()
    }

    /// Advisory lock strategy (PostgreSQL only).
    pub fn advisory_lock_strategy(&self) -> &AdvisoryLockStrategy {
        &self.advisory_lock_strategy
    }

    pub(crate) fn require_left_right(&self) -> Result<(&str, &str), TreeError> {
        match (self.left(), self.right()) {
            (Some(left), Some(right)) => Ok((left, right)),
            _ => Err(TreeError::mapping(format!(
                "nested set on {} requires left and right columns",
                self.entity_name
            ))),
        }
    }

    pub(crate) fn require_path(&self) -> Result<(&str, &str), TreeError> {
        match (self.path(), self.path_source()) {
            (Some(path), Some(source)) => Ok((path, source)),
            _ => Err(TreeError::mapping(format!(
                "materialized path on {} requires path and path_source columns",
                self.entity_name
            ))),
        }
    }

    pub(crate) fn require_closure(&self) -> Result<&ClosureTable, TreeError> {
        self.closure().ok_or_else(|| {
            TreeError::mapping(format!(
                "closure strategy on {} requires a closure table",
                self.entity_name
            ))
        })
    }
}

/// Builder-style options consumed by the derive macro.
///
/// Options can also be deserialized, which lets a mapping live outside the code.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeOptions {
    parent: Option<String>,
    left: Option<String>,
    right: Option<String>,
    root: Option<String>,
    level: Option<String>,
    level_base: Option<i64>,
    root_identifier_method: Option<bool>,
    path: Option<String>,
    path_source: Option<String>,
    path_hash: Option<String>,
    path_separator: Option<String>,
    path_append_id: Option<bool>,
    path_starts_with_separator: Option<bool>,
    path_ends_with_separator: Option<bool>,
    closure_table: Option<String>,
    closure_ancestor: Option<String>,
    closure_descendant: Option<String>,
    closure_depth: Option<String>,
    activate_locking: Option<bool>,
}

impl TreeOptions {
    pub fn from_json(value: &str) -> Result<Self, TreeError> {
        serde_json::from_str(value)
            .map_err(|err| TreeError::mapping(format!("unreadable tree options: {err}")))
    }

    pub fn parent(mut self, value: impl Into<String>) -> Self {
        self.parent = Some(value.into());
        self
    }

    pub fn left(mut self, value: impl Into<String>) -> Self {
        self.left = Some(value.into());
        self
    }

    pub fn right(mut self, value: impl Into<String>) -> Self {
        self.right = Some(value.into());
        self
    }

    pub fn root(mut self, value: impl Into<String>) -> Self {
        self.root = Some(value.into());
        self
    }

    pub fn level(mut self, value: impl Into<String>) -> Self {
        self.level = Some(value.into());
        self
    }

    pub fn level_base(mut self, value: i64) -> Self {
        self.level_base = Some(value);
        self
    }

    pub fn root_identifier_method(mut self, value: bool) -> Self {
        self.root_identifier_method = Some(value);
        self
    }

    pub fn path(mut self, value: impl Into<String>) -> Self {
        self.path = Some(value.into());
        self
    }

    pub fn path_source(mut self, value: impl Into<String>) -> Self {
        self.path_source = Some(value.into());
        self
    }

    pub fn path_hash(mut self, value: impl Into<String>) -> Self {
        self.path_hash = Some(value.into());
        self
    }

    pub fn path_separator(mut self, value: impl Into<String>) -> Self {
        self.path_separator = Some(value.into());
        self
    }

    pub fn path_append_id(mut self, value: bool) -> Self {
        self.path_append_id = Some(value);
        self
    }

    pub fn path_starts_with_separator(mut self, value: bool) -> Self {
        self.path_starts_with_separator = Some(value);
        self
    }

    pub fn path_ends_with_separator(mut self, value: bool) -> Self {
        self.path_ends_with_separator = Some(value);
        self
    }

    pub fn closure_table(mut self, value: impl Into<String>) -> Self {
        self.closure_table = Some(value.into());
        self
    }

    pub fn closure_ancestor(mut self, value: impl Into<String>) -> Self {
        self.closure_ancestor = Some(value.into());
        self
    }

    pub fn closure_descendant(mut self, value: impl Into<String>) -> Self {
        self.closure_descendant = Some(value.into());
        self
    }

    pub fn closure_depth(mut self, value: impl Into<String>) -> Self {
        self.closure_depth = Some(value.into());
        self
    }

    pub fn activate_locking(mut self, value: bool) -> Self {
        self.activate_locking = Some(value);
        self
    }

    pub fn apply(self, base: TreeConfig) -> TreeConfig {
        base.apply_options(self)
    }
}

/// Key used for PostgreSQL advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct AdvisoryLockKey(String);

impl AdvisoryLockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn derived_from(entity: &str, strategy: StrategyKind) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(entity.as_bytes());
        hasher.update(b"/");
        hasher.update(strategy.as_str().as_bytes());
        let crc = hasher.finalize();
        Self(format!("sea-orm-tree::{entity}::{strategy}::{crc:x}"))
    }
}

/// Configuration describing how to acquire advisory locks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdvisoryLockStrategy {
    Disabled,
    Namespaced(AdvisoryLockKey),
}

impl AdvisoryLockStrategy {
    pub fn key(&self) -> Option<&AdvisoryLockKey> {
        match self {
            AdvisoryLockStrategy::Disabled => None,
            AdvisoryLockStrategy::Namespaced(key) => Some(key),
        }
    }
}

/// Validated tree configurations, keyed by entity name.
///
/// One registry belongs to one listener; strategies receive it at construction.
#[derive(Debug, Default)]
pub struct ConfigurationRegistry {
    configurations: HashMap<String, Arc<TreeConfig>>,
}

impl ConfigurationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register the configuration of `E`.
    pub fn load<E: TreeEntity>(&mut self) -> Result<Arc<TreeConfig>, TreeError> {
        let config = E::tree_config();
        if let Some(existing) = self.configurations.get(config.entity_name()) {
            return Ok(existing.clone());
        }

        metadata::validate::<E>(config)?;
        let config = Arc::new(config.clone());
        self.configurations
            .insert(config.entity_name().to_owned(), config.clone());
        Ok(config)
    }

    pub fn get(&self, entity_name: &str) -> Result<Arc<TreeConfig>, TreeError> {
        self.configurations
            .get(entity_name)
            .cloned()
            .ok_or_else(|| {
                TreeError::mapping(format!("no tree configuration loaded for {entity_name}"))
            })
    }

    pub fn contains(&self, entity_name: &str) -> bool {
        self.configurations.contains_key(entity_name)
    }
}
