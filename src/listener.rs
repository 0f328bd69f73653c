use std::sync::Arc;

use crate::config::{ConfigurationRegistry, StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::strategy::{ClosureTable, MaterializedPath, NestedSet, Strategy};
use crate::traits::TreeEntity;

/// Binds the validated configuration of `E` to the strategy it selects.
pub struct TreeListener<E: TreeEntity> {
    registry: Arc<ConfigurationRegistry>,
    config: Arc<TreeConfig>,
    strategy: Box<dyn Strategy<E>>,
}

impl<E: TreeEntity> TreeListener<E> {
    pub fn new() -> Result<Self, TreeError> {
        let mut registry = ConfigurationRegistry::new();
        registry.load::<E>()?;
        Self::with_registry(Arc::new(registry))
    }

    /// Build a listener from a registry that already holds the configuration of `E`.
    pub fn with_registry(registry: Arc<ConfigurationRegistry>) -> Result<Self, TreeError> {
        let config = registry.get(E::tree_config().entity_name())?;
        let strategy: Box<dyn Strategy<E>> = match config.strategy() {
            StrategyKind::Nested => Box::new(NestedSet::<E>::new(config.clone())),
            StrategyKind::Closure => Box::new(ClosureTable::<E>::new(config.clone())),
            StrategyKind::MaterializedPath => Box::new(MaterializedPath::<E>::new(config.clone())),
        };
        strategy.process_metadata_load(&config)?;
        Ok(Self {
            registry,
            config,
            strategy,
        })
    }

    pub fn config(&self) -> &Arc<TreeConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConfigurationRegistry> {
        &self.registry
    }

    pub fn strategy(&self) -> &dyn Strategy<E> {
        self.strategy.as_ref()
    }

    pub(crate) fn strategy_mut(&mut self) -> &mut dyn Strategy<E> {
        self.strategy.as_mut()
    }
}
