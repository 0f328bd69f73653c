//! Hierarchical trees for SeaORM entities.
//!
//! Three storage strategies are available: nested set intervals, a closure
//! table and materialized paths. Entities opt in with `#[derive(TreeEntity)]`
//! on their model; changes are tracked by a [`TreeSession`] and written by its
//! flush, which keeps the tree columns consistent. PostgreSQL and SQLite are
//! supported.

pub mod config;
pub mod error;
pub mod listener;
pub mod lock;
pub mod metadata;
mod query;
pub mod repository;
pub mod session;
pub mod strategy;
pub mod traits;
pub mod unit_of_work;
pub mod wrapper;

pub mod prelude {
    //! Convenient re-exports for consumers.
    pub use crate::config::{StrategyKind, TreeConfig, TreeOptions};
    pub use crate::repository::{
        ClosureTableRepository, MaterializedPathRepository, NestedSetRepository, Steps,
        Verification,
    };
    pub use crate::session::TreeSession;
    pub use crate::strategy::Position;
    pub use crate::traits::TreeEntity;
    pub use crate::unit_of_work::NodeHandle;
    pub use crate::wrapper::{Identifier, NodeWrapper};
}

pub use sea_orm_tree_macros::TreeEntity as TreeEntityDerive;
#[doc(hidden)]
pub use sea_orm_tree_macros::TreeEntity;

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;
}

pub use config::{
    AdvisoryLockKey, AdvisoryLockStrategy, ConfigurationRegistry, StrategyKind, TreeConfig,
    TreeOptions,
};
pub use error::TreeError;
pub use listener::TreeListener;
pub use lock::TreeTransaction;
pub use repository::{
    ClosureTableRepository, MaterializedPathRepository, NestedSetRepository, Steps, Verification,
};
pub use session::TreeSession;
pub use strategy::{MaterializedPath, NestedSet, NodePosition, Position, Strategy};
pub use traits::TreeEntity;
pub use unit_of_work::{NodeHandle, UnitOfWork};
pub use wrapper::{Identifier, NodeWrapper};
