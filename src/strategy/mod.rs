//! Tree maintenance algorithms plugged into the flush lifecycle.

use async_trait::async_trait;
use sea_orm::DatabaseTransaction;

use crate::config::{StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::traits::TreeEntity;
use crate::unit_of_work::{NodeHandle, UnitOfWork};

pub mod closure;
pub mod nested;
pub mod path;

pub use closure::ClosureTable;
pub use nested::{NestedSet, NodePosition, Position};
pub use path::MaterializedPath;

/// Capability shared by the tree strategies.
///
/// Hooks run inside the flush transaction, in this order: scheduled insertion,
/// scheduled update and scheduled delete for every affected node, then pre/post
/// persist around each insert, pre/post update around each update, pre/post
/// remove around each delete, and finally [`Strategy::on_flush_end`].
#[async_trait]
pub trait Strategy<E: TreeEntity>: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Strategy-specific mapping checks, run when the listener is built.
    fn process_metadata_load(&self, config: &TreeConfig) -> Result<(), TreeError>;

    async fn process_scheduled_insertion(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_pre_persist(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_post_persist(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_scheduled_update(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_pre_update(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_post_update(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_scheduled_delete(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_pre_remove(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    async fn process_post_remove(
        &mut self,
        _conn: &DatabaseTransaction,
        _uow: &mut UnitOfWork<E>,
        _node: NodeHandle,
    ) -> Result<(), TreeError> {
        Ok(())
    }

    /// Drop per-flush caches and queues.
    fn on_flush_end(&mut self);
}
