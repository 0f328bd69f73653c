use std::sync::Arc;

use sea_orm::{DatabaseConnection, DatabaseTransaction, Select};
use tracing::{debug, warn};

use crate::config::{StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::listener::TreeListener;
use crate::lock::TreeTransaction;
use crate::query::ensure_supported;
use crate::strategy::{NodePosition, Position};
use crate::traits::TreeEntity;
use crate::unit_of_work::{NodeHandle, NodeState, UnitOfWork};
use crate::wrapper::Identifier;

/// Tracks tree nodes of `E` and writes their changes in one transaction per flush.
///
/// A failed flush rolls back and closes the session; every later call returns
/// [`TreeError::SessionClosed`].
pub struct TreeSession<E: TreeEntity> {
    listener: TreeListener<E>,
    uow: UnitOfWork<E>,
    closed: bool,
}

impl<E: TreeEntity> TreeSession<E> {
    pub fn new(listener: TreeListener<E>) -> Self {
        let uow = UnitOfWork::new(listener.config().clone());
        Self {
            listener,
            uow,
            closed: false,
        }
    }

    /// Open a session with a listener built from the entity's own configuration.
    pub fn open() -> Result<Self, TreeError> {
        Ok(Self::new(TreeListener::new()?))
    }

    fn ensure_open(&self) -> Result<(), TreeError> {
        if self.closed {
            Err(TreeError::SessionClosed)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &Arc<TreeConfig> {
        self.listener.config()
    }

    pub fn listener(&self) -> &TreeListener<E> {
        &self.listener
    }

    pub fn unit_of_work(&self) -> &UnitOfWork<E> {
        &self.uow
    }

    pub(crate) fn unit_of_work_mut(&mut self) -> Result<&mut UnitOfWork<E>, TreeError> {
        self.ensure_open()?;
        Ok(&mut self.uow)
    }

    /// Schedule a new node for insertion.
    pub fn persist(&mut self, model: E::Model) -> Result<NodeHandle, TreeError> {
        self.ensure_open()?;
        Ok(self.uow.attach_new(model))
    }

    pub fn set_parent(
        &mut self,
        node: NodeHandle,
        parent: Option<NodeHandle>,
    ) -> Result<(), TreeError> {
        self.ensure_open()?;
        self.uow.assign_parent(node, parent)
    }

    /// Request a nested set position for `node`, relative to `sibling` when given.
    pub fn set_position(
        &mut self,
        node: NodeHandle,
        position: Position,
        sibling: Option<NodeHandle>,
    ) -> Result<(), TreeError> {
        self.ensure_open()?;
        if self.config().strategy() != StrategyKind::Nested {
            return Err(TreeError::invalid_argument(format!(
                "positions apply to nested set trees, {} uses {}",
                self.config().entity_name(),
                self.config().strategy()
            )));
        }
        let position = match sibling {
            Some(sibling) => NodePosition::next_to(position, sibling),
            None => NodePosition::new(position),
        };
        self.uow.set_position(node, position)
    }

    pub fn remove(&mut self, node: NodeHandle) -> Result<(), TreeError> {
        self.ensure_open()?;
        self.uow.schedule_delete(node)
    }

    pub async fn find(
        &mut self,
        conn: &DatabaseConnection,
        id: impl Into<Identifier>,
    ) -> Result<Option<NodeHandle>, TreeError> {
        self.ensure_open()?;
        self.uow.find(conn, &id.into()).await
    }

    pub async fn load(
        &mut self,
        conn: &DatabaseConnection,
        select: Select<E>,
    ) -> Result<Vec<NodeHandle>, TreeError> {
        self.ensure_open()?;
        self.uow.load(conn, select).await
    }

    pub fn model(&self, node: NodeHandle) -> Result<&E::Model, TreeError> {
        Ok(self.uow.node(node)?.model())
    }

    pub fn model_mut(&mut self, node: NodeHandle) -> Result<&mut E::Model, TreeError> {
        self.ensure_open()?;
        Ok(self.uow.node_mut(node)?.model_mut())
    }

    pub fn id(&self, node: NodeHandle) -> Result<Option<Identifier>, TreeError> {
        self.uow.id(node)
    }

    /// Write every scheduled change in one transaction.
    pub async fn flush(&mut self, db: &DatabaseConnection) -> Result<(), TreeError> {
        self.ensure_open()?;
        ensure_supported(db)?;
        if !self.uow.has_pending_work() {
            return Ok(());
        }

        let txn = TreeTransaction::begin(self.config().advisory_lock_strategy(), db).await?;
        let outcome = self.run_flush(txn.connection()).await;
        self.listener.strategy_mut().on_flush_end();

        let outcome = match outcome {
            Ok(()) => txn.commit().await,
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        };
        match outcome {
            Ok(()) => {
                self.uow.finish_flush();
                Ok(())
            }
            Err(err) => {
                warn!(entity = %self.config().entity_name(), error = %err, "tree flush failed, closing session");
                self.close();
                Err(err)
            }
        }
    }

    async fn run_flush(&mut self, conn: &DatabaseTransaction) -> Result<(), TreeError> {
        let Self { listener, uow, .. } = self;
        let strategy = listener.strategy_mut();

        uow.compute_change_sets(conn).await?;
        debug!(
            inserts = uow.insertions().len(),
            updates = uow.updates().len(),
            deletes = uow.deletions().len(),
            "flushing tree session"
        );

        for node in uow.insertions().to_vec() {
            strategy.process_scheduled_insertion(conn, uow, node).await?;
        }
        for node in uow.updates().to_vec() {
            strategy.process_scheduled_update(conn, uow, node).await?;
        }
        // Cascades append to the deletion list while it is walked.
        let mut index = 0;
        while let Some(node) = uow.deletions().get(index).copied() {
            strategy.process_scheduled_delete(conn, uow, node).await?;
            index += 1;
        }

        let insertions = uow.insertions().to_vec();
        for node in &insertions {
            strategy.process_pre_persist(conn, uow, *node).await?;
            uow.execute_insert(conn, *node).await?;
        }
        uow.execute_deferred_parents(conn).await?;
        for node in &insertions {
            strategy.process_post_persist(conn, uow, *node).await?;
        }

        for node in uow.updates().to_vec() {
            if !matches!(uow.node(node).map(|tracked| tracked.state()), Ok(NodeState::Managed)) {
                continue;
            }
            strategy.process_pre_update(conn, uow, node).await?;
            uow.execute_update(conn, node).await?;
            strategy.process_post_update(conn, uow, node).await?;
        }
        uow.execute_extra_updates(conn).await?;

        for node in uow.deletion_order()? {
            strategy.process_pre_remove(conn, uow, node).await?;
            uow.execute_delete(conn, node).await?;
            strategy.process_post_remove(conn, uow, node).await?;
        }
        Ok(())
    }

    /// Stop tracking every node. Pending changes are discarded.
    pub fn clear(&mut self) {
        self.uow.clear();
    }

    pub fn close(&mut self) {
        self.uow.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
