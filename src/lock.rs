use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, Statement,
    TransactionTrait, Value,
};
use tracing::debug;

use crate::config::AdvisoryLockStrategy;
use crate::error::TreeError;

/// A transaction that holds the tree's advisory lock until it ends.
///
/// The lock is only taken on PostgreSQL; other backends rely on the
/// transaction alone.
pub struct TreeTransaction {
    txn: DatabaseTransaction,
    key: Option<String>,
}

impl TreeTransaction {
    pub async fn begin(
        strategy: &AdvisoryLockStrategy,
        db: &DatabaseConnection,
    ) -> Result<Self, TreeError> {
        let key = match (strategy.key(), db.get_database_backend()) {
            (Some(key), DbBackend::Postgres) => Some(key.as_str().to_owned()),
            _ => None,
        };

        let txn = db.begin().await?;
        if let Some(ref key) = key {
            if let Err(err) = acquire_lock(&txn, key).await {
                let _ = txn.rollback().await;
                return Err(err);
            }
            debug!(key = %key, "acquired advisory lock");
        }

        Ok(Self { txn, key })
    }

    pub fn connection(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub async fn commit(self) -> Result<(), TreeError> {
        if let Some(ref key) = self.key {
            release_lock(&self.txn, key).await?;
        }
        self.txn.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), TreeError> {
        if let Some(ref key) = self.key {
            let _ = release_lock(&self.txn, key).await;
        }
        self.txn.rollback().await?;
        Ok(())
    }
}

async fn acquire_lock(txn: &DatabaseTransaction, key: &str) -> Result<(), TreeError> {
    advisory(txn, "pg_advisory_lock", key).await
}

async fn release_lock(txn: &DatabaseTransaction, key: &str) -> Result<(), TreeError> {
    advisory(txn, "pg_advisory_unlock", key).await
}

async fn advisory(txn: &DatabaseTransaction, function: &str, key: &str) -> Result<(), TreeError> {
    let sql = format!("SELECT {function}(hashtext($1), 0)");
    txn.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        sql,
        vec![Value::from(key)],
    ))
    .await?;
    Ok(())
}
