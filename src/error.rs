use thiserror::Error;

use crate::unit_of_work::NodeHandle;

/// Errors returned by the tree strategies, sessions and repositories.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("sea-orm-tree supports PostgreSQL and SQLite connections only")]
    UnsupportedBackend,

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("query build error: {0}")]
    Query(#[from] sea_orm::sea_query::error::Error),

    /// Invalid tree mapping, raised while the metadata is loaded.
    #[error("invalid tree mapping: {0}")]
    Mapping(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested change would break the tree structure.
    #[error("unexpected value: {0}")]
    UnexpectedValue(String),

    /// A statement against the backing tables did not have the expected effect.
    #[error("storage operation failed: {0}")]
    Runtime(String),

    #[error("node {0} is not managed by this session")]
    UnmanagedNode(NodeHandle),

    #[error("the tree session is closed, open a new one")]
    SessionClosed,

    #[error("transaction failed: {0}")]
    TransactionFailed(#[source] Box<TreeError>),

    #[error("tree invariant violation: {0}")]
    Invariant(String),
}

impl TreeError {
    pub fn mapping(detail: impl Into<String>) -> Self {
        Self::Mapping(detail.into())
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument(detail.into())
    }

    pub fn unexpected(detail: impl Into<String>) -> Self {
        Self::UnexpectedValue(detail.into())
    }

    pub fn runtime(detail: impl Into<String>) -> Self {
        Self::Runtime(detail.into())
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant(detail.into())
    }
}
