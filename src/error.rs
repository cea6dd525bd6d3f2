//! Error types for the branch store.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid branch name: {0:?}")]
    InvalidName(String),

    #[error("Branch already exists: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid fork point: {0}")]
    InvalidForkPoint(String),

    #[error("Cannot delete the checked-out branch: {0}")]
    CurrentBranch(String),

    #[error("Operation not allowed: {0}")]
    NotAllowed(String),

    #[error("Commit {commit} is a fork point of branch {child}")]
    ForkPointLocked { commit: u64, child: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Checked-out branch no longer exists: {0}")]
    StaleBranch(String),

    #[error("Checked-out commit no longer exists: {0}")]
    StaleCheckout(String),

    #[error("Integer overflow: {0}")]
    Overflow(String),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Checkout is pinned to a historical commit: {0}")]
    ReadOnlyCheckout(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Database size limit of {limit} bytes reached")]
    MapFull { limit: u64 },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("No such savepoint: {0}")]
    SavepointNotFound(String),

    #[error("Branching is not enabled on this connection")]
    BranchesDisabled,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Database is locked by another process")]
    Locked,

    #[error("Invalid database format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
