//! Broker port error types.

use thiserror::Error;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by a broker client behind the port.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not establish a physical connection.
    #[error("broker connection failed: {0}")]
    ConnectionFailed(String),

    /// The session (or its underlying connection) is no longer usable.
    #[error("broker session lost: {0}")]
    SessionLost(String),

    /// Operation on a closed session.
    #[error("broker session closed")]
    SessionClosed,

    /// The transactional commit failed; staged sends were not published.
    #[error("broker commit failed: {0}")]
    CommitFailed(String),

    /// The rollback failed; redelivery state is unknown.
    #[error("broker rollback failed: {0}")]
    RollbackFailed(String),

    /// Consumer creation or receive failed.
    #[error("broker consumer error: {0}")]
    Consumer(String),
}
