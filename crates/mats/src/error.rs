//! Runtime error types.

use mats_broker::BrokerError;
use mats_serial::SerializationError;
use thiserror::Error;

/// Result type for runtime operations.
pub type MatsResult<T> = Result<T, MatsError>;

/// Errors surfaced to callers of the runtime.
///
/// The important distinction is `BackendUnavailable` ("nothing happened")
/// versus `MessageSend` ("external side effects may have happened"): the
/// former is safe to retry blindly, the latter demands compensating logic.
/// Stage-side processing failures never appear here; they roll the broker
/// transaction back and ride redelivery.
#[derive(Debug, Error)]
pub enum MatsError {
    /// An initiation was missing a required field. Local to the caller; no
    /// side effects, no message I/O.
    #[error("missing required initiation field '{0}'")]
    Validation(&'static str),

    /// No broker connection or session could be acquired. Nothing was
    /// committed anywhere.
    #[error("broker backend unavailable: {0}")]
    BackendUnavailable(#[source] BrokerError),

    /// The external resource committed but the broker commit failed: the
    /// messages may not have been published. The caller must compensate.
    #[error("message send failed after external resource commit: {0}")]
    MessageSend(#[source] BrokerError),

    /// Envelope or DTO (de)serialization failed on the outbound path.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The external resource transaction failed before the broker commit;
    /// everything was rolled back.
    #[error("external resource transaction failed: {0}")]
    Resource(anyhow::Error),

    /// Operation on a stopped or closed component.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

/// Failure inside one stage execution. Internal: both variants roll the
/// transaction back and the broker redelivers.
#[derive(Debug, Error)]
pub(crate) enum StageFailure {
    /// The incoming DTO or state did not deserialize, or the outgoing state
    /// did not serialize.
    #[error("stage serialization failure: {0}")]
    Serialization(#[from] SerializationError),

    /// The user lambda returned an error or panicked.
    #[error("stage lambda failure: {0}")]
    User(anyhow::Error),
}
