//! Best-effort 1-phase-commit coordination.
//!
//! Every stage execution and every initiation runs inside the same ordered
//! bracket: broker session transaction (implicit on first operation), then
//! the optional external resource transaction, then the user logic, then a
//! session liveness probe, then resource commit, then broker commit, in
//! that order. The window between the two commits is the best-effort-1PC
//! hazard: a failure there surfaces as [`TxAttemptError::MessageSend`] so
//! callers can run compensating logic, distinctly from failures where
//! nothing committed at all.

use mats_broker::{BrokerError, Destination, OutgoingMessage, Session};
use tracing::{debug, warn};

/// Bridge to an ambient transactional resource (e.g. a database).
///
/// Configured once per factory; [`begin`](Self::begin) is called for every
/// stage execution and initiation, bracketing the user logic.
pub trait TransactionManager: Send + Sync {
    /// Opens a resource transaction for one receive-process-send cycle.
    fn begin(&self) -> anyhow::Result<Box<dyn ResourceTransaction>>;
}

/// One open external resource transaction.
pub trait ResourceTransaction: Send {
    /// Commits the resource transaction. Runs *before* the broker commit.
    fn commit(self: Box<Self>) -> anyhow::Result<()>;

    /// Rolls the resource transaction back. Best effort; failures are logged
    /// by the caller, not propagated.
    fn rollback(self: Box<Self>);
}

/// How one transactional attempt failed.
#[derive(Debug)]
pub(crate) enum TxAttemptError {
    /// User logic or the resource refused; both sides were rolled back. A
    /// stage sees redelivery; an initiator returns the error to its caller.
    Retry(anyhow::Error),
    /// The session died before anything committed; both sides were rolled
    /// back. The caller must discard the session and reacquire.
    SessionLost(BrokerError),
    /// The resource committed but the broker commit failed: the messages may
    /// not have been published.
    MessageSend(BrokerError),
}

/// Runs `work` inside the ordered commit bracket on `session`.
///
/// `work` performs the user logic and returns the outbound messages to
/// stage; it runs with the resource transaction open, so resource work done
/// inside it joins the bracket.
pub(crate) fn within_transaction<F>(
    session: &mut dyn Session,
    manager: Option<&dyn TransactionManager>,
    work: F,
) -> Result<(), TxAttemptError>
where
    F: FnOnce() -> anyhow::Result<Vec<(Destination, OutgoingMessage)>>,
{
    let resource = match manager {
        Some(manager) => match manager.begin() {
            Ok(tx) => Some(tx),
            Err(e) => {
                rollback_session(session);
                return Err(TxAttemptError::Retry(e));
            }
        },
        None => None,
    };

    let outbound = match work() {
        Ok(outbound) => outbound,
        Err(e) => {
            rollback_resource(resource);
            rollback_session(session);
            return Err(TxAttemptError::Retry(e));
        }
    };

    for (destination, message) in outbound {
        if let Err(e) = session.send(&destination, message) {
            rollback_resource(resource);
            rollback_session(session);
            return Err(TxAttemptError::SessionLost(e));
        }
    }

    if !session.is_still_active() {
        rollback_resource(resource);
        rollback_session(session);
        return Err(TxAttemptError::SessionLost(BrokerError::SessionLost(
            "pre-commit liveness probe failed".to_string(),
        )));
    }

    if let Some(resource) = resource {
        if let Err(e) = resource.commit() {
            rollback_session(session);
            return Err(TxAttemptError::Retry(e));
        }
    }

    // Past this point the external resource has committed: a broker failure
    // is the best-effort-1PC window.
    session.commit().map_err(TxAttemptError::MessageSend)
}

fn rollback_resource(resource: Option<Box<dyn ResourceTransaction>>) {
    if let Some(resource) = resource {
        debug!("rolling back external resource transaction");
        resource.rollback();
    }
}

fn rollback_session(session: &mut dyn Session) {
    if let Err(e) = session.rollback() {
        warn!(error = %e, "broker session rollback failed");
    }
}
