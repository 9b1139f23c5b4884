//! The broker port traits.
//!
//! Ownership contract: a [`Session`] (and any [`Consumer`] carved from it)
//! is owned by exactly one thread at a time. [`Connection`]s are shared and
//! hand out independent sessions; the runtime's pool decides how sessions
//! map onto physical connections.

use crate::{BrokerResult, Destination, IncomingMessage, OutgoingMessage};

/// Creates physical broker connections. The factory is the only piece of
/// broker wiring an application hands to the runtime.
pub trait ConnectionFactory: Send + Sync {
    /// Establishes a new physical connection.
    fn connect(&self) -> BrokerResult<Box<dyn Connection>>;
}

/// A physical broker connection, shared by a group of sessions.
pub trait Connection: Send + Sync {
    /// Carves a new transacted session out of this connection.
    fn create_session(&self) -> BrokerResult<Box<dyn Session>>;

    /// Closes the physical connection. Idempotent. Blocked receives on
    /// sessions of this connection return `Ok(None)`.
    fn close(&self);
}

/// A transacted broker session.
///
/// Sends are staged until [`commit`](Self::commit); received messages are
/// un-acknowledged until commit and are redelivered after
/// [`rollback`](Self::rollback) (or a close without commit).
pub trait Session: Send {
    /// Stages a message for `destination` in the current transaction.
    fn send(&mut self, destination: &Destination, message: OutgoingMessage) -> BrokerResult<()>;

    /// Creates a consumer on `destination`. For topics, the subscription
    /// exists from this call on: messages published earlier are not seen.
    fn create_consumer(&mut self, destination: &Destination) -> BrokerResult<Box<dyn Consumer>>;

    /// Commits the transaction: publishes staged sends, acknowledges
    /// received messages.
    fn commit(&mut self) -> BrokerResult<()>;

    /// Rolls the transaction back: discards staged sends, makes received
    /// messages eligible for redelivery.
    fn rollback(&mut self) -> BrokerResult<()>;

    /// Pre-commit liveness probe. `false` demands rollback and reacquire.
    fn is_still_active(&self) -> bool;

    /// Closes the session. Idempotent. An uncommitted transaction is rolled
    /// back; blocked receives return `Ok(None)`.
    fn close(&mut self);
}

/// A message consumer bound to one destination of one session.
pub trait Consumer: Send {
    /// Blocks until a message arrives, returning `Ok(None)` when the session
    /// (or connection) closes while waiting.
    fn receive(&mut self) -> BrokerResult<Option<IncomingMessage>>;
}
