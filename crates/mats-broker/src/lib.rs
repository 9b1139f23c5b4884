//! # mats-broker: Broker port for the Mats messaging runtime
//!
//! The runtime talks to its message broker exclusively through the traits in
//! this crate: [`ConnectionFactory`] → [`Connection`] → [`Session`] →
//! [`Consumer`]. The broker is an external collaborator; any client with
//! transactional send/receive on queues, publish/subscribe on topics,
//! per-message persistence and priority flags, and keyed message bodies can
//! stand behind this port.
//!
//! Also here: the message representation ([`OutgoingMessage`],
//! [`IncomingMessage`], [`Priority`]), destination naming
//! ([`Destination`], [`DestinationKind`]) and the wire-key scheme
//! ([`WireKeys`]) that places the envelope, its serializer meta, and the
//! bytes/strings side channels into a message body.

mod destination;
mod error;
mod message;
mod port;

pub use destination::{Destination, DestinationKind};
pub use error::{BrokerError, BrokerResult};
pub use message::{IncomingMessage, OutgoingMessage, Priority, WireKeys, MSG_ID_HEADER, TRACE_ID_HEADER};
pub use port::{Connection, ConnectionFactory, Consumer, Session};
