//! # mats-trace: Wire envelope for the Mats messaging runtime
//!
//! This crate contains the per-flow envelope (the "trace") that travels with
//! every message of a flow, and the pure rules that mutate it:
//!
//! - Addressing ([`Channel`], [`MessagingModel`])
//! - Call history ([`Call`], [`CallKind`])
//! - Continuation state ([`StateFrame`])
//! - The envelope itself ([`MatsTrace`], [`InitiatorMeta`], [`KeepTrace`])
//!
//! The envelope is the single source of truth for a live flow: the stack of
//! return addresses pushed by requests, the state frames that carry an
//! endpoint's state between its stages and across request/reply boundaries,
//! and the call history used for debugging. Nothing in this crate touches a
//! broker; the transitions are pure clone-then-mutate operations on the
//! envelope, exercised by the runtime's stage processors and initiators.

use std::{
    fmt::Display,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

mod call;
mod trace;

pub use call::{Call, CallKind, Channel, MessagingModel, StateFrame};
pub use trace::{InitiatorMeta, KeepTrace, MatsTrace};

/// Milliseconds since the Unix epoch.
///
/// Stamped on the envelope at initiation and on every call as it is added.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the Unix epoch.
    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
