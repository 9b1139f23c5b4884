//! # Mats: messaging-based service composition
//!
//! A runtime for expressing services as *multi-stage endpoints* over a
//! transactional message broker. Each stage is an independent message
//! consumer; a flow travels between stages as a self-contained envelope
//! carrying its stack of return addresses and its state history, so no
//! process ever holds flow state in memory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           MatsFactory                            │
//! │  ┌───────────┐   ┌────────────┐   ┌───────────┐   ┌───────────┐ │
//! │  │ Initiator │ → │   Broker   │ → │   Stage   │ → │  Broker   │ │
//! │  │ (tx send) │   │ (queue/    │   │ processor │   │  (reply/  │ │
//! │  └───────────┘   │   topic)   │   │ (tx recv) │   │  request) │ │
//! │                  └────────────┘   └───────────┘   └───────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use mats::{FactoryConfig, MatsFactory};
//! use mats_serial::MatsSerializerJson;
//! use std::sync::Arc;
//!
//! let factory = MatsFactory::create(broker_connection_factory, Arc::new(MatsSerializerJson::new()), FactoryConfig::load_or_default());
//!
//! // A single-stage service endpoint.
//! factory.single("svc.double", |_ctx, x: i32| Ok(x * 2));
//!
//! // A terminator receiving final replies.
//! factory.terminator("app.result", |ctx, _state: &mut (), result: i32| {
//!     println!("flow {} finished: {result}", ctx.trace_id());
//!     Ok(())
//! });
//!
//! factory.default_initiator().initiate(|init| {
//!     init.trace_id("flow-4711").from("app.main").to("svc.double");
//!     init.reply_to("app.result", &())?;
//!     init.request(&21)
//! })?;
//! ```
//!
//! # Guarantees
//!
//! - At-least-once delivery with transactional receive-process-send: a stage
//!   failure rolls everything back and the broker redelivers.
//! - Replies return to the continuation on top of the flow's stack, with the
//!   requester's state restored from the envelope.
//! - Message send is atomically tied to an optional external resource via
//!   best-effort 1PC, with the inter-commit hazard surfaced distinctly
//!   ([`MatsError::MessageSend`]).

mod config;
mod endpoint;
mod error;
mod factory;
mod initiator;
mod process_context;
mod session_pool;
mod stage_processor;
mod transactions;
mod wrappers;

pub use config::FactoryConfig;
pub use endpoint::EndpointSetup;
pub use error::{MatsError, MatsResult};
pub use factory::MatsFactory;
pub use initiator::{InitiateContext, Initiator};
pub use process_context::ProcessContext;
pub use transactions::{ResourceTransaction, TransactionManager};
pub use wrappers::{FactoryWrapper, unwrap_fully};

// Re-export the envelope model.
pub use mats_trace::{
    Call, CallKind, Channel, InitiatorMeta, KeepTrace, MatsTrace, MessagingModel, StateFrame,
    Timestamp,
};

// Re-export the serializer port.
pub use mats_serial::{
    CompressionKind, MatsSerializer, MatsSerializerJson, SerializationError, SerializedTrace,
};

// Re-export the broker port.
pub use mats_broker::{
    BrokerError, Connection, ConnectionFactory, Consumer, Destination, DestinationKind,
    IncomingMessage, MSG_ID_HEADER, OutgoingMessage, Priority, Session, TRACE_ID_HEADER, WireKeys,
};
