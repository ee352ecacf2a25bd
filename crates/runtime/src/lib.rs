//! UCM Runtime - session-scoped connection context broker
//!
//! This crate brokers externally managed connection endpoints to client
//! sessions:
//!
//! - **Handle table**: integer ids for contexts and multicast memberships
//! - **Contexts**: reference-counted endpoints with two-phase teardown
//! - **Sessions**: per-client ownership lists and a FIFO event queue
//! - **Delivery**: callbacks from the connection manager into session queues
//! - **Migration**: moving a context and its pending events between sessions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   ucm-cli   │  Unix-socket daemon, one session per client
//! └──────┬──────┘
//!        │ Session::execute(Command)
//! ┌──────▼──────┐
//! │ ucm-runtime │  This crate
//! │  ┌────────┐ │
//! │  │ Table  │ │  id -> context / membership
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │Session │ │  ownership list + event queue
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Sink   │ │  manager callbacks
//! │  └────────┘ │
//! └──────┬──────┘
//!        │ Endpoint / EventSink
//! ┌──────▼──────┐
//! │   manager   │  loopback or a real fabric
//! └─────────────┘
//! ```
//!
//! # Lock order
//!
//! Session state, then a context's endpoint lock, then the handle table.
//! Two sessions are always locked in ascending id order.

pub mod broker;
pub mod config;
pub mod context;
mod delivery;
pub mod dispatch;
pub mod error;
pub mod loopback;
pub mod manager;
mod migrate;
mod multicast;
mod ops;
pub mod session;
mod table;
mod teardown;

#[cfg(test)]
mod test_support;

// Re-export key types at crate root
pub use broker::Broker;
pub use config::BrokerConfig;
pub use context::{ContextState, ContextStatus};
pub use dispatch::Command;
pub use error::{Error, Result};
pub use loopback::LoopbackManager;
pub use manager::{CmEvent, ConnectionManager, Endpoint, EventSink, IdOption, Rejected};
pub use session::Session;
