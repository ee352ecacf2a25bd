//! Wire types for the user-space connection manager broker.
//!
//! This crate contains the serde-serializable types exchanged between a
//! client and the broker: identifiers, opcodes, per-opcode request
//! structs, responses and the event records handed out by `get_event`.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization and a few constructors
//! - **Sized like the ABI**: Every response carries the fixed size a client
//!   buffer must reserve for it (see [`Response::wire_size`])
//! - **Stable**: Changes only when the command surface changes
//!
//! The lifecycle engine that gives these types meaning lives in
//! `ucm-runtime`.

pub mod command;
pub mod ids;
pub mod types;

pub use command::*;
pub use ids::*;
pub use types::*;
