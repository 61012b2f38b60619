//! disasync: tick-ordered replication of collaboratively edited disassembly databases
//!
//! Several editors of one shared document stay consistent through a central
//! relay. Every mutation is persisted by the relay at the next tick of its
//! `(repository, branch)` log and fanned out to the other subscribers, which
//! apply it in tick order. Late or reconnecting clients replay the log from
//! their last applied tick.
//!
//! # Architecture
//!
//! - **Protocol**: tagged packets framed as length-prefixed CBOR maps, with
//!   query/reply pairs correlated by identifier
//! - **Server**: SQLite event log, subscription manager and TCP relay
//! - **Client**: connection, query correlation and the replication engine
//!   driving the host editor through [`client::DocumentHooks`]

pub mod correlation;
pub mod fs;
pub mod protocol;
pub mod types;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "server")]
pub mod tracing_util;

#[cfg(feature = "client")]
pub mod client;

// Re-export commonly used types
pub use protocol::{Event, EventPayload, Packet};
pub use types::{Branch, Error, ErrorCode, ProtocolError, Repository, Result, Tick};

#[cfg(feature = "client")]
pub use client::{Client, ClientConfig, DocumentHooks};

#[cfg(feature = "server")]
pub use server::{Server, ServerConfig};
