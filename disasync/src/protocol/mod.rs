//! Wire protocol spoken between disasync clients and the relay
//!
//! Packets are length-prefixed CBOR maps tagged with their type. See
//! [`codec`] for the framing and [`packet`] for the envelope.

use std::time::Duration;

pub mod codec;
pub mod commands;
pub mod packet;
pub mod progress;

pub use codec::PacketCodec;
pub use commands::*;
pub use packet::{Exchange, Packet, QueryId};
pub use progress::{Progress, Transfers};

/// Maximum size of an encoded packet header (10 MB)
pub const MAX_HEADER_SIZE: usize = 10 * 1024 * 1024;

/// Maximum size of the content section of a container packet (1 GiB)
pub const MAX_CONTAINER_SIZE: usize = 1024 * 1024 * 1024;

/// Default query timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
