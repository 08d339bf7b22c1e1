//! # HERMES Core
//!
//! The engine of the HERMES multi-transport publish/subscribe bus.
//!
//! Nodes join message groups, subscribe to topics, and broadcast opaque
//! payloads; the bus picks the cheapest route per recipient (direct
//! in-process dispatch, a shared-memory SPSC ring, or a UDP datagram)
//! without the caller knowing which was used.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hermes_core::{Node, HermesResult};
//! use std::sync::Arc;
//!
//! fn main() -> HermesResult<()> {
//!     let receiver = Node::create("thermostat")?;
//!     receiver.subscribe("sensor", &["temperature"], Arc::new(|_group, _topic, payload| {
//!         println!("reading: {}", String::from_utf8_lossy(payload));
//!     }))?;
//!
//!     let sender = Node::create("probe")?;
//!     sender.publish("sensor", "temperature", b"T=21C")?;
//!     Ok(())
//! }
//! ```
//!
//! Payloads too large for a datagram go through named shared-memory
//! channels ([`Node::send_large_data`] / [`Node::open_large_data`]); only
//! the notification travels on the normal bus.

pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod memory;

pub use communication::{MessagePacket, MessageType, OverflowCallback, OverflowPolicy, UdpTransport};
pub use config::Config;
pub use crate::core::{
    default_node, Callback, GlobalRegistry, Node, NodePresence, ServiceDescriptor, ServiceType,
    TransportType,
};
pub use error::{HermesError, HermesResult};
pub use memory::{
    LargeDataNotification, LargeDataReader, LargeDataWriter, NodeEntry, RingBuffer, RingStats,
    SharedMemoryRegistry,
};

// Re-export serde for downstream payload types
pub use serde;
