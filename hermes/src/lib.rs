//! # HERMES: multi-transport publish/subscribe bus
//!
//! Nodes living in the same process, in sibling processes, or on different
//! hosts join message groups, subscribe to topics, and broadcast payloads.
//! The bus selects the cheapest available transport per recipient
//! (in-process delivery, a shared-memory ring, or a UDP datagram) with
//! automatic discovery on the local host.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hermes::prelude::*;
//! use std::sync::Arc;
//!
//! let node = Node::create("thermostat").unwrap();
//! node.subscribe("sensor", &["temperature"], Arc::new(|_g, _t, payload| {
//!     println!("reading: {}", String::from_utf8_lossy(payload));
//! })).unwrap();
//! ```

// Re-export the engine
pub use hermes_core::{self, *};

// Re-export serde at crate root for downstream payload types
pub use serde;

/// Everything you need to get started: `use hermes::prelude::*;`
pub mod prelude {
    pub use hermes_core::config::Config;
    pub use hermes_core::core::{
        default_node, Callback, Node, ServiceDescriptor, ServiceType, TransportType,
    };
    pub use hermes_core::error::{HermesError, HermesResult};
    pub use hermes_core::memory::{LargeDataNotification, LargeDataReader, LargeDataWriter};
    pub use hermes_core::communication::OverflowPolicy;
}
