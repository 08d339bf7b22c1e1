//! Node core, registries, discovery, and presence.

pub mod discovery;
pub mod node;
pub mod presence;
pub mod registry;
pub mod services;

pub use discovery::{PeerState, RemoteNode};
pub use node::{default_node, Callback, Node};
pub use presence::NodePresence;
pub use registry::GlobalRegistry;
pub use services::{ServiceAnnouncement, ServiceDescriptor, ServiceType, TransportType};
