//! Wire protocol, UDP transport, and the inbound dispatch pool.

pub mod dispatch;
pub mod packet;
pub mod udp;

pub use dispatch::{DispatchPool, InboundMessage, OverflowCallback, OverflowPolicy};
pub use packet::{MessagePacket, MessageType};
pub use udp::{ReceiveCallback, UdpTransport, PORT_BASE, PORT_MAX};
