//! Shared-memory primitives: regions, the framed SPSC ring, the host-wide
//! node registry, and large-data channels.

pub mod large_data;
pub mod platform;
pub mod ring;
pub mod shm_region;
pub mod shm_registry;

pub use large_data::{LargeDataNotification, LargeDataReader, LargeDataWriter};
pub use ring::{RingBuffer, RingConsumer, RingProducer, RingStats, MAX_FRAME_PAYLOAD};
pub use shm_region::ShmRegion;
pub use shm_registry::{NodeEntry, SharedMemoryRegistry, MAX_ENTRIES};
