//! Large-data side channels.
//!
//! Payloads too big for the datagram path travel through a named SPSC ring
//! (same framing as the packet rings, with a per-channel frame limit). Only
//! the announcement is carried on the normal bus: the sender publishes a
//! [`LargeDataNotification`] on the subscribed topic, and the receiver opens
//! the channel by name and drains it.

use crate::config::Config;
use crate::error::{HermesError, HermesResult};
use crate::memory::ring::{RingBuffer, RingConsumer, RingProducer, RingStats};
use serde::{Deserialize, Serialize};

/// Smallest ring region a channel will allocate.
pub const MIN_CHANNEL_SIZE: usize = 4096;

/// Control message published on the normal bus when a block lands in a
/// large-data channel. bincode-encoded as the DATA payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LargeDataNotification {
    pub channel_name: String,
    pub topic: String,
    pub size: u64,
}

impl LargeDataNotification {
    pub fn encode(&self) -> HermesResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> HermesResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn channel_geometry(buffer_size: usize, max_block_size: usize) -> HermesResult<(usize, usize)> {
    if max_block_size == 0 {
        return Err(HermesError::invalid_input(
            "channel max block size must be non-zero",
        ));
    }
    let size = buffer_size
        .max(MIN_CHANNEL_SIZE)
        .checked_next_power_of_two()
        .ok_or_else(|| HermesError::invalid_input("channel buffer size overflow"))?;
    if (8 + max_block_size + 7) & !7 > size {
        return Err(HermesError::invalid_input(format!(
            "channel buffer of {} bytes cannot hold a {}-byte block",
            size, max_block_size
        )));
    }
    Ok((size, max_block_size))
}

/// Producer side of a named channel. One writer per channel.
pub struct LargeDataWriter {
    name: String,
    producer: RingProducer,
    max_block_size: usize,
}

impl std::fmt::Debug for LargeDataWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeDataWriter")
            .field("name", &self.name)
            .field("max_block_size", &self.max_block_size)
            .finish()
    }
}

impl LargeDataWriter {
    /// Create the named channel with explicit geometry.
    pub fn create(name: &str, buffer_size: usize, max_block_size: usize) -> HermesResult<Self> {
        let (size, max_block) = channel_geometry(buffer_size, max_block_size)?;
        let ring = RingBuffer::create(name, size, max_block)?;
        Ok(Self {
            name: name.to_string(),
            producer: ring.producer()?,
            max_block_size: max_block,
        })
    }

    /// Create the named channel using the configured defaults.
    pub fn create_default(name: &str) -> HermesResult<Self> {
        let cfg = &Config::global().large_data;
        Self::create(name, cfg.buffer_size, cfg.max_block_size)
    }

    /// Write one block. Overflow drops the new block (the notification is
    /// never published for a failed write, so readers see no gap).
    pub fn write(&self, payload: &[u8]) -> HermesResult<()> {
        if payload.is_empty() {
            return Err(HermesError::invalid_input("empty large-data payload"));
        }
        if payload.len() > self.max_block_size {
            return Err(HermesError::PayloadTooLarge(format!(
                "{} bytes exceeds channel '{}' max block size of {}",
                payload.len(),
                self.name,
                self.max_block_size
            )));
        }
        if !self.producer.try_write(payload) {
            return Err(HermesError::memory(format!(
                "channel '{}' is full, block dropped",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn stats(&self) -> RingStats {
        self.producer.stats()
    }
}

/// Consumer side of a named channel. One reader per channel.
pub struct LargeDataReader {
    name: String,
    consumer: RingConsumer,
    scratch: Vec<u8>,
}

impl LargeDataReader {
    /// Open an announced channel by name.
    pub fn open(name: &str) -> HermesResult<Self> {
        let ring = RingBuffer::open(name)?;
        let scratch = vec![0u8; ring.max_payload()];
        Ok(Self {
            name: name.to_string(),
            consumer: ring.consumer()?,
            scratch,
        })
    }

    /// Pop the next block, if any.
    pub fn try_read(&mut self) -> HermesResult<Option<Vec<u8>>> {
        match self.consumer.try_read_into(&mut self.scratch)? {
            Some(len) => Ok(Some(self.scratch[..len].to_vec())),
            None => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> RingStats {
        self.consumer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::shm_region::unique_name;

    #[test]
    fn notification_round_trip() {
        let n = LargeDataNotification {
            channel_name: "/cam0_frames".into(),
            topic: "frame".into(),
            size: 1 << 20,
        };
        let bytes = n.encode().unwrap();
        assert_eq!(LargeDataNotification::decode(&bytes).unwrap(), n);
    }

    #[test]
    fn write_and_drain() {
        let name = unique_name("chan");
        let writer = LargeDataWriter::create(&name, 1 << 16, 4096).unwrap();
        let mut reader = LargeDataReader::open(&name).unwrap();

        let block: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        writer.write(&block).unwrap();
        writer.write(&block).unwrap();

        assert_eq!(reader.try_read().unwrap().unwrap(), block);
        assert_eq!(reader.try_read().unwrap().unwrap(), block);
        assert_eq!(reader.try_read().unwrap(), None);
    }

    #[test]
    fn oversize_block_is_explicit_error() {
        let name = unique_name("chan_big");
        let writer = LargeDataWriter::create(&name, 1 << 16, 1024).unwrap();
        let err = writer.write(&vec![0u8; 1025]).unwrap_err();
        assert!(matches!(err, HermesError::PayloadTooLarge(_)));
        // Ring untouched
        assert_eq!(writer.stats().messages_written, 0);
    }

    #[test]
    fn full_channel_drops_newest() {
        let name = unique_name("chan_full");
        // 4096-byte ring, 1000-byte blocks framed to 1008 bytes: four fit
        let writer = LargeDataWriter::create(&name, 4096, 1000).unwrap();
        let block = vec![7u8; 1000];
        for _ in 0..4 {
            writer.write(&block).unwrap();
        }
        let err = writer.write(&block).unwrap_err();
        assert!(matches!(err, HermesError::Memory(_)));
        assert_eq!(writer.stats().messages_dropped, 1);
        assert_eq!(writer.stats().messages_written, 4);
    }

    #[test]
    fn geometry_validation() {
        assert!(channel_geometry(0, 0).is_err());
        // Block bigger than the buffer can ever hold
        let err = LargeDataWriter::create(&unique_name("chan_geo"), 4096, 1 << 20).unwrap_err();
        assert!(matches!(err, HermesError::InvalidInput(_)));
    }
}
