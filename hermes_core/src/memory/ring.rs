//! Byte-framed SPSC ring buffer in shared memory.
//!
//! One producer process/thread, one consumer process/thread, wait-free on
//! both sides. Variable-length messages are stored as frames:
//!
//! ```text
//! FrameHeader { length: u32, magic: u32 }  // 8 bytes
//! payload     [length bytes]
//! padding     [0-7 bytes, to the next 8-byte boundary]
//! ```
//!
//! A frame with `MAGIC_PADDING` carries no payload and tells the reader to
//! wrap to offset 0. `head` (next write) and `tail` (next read) are
//! monotonically increasing byte offsets; the physical position is
//! `cursor & (size - 1)`. `head == tail` iff the ring is empty, so a full
//! ring (`head - tail == size`, possible when a frame ends flush on the
//! region boundary) is checked before the offset-space cases.
//!
//! Fan-in is one ring per producer. The producer/consumer endpoints can each
//! be taken exactly once per process; handing a second thread a reference to
//! the same endpoint is prevented by making them `!Sync`.

use crate::error::{HermesError, HermesResult};
use crate::memory::shm_region::ShmRegion;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum payload of a single frame in node packet rings.
pub const MAX_FRAME_PAYLOAD: usize = 2040;

/// Smallest supported data area. The public channel constructors clamp to
/// 4 KiB; tiny rings exist for boundary tests.
pub const MIN_RING_SIZE: usize = 64;

const FRAME_HEADER_SIZE: usize = 8;
const MAGIC_VALID: u32 = 0xCAFE_BABE;
const MAGIC_PADDING: u32 = 0xDEAD_BEEF;

// "HMSRING1", written last by the creator with release ordering.
const RING_MAGIC: u64 = 0x484D_5352_494E_4731;

// Bounded spin while the creator initializes the header (~100ms).
const MAX_INIT_WAIT_ITERS: u32 = 1_000_000;

#[inline]
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// 128-byte alignment keeps producer- and consumer-written words out of each
/// other's prefetch pairs (Intel prefetches adjacent lines in pairs).
#[repr(C, align(128))]
struct CachePadded<T> {
    value: T,
}

#[repr(C)]
struct FrameHeader {
    length: u32,
    magic: u32,
}

#[repr(C)]
struct RingStatsAtomic {
    written: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
}

/// Region layout: this header, then `data_size` bytes of frames.
#[repr(C, align(128))]
struct RingHeader {
    // Lines 0: read-mostly, written once by the creator
    magic: AtomicU64,
    data_size: AtomicU64,
    max_payload: AtomicU64,
    _pad0: [u8; 104],
    // Producer cursor on its own line pair
    head: CachePadded<AtomicU64>,
    // Consumer cursor on its own line pair
    tail: CachePadded<AtomicU64>,
    // Statistics share a third line
    stats: CachePadded<RingStatsAtomic>,
}

const RING_HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

/// Cumulative ring statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub messages_written: u64,
    pub messages_read: u64,
    pub messages_dropped: u64,
}

/// A byte-framed SPSC ring living in a named shared-memory region.
pub struct RingBuffer {
    _region: ShmRegion,
    header: NonNull<RingHeader>,
    data: NonNull<u8>,
    size: u64,
    max_payload: usize,
    producer_taken: AtomicBool,
    consumer_taken: AtomicBool,
}

// SAFETY: all shared state is behind atomics in the mapped header; the data
// area is published via Release/Acquire on the cursors.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    fn validate_geometry(data_size: usize, max_payload: usize) -> HermesResult<()> {
        if !data_size.is_power_of_two() || data_size < MIN_RING_SIZE {
            return Err(HermesError::memory(format!(
                "ring size {} must be a power of two >= {}",
                data_size, MIN_RING_SIZE
            )));
        }
        if max_payload == 0 {
            return Err(HermesError::memory("ring max payload must be non-zero"));
        }
        if align8(FRAME_HEADER_SIZE + max_payload) > data_size {
            return Err(HermesError::memory(format!(
                "ring size {} cannot hold a {}-byte frame",
                data_size, max_payload
            )));
        }
        Ok(())
    }

    /// Create the named ring (or attach to it if it already exists with the
    /// same geometry).
    pub fn create(name: &str, data_size: usize, max_payload: usize) -> HermesResult<Arc<Self>> {
        Self::validate_geometry(data_size, max_payload)?;
        let region = ShmRegion::create(name, RING_HEADER_SIZE + data_size)?;
        let is_owner = region.is_owner();
        Self::from_region(region, is_owner, Some((data_size, max_payload)), name)
    }

    /// Attach to an existing ring; geometry comes from its header.
    pub fn open(name: &str) -> HermesResult<Arc<Self>> {
        let region = ShmRegion::open(name)?;
        Self::from_region(region, false, None, name)
    }

    fn from_region(
        region: ShmRegion,
        init: bool,
        geometry: Option<(usize, usize)>,
        name: &str,
    ) -> HermesResult<Arc<Self>> {
        let header_ptr = region.as_mut_ptr() as *mut RingHeader;
        if !(header_ptr as usize).is_multiple_of(std::mem::align_of::<RingHeader>()) {
            return Err(HermesError::memory("ring header pointer misaligned"));
        }
        // SAFETY: the region is at least RING_HEADER_SIZE bytes (checked by
        // the callers via geometry validation / the creator's sizing) and the
        // pointer is non-null and aligned.
        let header = NonNull::new(header_ptr)
            .ok_or_else(|| HermesError::memory("null ring header pointer"))?;

        if init {
            let (data_size, max_payload) =
                geometry.ok_or_else(|| HermesError::memory("missing ring geometry"))?;
            // SAFETY: we are the creator; nobody reads fields until the magic
            // is published below.
            unsafe {
                let h = header.as_ref();
                h.data_size.store(data_size as u64, Ordering::Relaxed);
                h.max_payload.store(max_payload as u64, Ordering::Relaxed);
                h.head.value.store(0, Ordering::Relaxed);
                h.tail.value.store(0, Ordering::Relaxed);
                h.stats.value.written.store(0, Ordering::Relaxed);
                h.stats.value.read.store(0, Ordering::Relaxed);
                h.stats.value.dropped.store(0, Ordering::Relaxed);
                // Magic last: attachers spin on it before trusting anything
                fence(Ordering::Release);
                h.magic.store(RING_MAGIC, Ordering::Release);
            }
        } else {
            let mut wait = 0u32;
            loop {
                // SAFETY: header points into the live mapping; the load
                // synchronizes with the creator's release store.
                let magic = unsafe { header.as_ref().magic.load(Ordering::Acquire) };
                if magic == RING_MAGIC {
                    break;
                }
                if magic != 0 {
                    return Err(HermesError::memory(format!(
                        "ring '{}' has invalid magic 0x{:X} (corrupted or incompatible)",
                        name, magic
                    )));
                }
                wait += 1;
                if wait > MAX_INIT_WAIT_ITERS {
                    return Err(HermesError::memory(format!(
                        "ring '{}' initialization timeout (creator crashed during setup?)",
                        name
                    )));
                }
                std::hint::spin_loop();
            }
        }

        // SAFETY: magic is published, the sizing fields are stable now.
        let (data_size, max_payload) = unsafe {
            let h = header.as_ref();
            (
                h.data_size.load(Ordering::Acquire) as usize,
                h.max_payload.load(Ordering::Acquire) as usize,
            )
        };
        Self::validate_geometry(data_size, max_payload)?;
        if let Some((want_size, want_payload)) = geometry {
            if !init && (want_size != data_size || want_payload != max_payload) {
                return Err(HermesError::memory(format!(
                    "ring '{}' geometry mismatch: existing {}x{}, requested {}x{}",
                    name, data_size, max_payload, want_size, want_payload
                )));
            }
        }
        if region.size() < RING_HEADER_SIZE + data_size {
            return Err(HermesError::memory(format!(
                "ring '{}' region too small for its declared size",
                name
            )));
        }

        // SAFETY: offset stays inside the mapping (checked above).
        let data = unsafe {
            NonNull::new(region.as_mut_ptr().add(RING_HEADER_SIZE))
                .ok_or_else(|| HermesError::memory("null ring data pointer"))?
        };

        Ok(Arc::new(Self {
            _region: region,
            header,
            data,
            size: data_size as u64,
            max_payload,
            producer_taken: AtomicBool::new(false),
            consumer_taken: AtomicBool::new(false),
        }))
    }

    /// Take the single producer endpoint. Fails on the second call.
    pub fn producer(self: &Arc<Self>) -> HermesResult<RingProducer> {
        if self.producer_taken.swap(true, Ordering::AcqRel) {
            return Err(HermesError::AlreadyExists(
                "ring producer endpoint already taken".into(),
            ));
        }
        Ok(RingProducer {
            ring: Arc::clone(self),
            _not_sync: PhantomData,
        })
    }

    /// Take the single consumer endpoint. Fails on the second call.
    pub fn consumer(self: &Arc<Self>) -> HermesResult<RingConsumer> {
        if self.consumer_taken.swap(true, Ordering::AcqRel) {
            return Err(HermesError::AlreadyExists(
                "ring consumer endpoint already taken".into(),
            ));
        }
        Ok(RingConsumer {
            ring: Arc::clone(self),
            _not_sync: PhantomData,
        })
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn stats(&self) -> RingStats {
        let h = self.header();
        RingStats {
            messages_written: h.stats.value.written.load(Ordering::Relaxed),
            messages_read: h.stats.value.read.load(Ordering::Relaxed),
            messages_dropped: h.stats.value.dropped.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: the header lives in the mapping for the lifetime of self.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn frame_ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset < self.size);
        // SAFETY: offset < data_size, inside the mapping.
        unsafe { self.data.as_ptr().add(offset as usize) }
    }

    fn write_frame(&self, offset: u64, payload: &[u8]) {
        let ptr = self.frame_ptr(offset);
        let hdr = FrameHeader {
            length: payload.len() as u32,
            magic: MAGIC_VALID,
        };
        // SAFETY: offset is 8-aligned and the frame (header + payload +
        // padding) fits below data_size; exclusivity is guaranteed by the
        // single-producer protocol.
        unsafe {
            (ptr as *mut FrameHeader).write(hdr);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr.add(FRAME_HEADER_SIZE), payload.len());
        }
    }

    fn write_padding(&self, offset: u64, span: u64) {
        debug_assert!(span >= FRAME_HEADER_SIZE as u64);
        let hdr = FrameHeader {
            length: span as u32,
            magic: MAGIC_PADDING,
        };
        // SAFETY: as in write_frame; a padding header always fits because
        // offsets and the region size are multiples of 8.
        unsafe {
            (self.frame_ptr(offset) as *mut FrameHeader).write(hdr);
        }
    }

    fn try_write(&self, payload: &[u8]) -> bool {
        let size = payload.len();
        if size == 0 || size > self.max_payload {
            return false;
        }
        let needed = align8(FRAME_HEADER_SIZE + size) as u64;
        let hdr = self.header();
        let head = hdr.head.value.load(Ordering::Acquire);
        let tail = hdr.tail.value.load(Ordering::Acquire);
        let s = self.size;
        let mask = s - 1;
        let used = head.wrapping_sub(tail);
        debug_assert!(used <= s);

        if used == s {
            // A frame ended flush on the boundary last time; completely full.
            hdr.stats.value.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let h = head & mask;
        let t = tail & mask;

        if h >= t {
            // Free space: [h, s) and [0, t)
            if h + needed <= s {
                self.write_frame(h, payload);
                hdr.head.value.store(head + needed, Ordering::Release);
                hdr.stats.value.written.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            // Wrap: padding over [h, s), frame at 0. Strictly less than t
            // keeps the cursors from meeting mid-region.
            if needed < t {
                self.write_padding(h, s - h);
                self.write_frame(0, payload);
                hdr.head
                    .value
                    .store(head + (s - h) + needed, Ordering::Release);
                hdr.stats.value.written.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        } else {
            // Free space: [h, t)
            if h + needed < t {
                self.write_frame(h, payload);
                hdr.head.value.store(head + needed, Ordering::Release);
                hdr.stats.value.written.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        hdr.stats.value.dropped.fetch_add(1, Ordering::Relaxed);
        false
    }

    fn try_read_into(&self, out: &mut [u8]) -> HermesResult<Option<usize>> {
        let hdr = self.header();
        let s = self.size;
        let mask = s - 1;

        loop {
            let tail = hdr.tail.value.load(Ordering::Acquire);
            let head = hdr.head.value.load(Ordering::Acquire);
            if tail == head {
                return Ok(None);
            }

            let t = tail & mask;
            // SAFETY: a frame header at t was fully written before the
            // producer's release store on head made tail != head observable.
            let frame = unsafe { (self.frame_ptr(t) as *const FrameHeader).read() };

            match frame.magic {
                MAGIC_PADDING => {
                    // Skip to the start of the next lap
                    hdr.tail.value.store(tail + (s - t), Ordering::Release);
                    continue;
                }
                MAGIC_VALID => {
                    let len = frame.length as usize;
                    if len > self.max_payload {
                        // Corruption: do not advance, the consumer escalates.
                        return Err(HermesError::memory(format!(
                            "corrupted ring frame: length {} exceeds max payload {}",
                            len, self.max_payload
                        )));
                    }
                    if len > out.len() {
                        return Err(HermesError::invalid_input(format!(
                            "read buffer of {} bytes cannot hold a {}-byte frame",
                            out.len(),
                            len
                        )));
                    }
                    // SAFETY: the payload lies within [t+8, t+8+len), inside
                    // the data area, published by the producer.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            self.frame_ptr(t).add(FRAME_HEADER_SIZE),
                            out.as_mut_ptr(),
                            len,
                        );
                    }
                    hdr.tail
                        .value
                        .store(tail + align8(FRAME_HEADER_SIZE + len) as u64, Ordering::Release);
                    hdr.stats.value.read.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(len));
                }
                other => {
                    return Err(HermesError::memory(format!(
                        "corrupted ring frame: unknown magic 0x{:X}",
                        other
                    )));
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        let hdr = self.header();
        hdr.head.value.load(Ordering::Acquire) == hdr.tail.value.load(Ordering::Acquire)
    }
}

/// Write side of a ring. `Send` but deliberately `!Sync`: exactly one thread
/// may produce.
pub struct RingProducer {
    ring: Arc<RingBuffer>,
    _not_sync: PhantomData<Cell<()>>,
}

impl RingProducer {
    /// Append one frame. Returns `false` if the payload is empty, oversized,
    /// or the ring is full (the drop counter is bumped for a full ring).
    pub fn try_write(&self, payload: &[u8]) -> bool {
        self.ring.try_write(payload)
    }

    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }

    pub fn max_payload(&self) -> usize {
        self.ring.max_payload()
    }
}

/// Read side of a ring. `Send` but `!Sync`: exactly one thread may consume.
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
    _not_sync: PhantomData<Cell<()>>,
}

impl RingConsumer {
    /// Pop the next frame into `out` (which must hold `max_payload` bytes).
    ///
    /// `Ok(None)` when empty. `Err` on a corrupted frame; the cursor is
    /// left in place so the fault is observable rather than silently skipped.
    pub fn try_read_into(&self, out: &mut [u8]) -> HermesResult<Option<usize>> {
        self.ring.try_read_into(out)
    }

    /// Pop the next frame as an owned buffer.
    pub fn try_read(&self) -> HermesResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; self.ring.max_payload()];
        match self.ring.try_read_into(&mut buf)? {
            Some(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }
}
