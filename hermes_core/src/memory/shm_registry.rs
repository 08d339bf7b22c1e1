//! Shared-memory node registry.
//!
//! A single well-known region (`hermes_registry`) holds up to 256 fixed-size
//! slots mapping `node_id -> (inbound ring base name, pid, heartbeat)`. Every
//! process on the host maps the same region; liveness is heartbeat- and
//! pid-based, so a crashed process is reclaimed by any surviving one.
//!
//! Strings are stored as arrays of 8-byte atomic words: a reader racing a
//! writer observes whole words, never torn bytes. Slot visibility follows the
//! flags word: a slot is filled first and published by setting
//! `VALID | ACTIVE` with release ordering.

use crate::error::{HermesError, HermesResult};
use crate::memory::shm_region::ShmRegion;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_ENTRIES: usize = 256;
pub const NODE_ID_BYTES: usize = 64;
pub const SHM_NAME_BYTES: usize = 64;

const REGISTRY_MAGIC: u32 = 0x4C52_5247;
const REGISTRY_VERSION: u32 = 1;
const DEFAULT_REGISTRY_NAME: &str = "registry";

const FLAG_VALID: u32 = 1 << 0;
const FLAG_ACTIVE: u32 = 1 << 1;

const MAX_INIT_WAIT_ITERS: u32 = 1_000_000;

#[repr(C, align(64))]
struct RegistryHeader {
    magic: AtomicU32,
    version: AtomicU32,
    num_entries: AtomicU32,
    capacity: AtomicU32,
    open_count: AtomicU32,
    _pad: [u8; 44],
}

#[repr(C)]
struct RegistryEntry {
    flags: AtomicU32,
    pid: AtomicU32,
    last_heartbeat_ms: AtomicU64,
    node_id: [AtomicU64; 8],
    shm_name: [AtomicU64; 8],
    _pad: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<RegistryHeader>() == 64);
const _: () = assert!(std::mem::size_of::<RegistryEntry>() == 192);

const REGION_SIZE: usize =
    std::mem::size_of::<RegistryHeader>() + MAX_ENTRIES * std::mem::size_of::<RegistryEntry>();

/// Snapshot of one live registry slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub node_id: String,
    pub shm_name: String,
    pub pid: u32,
    pub last_heartbeat_ms: u64,
}

pub struct SharedMemoryRegistry {
    region: ShmRegion,
    header: NonNull<RegistryHeader>,
    entries: NonNull<RegistryEntry>,
}

// SAFETY: all mutation goes through the atomics inside the mapping.
unsafe impl Send for SharedMemoryRegistry {}
unsafe impl Sync for SharedMemoryRegistry {}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Existence check via signal 0, as the monitor tooling does.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: kill(pid, 0) delivers no signal; it only probes existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Pack a string into 8-byte words, NUL-padded.
pub(crate) fn write_atomic_string(words: &[AtomicU64], s: &str, max_bytes: usize) {
    debug_assert!(s.len() < max_bytes);
    let mut raw = vec![0u8; max_bytes];
    raw[..s.len()].copy_from_slice(s.as_bytes());
    for (i, chunk) in raw.chunks_exact(8).enumerate() {
        let word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        words[i].store(word, Ordering::Relaxed);
    }
}

/// Read a NUL-terminated string back out of its atomic words.
pub(crate) fn read_atomic_string(words: &[AtomicU64]) -> String {
    let mut raw = Vec::with_capacity(words.len() * 8);
    for word in words {
        raw.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
    }
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl SharedMemoryRegistry {
    /// Open the host-wide registry, creating it if this is the first process.
    pub fn open() -> HermesResult<Self> {
        Self::open_named(DEFAULT_REGISTRY_NAME)
    }

    /// Open a registry under a custom region name (tests use unique names so
    /// they do not cross-talk with live buses on the same host).
    pub fn open_named(name: &str) -> HermesResult<Self> {
        let region = ShmRegion::create(name, REGION_SIZE)?;
        // The last closer unlinks (see Drop); the creator must not take the
        // file down while other processes still use it.
        region.persist();
        let is_owner = region.is_owner();

        let header = NonNull::new(region.as_mut_ptr() as *mut RegistryHeader)
            .ok_or_else(|| HermesError::memory("null registry header"))?;
        // SAFETY: REGION_SIZE covers header + entries; the pointer math stays
        // inside the mapping.
        let entries = unsafe {
            NonNull::new(
                region
                    .as_mut_ptr()
                    .add(std::mem::size_of::<RegistryHeader>()) as *mut RegistryEntry,
            )
            .ok_or_else(|| HermesError::memory("null registry entries"))?
        };

        // SAFETY: header is inside the live mapping.
        let h = unsafe { header.as_ref() };
        if is_owner {
            h.version.store(REGISTRY_VERSION, Ordering::Relaxed);
            h.num_entries.store(0, Ordering::Relaxed);
            h.capacity.store(MAX_ENTRIES as u32, Ordering::Relaxed);
            h.open_count.store(0, Ordering::Relaxed);
            fence(Ordering::Release);
            h.magic.store(REGISTRY_MAGIC, Ordering::Release);
        } else {
            let mut wait = 0u32;
            loop {
                let magic = h.magic.load(Ordering::Acquire);
                if magic == REGISTRY_MAGIC {
                    break;
                }
                if magic != 0 {
                    return Err(HermesError::memory(format!(
                        "registry has invalid magic 0x{:X} (corrupted or incompatible); \
                         remove the hermes_* files under /dev/shm and restart",
                        magic
                    )));
                }
                wait += 1;
                if wait > MAX_INIT_WAIT_ITERS {
                    return Err(HermesError::memory(
                        "registry initialization timeout (creator crashed during setup?)",
                    ));
                }
                std::hint::spin_loop();
            }
            if h.capacity.load(Ordering::Acquire) != MAX_ENTRIES as u32 {
                return Err(HermesError::memory("registry capacity mismatch"));
            }
        }
        h.open_count.fetch_add(1, Ordering::AcqRel);

        Ok(Self {
            region,
            header,
            entries,
        })
    }

    #[inline]
    fn header(&self) -> &RegistryHeader {
        // SAFETY: valid for the lifetime of the mapping.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn entry(&self, index: usize) -> &RegistryEntry {
        debug_assert!(index < MAX_ENTRIES);
        // SAFETY: index < MAX_ENTRIES, inside the mapping.
        unsafe { &*self.entries.as_ptr().add(index) }
    }

    fn find_index(&self, node_id: &str) -> Option<usize> {
        (0..MAX_ENTRIES).find(|&i| {
            let e = self.entry(i);
            e.flags.load(Ordering::Acquire) & FLAG_VALID != 0
                && read_atomic_string(&e.node_id) == node_id
        })
    }

    /// Register a node, or refresh its heartbeat if it is already present.
    pub fn register(&self, node_id: &str, shm_name: &str) -> HermesResult<()> {
        if node_id.is_empty() || node_id.len() >= NODE_ID_BYTES {
            return Err(HermesError::invalid_input(format!(
                "node id must be 1..{} bytes",
                NODE_ID_BYTES
            )));
        }
        if shm_name.len() >= SHM_NAME_BYTES {
            return Err(HermesError::invalid_input(format!(
                "shm name must be under {} bytes",
                SHM_NAME_BYTES
            )));
        }

        if let Some(i) = self.find_index(node_id) {
            let e = self.entry(i);
            e.pid.store(std::process::id(), Ordering::Relaxed);
            e.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
            e.flags.store(FLAG_VALID | FLAG_ACTIVE, Ordering::Release);
            return Ok(());
        }

        for i in 0..MAX_ENTRIES {
            let e = self.entry(i);
            // Claim the slot first so concurrent registrations from other
            // processes cannot land on the same index.
            if e.flags
                .compare_exchange(0, FLAG_VALID, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            write_atomic_string(&e.node_id, node_id, NODE_ID_BYTES);
            write_atomic_string(&e.shm_name, shm_name, SHM_NAME_BYTES);
            e.pid.store(std::process::id(), Ordering::Relaxed);
            e.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
            e.flags.store(FLAG_VALID | FLAG_ACTIVE, Ordering::Release);
            self.header().num_entries.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        Err(HermesError::AlreadyExists(format!(
            "registry full: all {} slots in use",
            MAX_ENTRIES
        )))
    }

    pub fn unregister(&self, node_id: &str) -> HermesResult<()> {
        let i = self
            .find_index(node_id)
            .ok_or_else(|| HermesError::not_found(format!("node '{}' not registered", node_id)))?;
        let e = self.entry(i);
        e.flags.fetch_and(!FLAG_ACTIVE, Ordering::AcqRel);
        e.flags.store(0, Ordering::Release);
        self.header().num_entries.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// Stamp the current time into the node's slot. Returns false when the
    /// node is not registered.
    pub fn update_heartbeat(&self, node_id: &str) -> bool {
        match self.find_index(node_id) {
            Some(i) => {
                self.entry(i)
                    .last_heartbeat_ms
                    .store(now_ms(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// All nodes that are valid, active, whose process is alive, and whose
    /// heartbeat is younger than `timeout_ms`.
    pub fn get_all_active(&self, timeout_ms: u64) -> Vec<NodeEntry> {
        let now = now_ms();
        let mut out = Vec::new();
        for i in 0..MAX_ENTRIES {
            let e = self.entry(i);
            let flags = e.flags.load(Ordering::Acquire);
            if flags & FLAG_VALID == 0 || flags & FLAG_ACTIVE == 0 {
                continue;
            }
            let pid = e.pid.load(Ordering::Relaxed);
            if !process_alive(pid) {
                continue;
            }
            let hb = e.last_heartbeat_ms.load(Ordering::Relaxed);
            if now.saturating_sub(hb) > timeout_ms {
                continue;
            }
            out.push(NodeEntry {
                node_id: read_atomic_string(&e.node_id),
                shm_name: read_atomic_string(&e.shm_name),
                pid,
                last_heartbeat_ms: hb,
            });
        }
        out
    }

    pub fn find_node(&self, node_id: &str) -> Option<NodeEntry> {
        let i = self.find_index(node_id)?;
        let e = self.entry(i);
        if e.flags.load(Ordering::Acquire) & FLAG_ACTIVE == 0 {
            return None;
        }
        Some(NodeEntry {
            node_id: read_atomic_string(&e.node_id),
            shm_name: read_atomic_string(&e.shm_name),
            pid: e.pid.load(Ordering::Relaxed),
            last_heartbeat_ms: e.last_heartbeat_ms.load(Ordering::Relaxed),
        })
    }

    pub fn node_exists(&self, node_id: &str) -> bool {
        self.find_node(node_id).is_some()
    }

    pub fn active_node_count(&self) -> usize {
        (0..MAX_ENTRIES)
            .filter(|&i| {
                let flags = self.entry(i).flags.load(Ordering::Acquire);
                flags & FLAG_VALID != 0 && flags & FLAG_ACTIVE != 0
            })
            .count()
    }

    /// Reclaim slots whose heartbeat is older than `timeout_ms` or whose
    /// process is gone. Returns the number of slots cleared.
    pub fn cleanup_stale(&self, timeout_ms: u64) -> usize {
        let now = now_ms();
        let mut reclaimed = 0;
        for i in 0..MAX_ENTRIES {
            let e = self.entry(i);
            if e.flags.load(Ordering::Acquire) & FLAG_VALID == 0 {
                continue;
            }
            let pid = e.pid.load(Ordering::Relaxed);
            let hb = e.last_heartbeat_ms.load(Ordering::Relaxed);
            let stale = now.saturating_sub(hb) > timeout_ms || !process_alive(pid);
            if stale {
                e.flags.store(0, Ordering::Release);
                self.header().num_entries.fetch_sub(1, Ordering::AcqRel);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

impl Drop for SharedMemoryRegistry {
    fn drop(&mut self) {
        // Last process out unlinks the region file.
        if self.header().open_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.region.force_cleanup();
        }
    }
}
