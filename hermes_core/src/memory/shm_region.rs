//! Named shared-memory regions for inter-process transport.
//!
//! A region is a memory-mapped file on a RAM-backed filesystem (`/dev/shm`
//! on Linux, so mapping is tmpfs and never touches disk). The first process
//! to create a region is its *owner*: it zero-fills the mapping and, by
//! default, unlinks the file when dropped. Later openers map the same file
//! and leave cleanup to the owner, except for the refcounted registry
//! layout, which calls [`ShmRegion::force_cleanup`] from the last closer
//! instead (see [`ShmRegion::persist`]).

use crate::error::{HermesError, HermesResult};
use crate::memory::platform::region_path;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct ShmRegion {
    mmap: MmapMut,
    _file: File,
    path: PathBuf,
    size: usize,
    owner: bool,
    unlink_on_drop: AtomicBool,
}

impl ShmRegion {
    /// Create a region of `size` bytes, or map it if it already exists.
    pub fn create(name: &str, size: usize) -> HermesResult<Self> {
        if size == 0 {
            return Err(HermesError::memory("region size must be non-zero"));
        }
        let path = region_path(name);

        // create_new is the atomic claim: exactly one racing process becomes
        // the owner, everyone else maps the existing file.
        let (file, is_owner) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                file.set_len(size as u64)?;
                (file, true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                if file.metadata()?.len() < size as u64 {
                    file.set_len(size as u64)?;
                }
                (file, false)
            }
            Err(e) => return Err(e.into()),
        };

        // SAFETY: file is open with at least `size` bytes (set above); the
        // mapping length matches.
        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        if is_owner {
            mmap.fill(0);
        }

        Ok(Self {
            mmap,
            _file: file,
            path,
            size,
            owner: is_owner,
            unlink_on_drop: AtomicBool::new(is_owner),
        })
    }

    /// Map an existing region; fails if it has not been created yet.
    pub fn open(name: &str) -> HermesResult<Self> {
        let path = region_path(name);
        if !path.exists() {
            return Err(HermesError::not_found(format!(
                "shared memory region '{}' does not exist",
                name
            )));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(HermesError::memory(format!(
                "shared memory region '{}' is empty",
                name
            )));
        }
        // SAFETY: file is open and `size` equals its current length.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        Ok(Self {
            mmap,
            _file: file,
            path,
            size,
            owner: false,
            unlink_on_drop: AtomicBool::new(false),
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the region (responsible for cleanup on drop).
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Keep the file on disk when this handle drops. Used by refcounted
    /// layouts where the last closer unlinks instead of the creator.
    pub fn persist(&self) {
        self.unlink_on_drop.store(false, Ordering::Relaxed);
    }

    /// Unlink the backing file immediately, regardless of ownership.
    pub fn force_cleanup(&self) {
        self.unlink_on_drop.store(false, Ordering::Relaxed);
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.unlink_on_drop.load(Ordering::Relaxed) && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// SAFETY: the region is plain OS shared memory with no thread-local state;
// all concurrent access goes through atomics placed in it by the layouts
// built on top (ring buffer, registry).
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

#[cfg(test)]
pub(crate) fn unique_name(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}
