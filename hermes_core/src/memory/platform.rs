//! Shared-memory path helpers.
//!
//! Regions live as plain files on a RAM-backed filesystem: `/dev/shm` where
//! available (Linux tmpfs), `/tmp` otherwise. A region named `foo` maps to
//! `<root>/hermes_foo`.

use std::path::PathBuf;

/// Root directory for all HERMES shared-memory files.
pub fn shm_root() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

/// Directory holding per-node presence files.
pub fn nodes_dir() -> PathBuf {
    shm_root().join("hermes").join("nodes")
}

/// Turn a caller-supplied region name into a flat file name.
///
/// Leading slashes (POSIX shm convention) are stripped; path separators and
/// other non-portable characters become underscores.
pub fn sanitize_region_name(name: &str) -> String {
    name.trim_start_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Full path of a named shared-memory region.
pub fn region_path(name: &str) -> PathBuf {
    shm_root().join(format!("hermes_{}", sanitize_region_name(name)))
}

/// Remove a region file by name, ignoring missing files.
pub fn remove_region(name: &str) {
    let path = region_path(name);
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
}
