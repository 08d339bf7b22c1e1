//! Node presence files for monitor tooling.
//!
//! Each node drops a JSON file under the shm directory at init and removes
//! it at shutdown; `read_all` is what `hermes-top`-style monitors scan.
//! Files whose process is gone are cleaned up lazily on read.

use crate::memory::platform::nodes_dir;
use crate::memory::shm_registry::process_alive;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePresence {
    pub node_id: String,
    pub pid: u32,
    pub udp_port: u16,
    /// Unix timestamp when the node started (seconds)
    pub start_time: u64,
    /// `(group, topics)` pairs currently subscribed
    pub subscriptions: Vec<(String, Vec<String>)>,
}

impl NodePresence {
    pub fn new(node_id: &str, udp_port: u16, subscriptions: Vec<(String, Vec<String>)>) -> Self {
        Self {
            node_id: node_id.to_string(),
            pid: std::process::id(),
            udp_port,
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            subscriptions,
        }
    }

    fn presence_path(node_id: &str) -> PathBuf {
        nodes_dir().join(format!("{}.json", node_id))
    }

    /// Write (or rewrite) this node's presence file.
    pub fn write(&self) -> std::io::Result<()> {
        let dir = nodes_dir();
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(Self::presence_path(&self.node_id), json)
    }

    /// Remove a node's presence file, ignoring a missing one.
    pub fn remove(node_id: &str) -> std::io::Result<()> {
        let path = Self::presence_path(node_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn read(node_id: &str) -> Option<Self> {
        let content = fs::read_to_string(Self::presence_path(node_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Every presence file with a live process behind it. Stale files are
    /// deleted as they are encountered.
    pub fn read_all() -> Vec<Self> {
        let dir = nodes_dir();
        if !dir.exists() {
            return Vec::new();
        }
        let mut nodes = Vec::new();
        if let Ok(entries) = fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(presence) = serde_json::from_str::<NodePresence>(&content) {
                        if process_alive(presence.pid) {
                            nodes.push(presence);
                        } else {
                            let _ = fs::remove_file(&path);
                        }
                    }
                }
            }
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let id = format!("presence_test_{}", std::process::id());
        let presence = NodePresence::new(
            &id,
            47333,
            vec![("sensor".into(), vec!["temperature".into()])],
        );
        presence.write().unwrap();

        let read = NodePresence::read(&id).unwrap();
        assert_eq!(read.node_id, id);
        assert_eq!(read.udp_port, 47333);
        assert_eq!(read.pid, std::process::id());
        assert_eq!(read.subscriptions.len(), 1);
        assert!(read.start_time > 0);

        NodePresence::remove(&id).unwrap();
        assert!(NodePresence::read(&id).is_none());
        // Removing twice is fine
        NodePresence::remove(&id).unwrap();
    }

    #[test]
    fn read_all_prunes_dead_pids() {
        let id = format!("presence_dead_{}", std::process::id());
        let mut presence = NodePresence::new(&id, 0, vec![]);
        presence.pid = 999_999_999;
        presence.write().unwrap();

        let all = NodePresence::read_all();
        assert!(all.iter().all(|p| p.node_id != id));
        assert!(NodePresence::read(&id).is_none(), "stale file not pruned");
    }
}
