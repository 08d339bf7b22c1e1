//! Service descriptors and the transport-precedence table.
//!
//! A descriptor records that `node N serves (group, topic) over transport T`.
//! The table keeps at most one descriptor per `(node_id, group, topic)`
//! identity, resolving conflicts with the total order
//! `SharedMemory > Udp > InProcess` so a publisher never sends the same
//! payload to a node twice.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Transport a descriptor is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportType {
    InProcess,
    Udp,
    SharedMemory,
}

/// Normal pub/sub service or a large-data channel announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    Normal,
    LargeData,
}

/// The fabric's record of who serves what, and how to reach them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub node_id: String,
    pub group: String,
    pub topic: String,
    pub service_type: ServiceType,
    pub transport: TransportType,
    /// Set for `Udp` descriptors
    pub udp_endpoint: Option<SocketAddr>,
    /// Set for large-data announcements: the named channel to open
    pub shm_channel: Option<String>,
}

impl ServiceDescriptor {
    /// `group:topic`, the capability half of the dedup identity.
    pub fn capability(&self) -> String {
        format!("{}:{}", self.group, self.topic)
    }

    fn same_identity(&self, other: &ServiceDescriptor) -> bool {
        self.node_id == other.node_id && self.group == other.group && self.topic == other.topic
    }
}

/// Metadata carried in SERVICE_REGISTER / SERVICE_UNREGISTER payloads.
/// The transport is implied by the fabric the packet arrived on; only the
/// pieces the wire cannot express travel in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    pub service_type: ServiceType,
    pub shm_channel: Option<String>,
}

impl ServiceAnnouncement {
    pub fn normal() -> Self {
        Self {
            service_type: ServiceType::Normal,
            shm_channel: None,
        }
    }

    pub fn large_data(channel: &str) -> Self {
        Self {
            service_type: ServiceType::LargeData,
            shm_channel: Some(channel.to_string()),
        }
    }
}

/// Group-keyed descriptor table. Callers wrap it in the registry's lock.
#[derive(Default)]
pub(crate) struct ServiceTable {
    groups: HashMap<String, Vec<ServiceDescriptor>>,
}

impl ServiceTable {
    /// Insert a descriptor, enforcing transport precedence per identity:
    /// 1. no existing descriptor -> append
    /// 2. same transport        -> ignore
    /// 3. existing SharedMemory -> reject the newcomer
    /// 4. new SharedMemory      -> replace the existing one
    /// 5. otherwise             -> keep the existing one
    pub fn register(&mut self, svc: ServiceDescriptor) {
        let group = self.groups.entry(svc.group.clone()).or_default();
        for existing in group.iter_mut() {
            if !existing.same_identity(&svc) {
                continue;
            }
            if existing.transport == svc.transport {
                // Exact duplicate
                return;
            }
            if existing.transport == TransportType::SharedMemory {
                return;
            }
            if svc.transport == TransportType::SharedMemory {
                *existing = svc;
                return;
            }
            return;
        }
        group.push(svc);
    }

    /// Remove every descriptor of `(node_id, topic)` inside `group`.
    pub fn unregister(&mut self, group: &str, node_id: &str, topic: &str) {
        if let Some(list) = self.groups.get_mut(group) {
            list.retain(|s| !(s.node_id == node_id && s.topic == topic));
            if list.is_empty() {
                self.groups.remove(group);
            }
        }
    }

    /// Drop everything a node ever registered. Returns what was removed so
    /// callers can synthesize teardown events.
    pub fn remove_node(&mut self, node_id: &str) -> Vec<ServiceDescriptor> {
        let mut removed = Vec::new();
        self.groups.retain(|_, list| {
            let mut kept = Vec::with_capacity(list.len());
            for svc in list.drain(..) {
                if svc.node_id == node_id {
                    removed.push(svc);
                } else {
                    kept.push(svc);
                }
            }
            *list = kept;
            !list.is_empty()
        });
        removed
    }

    /// Snapshot; `None` returns every group.
    pub fn find(&self, group: Option<&str>) -> Vec<ServiceDescriptor> {
        match group {
            Some(g) => self.groups.get(g).cloned().unwrap_or_default(),
            None => self.groups.values().flatten().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(node: &str, group: &str, topic: &str, transport: TransportType) -> ServiceDescriptor {
        ServiceDescriptor {
            node_id: node.into(),
            group: group.into(),
            topic: topic.into(),
            service_type: ServiceType::Normal,
            transport,
            udp_endpoint: None,
            shm_channel: None,
        }
    }

    #[test]
    fn one_descriptor_per_identity() {
        let mut table = ServiceTable::default();
        table.register(svc("n1", "g", "t", TransportType::Udp));
        table.register(svc("n1", "g", "t", TransportType::Udp));
        assert_eq!(table.find(Some("g")).len(), 1);
    }

    // UDP then SHARED_MEMORY ends as SHARED_MEMORY, and a later UDP
    // registration is ignored.
    #[test]
    fn shared_memory_wins_in_either_order() {
        let mut table = ServiceTable::default();
        table.register(svc("n1", "g", "t", TransportType::Udp));
        table.register(svc("n1", "g", "t", TransportType::SharedMemory));
        let found = table.find(Some("g"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transport, TransportType::SharedMemory);

        table.register(svc("n1", "g", "t", TransportType::Udp));
        let found = table.find(Some("g"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transport, TransportType::SharedMemory);

        // Reverse order
        let mut table = ServiceTable::default();
        table.register(svc("n2", "g", "t", TransportType::SharedMemory));
        table.register(svc("n2", "g", "t", TransportType::Udp));
        let found = table.find(Some("g"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transport, TransportType::SharedMemory);
    }

    #[test]
    fn non_shm_conflict_keeps_existing() {
        let mut table = ServiceTable::default();
        table.register(svc("n1", "g", "t", TransportType::Udp));
        table.register(svc("n1", "g", "t", TransportType::InProcess));
        let found = table.find(Some("g"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].transport, TransportType::Udp);
    }

    #[test]
    fn distinct_identities_coexist() {
        let mut table = ServiceTable::default();
        table.register(svc("n1", "g", "t", TransportType::Udp));
        table.register(svc("n2", "g", "t", TransportType::Udp));
        table.register(svc("n1", "g", "other", TransportType::Udp));
        assert_eq!(table.find(Some("g")).len(), 3);
        assert_eq!(table.find(None).len(), 3);
    }

    #[test]
    fn unregister_clears_matching_topic() {
        let mut table = ServiceTable::default();
        table.register(svc("n1", "g", "t", TransportType::Udp));
        table.register(svc("n1", "g", "u", TransportType::Udp));
        table.unregister("g", "n1", "t");
        let found = table.find(Some("g"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic, "u");
        // Removing the last entry drops the group
        table.unregister("g", "n1", "u");
        assert!(table.find(Some("g")).is_empty());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn remove_node_reports_everything_it_served() {
        let mut table = ServiceTable::default();
        table.register(svc("n1", "g1", "t", TransportType::Udp));
        table.register(svc("n1", "g2", "t", TransportType::SharedMemory));
        table.register(svc("n2", "g1", "t", TransportType::Udp));
        let removed = table.remove_node("n1");
        assert_eq!(removed.len(), 2);
        assert_eq!(table.find(None).len(), 1);
        assert!(table.find(Some("g2")).is_empty());
    }

    #[test]
    fn announcement_round_trip() {
        let a = ServiceAnnouncement::large_data("/cam0");
        let bytes = bincode::serialize(&a).unwrap();
        let b: ServiceAnnouncement = bincode::deserialize(&bytes).unwrap();
        assert_eq!(a, b);
        assert_eq!(b.shm_channel.as_deref(), Some("/cam0"));
    }

    #[test]
    fn capability_format() {
        let s = svc("n1", "sensor", "temperature", TransportType::Udp);
        assert_eq!(s.capability(), "sensor:temperature");
    }
}
