//! Process-wide registry of live nodes and known services.
//!
//! Two independently locked maps behind one singleton: `nodes` holds weak
//! references (the registry never keeps a node alive; readers compact
//! expired entries on traversal), `services` is the transport-precedence
//! table. Unregistering a node also sweeps its services, so a destructed
//! node cannot leave zombie descriptors behind.

use crate::core::node::NodeShared;
use crate::core::services::{ServiceDescriptor, ServiceTable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

#[derive(Default)]
pub struct GlobalRegistry {
    nodes: Mutex<HashMap<String, Weak<NodeShared>>>,
    services: Mutex<ServiceTable>,
}

impl GlobalRegistry {
    /// The process-wide singleton.
    pub fn instance() -> &'static GlobalRegistry {
        static REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();
        REGISTRY.get_or_init(GlobalRegistry::default)
    }

    pub(crate) fn register_node(&self, node_id: &str, node: Weak<NodeShared>) {
        self.nodes.lock().insert(node_id.to_string(), node);
    }

    /// Remove the node and every service it registered.
    pub(crate) fn unregister_node(&self, node_id: &str) {
        self.nodes.lock().remove(node_id);
        self.services.lock().remove_node(node_id);
    }

    /// All live local nodes. Expired weak entries are pruned as a side
    /// effect of the traversal.
    pub(crate) fn get_all_nodes(&self) -> Vec<Arc<NodeShared>> {
        let mut nodes = self.nodes.lock();
        let mut alive = Vec::with_capacity(nodes.len());
        nodes.retain(|_, weak| match weak.upgrade() {
            Some(node) => {
                alive.push(node);
                true
            }
            None => false,
        });
        alive
    }

    pub(crate) fn find_node(&self, node_id: &str) -> Option<Arc<NodeShared>> {
        self.nodes.lock().get(node_id)?.upgrade()
    }

    /// Whether `node_id` is a live node in this process.
    pub fn is_local_node(&self, node_id: &str) -> bool {
        self.find_node(node_id).is_some()
    }

    pub fn register_service(&self, svc: ServiceDescriptor) {
        self.services.lock().register(svc);
    }

    pub fn unregister_service(&self, group: &str, node_id: &str, topic: &str) {
        self.services.lock().unregister(group, node_id, topic);
    }

    /// Sweep a node's services, returning what was removed so the caller can
    /// synthesize SERVICE_UNREGISTER events.
    pub(crate) fn remove_node_services(&self, node_id: &str) -> Vec<ServiceDescriptor> {
        self.services.lock().remove_node(node_id)
    }

    /// Snapshot of the service table; `None` returns every group.
    pub fn find_services(&self, group: Option<&str>) -> Vec<ServiceDescriptor> {
        self.services.lock().find(group)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::services::{ServiceType, TransportType};

    fn svc(node: &str, group: &str, topic: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            node_id: node.into(),
            group: group.into(),
            topic: topic.into(),
            service_type: ServiceType::Normal,
            transport: TransportType::Udp,
            udp_endpoint: None,
            shm_channel: None,
        }
    }

    // The singleton is shared by every test in the binary, so these tests
    // use their own node ids and groups.
    #[test]
    fn unregister_node_sweeps_its_services() {
        let registry = GlobalRegistry::instance();
        registry.register_service(svc("reg_test_n1", "reg_test_g", "t1"));
        registry.register_service(svc("reg_test_n1", "reg_test_g", "t2"));
        registry.register_service(svc("reg_test_n2", "reg_test_g", "t1"));

        registry.unregister_node("reg_test_n1");

        let left = registry.find_services(Some("reg_test_g"));
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].node_id, "reg_test_n2");

        registry.unregister_node("reg_test_n2");
        assert!(registry.find_services(Some("reg_test_g")).is_empty());
    }

    #[test]
    fn remove_node_services_reports_removed() {
        let registry = GlobalRegistry::instance();
        registry.register_service(svc("reg_sweep_n", "reg_sweep_g", "a"));
        registry.register_service(svc("reg_sweep_n", "reg_sweep_g", "b"));
        let removed = registry.remove_node_services("reg_sweep_n");
        assert_eq!(removed.len(), 2);
        assert!(registry.find_services(Some("reg_sweep_g")).is_empty());
    }

    #[test]
    fn singleton_identity() {
        let a = GlobalRegistry::instance() as *const _;
        let b = GlobalRegistry::instance() as *const _;
        assert_eq!(a, b);
    }
}
