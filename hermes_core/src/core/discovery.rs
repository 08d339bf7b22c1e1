//! Remote-node tracking for the UDP fabric.
//!
//! Every packet source moves through a small liveness machine:
//! `Seen` on first contact, `Alive` once a SUBSCRIPTION_REPLY or HEARTBEAT
//! arrives, `Dead` when the heartbeat goes quiet past the timeout. The
//! reaper sweeps `Dead` peers, returning their subscriptions so the caller
//! can synthesize SERVICE_UNREGISTER events before the entry is deleted.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Some packet arrived, the peer has not proven liveness yet
    Seen,
    /// Confirmed by a subscription reply or heartbeat
    Alive,
    /// Timed out; removed on the next sweep
    Dead,
}

#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub node_id: String,
    pub addr: IpAddr,
    pub port: u16,
    pub state: PeerState,
    pub last_heartbeat: Instant,
    pub subscriptions: BTreeSet<(String, String)>,
}

impl RemoteNode {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Mutex-protected table of remote peers, keyed by node id.
#[derive(Default)]
pub(crate) struct RemoteNodeTable {
    peers: Mutex<HashMap<String, RemoteNode>>,
}

impl RemoteNodeTable {
    /// Record contact from a peer, creating it in `Seen` state. Refreshes
    /// the endpoint (a peer may rebind) but not the liveness clock.
    pub fn touch(&self, node_id: &str, addr: IpAddr, port: u16) {
        let mut peers = self.peers.lock();
        peers
            .entry(node_id.to_string())
            .and_modify(|p| {
                p.addr = addr;
                p.port = port;
            })
            .or_insert_with(|| RemoteNode {
                node_id: node_id.to_string(),
                addr,
                port,
                state: PeerState::Seen,
                last_heartbeat: Instant::now(),
                subscriptions: BTreeSet::new(),
            });
    }

    /// Liveness proof: SUBSCRIPTION_REPLY or HEARTBEAT.
    pub fn mark_alive(&self, node_id: &str) {
        if let Some(peer) = self.peers.lock().get_mut(node_id) {
            peer.state = PeerState::Alive;
            peer.last_heartbeat = Instant::now();
        }
    }

    pub fn add_subscription(&self, node_id: &str, group: &str, topic: &str) {
        if let Some(peer) = self.peers.lock().get_mut(node_id) {
            peer.subscriptions
                .insert((group.to_string(), topic.to_string()));
        }
    }

    /// Remove one subscription; the peer itself stays until it times out.
    pub fn remove_subscription(&self, node_id: &str, group: &str, topic: &str) {
        if let Some(peer) = self.peers.lock().get_mut(node_id) {
            peer.subscriptions
                .remove(&(group.to_string(), topic.to_string()));
        }
    }

    pub fn remove(&self, node_id: &str) -> Option<RemoteNode> {
        self.peers.lock().remove(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<RemoteNode> {
        self.peers.lock().get(node_id).cloned()
    }

    /// Endpoints of every peer not yet declared dead, for heartbeats and
    /// control broadcasts.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.state != PeerState::Dead)
            .map(RemoteNode::endpoint)
            .collect()
    }

    /// Age out silent peers. Newly dead entries are deleted and returned
    /// with the subscriptions they held.
    pub fn sweep(&self, timeout: std::time::Duration) -> Vec<RemoteNode> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let dead_ids: Vec<String> = peers
            .values_mut()
            .filter_map(|peer| {
                if now.duration_since(peer.last_heartbeat) > timeout {
                    peer.state = PeerState::Dead;
                    Some(peer.node_id.clone())
                } else {
                    None
                }
            })
            .collect();
        dead_ids
            .into_iter()
            .filter_map(|id| peers.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    #[test]
    fn touch_creates_seen_peer() {
        let table = RemoteNodeTable::default();
        table.touch("peer1", LOCALHOST, 47300);
        let peer = table.get("peer1").unwrap();
        assert_eq!(peer.state, PeerState::Seen);
        assert_eq!(peer.port, 47300);
    }

    #[test]
    fn heartbeat_promotes_to_alive() {
        let table = RemoteNodeTable::default();
        table.touch("peer1", LOCALHOST, 47300);
        table.mark_alive("peer1");
        assert_eq!(table.get("peer1").unwrap().state, PeerState::Alive);
    }

    #[test]
    fn endpoint_refresh_keeps_subscriptions() {
        let table = RemoteNodeTable::default();
        table.touch("peer1", LOCALHOST, 47300);
        table.add_subscription("peer1", "g", "t");
        table.touch("peer1", LOCALHOST, 47301);
        let peer = table.get("peer1").unwrap();
        assert_eq!(peer.port, 47301);
        assert_eq!(peer.subscriptions.len(), 1);
    }

    #[test]
    fn sweep_returns_dead_peers_with_their_services() {
        let table = RemoteNodeTable::default();
        table.touch("quiet", LOCALHOST, 47300);
        table.mark_alive("quiet");
        table.add_subscription("quiet", "g", "t1");
        table.add_subscription("quiet", "g", "t2");
        table.touch("fresh", LOCALHOST, 47301);
        table.mark_alive("fresh");

        std::thread::sleep(Duration::from_millis(60));
        table.mark_alive("fresh");

        let dead = table.sweep(Duration::from_millis(50));
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].node_id, "quiet");
        assert_eq!(dead[0].subscriptions.len(), 2);
        assert!(table.get("quiet").is_none());
        assert!(table.get("fresh").is_some());
    }

    #[test]
    fn unsubscribe_keeps_peer_until_timeout() {
        let table = RemoteNodeTable::default();
        table.touch("peer1", LOCALHOST, 47300);
        table.add_subscription("peer1", "g", "t");
        table.remove_subscription("peer1", "g", "t");
        assert!(table.get("peer1").is_some());
        assert!(table.get("peer1").unwrap().subscriptions.is_empty());
    }
}
