//! The node core.
//!
//! A `Node` is one participant on the bus: it owns a UDP socket, an inbound
//! shared-memory lane per sending peer, a dispatch pool for subscriber
//! callbacks, and the background threads that keep the fabric alive
//! (heartbeat, reaper, shm poller). Publishing selects the cheapest
//! transport per recipient (in-process dispatch, a shared-memory pair ring,
//! or a UDP datagram) without the caller knowing which was used.

use crate::communication::dispatch::{
    DispatchPool, InboundMessage, OverflowCallback, OverflowPolicy,
};
use crate::communication::packet::{MessagePacket, MessageType};
use crate::communication::udp::UdpTransport;
use crate::config::Config;
use crate::core::discovery::RemoteNodeTable;
use crate::core::presence::NodePresence;
use crate::core::registry::GlobalRegistry;
use crate::core::services::{ServiceAnnouncement, ServiceDescriptor, ServiceType, TransportType};
use crate::error::{HermesError, HermesResult};
use crate::memory::large_data::{LargeDataNotification, LargeDataReader, LargeDataWriter};
use crate::memory::ring::{RingBuffer, RingConsumer, RingProducer, MAX_FRAME_PAYLOAD};
use crate::memory::shm_registry::SharedMemoryRegistry;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Subscriber callback: `(group, topic, payload)`.
pub type Callback = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;

const REAPER_INTERVAL: Duration = Duration::from_secs(2);
const POLL_IDLE: Duration = Duration::from_micros(100);
const RING_REFRESH: Duration = Duration::from_secs(1);
const SLEEP_STEP: Duration = Duration::from_millis(50);

struct SubscriptionInfo {
    topics: BTreeSet<String>,
    callback: Callback,
}

/// Shared-memory side of the fabric. Absent when the registry could not be
/// opened; the node then runs on UDP and in-process delivery alone.
struct ShmFabric {
    registry: SharedMemoryRegistry,
    /// Pair rings we write: peer node id -> producer endpoint
    outbound: Mutex<HashMap<String, RingProducer>>,
}

/// State shared between the public handle and the background threads. The
/// in-process registry holds this behind a `Weak`, so it never keeps a node
/// alive past its creator's last `Arc<Node>`.
pub(crate) struct NodeShared {
    node_id: String,
    inbound_base: String,
    running: AtomicBool,
    udp: UdpTransport,
    dispatch: DispatchPool,
    subscriptions: Mutex<BTreeMap<String, SubscriptionInfo>>,
    remote_nodes: RemoteNodeTable,
    shm: Option<ShmFabric>,
    large_writers: Mutex<HashMap<String, LargeDataWriter>>,
}

/// A participant on the bus. Dropping the last handle announces NODE_LEAVE,
/// joins every owned thread, and removes all traces from both registries.
pub struct Node {
    shared: Arc<NodeShared>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

fn generate_node_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let ms = chrono::Utc::now().timestamp_millis() as u64;
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    if seq == 0 {
        format!("node_{:012x}", ms)
    } else {
        format!("node_{:012x}_{}", ms, seq)
    }
}

fn validate_node_id(id: &str) -> HermesResult<()> {
    if id.is_empty() || id.len() > 63 {
        return Err(HermesError::invalid_input(
            "node id must be 1..=63 bytes".to_string(),
        ));
    }
    if !id.chars().all(|c| c.is_ascii_graphic()) {
        return Err(HermesError::invalid_input(format!(
            "node id '{}' contains non-printable characters",
            id
        )));
    }
    Ok(())
}

impl Node {
    /// Create and initialize a node. Pass an empty id to auto-generate one.
    pub fn create(node_id: &str) -> HermesResult<Arc<Node>> {
        crate::logging::init();
        let cfg = Config::global();

        let node_id = if node_id.is_empty() {
            generate_node_id()
        } else {
            node_id.to_string()
        };
        validate_node_id(&node_id)?;
        if GlobalRegistry::instance().is_local_node(&node_id) {
            return Err(HermesError::AlreadyExists(format!(
                "node '{}' already exists in this process",
                node_id
            )));
        }

        static NEXT_BASE: AtomicU64 = AtomicU64::new(0);
        let inbound_base = format!(
            "node_{}_{}",
            std::process::id(),
            NEXT_BASE.fetch_add(1, Ordering::Relaxed)
        );

        // Open the shared-memory fabric up front; losing it degrades the
        // node to UDP + in-process delivery instead of failing creation.
        let shm = match SharedMemoryRegistry::open() {
            Ok(registry) => match registry.register(&node_id, &inbound_base) {
                Ok(()) => Some(ShmFabric {
                    registry,
                    outbound: Mutex::new(HashMap::new()),
                }),
                Err(e) => {
                    log::error!(
                        "node '{}': registry registration failed, shared-memory delivery disabled: {}",
                        node_id,
                        e
                    );
                    None
                }
            },
            Err(e) => {
                log::error!(
                    "node '{}': cannot open shared registry, shared-memory delivery disabled: {}",
                    node_id,
                    e
                );
                None
            }
        };

        let shared = Arc::new_cyclic(|weak: &Weak<NodeShared>| {
            let delivery_weak = weak.clone();
            NodeShared {
                node_id: node_id.clone(),
                inbound_base,
                running: AtomicBool::new(true),
                udp: UdpTransport::new(),
                dispatch: DispatchPool::new(
                    cfg.node.num_processing_threads,
                    cfg.node.queue_capacity,
                    cfg.node.max_queue_size,
                    OverflowPolicy::default(),
                    Arc::new(move |msg: InboundMessage| {
                        if let Some(shared) = delivery_weak.upgrade() {
                            shared.deliver(msg);
                        }
                    }),
                ),
                subscriptions: Mutex::new(BTreeMap::new()),
                remote_nodes: RemoteNodeTable::default(),
                shm,
                large_writers: Mutex::new(HashMap::new()),
            }
        });

        shared.udp.initialize(0)?;
        let recv_weak = Arc::downgrade(&shared);
        shared
            .udp
            .set_receive_callback(Arc::new(move |data: &[u8], src| {
                if let Some(shared) = recv_weak.upgrade() {
                    shared.on_udp_datagram(data, src);
                }
            }))?;

        GlobalRegistry::instance().register_node(&node_id, Arc::downgrade(&shared));
        shared.write_presence();

        let node = Arc::new(Node {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut threads = node.threads.lock();
            if shared.shm.is_some() {
                let s = Arc::clone(&shared);
                threads.push(
                    std::thread::Builder::new()
                        .name("hermes-shm-poll".into())
                        .spawn(move || s.poll_loop())
                        .map_err(|e| HermesError::memory(format!("spawn poll thread: {}", e)))?,
                );
            }
            let s = Arc::clone(&shared);
            threads.push(
                std::thread::Builder::new()
                    .name("hermes-heartbeat".into())
                    .spawn(move || s.heartbeat_loop())
                    .map_err(|e| HermesError::memory(format!("spawn heartbeat: {}", e)))?,
            );
            let s = Arc::clone(&shared);
            threads.push(
                std::thread::Builder::new()
                    .name("hermes-reaper".into())
                    .spawn(move || s.reaper_loop())
                    .map_err(|e| HermesError::memory(format!("spawn reaper: {}", e)))?,
            );
        }

        // Zero-config discovery: probe the loopback range for existing
        // nodes, and greet every registry peer over shared memory.
        shared.query_existing_subscriptions();
        shared.announce_join();

        log::info!(
            "node '{}' up (udp port {}, shm {})",
            shared.node_id,
            shared.udp.port(),
            if shared.shm.is_some() { "on" } else { "off" }
        );
        Ok(node)
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn udp_port(&self) -> u16 {
        self.shared.udp.port()
    }

    /// Broadcast `payload` to every subscriber of `(group, topic)`.
    pub fn publish(&self, group: &str, topic: &str, payload: &[u8]) -> HermesResult<()> {
        self.shared.publish(group, topic, payload)
    }

    /// Subscribe to `topics` within `group`. Re-subscribing unions the topic
    /// set and replaces the group's callback.
    pub fn subscribe(&self, group: &str, topics: &[&str], callback: Callback) -> HermesResult<()> {
        self.shared.subscribe(group, topics, callback)
    }

    /// Remove topics from a group subscription; an empty list removes the
    /// whole group.
    pub fn unsubscribe(&self, group: &str, topics: &[&str]) -> HermesResult<()> {
        self.shared.unsubscribe(group, topics)
    }

    /// Snapshot of `(group, topics)` pairs.
    pub fn subscriptions(&self) -> Vec<(String, Vec<String>)> {
        self.shared.subscriptions_snapshot()
    }

    pub fn is_subscribed(&self, group: &str, topic: &str) -> bool {
        self.shared.matches(group, topic)
    }

    /// Push a payload through the named large-data channel (created on first
    /// use) and notify subscribers of `(group, topic)` on the normal bus.
    pub fn send_large_data(
        &self,
        group: &str,
        channel_name: &str,
        topic: &str,
        payload: &[u8],
    ) -> HermesResult<()> {
        self.shared
            .send_large_data(group, channel_name, topic, payload)
    }

    /// Open an announced large-data channel for draining.
    pub fn open_large_data(&self, channel_name: &str) -> HermesResult<LargeDataReader> {
        LargeDataReader::open(channel_name)
    }

    /// Snapshot of the service table, optionally filtered.
    pub fn discover_services(
        &self,
        group: Option<&str>,
        type_filter: Option<ServiceType>,
    ) -> Vec<ServiceDescriptor> {
        GlobalRegistry::instance()
            .find_services(group)
            .into_iter()
            .filter(|s| type_filter.is_none_or(|t| s.service_type == t))
            .collect()
    }

    /// Invoked with `(group, topic, dropped_count)` when a dispatch lane
    /// overflows.
    pub fn set_overflow_callback(&self, cb: OverflowCallback) {
        self.shared.dispatch.set_overflow_callback(cb);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let shared = &self.shared;
        // Announce departure while the transports are still up
        shared.announce_leave();
        shared.running.store(false, Ordering::Release);
        shared.udp.shutdown();
        shared.dispatch.shutdown();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        GlobalRegistry::instance().unregister_node(&shared.node_id);
        if let Some(fabric) = &shared.shm {
            let _ = fabric.registry.unregister(&shared.node_id);
            // Dropping the producers unlinks the pair rings we created
            fabric.outbound.lock().clear();
        }
        let _ = NodePresence::remove(&shared.node_id);
        log::info!("node '{}' down", shared.node_id);
    }
}

impl NodeShared {
    fn ensure_running(&self) -> HermesResult<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HermesError::not_initialized(format!(
                "node '{}' is shut down",
                self.node_id
            )))
        }
    }

    // ------------------------------------------------------------------
    // Publish path
    // ------------------------------------------------------------------

    fn publish(&self, group: &str, topic: &str, payload: &[u8]) -> HermesResult<()> {
        if group.is_empty() || topic.is_empty() {
            return Err(HermesError::invalid_input(
                "publish requires a non-empty group and topic",
            ));
        }
        self.ensure_running()?;

        // In-process fan-out: every other live local node that matches
        let locals = GlobalRegistry::instance().get_all_nodes();
        let mut local_ids: HashSet<String> = HashSet::with_capacity(locals.len());
        for node in &locals {
            local_ids.insert(node.node_id.clone());
            if node.node_id != self.node_id && node.matches(group, topic) {
                node.enqueue_local(&self.node_id, group, topic, payload);
            }
        }

        // Remote fan-out: one copy per descriptor identity. The table keeps
        // a single descriptor per (node, group, topic), pre-resolved by
        // transport precedence, so nobody is hit twice. The recipient's own
        // subscription check gates actual delivery, so no service-type
        // filter is applied here.
        let descriptors: Vec<ServiceDescriptor> = GlobalRegistry::instance()
            .find_services(Some(group))
            .into_iter()
            .filter(|s| {
                s.topic == topic && s.node_id != self.node_id && !local_ids.contains(&s.node_id)
            })
            .collect();
        if descriptors.is_empty() {
            return Ok(());
        }

        let packet = MessagePacket::data(
            &self.node_id,
            self.udp.port(),
            group,
            topic,
            payload.to_vec(),
        );
        let mut bytes = Vec::new();
        packet.encode(&mut bytes)?;

        for svc in descriptors {
            match svc.transport {
                TransportType::InProcess => {} // covered by the local pass
                TransportType::SharedMemory => self.send_via_shm(&svc, &bytes),
                TransportType::Udp => self.send_via_udp(&svc, &bytes),
            }
        }
        Ok(())
    }

    fn send_via_shm(&self, svc: &ServiceDescriptor, bytes: &[u8]) {
        if bytes.len() > MAX_FRAME_PAYLOAD {
            // Frame cannot fit a shm ring slot; fall back to the datagram
            // path for this recipient.
            self.send_via_udp(svc, bytes);
            return;
        }
        let Some(fabric) = &self.shm else {
            self.send_via_udp(svc, bytes);
            return;
        };
        match self.outbound_ring(fabric, &svc.node_id) {
            Some(()) => {
                let outbound = fabric.outbound.lock();
                if let Some(producer) = outbound.get(&svc.node_id) {
                    if !producer.try_write(bytes) {
                        log::debug!(
                            "shm ring to '{}' full, frame dropped (capability {})",
                            svc.node_id,
                            svc.capability()
                        );
                    }
                }
            }
            None => self.send_via_udp(svc, bytes),
        }
    }

    fn send_via_udp(&self, svc: &ServiceDescriptor, bytes: &[u8]) {
        let dest = svc
            .udp_endpoint
            .or_else(|| self.remote_nodes.get(&svc.node_id).map(|p| p.endpoint()));
        match dest {
            Some(dest) => {
                if let Err(e) = self.udp.send_to(bytes, dest) {
                    log::warn!("udp send to '{}' ({}) failed: {}", svc.node_id, dest, e);
                }
            }
            None => log::debug!(
                "no route to '{}' for {}: descriptor without endpoint",
                svc.node_id,
                svc.capability()
            ),
        }
    }

    /// Make sure a pair ring to `peer` exists and has its producer cached.
    fn outbound_ring(&self, fabric: &ShmFabric, peer: &str) -> Option<()> {
        {
            if fabric.outbound.lock().contains_key(peer) {
                return Some(());
            }
        }
        let entry = fabric.registry.find_node(peer)?;
        let cfg = Config::global();
        let data_size = (cfg.shm.queue_capacity * 2048).next_power_of_two();
        let name = format!("{}_{}", entry.shm_name, self.node_id);
        match RingBuffer::create(&name, data_size, MAX_FRAME_PAYLOAD)
            .and_then(|ring| ring.producer())
        {
            Ok(producer) => {
                fabric.outbound.lock().insert(peer.to_string(), producer);
                Some(())
            }
            Err(e) => {
                log::warn!("cannot open pair ring to '{}': {}", peer, e);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscription management
    // ------------------------------------------------------------------

    fn subscribe(&self, group: &str, topics: &[&str], callback: Callback) -> HermesResult<()> {
        if group.is_empty() || topics.is_empty() || topics.iter().any(|t| t.is_empty()) {
            return Err(HermesError::invalid_input(
                "subscribe requires a group and at least one non-empty topic",
            ));
        }
        self.ensure_running()?;

        {
            let mut subs = self.subscriptions.lock();
            let info = subs.entry(group.to_string()).or_insert_with(|| SubscriptionInfo {
                topics: BTreeSet::new(),
                callback: Arc::clone(&callback),
            });
            for topic in topics {
                info.topics.insert(topic.to_string());
            }
            // One callback per group: the latest subscribe wins
            info.callback = callback;
        }

        for topic in topics {
            GlobalRegistry::instance().register_service(ServiceDescriptor {
                node_id: self.node_id.clone(),
                group: group.to_string(),
                topic: topic.to_string(),
                service_type: ServiceType::Normal,
                transport: TransportType::InProcess,
                udp_endpoint: None,
                shm_channel: None,
            });
            self.announce_service(group, topic, &ServiceAnnouncement::normal(), true);
        }
        self.write_presence();
        Ok(())
    }

    fn unsubscribe(&self, group: &str, topics: &[&str]) -> HermesResult<()> {
        if group.is_empty() {
            return Err(HermesError::invalid_input("unsubscribe requires a group"));
        }
        self.ensure_running()?;

        let removed: Vec<String> = {
            let mut subs = self.subscriptions.lock();
            let info = subs
                .get_mut(group)
                .ok_or_else(|| HermesError::not_found(format!("not subscribed to '{}'", group)))?;
            if topics.is_empty() {
                // Whole group goes away
                let all = info.topics.iter().cloned().collect();
                subs.remove(group);
                all
            } else {
                let mut removed = Vec::new();
                for topic in topics {
                    if info.topics.remove(*topic) {
                        removed.push(topic.to_string());
                    }
                }
                if info.topics.is_empty() {
                    subs.remove(group);
                }
                removed
            }
        };

        for topic in &removed {
            GlobalRegistry::instance().unregister_service(group, &self.node_id, topic);
            self.announce_service(group, topic, &ServiceAnnouncement::normal(), false);
        }
        self.write_presence();
        Ok(())
    }

    fn subscriptions_snapshot(&self) -> Vec<(String, Vec<String>)> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(group, info)| (group.clone(), info.topics.iter().cloned().collect()))
            .collect()
    }

    pub(crate) fn matches(&self, group: &str, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .get(group)
            .is_some_and(|info| info.topics.contains(topic))
    }

    pub(crate) fn enqueue_local(&self, source: &str, group: &str, topic: &str, payload: &[u8]) {
        self.dispatch.enqueue(InboundMessage {
            source: source.to_string(),
            group: group.to_string(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Worker-side delivery: subscription lookup, then the user callback
    /// outside every lock.
    fn deliver(&self, msg: InboundMessage) {
        let callback = {
            let subs = self.subscriptions.lock();
            match subs.get(&msg.group) {
                Some(info) if info.topics.contains(&msg.topic) => Arc::clone(&info.callback),
                _ => return,
            }
        };
        callback(&msg.group, &msg.topic, &msg.payload);
    }

    fn write_presence(&self) {
        let presence = NodePresence::new(
            &self.node_id,
            self.udp.port(),
            self.subscriptions_snapshot(),
        );
        if let Err(e) = presence.write() {
            log::debug!("presence write failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Large data
    // ------------------------------------------------------------------

    fn send_large_data(
        &self,
        group: &str,
        channel_name: &str,
        topic: &str,
        payload: &[u8],
    ) -> HermesResult<()> {
        if group.is_empty() || topic.is_empty() || channel_name.is_empty() {
            return Err(HermesError::invalid_input(
                "send_large_data requires group, channel and topic",
            ));
        }
        if payload.is_empty() {
            return Err(HermesError::invalid_input("empty large-data payload"));
        }
        self.ensure_running()?;

        {
            let mut writers = self.large_writers.lock();
            if !writers.contains_key(channel_name) {
                let writer = LargeDataWriter::create_default(channel_name)?;
                GlobalRegistry::instance().register_service(ServiceDescriptor {
                    node_id: self.node_id.clone(),
                    group: group.to_string(),
                    topic: topic.to_string(),
                    service_type: ServiceType::LargeData,
                    transport: TransportType::SharedMemory,
                    udp_endpoint: None,
                    shm_channel: Some(channel_name.to_string()),
                });
                self.announce_service(
                    group,
                    topic,
                    &ServiceAnnouncement::large_data(channel_name),
                    true,
                );
                writers.insert(channel_name.to_string(), writer);
            }
            writers
                .get(channel_name)
                .expect("writer inserted above")
                .write(payload)?;
        }

        let notification = LargeDataNotification {
            channel_name: channel_name.to_string(),
            topic: topic.to_string(),
            size: payload.len() as u64,
        };
        self.publish(group, topic, &notification.encode()?)
    }

    // ------------------------------------------------------------------
    // Fabric announcements
    // ------------------------------------------------------------------

    fn control_packet(&self, msg_type: MessageType, group: &str, topic: &str, payload: Vec<u8>) -> Option<Vec<u8>> {
        let packet = MessagePacket::new(msg_type, &self.node_id, self.udp.port(), group, topic, payload);
        let mut bytes = Vec::new();
        match packet.encode(&mut bytes) {
            Ok(_) => Some(bytes),
            Err(e) => {
                log::warn!("control packet encode failed: {}", e);
                None
            }
        }
    }

    /// SERVICE_REGISTER / SERVICE_UNREGISTER on both fabrics.
    fn announce_service(&self, group: &str, topic: &str, ann: &ServiceAnnouncement, register: bool) {
        let msg_type = if register {
            MessageType::ServiceRegister
        } else {
            MessageType::ServiceUnregister
        };
        let payload = match bincode::serialize(ann) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("announcement encode failed: {}", e);
                return;
            }
        };
        let Some(bytes) = self.control_packet(msg_type, group, topic, payload) else {
            return;
        };
        self.shm_broadcast(&bytes);
        self.udp_broadcast(&bytes);
    }

    /// Write a control frame into the pair ring of every live registry peer.
    fn shm_broadcast(&self, bytes: &[u8]) {
        let Some(fabric) = &self.shm else { return };
        let timeout = Config::global().shm.node_timeout_ms;
        for peer in fabric.registry.get_all_active(timeout) {
            if peer.node_id == self.node_id {
                continue;
            }
            if self.outbound_ring(fabric, &peer.node_id).is_some() {
                let outbound = fabric.outbound.lock();
                if let Some(producer) = outbound.get(&peer.node_id) {
                    producer.try_write(bytes);
                }
            }
        }
    }

    /// Send a control frame to every known UDP peer; with nobody known yet,
    /// probe the reserved loopback range so existing nodes learn about us.
    fn udp_broadcast(&self, bytes: &[u8]) {
        let endpoints = self.remote_nodes.endpoints();
        if endpoints.is_empty() {
            self.udp.probe_range(bytes);
            return;
        }
        for endpoint in endpoints {
            if let Err(e) = self.udp.send_to(bytes, endpoint) {
                log::debug!("control send to {} failed: {}", endpoint, e);
            }
        }
    }

    /// Startup probe: ask every port in the reserved range who subscribes to
    /// what.
    fn query_existing_subscriptions(&self) {
        if let Some(bytes) = self.control_packet(MessageType::QuerySubscriptions, "", "", Vec::new())
        {
            self.udp.probe_range(&bytes);
        }
    }

    /// Greet every registry peer over shared memory: NODE_JOIN plus one
    /// SERVICE_REGISTER per local subscription.
    fn announce_join(&self) {
        if self.shm.is_none() {
            return;
        }
        if let Some(bytes) = self.control_packet(MessageType::NodeJoin, "", "", Vec::new()) {
            self.shm_broadcast(&bytes);
        }
        for (group, topics) in self.subscriptions_snapshot() {
            for topic in topics {
                self.announce_service(&group, &topic, &ServiceAnnouncement::normal(), true);
            }
        }
    }

    fn announce_leave(&self) {
        if let Some(bytes) = self.control_packet(MessageType::NodeLeave, "", "", Vec::new()) {
            self.shm_broadcast(&bytes);
            self.udp_broadcast(&bytes);
        }
    }

    // ------------------------------------------------------------------
    // Inbound paths
    // ------------------------------------------------------------------

    fn on_udp_datagram(&self, data: &[u8], src: SocketAddr) {
        let packet = match MessagePacket::decode(data) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("dropping malformed datagram from {}: {}", src, e);
                return;
            }
        };
        // Self-sent packets (range probes hit our own port too)
        if packet.node_id == self.node_id {
            return;
        }
        self.handle_packet(packet, Some(src));
    }

    fn on_shm_frame(&self, data: &[u8]) {
        let packet = match MessagePacket::decode(data) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("dropping malformed shm frame: {}", e);
                return;
            }
        };
        if packet.node_id == self.node_id {
            return;
        }
        self.handle_packet(packet, None);
    }

    fn handle_packet(&self, packet: MessagePacket, udp_src: Option<SocketAddr>) {
        if let Some(src) = udp_src {
            let port = if packet.udp_port != 0 {
                packet.udp_port
            } else {
                src.port()
            };
            self.remote_nodes.touch(&packet.node_id, src.ip(), port);
        }

        match packet.msg_type {
            MessageType::Data => {
                if self.matches(&packet.group, &packet.topic) {
                    self.dispatch.enqueue(InboundMessage {
                        source: packet.node_id,
                        group: packet.group,
                        topic: packet.topic,
                        payload: packet.payload,
                    });
                }
            }
            MessageType::Subscribe | MessageType::SubscriptionReply => {
                if packet.msg_type == MessageType::SubscriptionReply {
                    self.remote_nodes.mark_alive(&packet.node_id);
                }
                if let Some(src) = udp_src {
                    self.register_remote_udp(&packet, src);
                }
            }
            MessageType::Unsubscribe => {
                self.remote_nodes
                    .remove_subscription(&packet.node_id, &packet.group, &packet.topic);
                GlobalRegistry::instance().unregister_service(
                    &packet.group,
                    &packet.node_id,
                    &packet.topic,
                );
            }
            MessageType::QuerySubscriptions => {
                if let Some(src) = udp_src {
                    self.reply_subscriptions(&packet, src);
                }
            }
            MessageType::ServiceRegister => {
                let ann = if packet.payload.is_empty() {
                    ServiceAnnouncement::normal()
                } else {
                    match bincode::deserialize(&packet.payload) {
                        Ok(a) => a,
                        Err(e) => {
                            log::debug!("bad service announcement from '{}': {}", packet.node_id, e);
                            ServiceAnnouncement::normal()
                        }
                    }
                };
                let (transport, endpoint) = match udp_src {
                    Some(src) => {
                        let port = if packet.udp_port != 0 {
                            packet.udp_port
                        } else {
                            src.port()
                        };
                        (TransportType::Udp, Some(SocketAddr::new(src.ip(), port)))
                    }
                    None => (TransportType::SharedMemory, None),
                };
                if udp_src.is_some() {
                    self.remote_nodes
                        .add_subscription(&packet.node_id, &packet.group, &packet.topic);
                }
                GlobalRegistry::instance().register_service(ServiceDescriptor {
                    node_id: packet.node_id,
                    group: packet.group,
                    topic: packet.topic,
                    service_type: ann.service_type,
                    transport,
                    udp_endpoint: endpoint,
                    shm_channel: ann.shm_channel,
                });
            }
            MessageType::ServiceUnregister => {
                self.remote_nodes
                    .remove_subscription(&packet.node_id, &packet.group, &packet.topic);
                GlobalRegistry::instance().unregister_service(
                    &packet.group,
                    &packet.node_id,
                    &packet.topic,
                );
            }
            MessageType::NodeJoin => {
                // A new shm peer: tell it what we serve, over its pair ring
                for (group, topics) in self.subscriptions_snapshot() {
                    for topic in topics {
                        let payload = bincode::serialize(&ServiceAnnouncement::normal())
                            .unwrap_or_default();
                        if let (Some(fabric), Some(bytes)) = (
                            self.shm.as_ref(),
                            self.control_packet(MessageType::ServiceRegister, &group, &topic, payload),
                        ) {
                            if self.outbound_ring(fabric, &packet.node_id).is_some() {
                                let outbound = fabric.outbound.lock();
                                if let Some(producer) = outbound.get(&packet.node_id) {
                                    producer.try_write(&bytes);
                                }
                            }
                        }
                    }
                }
            }
            MessageType::NodeLeave => {
                self.purge_peer(&packet.node_id);
            }
            MessageType::Heartbeat => {
                self.remote_nodes.mark_alive(&packet.node_id);
            }
        }
    }

    fn register_remote_udp(&self, packet: &MessagePacket, src: SocketAddr) {
        if packet.group.is_empty() || packet.topic.is_empty() {
            return;
        }
        let port = if packet.udp_port != 0 {
            packet.udp_port
        } else {
            src.port()
        };
        self.remote_nodes
            .add_subscription(&packet.node_id, &packet.group, &packet.topic);
        GlobalRegistry::instance().register_service(ServiceDescriptor {
            node_id: packet.node_id.clone(),
            group: packet.group.clone(),
            topic: packet.topic.clone(),
            service_type: ServiceType::Normal,
            transport: TransportType::Udp,
            udp_endpoint: Some(SocketAddr::new(src.ip(), port)),
            shm_channel: None,
        });
    }

    /// Answer a QUERY_SUBSCRIPTIONS probe with one SUBSCRIPTION_REPLY per
    /// locally subscribed `(group, topic)`.
    fn reply_subscriptions(&self, query: &MessagePacket, src: SocketAddr) {
        let port = if query.udp_port != 0 {
            query.udp_port
        } else {
            src.port()
        };
        let dest = SocketAddr::new(src.ip(), port);
        for (group, topics) in self.subscriptions_snapshot() {
            for topic in topics {
                if let Some(bytes) =
                    self.control_packet(MessageType::SubscriptionReply, &group, &topic, Vec::new())
                {
                    if let Err(e) = self.udp.send_to(&bytes, dest) {
                        log::debug!("subscription reply to {} failed: {}", dest, e);
                        return;
                    }
                }
            }
        }
    }

    /// Forget everything about a departed peer and synthesize teardown for
    /// its services.
    fn purge_peer(&self, node_id: &str) {
        let removed = GlobalRegistry::instance().remove_node_services(node_id);
        if !removed.is_empty() {
            log::info!(
                "peer '{}' gone, {} service(s) unregistered",
                node_id,
                removed.len()
            );
        }
        self.remote_nodes.remove(node_id);
        if let Some(fabric) = &self.shm {
            fabric.outbound.lock().remove(node_id);
        }
    }

    // ------------------------------------------------------------------
    // Background threads
    // ------------------------------------------------------------------

    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.running.load(Ordering::Acquire) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            std::thread::sleep(left.min(SLEEP_STEP));
        }
    }

    /// Refresh our registry slot and ping every known UDP peer.
    fn heartbeat_loop(&self) {
        let interval = Duration::from_millis(Config::global().shm.heartbeat_interval_ms);
        while self.running.load(Ordering::Acquire) {
            if let Some(fabric) = &self.shm {
                fabric.registry.update_heartbeat(&self.node_id);
            }
            if let Some(bytes) = self.control_packet(MessageType::Heartbeat, "", "", Vec::new()) {
                for endpoint in self.remote_nodes.endpoints() {
                    let _ = self.udp.send_to(&bytes, endpoint);
                }
            }
            self.sleep_while_running(interval);
        }
    }

    /// Reclaim stale registry slots, time out silent UDP peers, and tear
    /// down the services of anything declared dead.
    fn reaper_loop(&self) {
        let timeout = Duration::from_millis(Config::global().shm.node_timeout_ms);
        while self.running.load(Ordering::Acquire) {
            self.sleep_while_running(REAPER_INTERVAL);
            if !self.running.load(Ordering::Acquire) {
                return;
            }

            if let Some(fabric) = &self.shm {
                let reclaimed = fabric.registry.cleanup_stale(timeout.as_millis() as u64);
                if reclaimed > 0 {
                    log::info!("reaper reclaimed {} stale registry slot(s)", reclaimed);
                }
            }

            for dead in self.remote_nodes.sweep(timeout) {
                log::info!("peer '{}' timed out", dead.node_id);
                self.purge_peer(&dead.node_id);
            }

            // Shared-memory descriptors have no heartbeat of their own; a
            // node that vanished from the registry takes its services along.
            if let Some(fabric) = &self.shm {
                let registry = GlobalRegistry::instance();
                for svc in registry.find_services(None) {
                    if svc.transport == TransportType::SharedMemory
                        && svc.node_id != self.node_id
                        && !registry.is_local_node(&svc.node_id)
                        && !fabric.registry.node_exists(&svc.node_id)
                    {
                        self.purge_peer(&svc.node_id);
                    }
                }
            }
        }
    }

    /// Drain every inbound pair ring. The consumer endpoints live on this
    /// thread (they are single-consumer by construction); the set refreshes
    /// against the shared registry once a second.
    fn poll_loop(&self) {
        let cfg = Config::global();
        let timeout = cfg.shm.node_timeout_ms;
        let max_inbound = cfg.node.max_inbound_queues;
        let mut consumers: HashMap<String, RingConsumer> = HashMap::new();
        let mut halted: HashSet<String> = HashSet::new();
        let mut scratch = vec![0u8; MAX_FRAME_PAYLOAD];
        let mut last_refresh: Option<Instant> = None;

        while self.running.load(Ordering::Acquire) {
            if last_refresh.is_none_or(|t| t.elapsed() >= RING_REFRESH) {
                last_refresh = Some(Instant::now());
                if let Some(fabric) = &self.shm {
                    let active: HashMap<String, String> = fabric
                        .registry
                        .get_all_active(timeout)
                        .into_iter()
                        .filter(|e| e.node_id != self.node_id)
                        .map(|e| (e.node_id, e.shm_name))
                        .collect();
                    consumers.retain(|peer, _| active.contains_key(peer));
                    for (peer, _base) in active {
                        if consumers.len() >= max_inbound {
                            break;
                        }
                        if consumers.contains_key(&peer) || halted.contains(&peer) {
                            continue;
                        }
                        let name = format!("{}_{}", self.inbound_base, peer);
                        match RingBuffer::open(&name) {
                            Ok(ring) => match ring.consumer() {
                                Ok(consumer) => {
                                    log::debug!("draining pair ring from '{}'", peer);
                                    consumers.insert(peer, consumer);
                                }
                                Err(e) => log::warn!("pair ring from '{}': {}", peer, e),
                            },
                            // The peer simply has not sent us anything yet
                            Err(HermesError::NotFound(_)) => {}
                            Err(e) => log::debug!("pair ring from '{}': {}", peer, e),
                        }
                    }
                }
            }

            let mut drained = false;
            let mut broken: Vec<String> = Vec::new();
            for (peer, consumer) in &consumers {
                // Bounded drain per ring per pass keeps one chatty peer from
                // starving the others.
                for _ in 0..128 {
                    match consumer.try_read_into(&mut scratch) {
                        Ok(Some(len)) => {
                            drained = true;
                            self.on_shm_frame(&scratch[..len]);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // Corruption halts this ring; the cursor stays
                            // put so the fault remains observable.
                            log::warn!("inbound ring from '{}' corrupted: {}", peer, e);
                            broken.push(peer.clone());
                            break;
                        }
                    }
                }
            }
            for peer in broken {
                consumers.remove(&peer);
                halted.insert(peer);
            }

            if !drained {
                std::thread::sleep(POLL_IDLE);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Default node singleton
// ----------------------------------------------------------------------

/// The process-wide default node, created lazily with an auto-generated id.
/// Callers share one instance for as long as anyone holds it; once the last
/// handle drops, the next call creates a fresh node.
pub fn default_node() -> HermesResult<Arc<Node>> {
    static DEFAULT: OnceLock<Mutex<Weak<Node>>> = OnceLock::new();
    let slot = DEFAULT.get_or_init(|| Mutex::new(Weak::new()));
    let mut guard = slot.lock();
    if let Some(node) = guard.upgrade() {
        return Ok(node);
    }
    let node = Node::create("")?;
    *guard = Arc::downgrade(&node);
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_id(tag: &str) -> String {
        format!(
            "{}_{}_{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
                % 1_000_000
        )
    }

    fn noop() -> Callback {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn create_validates_node_id() {
        assert!(Node::create(&"x".repeat(64)).is_err());
        assert!(Node::create("has space").is_err());
    }

    #[test]
    fn duplicate_id_in_process_is_rejected() {
        let id = test_id("dup");
        let _node = Node::create(&id).unwrap();
        assert!(matches!(
            Node::create(&id),
            Err(HermesError::AlreadyExists(_))
        ));
    }

    #[test]
    fn auto_generated_ids_are_unique() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_ne!(a, b);
        assert!(validate_node_id(&a).is_ok());
    }

    #[test]
    fn subscribe_validation() {
        let node = Node::create(&test_id("subv")).unwrap();
        assert!(matches!(
            node.subscribe("", &["t"], noop()),
            Err(HermesError::InvalidInput(_))
        ));
        assert!(matches!(
            node.subscribe("g", &[], noop()),
            Err(HermesError::InvalidInput(_))
        ));
        assert!(matches!(
            node.subscribe("g", &[""], noop()),
            Err(HermesError::InvalidInput(_))
        ));
    }

    #[test]
    fn publish_validation() {
        let node = Node::create(&test_id("pubv")).unwrap();
        assert!(matches!(
            node.publish("", "t", b"x"),
            Err(HermesError::InvalidInput(_))
        ));
        assert!(matches!(
            node.publish("g", "", b"x"),
            Err(HermesError::InvalidInput(_))
        ));
    }

    #[test]
    fn subscription_bookkeeping() {
        let node = Node::create(&test_id("subs")).unwrap();
        let group = test_id("grp");

        node.subscribe(&group, &["a", "b"], noop()).unwrap();
        assert!(node.is_subscribed(&group, "a"));
        assert!(node.is_subscribed(&group, "b"));
        assert!(!node.is_subscribed(&group, "c"));

        // Union on re-subscribe
        node.subscribe(&group, &["c"], noop()).unwrap();
        let subs = node.subscriptions();
        let (_, topics) = subs.iter().find(|(g, _)| g == &group).unwrap();
        let expected: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(topics, &expected);

        // Removing the last topic drops the group
        node.unsubscribe(&group, &["a", "b"]).unwrap();
        node.unsubscribe(&group, &["c"]).unwrap();
        assert!(node.subscriptions().iter().all(|(g, _)| g != &group));
        assert!(matches!(
            node.unsubscribe(&group, &["c"]),
            Err(HermesError::NotFound(_))
        ));
    }

    #[test]
    fn subscribe_unsubscribe_round_trip_is_idempotent() {
        let node = Node::create(&test_id("idem")).unwrap();
        let group = test_id("grp");
        let before = node.subscriptions();
        node.subscribe(&group, &["t1", "t2"], noop()).unwrap();
        node.unsubscribe(&group, &[]).unwrap();
        assert_eq!(node.subscriptions(), before);
    }

    #[test]
    fn subscribing_registers_descriptors_and_drop_sweeps_them() {
        let id = test_id("sweep");
        let group = test_id("grp");
        {
            let node = Node::create(&id).unwrap();
            node.subscribe(&group, &["t"], noop()).unwrap();
            let services = node.discover_services(Some(&group), None);
            assert_eq!(services.len(), 1);
            assert_eq!(services[0].node_id, id);
            assert_eq!(services[0].transport, TransportType::InProcess);
        }
        // Last strong reference gone: no descriptor of this node survives
        let leftover: Vec<_> = GlobalRegistry::instance()
            .find_services(Some(&group))
            .into_iter()
            .filter(|s| s.node_id == id)
            .collect();
        assert!(leftover.is_empty());
    }

    #[test]
    fn local_publish_reaches_subscriber_once() {
        let a = Node::create(&test_id("pub_a")).unwrap();
        let b = Node::create(&test_id("pub_b")).unwrap();
        let group = test_id("grp");

        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        b.subscribe(
            &group,
            &["temperature"],
            Arc::new(move |_g, _t, payload| {
                assert_eq!(payload, b"T=21C");
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        a.publish(&group, "temperature", b"T=21C").unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_self_reception() {
        let node = Node::create(&test_id("selfr")).unwrap();
        let group = test_id("grp");
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        node.subscribe(
            &group,
            &["t"],
            Arc::new(move |_, _, _| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        node.publish(&group, "t", b"echo?").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn large_data_flows_through_named_channel() {
        let sender = Node::create(&test_id("ld_tx")).unwrap();
        let receiver = Node::create(&test_id("ld_rx")).unwrap();
        let group = test_id("grp");
        let channel = test_id("chan");

        let notified: Arc<Mutex<Option<LargeDataNotification>>> = Arc::new(Mutex::new(None));
        let notified_clone = Arc::clone(&notified);
        receiver
            .subscribe(
                &group,
                &["frame"],
                Arc::new(move |_g, _t, payload| {
                    *notified_clone.lock() = Some(LargeDataNotification::decode(payload).unwrap());
                }),
            )
            .unwrap();

        let block: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        sender
            .send_large_data(&group, &channel, "frame", &block)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while notified.lock().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let notification = notified.lock().clone().expect("notification not delivered");
        assert_eq!(notification.channel_name, channel);
        assert_eq!(notification.topic, "frame");
        assert_eq!(notification.size, block.len() as u64);

        let mut reader = receiver.open_large_data(&channel).unwrap();
        assert_eq!(reader.try_read().unwrap().unwrap(), block);

        // The channel is announced as a LARGE_DATA service
        let services = sender.discover_services(Some(&group), Some(ServiceType::LargeData));
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].shm_channel.as_deref(), Some(channel.as_str()));
    }

    #[test]
    fn default_node_is_shared() {
        let a = default_node().unwrap();
        let b = default_node().unwrap();
        assert_eq!(a.node_id(), b.node_id());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn operations_fail_after_shutdown_flag() {
        let node = Node::create(&test_id("down")).unwrap();
        node.shared.running.store(false, Ordering::Release);
        assert!(matches!(
            node.publish("g", "t", b"x"),
            Err(HermesError::NotInitialized(_))
        ));
        assert!(matches!(
            node.subscribe("g", &["t"], noop()),
            Err(HermesError::NotInitialized(_))
        ));
        // Restore so Drop's teardown still runs cleanly
        node.shared.running.store(true, Ordering::Release);
    }
}
