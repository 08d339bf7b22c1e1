//! Inbound dispatch pool.
//!
//! Every node feeds received messages (UDP thread, shm poller, local
//! publishers) into N bounded lanes drained by N worker threads. The lane is
//! picked by a stable hash of `(group, topic)`, which keeps per-topic
//! delivery order intact while spreading unrelated topics across workers.
//!
//! Lanes have multiple producers, so they are bounded mutex/condvar deques
//! rather than SPSC rings; the lock is held only to push/pop, never across a
//! subscriber callback.

use parking_lot::{Condvar, Mutex};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One message queued for local delivery.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: String,
    pub group: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What to do when a lane (or the global bound) is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Pop queued messages until the new one fits (default).
    #[default]
    DropOldest,
    /// Refuse the new message.
    DropNewest,
    /// Implemented as `DropOldest` in this version (documented fall-through).
    Block,
}

/// Invoked with `(group, topic, dropped_count)` after an overflow event.
pub type OverflowCallback = Arc<dyn Fn(&str, &str, u64) + Send + Sync>;

/// Worker-side delivery function (the node's subscription lookup + callback).
pub type DeliveryFn = Arc<dyn Fn(InboundMessage) + Send + Sync>;

struct Lane {
    queue: Mutex<VecDeque<InboundMessage>>,
    ready: Condvar,
}

pub struct DispatchPool {
    lanes: Vec<Arc<Lane>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    lane_capacity: usize,
    max_total: usize,
    total_pending: Arc<AtomicUsize>,
    policy: OverflowPolicy,
    overflow_cb: Mutex<Option<OverflowCallback>>,
    dropped: AtomicU64,
}

impl DispatchPool {
    pub fn new(
        num_threads: usize,
        lane_capacity: usize,
        max_total: usize,
        policy: OverflowPolicy,
        delivery: DeliveryFn,
    ) -> Self {
        let num_threads = num_threads.max(1);
        let running = Arc::new(AtomicBool::new(true));
        let total_pending = Arc::new(AtomicUsize::new(0));
        let lanes: Vec<Arc<Lane>> = (0..num_threads)
            .map(|_| {
                Arc::new(Lane {
                    queue: Mutex::new(VecDeque::new()),
                    ready: Condvar::new(),
                })
            })
            .collect();

        let workers = lanes
            .iter()
            .enumerate()
            .map(|(i, lane)| {
                let lane = Arc::clone(lane);
                let running = Arc::clone(&running);
                let total_pending = Arc::clone(&total_pending);
                let delivery = Arc::clone(&delivery);
                std::thread::Builder::new()
                    .name(format!("hermes-dispatch-{}", i))
                    .spawn(move || {
                        loop {
                            let msg = {
                                let mut queue = lane.queue.lock();
                                loop {
                                    if let Some(msg) = queue.pop_front() {
                                        break msg;
                                    }
                                    if !running.load(Ordering::Acquire) {
                                        return;
                                    }
                                    lane.ready
                                        .wait_for(&mut queue, Duration::from_millis(100));
                                }
                            };
                            total_pending.fetch_sub(1, Ordering::AcqRel);
                            // A panicking subscriber must not take the worker
                            // (and its whole lane) down with it.
                            let label = (msg.group.clone(), msg.topic.clone());
                            if catch_unwind(AssertUnwindSafe(|| delivery(msg))).is_err() {
                                log::error!(
                                    "subscriber callback panicked on ({}, {})",
                                    label.0,
                                    label.1
                                );
                            }
                        }
                    })
                    .expect("failed to spawn dispatch worker")
            })
            .collect();

        Self {
            lanes,
            workers: Mutex::new(workers),
            running,
            lane_capacity: lane_capacity.max(1),
            max_total: max_total.max(1),
            total_pending,
            policy,
            overflow_cb: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn set_overflow_callback(&self, cb: OverflowCallback) {
        *self.overflow_cb.lock() = Some(cb);
    }

    /// Stable lane index for a `(group, topic)` pair.
    pub fn lane_for(&self, group: &str, topic: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        group.hash(&mut hasher);
        topic.hash(&mut hasher);
        (hasher.finish() as usize) % self.lanes.len()
    }

    /// Queue a message for delivery. Returns false when the overflow policy
    /// rejected it.
    pub fn enqueue(&self, msg: InboundMessage) -> bool {
        let lane = &self.lanes[self.lane_for(&msg.group, &msg.topic)];
        let mut queue = lane.queue.lock();

        let over_lane = queue.len() >= self.lane_capacity;
        let over_total = self.total_pending.load(Ordering::Acquire) >= self.max_total;
        if over_lane || over_total {
            match self.policy {
                OverflowPolicy::DropNewest => {
                    drop(queue);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.fire_overflow(&msg.group, &msg.topic, 1);
                    return false;
                }
                OverflowPolicy::DropOldest | OverflowPolicy::Block => {
                    let mut evicted = 0u64;
                    while queue.len() >= self.lane_capacity {
                        if queue.pop_front().is_none() {
                            break;
                        }
                        self.total_pending.fetch_sub(1, Ordering::AcqRel);
                        evicted += 1;
                    }
                    if evicted > 0 {
                        self.dropped.fetch_add(evicted, Ordering::Relaxed);
                        let (group, topic) = (msg.group.clone(), msg.topic.clone());
                        queue.push_back(msg);
                        self.total_pending.fetch_add(1, Ordering::AcqRel);
                        lane.ready.notify_one();
                        drop(queue);
                        self.fire_overflow(&group, &topic, evicted);
                        return true;
                    }
                }
            }
        }

        queue.push_back(msg);
        self.total_pending.fetch_add(1, Ordering::AcqRel);
        lane.ready.notify_one();
        true
    }

    fn fire_overflow(&self, group: &str, topic: &str, count: u64) {
        let cb = self.overflow_cb.lock().clone();
        if let Some(cb) = cb {
            cb(group, topic, count);
        }
    }

    pub fn pending(&self) -> usize {
        self.total_pending.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Stop the workers. In-flight callbacks finish; queued messages after
    /// the current one are discarded.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for lane in &self.lanes {
            lane.ready.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn msg(group: &str, topic: &str, payload: &[u8]) -> InboundMessage {
        InboundMessage {
            source: "test".into(),
            group: group.into(),
            topic: topic.into(),
            payload: payload.to_vec(),
        }
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn lane_hash_is_stable() {
        let pool = DispatchPool::new(4, 16, 64, OverflowPolicy::DropOldest, Arc::new(|_| {}));
        let lane = pool.lane_for("sensor", "temperature");
        for _ in 0..100 {
            assert_eq!(pool.lane_for("sensor", "temperature"), lane);
        }
        pool.shutdown();
    }

    #[test]
    fn delivers_in_order_per_topic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let pool = DispatchPool::new(
            4,
            1024,
            25_000,
            OverflowPolicy::DropOldest,
            Arc::new(move |m: InboundMessage| {
                seen_clone.lock().push(m.payload[0]);
            }),
        );

        for i in 0..50u8 {
            assert!(pool.enqueue(msg("g", "t", &[i])));
        }
        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 50));
        let order: Vec<u8> = seen.lock().clone();
        assert_eq!(order, (0..50).collect::<Vec<u8>>());
        pool.shutdown();
    }

    #[test]
    fn drop_newest_rejects_and_reports() {
        let gate = Arc::new(Mutex::new(()));
        let blocker = gate.lock();
        let gate_clone = Arc::clone(&gate);
        let pool = DispatchPool::new(
            1,
            2,
            100,
            OverflowPolicy::DropNewest,
            Arc::new(move |_m| {
                let _hold = gate_clone.lock();
            }),
        );
        let overflowed = Arc::new(AtomicU32::new(0));
        let overflowed_clone = Arc::clone(&overflowed);
        pool.set_overflow_callback(Arc::new(move |group, topic, count| {
            assert_eq!(group, "g");
            assert_eq!(topic, "t");
            overflowed_clone.fetch_add(count as u32, Ordering::SeqCst);
        }));

        // First message may be in flight (worker blocked on the gate); fill
        // the lane behind it, then overflow.
        for i in 0..3u8 {
            pool.enqueue(msg("g", "t", &[i]));
        }
        assert!(!pool.enqueue(msg("g", "t", &[9])));
        assert!(overflowed.load(Ordering::SeqCst) >= 1);
        assert!(pool.dropped() >= 1);

        drop(blocker);
        pool.shutdown();
    }

    #[test]
    fn drop_oldest_makes_room() {
        let gate = Arc::new(Mutex::new(()));
        let blocker = gate.lock();
        let gate_clone = Arc::clone(&gate);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let delivered_clone = Arc::clone(&delivered);
        let pool = DispatchPool::new(
            1,
            2,
            100,
            OverflowPolicy::DropOldest,
            Arc::new(move |m: InboundMessage| {
                let _hold = gate_clone.lock();
                delivered_clone.lock().push(m.payload[0]);
            }),
        );

        for i in 0..3u8 {
            pool.enqueue(msg("g", "t", &[i]));
        }
        // Lane holds two; this evicts the oldest queued message
        assert!(pool.enqueue(msg("g", "t", &[9])));
        assert!(pool.dropped() >= 1);

        drop(blocker);
        assert!(wait_until(Duration::from_secs(2), || {
            delivered.lock().last() == Some(&9)
        }));
        pool.shutdown();
    }

    #[test]
    fn panicking_callback_does_not_kill_worker() {
        let delivered = Arc::new(AtomicU32::new(0));
        let delivered_clone = Arc::clone(&delivered);
        let pool = DispatchPool::new(
            1,
            64,
            100,
            OverflowPolicy::DropOldest,
            Arc::new(move |m: InboundMessage| {
                if m.payload[0] == 0xBD {
                    panic!("bad subscriber");
                }
                delivered_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        pool.enqueue(msg("g", "t", &[0xBD]));
        pool.enqueue(msg("g", "t", &[1]));
        pool.enqueue(msg("g", "t", &[2]));
        assert!(wait_until(Duration::from_secs(2), || {
            delivered.load(Ordering::SeqCst) == 2
        }));
        pool.shutdown();
    }
}
