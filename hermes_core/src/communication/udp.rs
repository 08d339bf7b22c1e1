//! Best-effort UDP datagram transport.
//!
//! One socket per node, bound on loopback inside the reserved discovery
//! range when possible. Receiving hands raw datagrams to a caller-supplied
//! callback on a dedicated thread; sending is fire-and-forget.

use crate::error::{HermesError, HermesResult};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Reserved loopback range used for auto-binding and zero-config discovery.
pub const PORT_BASE: u16 = 47200;
pub const PORT_MAX: u16 = 47999;
const PORT_COUNT: u16 = PORT_MAX - PORT_BASE + 1;

const UDP_BUFFER_SIZE: usize = 65536;
const RECV_IDLE: Duration = Duration::from_micros(100);

/// Invoked on the receive thread with each datagram and its sender.
pub type ReceiveCallback = Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync>;

pub struct UdpTransport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    port: AtomicU16,
    running: Arc<AtomicBool>,
    recv_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            port: AtomicU16::new(0),
            running: Arc::new(AtomicBool::new(false)),
            recv_thread: Mutex::new(None),
        }
    }

    /// Bind the socket. `port == 0` walks the reserved range from a
    /// time-seeded offset (spreads concurrent starters), then falls back to
    /// an ephemeral port. Calling again on a bound transport is a no-op.
    pub fn initialize(&self, port: u16) -> HermesResult<u16> {
        let mut guard = self.socket.lock();
        if guard.is_some() {
            return Ok(self.port.load(Ordering::Acquire));
        }

        let socket = if port != 0 {
            UdpSocket::bind(("127.0.0.1", port))
                .map_err(|e| HermesError::network(format!("failed to bind port {}: {}", port, e)))?
        } else {
            let offset = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u16
                % PORT_COUNT;
            let mut bound = None;
            for attempt in 0..PORT_COUNT {
                let candidate = PORT_BASE + (offset + attempt) % PORT_COUNT;
                if let Ok(s) = UdpSocket::bind(("127.0.0.1", candidate)) {
                    bound = Some(s);
                    break;
                }
            }
            match bound {
                Some(s) => s,
                // Range exhausted: let the system pick
                None => UdpSocket::bind(("127.0.0.1", 0))
                    .map_err(|e| HermesError::network(format!("ephemeral bind failed: {}", e)))?,
            }
        };

        socket
            .set_nonblocking(true)
            .map_err(|e| HermesError::network(format!("set_nonblocking failed: {}", e)))?;

        let local_port = socket
            .local_addr()
            .map_err(|e| HermesError::network(format!("local_addr failed: {}", e)))?
            .port();
        self.port.store(local_port, Ordering::Release);
        self.running.store(true, Ordering::Release);
        *guard = Some(Arc::new(socket));
        log::debug!("udp transport bound on 127.0.0.1:{}", local_port);
        Ok(local_port)
    }

    /// Start the receive thread, handing each datagram to `callback`.
    pub fn set_receive_callback(&self, callback: ReceiveCallback) -> HermesResult<()> {
        let socket = self
            .socket
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| HermesError::not_initialized("udp transport not initialized"))?;

        let mut thread_guard = self.recv_thread.lock();
        if thread_guard.is_some() {
            return Err(HermesError::AlreadyExists(
                "receive callback already installed".into(),
            ));
        }

        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("hermes-udp-rx".into())
            .spawn(move || {
                let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
                while running.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buffer) {
                        Ok((size, src)) => callback(&buffer[..size], src),
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(RECV_IDLE);
                        }
                        Err(e) => {
                            if running.load(Ordering::Acquire) {
                                log::warn!("udp recv error: {}", e);
                                std::thread::sleep(Duration::from_millis(10));
                            }
                        }
                    }
                }
            })
            .map_err(|e| HermesError::network(format!("failed to spawn receiver: {}", e)))?;
        *thread_guard = Some(handle);
        Ok(())
    }

    /// Send one datagram to `addr:port`.
    pub fn send(&self, data: &[u8], addr: &str, port: u16) -> HermesResult<()> {
        if data.is_empty() {
            return Err(HermesError::invalid_input("empty datagram"));
        }
        if addr.is_empty() || port == 0 {
            return Err(HermesError::invalid_input("missing destination"));
        }
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| HermesError::invalid_input(format!("unparseable address '{}'", addr)))?;
        self.send_to(data, SocketAddr::new(ip, port))
    }

    /// Send one datagram to a resolved address.
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> HermesResult<()> {
        if data.is_empty() {
            return Err(HermesError::invalid_input("empty datagram"));
        }
        let socket = self
            .socket
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| HermesError::not_initialized("udp transport not initialized"))?;
        socket
            .send_to(data, dest)
            .map_err(|e| HermesError::network(format!("send to {} failed: {}", dest, e)))?;
        Ok(())
    }

    /// Fire `data` at every port of the reserved loopback range except our
    /// own. Best-effort: individual send failures are ignored.
    pub fn probe_range(&self, data: &[u8]) {
        let socket = match self.socket.lock().as_ref() {
            Some(s) => Arc::clone(s),
            None => return,
        };
        let own = self.port.load(Ordering::Acquire);
        for port in PORT_BASE..=PORT_MAX {
            if port != own {
                let _ = socket.send_to(data, ("127.0.0.1", port));
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Stop the receive thread and close the socket. Safe to call twice.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.recv_thread.lock().take() {
            let _ = handle.join();
        }
        *self.socket.lock() = None;
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
