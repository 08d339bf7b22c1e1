//! HERMES runtime configuration.
//!
//! All knobs come from `HERMES_`-prefixed environment variables and are read
//! once into a process-wide singleton. Out-of-range or unparseable values are
//! clamped to their valid range silently; a bad environment must never keep
//! a node from starting.
//!
//! | Variable | Range | Default |
//! |---|---|---|
//! | `HERMES_MAX_INBOUND_QUEUES` | 8–64 | 32 |
//! | `HERMES_QUEUE_CAPACITY` | 64–1024 | 1024 |
//! | `HERMES_NUM_THREADS` | 1–16 | 4 |
//! | `HERMES_MAX_QUEUE_SIZE` | - | 25000 |
//! | `HERMES_SHM_QUEUE_CAPACITY` | 64–1024 | 1024 |
//! | `HERMES_HEARTBEAT_INTERVAL_MS` | - | 1000 |
//! | `HERMES_NODE_TIMEOUT_MS` | - | 5000 |
//! | `HERMES_BUFFER_SIZE` | - | 64 MiB |
//! | `HERMES_MAX_BLOCK_SIZE` | - | 8 MiB |
//! | `HERMES_LOG_LEVEL` | DEBUG..NONE | INFO |

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Log verbosity accepted by `HERMES_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    None,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "NONE" => Some(LogLevel::None),
            _ => None,
        }
    }
}

/// Node-local dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Upper bound on inbound shared-memory pair rings polled per node
    pub max_inbound_queues: usize,
    /// Per-lane capacity of the dispatch pool, in messages
    pub queue_capacity: usize,
    /// Number of dispatch worker threads (one lane each)
    pub num_processing_threads: usize,
    /// Global cap on messages queued across all lanes
    pub max_queue_size: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            max_inbound_queues: 32,
            queue_capacity: 1024,
            num_processing_threads: 4,
            max_queue_size: 25_000,
        }
    }
}

/// Shared-memory fabric settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmSection {
    /// Frame capacity hint for per-pair rings (rounded to a power of two)
    pub queue_capacity: usize,
    /// Heartbeat write interval for the shared registry
    pub heartbeat_interval_ms: u64,
    /// Age after which a silent node is considered dead
    pub node_timeout_ms: u64,
}

impl Default for ShmSection {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            heartbeat_interval_ms: 1000,
            node_timeout_ms: 5000,
        }
    }
}

/// Large-data channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeDataSection {
    /// Ring region size for large-data channels, in bytes
    pub buffer_size: usize,
    /// Maximum single payload accepted by a large-data channel
    pub max_block_size: usize,
}

impl Default for LargeDataSection {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024 * 1024,
            max_block_size: 8 * 1024 * 1024,
        }
    }
}

/// Process-wide configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeSection,
    pub shm: ShmSection,
    pub large_data: LargeDataSection,
    pub log_level: LogLevelSection,
}

/// Wrapper so `Config` can derive `Default` while `LogLevel` defaults to INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevelSection(pub LogLevel);

impl Default for LogLevelSection {
    fn default() -> Self {
        LogLevelSection(LogLevel::Info)
    }
}

fn env_clamped(name: &str, default: usize, min: usize, max: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(v) => v.clamp(min, max),
            Err(_) => default,
        },
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

impl Config {
    /// Read the configuration from the current environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            node: NodeSection {
                max_inbound_queues: env_clamped("HERMES_MAX_INBOUND_QUEUES", 32, 8, 64),
                queue_capacity: env_clamped("HERMES_QUEUE_CAPACITY", 1024, 64, 1024),
                num_processing_threads: env_clamped("HERMES_NUM_THREADS", 4, 1, 16),
                max_queue_size: env_clamped(
                    "HERMES_MAX_QUEUE_SIZE",
                    defaults.node.max_queue_size,
                    64,
                    usize::MAX,
                ),
            },
            shm: ShmSection {
                queue_capacity: env_clamped("HERMES_SHM_QUEUE_CAPACITY", 1024, 64, 1024),
                heartbeat_interval_ms: env_u64("HERMES_HEARTBEAT_INTERVAL_MS", 1000).max(10),
                node_timeout_ms: env_u64("HERMES_NODE_TIMEOUT_MS", 5000).max(100),
            },
            large_data: LargeDataSection {
                buffer_size: env_clamped(
                    "HERMES_BUFFER_SIZE",
                    defaults.large_data.buffer_size,
                    4096,
                    usize::MAX,
                ),
                max_block_size: env_clamped(
                    "HERMES_MAX_BLOCK_SIZE",
                    defaults.large_data.max_block_size,
                    1,
                    usize::MAX,
                ),
            },
            log_level: LogLevelSection(
                std::env::var("HERMES_LOG_LEVEL")
                    .ok()
                    .and_then(|s| LogLevel::parse(&s))
                    .unwrap_or(LogLevel::Info),
            ),
        }
    }

    /// The process-wide configuration, loaded from the environment on first
    /// access.
    pub fn global() -> &'static Config {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        CONFIG.get_or_init(Config::from_env)
    }
}
