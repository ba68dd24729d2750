//! # Configuration
//!
//! TOML configuration for the mote bridge, loaded once at startup.
//!
//! ```toml
//! [serial]
//! ports = ["/dev/ttyUSB0"]
//! baud_rate = 115200
//!
//! [mote]
//! namespace = "d8b61708-2797-11e6-836b-0cc47a0f7eea"
//! base_uri = "building/motes"
//!
//! [collector]
//! uri = "http://localhost:8079/add"
//! capacity = 100
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Optional keys fall back to the defaults below. CLI flags override the
//! serial port list (`start --port`).
use crate::delivery::BatchPolicy;
use crate::mote::{self, PortSettings};
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub serial: SerialConfig,
    pub mote: MoteConfig,
    pub collector: CollectorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub ports: Vec<String>,
    pub baud_rate: u32,
    /// Serial read timeout (ms). Bounds how long shutdown waits on an idle line.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Bytes requested per read.
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Validated packets buffered between reassembly and decoding.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Frames longer than this (after unescaping) are abandoned.
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_read_chunk() -> usize {
    mote::DEFAULT_READ_CHUNK
}

fn default_queue_capacity() -> usize {
    mote::DEFAULT_QUEUE_CAPACITY
}

fn default_max_frame() -> usize {
    mote::hdlc::DEFAULT_MAX_FRAME
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoteConfig {
    /// Namespace for UUIDv5 stream identifiers.
    pub namespace: Uuid,
    /// Prefix of published signal URIs.
    #[serde(default)]
    pub base_uri: String,
    /// Drop a packet repeating the previous (node, type, seq) within this many seconds.
    /// Unset or 0 disables duplicate suppression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_window_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub uri: String,
    /// Readings per batch.
    pub capacity: usize,
    /// Transmit timeout in seconds; 0 waits indefinitely.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Maximum readings held while the collector is failing. Oldest are dropped beyond this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<usize>,
}

fn default_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    /// Interval for per-port counter logs (0 disables).
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_stats_interval_secs() -> u64 {
    300
}

impl CollectorConfig {
    pub fn policy(&self) -> BatchPolicy {
        BatchPolicy {
            capacity: self.capacity.max(1),
            timeout: (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds)),
            max_pending: self.max_pending,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.baud_rate == 0 {
            bail!("serial.baud_rate must be positive");
        }
        if self.serial.read_chunk == 0 || self.serial.queue_capacity == 0 {
            bail!("serial.read_chunk and serial.queue_capacity must be positive");
        }
        if self.collector.uri.trim().is_empty() {
            bail!("collector.uri must be set");
        }
        if self.collector.capacity == 0 {
            bail!("collector.capacity must be at least 1");
        }
        if let Some(max) = self.collector.max_pending {
            if max < self.collector.capacity {
                bail!(
                    "collector.max_pending ({}) must not be below collector.capacity ({})",
                    max,
                    self.collector.capacity
                );
            }
        }
        Ok(())
    }

    pub fn port_settings(&self, port: &str) -> PortSettings {
        PortSettings {
            port: port.to_string(),
            read_chunk: self.serial.read_chunk,
            queue_capacity: self.serial.queue_capacity,
            max_frame: self.serial.max_frame,
            namespace: self.mote.namespace,
            duplicate_window: self
                .mote
                .duplicate_window_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial: SerialConfig {
                ports: vec!["/dev/ttyUSB0".to_string()],
                baud_rate: 115200,
                read_timeout_ms: default_read_timeout_ms(),
                read_chunk: default_read_chunk(),
                queue_capacity: default_queue_capacity(),
                max_frame: default_max_frame(),
            },
            mote: MoteConfig {
                namespace: Uuid::new_v5(&Uuid::NAMESPACE_URL, b"moteline"),
                base_uri: "building/motes".to_string(),
                duplicate_window_secs: None,
            },
            collector: CollectorConfig {
                uri: "http://localhost:8079/add".to_string(),
                capacity: 100,
                timeout_seconds: default_timeout_seconds(),
                max_pending: Some(100_000),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
                stats_interval_secs: default_stats_interval_secs(),
            },
        }
    }
}
