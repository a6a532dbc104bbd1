//! Configuration for varasto
//!
//! Deserializable with serde for embedding in a larger config document, or
//! loaded from `VARASTO_*` environment variables with [`Config::from_env`].
//!
//! ```text
//! buffer:
//!   type: mmap            # memory | mmap | none
//!   memory:
//!     limit_bytes: 524288000
//!   mmap:
//!     path: varasto_data
//!     segment_size_bytes: 268435456
//!     limit_bytes: null   # unbounded
//!     sync_writes: false
//! ```

use crate::buffer::{BufferStrategy, DEFAULT_MEMORY_LIMIT, DEFAULT_SEGMENT_SIZE};
use crate::error::{Result, VarastoError};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which buffer implementation to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferType {
    /// In-memory FIFO
    #[default]
    Memory,
    /// Memory-mapped segment files
    Mmap,
    /// Unbuffered hand-off
    None,
}

impl FromStr for BufferType {
    type Err = VarastoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "mmap" => Ok(Self::Mmap),
            "none" => Ok(Self::None),
            other => Err(VarastoError::Config(format!(
                "unknown buffer type '{other}' (expected memory, mmap or none)"
            ))),
        }
    }
}

/// Memory buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum backlog in encoded bytes
    pub limit_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_bytes: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// Segmented mmap buffer settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MmapConfig {
    /// Directory for segment files
    pub path: PathBuf,
    /// Size of each segment file
    pub segment_size_bytes: usize,
    /// Maximum backlog in encoded bytes, unbounded when absent
    pub limit_bytes: Option<usize>,
    /// msync every record before acknowledging the push
    pub sync_writes: bool,
}

impl Default for MmapConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("varasto_data"),
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            limit_bytes: None,
            sync_writes: false,
        }
    }
}

/// Buffer section of the configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Selected implementation
    #[serde(rename = "type")]
    pub kind: BufferType,
    /// Used when `kind` is `memory`
    pub memory: MemoryConfig,
    /// Used when `kind` is `mmap`
    pub mmap: MmapConfig,
}

impl BufferConfig {
    /// Check the section selected by `kind`
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            BufferType::Memory if self.memory.limit_bytes == 0 => Err(VarastoError::Config(
                "memory.limit_bytes must be greater than zero".to_string(),
            )),
            BufferType::Mmap if self.mmap.segment_size_bytes < varasto_core::codec::HEADER_LEN => {
                Err(VarastoError::Config(format!(
                    "mmap.segment_size_bytes must be at least {}",
                    varasto_core::codec::HEADER_LEN
                )))
            }
            BufferType::Mmap if self.mmap.path.as_os_str().is_empty() => Err(
                VarastoError::Config("mmap.path must not be empty".to_string()),
            ),
            BufferType::Mmap if self.mmap.limit_bytes == Some(0) => Err(VarastoError::Config(
                "mmap.limit_bytes must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// The strategy this section selects
    pub fn strategy(&self) -> BufferStrategy {
        match self.kind {
            BufferType::Memory => BufferStrategy::Memory {
                limit: self.memory.limit_bytes,
            },
            BufferType::Mmap => BufferStrategy::Mmap {
                path: self.mmap.path.clone(),
                segment_size: self.mmap.segment_size_bytes,
                limit: self.mmap.limit_bytes,
                sync_writes: self.mmap.sync_writes,
            },
            BufferType::None => BufferStrategy::None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human readable
    Pretty,
}

impl FromStr for LogFormat {
    type Err = VarastoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(VarastoError::Config(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Buffer selection and limits
    pub buffer: BufferConfig,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Capacity of the channels the stage creates
    pub channel_capacity: usize,
    /// How long shutdown waits for the stage to close
    pub shutdown_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            channel_capacity: 1,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from `VARASTO_*` environment variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(v) = lookup("VARASTO_BUFFER_TYPE") {
            config.buffer.kind = v.parse()?;
        }
        if let Some(v) = lookup("VARASTO_MEMORY_LIMIT_BYTES") {
            config.buffer.memory.limit_bytes = parse_number("VARASTO_MEMORY_LIMIT_BYTES", &v)?;
        }
        if let Some(v) = lookup("VARASTO_MMAP_PATH") {
            config.buffer.mmap.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("VARASTO_MMAP_SEGMENT_SIZE_BYTES") {
            config.buffer.mmap.segment_size_bytes =
                parse_number("VARASTO_MMAP_SEGMENT_SIZE_BYTES", &v)?;
        }
        if let Some(v) = lookup("VARASTO_MMAP_LIMIT_BYTES") {
            config.buffer.mmap.limit_bytes = if v.trim().is_empty() {
                None
            } else {
                Some(parse_number("VARASTO_MMAP_LIMIT_BYTES", &v)?)
            };
        }
        if let Some(v) = lookup("VARASTO_MMAP_SYNC_WRITES") {
            config.buffer.mmap.sync_writes = parse_bool("VARASTO_MMAP_SYNC_WRITES", &v)?;
        }
        if let Some(v) = lookup("VARASTO_LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = lookup("VARASTO_LOG_FORMAT") {
            config.log_format = v.parse()?;
        }
        if let Some(v) = lookup("VARASTO_CHANNEL_CAPACITY") {
            config.channel_capacity = parse_number("VARASTO_CHANNEL_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("VARASTO_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout_ms = parse_number("VARASTO_SHUTDOWN_TIMEOUT_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(VarastoError::Config(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        self.buffer.validate()
    }

    /// Shutdown timeout as a Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| VarastoError::Config(format!("{key}: '{value}' is not a valid number")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(VarastoError::Config(format!(
            "{key}: '{value}' is not a valid boolean"
        ))),
    }
}
