//! Buffer abstraction for pluggable buffer strategies
//!
//! Provides the [`Buffer`] trait and the [`BufferStrategy`] enum for choosing
//! how a stage holds its backlog.
//!
//! # Consumption protocol
//!
//! ```text
//! push_message ──► [ oldest ... newest ]
//!                     │
//!                     ├── next_message   peek, repeatable
//!                     └── shift_message  remove once delivery is confirmed
//! ```
//!
//! A message is only gone after `shift_message`. Anything peeked but not
//! shifted is handed out again by the next `next_message`.

use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use varasto_core::Message;

mod memory;
mod passthrough;
mod queue;
mod segmented;

pub use memory::MemoryBuffer;
pub use passthrough::PassthroughBuffer;
pub use segmented::{SegmentedBuffer, SegmentedOptions, segment_file_name};

/// Default byte limit of the memory buffer (500 MiB)
pub const DEFAULT_MEMORY_LIMIT: usize = 500 * 1024 * 1024;

/// Default size of one mmap segment file (256 MiB)
pub const DEFAULT_SEGMENT_SIZE: usize = 256 * 1024 * 1024;

/// Trait for buffer implementations driven by a buffer stage
///
/// Implementations:
/// - [`MemoryBuffer`]: byte-bounded FIFO in process memory
/// - [`SegmentedBuffer`]: durable FIFO over memory-mapped segment files
/// - [`PassthroughBuffer`]: no storage, hands each message straight through
///
/// `push_message` and `next_message` wait instead of failing when the buffer
/// is full or empty. Both futures are cancel-safe: dropping a pending push
/// stores nothing, dropping a pending next removes nothing.
#[async_trait]
pub trait Buffer: Send + Sync {
    /// Append a message, waiting while it does not fit under the limit
    ///
    /// Returns the backlog after the push.
    async fn push_message(&self, msg: Message) -> Result<usize>;

    /// Return the oldest pending message without removing it
    async fn next_message(&self) -> Result<Message>;

    /// Remove the oldest pending message
    ///
    /// Returns the number of bytes freed.
    fn shift_message(&self) -> Result<usize>;

    /// Encoded bytes of all unshifted messages
    fn backlog(&self) -> usize;

    /// Close the buffer, waking every waiter with `Closed`
    fn close(&self);

    /// Close as soon as the last pending message is shifted
    fn close_once_empty(&self);

    /// True once the buffer has closed
    fn is_closed(&self) -> bool;

    /// Strategy name for logging
    fn strategy_name(&self) -> &'static str;

    /// True when a push does not take ownership of the message
    ///
    /// The stage then answers upstream with the downstream response instead
    /// of acknowledging on push.
    fn defers_ack(&self) -> bool {
        false
    }
}

/// Buffer strategy configuration
///
/// Built once at startup; the stage only sees the resulting `dyn Buffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferStrategy {
    /// In-memory FIFO bounded by encoded bytes
    ///
    /// Fast, lost on restart.
    Memory {
        /// Maximum backlog in bytes
        limit: usize,
    },

    /// Memory-mapped segment files
    ///
    /// Survives restarts; the backlog is recovered from disk on open.
    Mmap {
        /// Directory holding the segment files
        path: PathBuf,
        /// Size of each segment file in bytes
        segment_size: usize,
        /// Maximum backlog in bytes (unbounded when `None`)
        limit: Option<usize>,
        /// msync every record before the push returns
        sync_writes: bool,
    },

    /// No storage, unbuffered hand-off
    None,
}

impl BufferStrategy {
    /// Create a memory buffer strategy
    pub fn memory(limit: usize) -> Self {
        Self::Memory { limit }
    }

    /// Create an mmap buffer strategy with no backlog limit
    pub fn mmap(path: impl Into<PathBuf>, segment_size: usize) -> Self {
        Self::Mmap {
            path: path.into(),
            segment_size,
            limit: None,
            sync_writes: false,
        }
    }

    /// Build the buffer from this strategy
    ///
    /// Opening an mmap buffer runs recovery and can fail.
    pub fn build(&self) -> Result<Arc<dyn Buffer>> {
        match self {
            Self::Memory { limit } => Ok(Arc::new(MemoryBuffer::new(*limit))),
            Self::Mmap {
                path,
                segment_size,
                limit,
                sync_writes,
            } => {
                let options = SegmentedOptions::new(path.clone())
                    .segment_size(*segment_size)
                    .limit(*limit)
                    .sync_writes(*sync_writes);
                Ok(Arc::new(SegmentedBuffer::open(options)?))
            }
            Self::None => Ok(Arc::new(PassthroughBuffer::new())),
        }
    }

    /// Strategy name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Mmap { .. } => "mmap",
            Self::None => "none",
        }
    }
}

impl Default for BufferStrategy {
    fn default() -> Self {
        Self::Memory {
            limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}
