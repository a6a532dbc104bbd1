//! varasto-buffer - Store-and-forward buffers for stream pipelines
//!
//! A buffer sits between an input and an output stage and holds the in-flight
//! backlog with byte-based backpressure. Messages leave the buffer only after
//! the downstream confirms delivery.
//!
//! ```text
//! upstream ──► BufferStage ──► downstream
//!                  │
//!          ┌───────┼──────────┐
//!       memory   mmap       none
//!       (RAM)  (segments)  (hand-off)
//! ```
//!
//! - [`Buffer`] - the peek / shift contract every strategy implements
//! - [`BufferStrategy`] - picks and builds a buffer
//! - [`BufferStage`] - drives a buffer from mpsc channels
//! - [`Config`] - serde and environment configuration

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod stage;

pub use buffer::{
    Buffer, BufferStrategy, MemoryBuffer, PassthroughBuffer, SegmentedBuffer, SegmentedOptions,
};
pub use config::{BufferConfig, BufferType, Config, LogFormat, MemoryConfig, MmapConfig};
pub use error::{Result, VarastoError};
pub use metrics::Metrics;
pub use stage::{BufferStage, StageState};
pub use varasto_core::{CodecError, Message, Response};
