//! Convenience re-exports for stage authors.
//!
//! ```rust
//! use varasto_runtime::prelude::*;
//! ```

// Core types
pub use varasto_core::{Message, Response};

// Stage
pub use varasto_buffer::{BufferStage, StageState};

// Buffers
pub use varasto_buffer::{
    Buffer, BufferStrategy, MemoryBuffer, PassthroughBuffer, SegmentedBuffer, SegmentedOptions,
};

// Configuration
pub use varasto_buffer::{BufferConfig, BufferType, Config};

// Error types
pub use varasto_buffer::VarastoError;

// Zero-copy payload
pub use bytes::Bytes;

// Runtime
pub use crate::RuntimeBuilder;
