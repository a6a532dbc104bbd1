//! varasto-core - Core types for the varasto buffer subsystem
//!
//! This crate provides the boundary types shared between the buffer crate and
//! the connectors that feed or drain it:
//!
//! - [`Message`] - an ordered list of opaque byte parts
//! - [`Response`] - the delivery outcome returned for every consumed message
//! - [`codec`] - the binary record framing used for storage and accounting
//! - [`CodecError`] - decode failures
//!
//! Connectors only depend on this crate; they never need the buffer
//! implementations themselves.
//!
//! ```text
//! varasto-core ◄── varasto-buffer ◄── varasto-runtime
//!     ▲
//!     └────────── connectors
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Binary record framing
pub mod codec;
mod error;
/// The multi-part message
pub mod message;
mod response;

pub use codec::{decode, decode_shared, encode, encoded_size};
pub use error::CodecError;
pub use message::Message;
pub use response::Response;
