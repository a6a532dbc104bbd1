//! Multi-part Message type for varasto
//!
//! A Message is the unit that flows between pipeline stages: an ordered list
//! of opaque byte blocks ("parts"). Order is significant and preserved
//! end-to-end. Parts are `Bytes`, so cloning a message only bumps refcounts.
//!
//! ```text
//! Message
//!   ├── part[0]  "hello"
//!   ├── part[1]  "world"
//!   └── part[2]  <binary blob>
//! ```

use bytes::Bytes;
use std::fmt;

/// An ordered sequence of zero or more opaque byte blocks
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Message {
    parts: Vec<Bytes>,
}

impl Message {
    /// Create an empty message (zero parts)
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    /// Create a message from already-owned parts
    pub fn from_parts(parts: Vec<Bytes>) -> Self {
        Self { parts }
    }

    /// Create a message by copying each slice into its own part
    ///
    /// Convenient for tests and for connectors that hand over borrowed data.
    pub fn from_slices<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self {
            parts: parts
                .into_iter()
                .map(|p| Bytes::copy_from_slice(p.as_ref()))
                .collect(),
        }
    }

    /// Append a part to the message
    pub fn with_part(mut self, part: impl Into<Bytes>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// All parts in order
    #[inline]
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Get a single part by index
    #[inline]
    pub fn part(&self, index: usize) -> Option<&Bytes> {
        self.parts.get(index)
    }

    /// Number of parts
    #[inline]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// True when the message has no parts
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Total payload bytes across all parts (excluding framing)
    pub fn payload_len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    /// Consume the message and return its parts
    pub fn into_parts(self) -> Vec<Bytes> {
        self.parts
    }
}

impl From<Vec<Bytes>> for Message {
    fn from(parts: Vec<Bytes>) -> Self {
        Self::from_parts(parts)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("parts", &self.parts.len())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}
