//! In-memory buffer bounded by encoded bytes

use super::Buffer;
use super::queue::{RecordQueue, RecordStore};
use crate::error::{Result, VarastoError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use varasto_core::{Message, codec};

/// Encoded records held in process memory
///
/// Records stay encoded so the backlog counts exactly what a disk buffer
/// would store; peeking decodes zero-copy from the record bytes.
pub(crate) struct MemoryStore {
    records: VecDeque<Bytes>,
}

impl RecordStore for MemoryStore {
    fn append(&mut self, record: &Bytes) -> Result<()> {
        self.records.push_back(record.clone());
        Ok(())
    }

    fn front(&mut self) -> Result<Option<Message>> {
        match self.records.front() {
            Some(record) => Ok(Some(codec::decode_shared(record)?.0)),
            None => Ok(None),
        }
    }

    fn pop_front(&mut self) -> Result<usize> {
        self.records
            .pop_front()
            .map(|record| record.len())
            .ok_or(VarastoError::NothingToShift)
    }
}

/// Byte-bounded FIFO buffer in process memory
///
/// A push waits while `backlog + encoded_size(msg) > limit`. A message whose
/// encoded size exceeds the limit on its own is rejected with
/// `MessageTooLarge`, since no amount of draining would make it fit.
pub struct MemoryBuffer {
    queue: RecordQueue<MemoryStore>,
    limit: usize,
}

impl MemoryBuffer {
    /// Create an empty buffer holding at most `limit` encoded bytes
    pub fn new(limit: usize) -> Self {
        let store = MemoryStore {
            records: VecDeque::new(),
        };
        Self {
            queue: RecordQueue::new(store, limit, limit, "memory"),
            limit,
        }
    }

    /// Byte limit of this buffer
    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[async_trait]
impl Buffer for MemoryBuffer {
    async fn push_message(&self, msg: Message) -> Result<usize> {
        self.queue.push(&msg).await
    }

    async fn next_message(&self) -> Result<Message> {
        self.queue.next().await
    }

    fn shift_message(&self) -> Result<usize> {
        self.queue.shift()
    }

    fn backlog(&self) -> usize {
        self.queue.backlog()
    }

    fn close(&self) {
        self.queue.close();
    }

    fn close_once_empty(&self) {
        self.queue.close_once_empty();
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    fn strategy_name(&self) -> &'static str {
        "memory"
    }
}
