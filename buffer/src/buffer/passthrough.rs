//! Passthrough buffer: no storage, one message in flight
//!
//! A push only succeeds while a consumer is parked in `next_message` and the
//! hand-off slot is empty. The producer therefore moves in lockstep with the
//! consumer, and the slot is freed by `shift_message`.

use super::Buffer;
use crate::error::{Result, VarastoError};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use varasto_core::Message;

#[derive(Default)]
struct HandOff {
    slot: Option<Message>,
    /// Consumers currently inside `next_message`
    waiting: usize,
    closed: bool,
    close_when_empty: bool,
}

/// Unbuffered hand-off between producer and consumer
///
/// Backlog is always zero. Because the buffer never owns a message, the stage
/// must answer upstream with the downstream response; see
/// [`Buffer::defers_ack`].
#[derive(Default)]
pub struct PassthroughBuffer {
    state: Mutex<HandOff>,
    changed: Notify,
}

/// Registers a consumer for the duration of one `next_message` call
struct Waiting<'a> {
    buffer: &'a PassthroughBuffer,
}

impl<'a> Waiting<'a> {
    fn register(buffer: &'a PassthroughBuffer) -> Self {
        buffer.state.lock().waiting += 1;
        buffer.changed.notify_waiters();
        Self { buffer }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut state = self.buffer.state.lock();
        state.waiting = state.waiting.saturating_sub(1);
    }
}

impl PassthroughBuffer {
    /// Create an open passthrough buffer
    pub fn new() -> Self {
        Self::default()
    }

    fn close_locked(&self, state: &mut HandOff) {
        if state.closed {
            return;
        }
        state.closed = true;
        self.changed.notify_waiters();
        debug!("Passthrough buffer closed");
    }
}

#[async_trait]
impl Buffer for PassthroughBuffer {
    async fn push_message(&self, msg: Message) -> Result<usize> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(VarastoError::Closed);
                }
                if state.slot.is_none() && state.waiting > 0 {
                    state.slot = Some(msg);
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(0);
                }
            }

            notified.await;
        }
    }

    async fn next_message(&self) -> Result<Message> {
        let _waiting = Waiting::register(self);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.closed {
                    return Err(VarastoError::Closed);
                }
                if let Some(msg) = &state.slot {
                    return Ok(msg.clone());
                }
            }

            notified.await;
        }
    }

    fn shift_message(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(VarastoError::Closed);
        }
        if state.slot.take().is_none() {
            return Err(VarastoError::NothingToShift);
        }
        if state.close_when_empty {
            self.close_locked(&mut state);
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(0)
    }

    fn backlog(&self) -> usize {
        0
    }

    fn close(&self) {
        let mut state = self.state.lock();
        self.close_locked(&mut state);
    }

    fn close_once_empty(&self) {
        let mut state = self.state.lock();
        if state.slot.is_none() {
            self.close_locked(&mut state);
        } else {
            state.close_when_empty = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn strategy_name(&self) -> &'static str {
        "none"
    }

    fn defers_ack(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_waits_for_consumer() {
        let buffer = Arc::new(PassthroughBuffer::new());

        let no_consumer = tokio::time::timeout(
            Duration::from_millis(20),
            buffer.push_message(Message::from_slices(["early"])),
        )
        .await;
        assert!(no_consumer.is_err());

        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.next_message().await })
        };
        let offset = tokio::time::timeout(
            Duration::from_secs(1),
            buffer.push_message(Message::from_slices(["hello"])),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(offset, 0);

        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got, Message::from_slices(["hello"]));
        assert_eq!(buffer.backlog(), 0);

        // Peek again before shifting
        assert_eq!(buffer.next_message().await.unwrap(), got);
        assert_eq!(buffer.shift_message().unwrap(), 0);
        assert!(matches!(
            buffer.shift_message(),
            Err(VarastoError::NothingToShift)
        ));
    }

    #[tokio::test]
    async fn test_dropped_consumer_deregisters() {
        let buffer = PassthroughBuffer::new();

        let mut consumer = Box::pin(buffer.next_message());
        assert!(futures::poll!(consumer.as_mut()).is_pending());
        assert_eq!(buffer.state.lock().waiting, 1);
        drop(consumer);
        assert_eq!(buffer.state.lock().waiting, 0);

        let pushed = tokio::time::timeout(
            Duration::from_millis(20),
            buffer.push_message(Message::from_slices(["orphan"])),
        )
        .await;
        assert!(pushed.is_err());
        assert!(buffer.state.lock().slot.is_none());
    }

    #[tokio::test]
    async fn test_slot_survives_cancelled_consumer() {
        let buffer = PassthroughBuffer::new();

        let mut consumer = Box::pin(buffer.next_message());
        assert!(futures::poll!(consumer.as_mut()).is_pending());
        let offset = tokio::time::timeout(
            Duration::from_secs(1),
            buffer.push_message(Message::from_slices(["kept"])),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(offset, 0);
        drop(consumer);

        let got = tokio::time::timeout(Duration::from_secs(1), buffer.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Message::from_slices(["kept"]));
        assert_eq!(buffer.shift_message().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_both_sides() {
        let buffer = Arc::new(PassthroughBuffer::new());
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.next_message().await })
        };
        tokio::task::yield_now().await;
        buffer.close();

        let res = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(VarastoError::Closed)));
        assert!(matches!(
            buffer.push_message(Message::new()).await,
            Err(VarastoError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_once_empty_after_shift() {
        let buffer = Arc::new(PassthroughBuffer::new());
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.next_message().await })
        };
        buffer
            .push_message(Message::from_slices(["last"]))
            .await
            .unwrap();
        consumer.await.unwrap().unwrap();

        buffer.close_once_empty();
        assert!(!buffer.is_closed());
        buffer.shift_message().unwrap();
        assert!(buffer.is_closed());
    }
}
