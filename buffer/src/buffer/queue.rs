//! Shared waiting and accounting logic for storing buffers
//!
//! `RecordQueue` owns the mutex, the byte accounting and the two wake-up
//! conditions. The actual bytes live in a [`RecordStore`], which is either a
//! `VecDeque` in memory or a chain of mapped segment files.

use crate::error::{Result, VarastoError};
use crate::metrics::Metrics;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use varasto_core::{Message, codec};

/// Ordered storage of encoded records
///
/// Called with the queue lock held; implementations never block on other
/// tasks.
pub(crate) trait RecordStore: Send + 'static {
    /// Append one encoded record at the tail
    fn append(&mut self, record: &Bytes) -> Result<()>;

    /// Decode the record at the head, if any
    fn front(&mut self) -> Result<Option<Message>>;

    /// Drop the record at the head and return its encoded size
    fn pop_front(&mut self) -> Result<usize>;

    /// Flush whatever needs flushing before the store goes away
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct QueueState<S> {
    store: S,
    backlog: usize,
    records: usize,
    closed: bool,
    close_when_empty: bool,
}

/// Byte-bounded FIFO with async waiting on both ends
pub(crate) struct RecordQueue<S> {
    state: Mutex<QueueState<S>>,
    /// Signalled when bytes are freed or the queue closes
    not_full: Notify,
    /// Signalled when a record is appended or the queue closes
    not_empty: Notify,
    /// Largest single record ever accepted
    record_limit: usize,
    /// Largest backlog a push may leave behind
    backlog_limit: usize,
    strategy: &'static str,
}

impl<S: RecordStore> RecordQueue<S> {
    pub(crate) fn new(
        store: S,
        record_limit: usize,
        backlog_limit: usize,
        strategy: &'static str,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                store,
                backlog: 0,
                records: 0,
                closed: false,
                close_when_empty: false,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            record_limit: record_limit.min(codec::MAX_ENCODED_SIZE),
            backlog_limit,
            strategy,
        }
    }

    /// Seed the accounting with records already held by the store
    pub(crate) fn with_backlog(self, backlog: usize, records: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.backlog = backlog;
            state.records = records;
        }
        self.report_backlog(backlog);
        self
    }

    pub(crate) async fn push(&self, msg: &Message) -> Result<usize> {
        let size = codec::encoded_size(msg);
        if size > self.record_limit {
            if let Some(m) = Metrics::get() {
                m.record_rejected("too_large");
            }
            return Err(VarastoError::MessageTooLarge {
                size,
                limit: self.record_limit,
            });
        }

        let record = codec::encode(msg);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(VarastoError::Closed);
                }
                if state.backlog.saturating_add(size) <= self.backlog_limit {
                    if let Err(e) = state.store.append(&record) {
                        return Err(self.fail(&mut state, e));
                    }
                    state.backlog += size;
                    state.records += 1;
                    let backlog = state.backlog;
                    drop(state);

                    self.not_empty.notify_waiters();
                    if let Some(m) = Metrics::get() {
                        m.record_pushed();
                    }
                    self.report_backlog(backlog);
                    return Ok(backlog);
                }
            }

            notified.await;
        }
    }

    pub(crate) async fn next(&self) -> Result<Message> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(VarastoError::Closed);
                }
                match state.store.front() {
                    Ok(Some(msg)) => return Ok(msg),
                    Ok(None) => {}
                    Err(e) => return Err(self.fail(&mut state, e)),
                }
            }

            notified.await;
        }
    }

    pub(crate) fn shift(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(VarastoError::Closed);
        }
        if state.records == 0 {
            return Err(VarastoError::NothingToShift);
        }

        let freed = match state.store.pop_front() {
            Ok(freed) => freed,
            Err(e) => return Err(self.fail(&mut state, e)),
        };
        state.backlog = state.backlog.saturating_sub(freed);
        state.records -= 1;
        let backlog = state.backlog;

        if state.records == 0 && state.close_when_empty {
            self.close_locked(&mut state);
        }
        drop(state);

        self.not_full.notify_waiters();
        if let Some(m) = Metrics::get() {
            m.record_shifted();
        }
        self.report_backlog(backlog);
        Ok(freed)
    }

    pub(crate) fn backlog(&self) -> usize {
        self.state.lock().backlog
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        self.close_locked(&mut state);
    }

    pub(crate) fn close_once_empty(&self) {
        let mut state = self.state.lock();
        if state.records == 0 {
            self.close_locked(&mut state);
        } else {
            state.close_when_empty = true;
        }
    }

    fn close_locked(&self, state: &mut QueueState<S>) {
        if state.closed {
            return;
        }
        state.closed = true;
        if let Err(e) = state.store.close() {
            warn!(strategy = self.strategy, error = %e, "Failed to flush buffer on close");
        }
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        info!(
            strategy = self.strategy,
            backlog = state.backlog,
            pending = state.records,
            "Buffer closed"
        );
    }

    /// Storage errors are fatal: log, close, hand the error back
    fn fail(&self, state: &mut QueueState<S>, err: VarastoError) -> VarastoError {
        error!(strategy = self.strategy, error = %err, "Buffer storage failed");
        if let Some(m) = Metrics::get() {
            m.record_fatal();
        }
        self.close_locked(state);
        err
    }

    fn report_backlog(&self, backlog: usize) {
        if let Some(m) = Metrics::get() {
            m.set_backlog(self.strategy, backlog);
        }
    }
}
