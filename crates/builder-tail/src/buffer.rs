//! Append-only log buffer shared between a tail session and its observers.
//!
//! `LogBuffer` is the mutable side and is owned by exactly one
//! `TailSession`. Observers get a `LogView`, which can read snapshots and
//! subscribe to incremental `LogUpdate`s but never mutate.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::error::FetchError;
use crate::types::EntityStatus;

/// One incremental change pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogUpdate {
    /// The buffer was cleared for a new session.
    Reset,
    /// Lines appended, in order.
    Lines(Vec<String>),
    /// The log is not available yet and the session is rechecking.
    Waiting(bool),
    /// Loading failed and the session stopped.
    Failed(FetchError),
    /// Latest status of the tailed entity.
    Status(EntityStatus),
    /// A status check failed; the log itself is unaffected.
    StatusFailed(FetchError),
    /// The session stopped; no further updates until the next reset.
    Closed,
}

/// Identifies a subscription for `LogView::unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A live subscription: lines present at subscribe time plus a stream of
/// every later update.
pub struct LogSubscription {
    pub id: SubscriptionId,
    pub backlog: Vec<String>,
    updates: mpsc::UnboundedReceiver<LogUpdate>,
}

impl LogSubscription {
    /// Next update, or `None` once unsubscribed or the buffer is dropped.
    pub async fn recv(&mut self) -> Option<LogUpdate> {
        self.updates.recv().await
    }

    /// Next update if one is already queued.
    pub fn try_recv(&mut self) -> Option<LogUpdate> {
        self.updates.try_recv().ok()
    }
}

#[derive(Default)]
struct BufferState {
    lines: Vec<String>,
    error: Option<FetchError>,
    waiting: bool,
    status: Option<EntityStatus>,
    closed: bool,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<LogUpdate>)>,
    next_subscription: u64,
}

impl BufferState {
    fn broadcast(&mut self, update: LogUpdate) {
        // Drop subscribers whose receiver is gone.
        self.subscribers
            .retain(|(_, tx)| tx.send(update.clone()).is_ok());
    }
}

fn lock(inner: &Mutex<BufferState>) -> MutexGuard<'_, BufferState> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The writable log sink.
#[derive(Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<BufferState>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only handle for observers.
    pub fn view(&self) -> LogView {
        LogView {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Clear lines, error, status and indicators.
    pub fn reset(&self) {
        let mut state = lock(&self.inner);
        state.lines.clear();
        state.error = None;
        state.waiting = false;
        state.status = None;
        state.closed = false;
        state.broadcast(LogUpdate::Reset);
    }

    /// Append lines in order. Empty input is not an update.
    pub fn append(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let mut state = lock(&self.inner);
        state.lines.extend(lines.iter().cloned());
        state.broadcast(LogUpdate::Lines(lines));
    }

    pub fn set_waiting(&self, waiting: bool) {
        let mut state = lock(&self.inner);
        if state.waiting == waiting {
            return;
        }
        state.waiting = waiting;
        state.broadcast(LogUpdate::Waiting(waiting));
    }

    /// Record a surfaced failure on the error channel.
    pub fn fail(&self, error: FetchError) {
        let mut state = lock(&self.inner);
        state.waiting = false;
        state.error = Some(error.clone());
        state.broadcast(LogUpdate::Failed(error));
    }

    pub fn publish_status(&self, status: EntityStatus) {
        let mut state = lock(&self.inner);
        state.status = Some(status.clone());
        state.broadcast(LogUpdate::Status(status));
    }

    pub fn status_failed(&self, error: FetchError) {
        lock(&self.inner).broadcast(LogUpdate::StatusFailed(error));
    }

    /// Mark the current run finished. Idempotent.
    pub fn close(&self) {
        let mut state = lock(&self.inner);
        if state.closed {
            return;
        }
        state.closed = true;
        state.broadcast(LogUpdate::Closed);
    }
}

/// Read-only observer handle onto a `LogBuffer`.
#[derive(Clone)]
pub struct LogView {
    inner: Arc<Mutex<BufferState>>,
}

impl LogView {
    pub fn lines(&self) -> Vec<String> {
        lock(&self.inner).lines.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).lines.is_empty()
    }

    pub fn error(&self) -> Option<FetchError> {
        lock(&self.inner).error.clone()
    }

    /// Whether to show a neutral "waiting for log" indicator.
    pub fn is_waiting(&self) -> bool {
        lock(&self.inner).waiting
    }

    pub fn status(&self) -> Option<EntityStatus> {
        lock(&self.inner).status.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Subscribe to updates. The backlog and the update stream are taken
    /// under one lock, so nothing is missed or seen twice.
    pub fn subscribe(&self) -> LogSubscription {
        let mut state = lock(&self.inner);
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((id, tx));
        LogSubscription {
            id,
            backlog: state.lines.clone(),
            updates: rx,
        }
    }

    /// Stop delivering updates to a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = lock(&self.inner);
        let before = state.subscribers.len();
        state.subscribers.retain(|(sub, _)| *sub != id);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}
