//! Tail event recording for audit and debugging.
//!
//! Each session operation (start, stop, chunk fetch, status fetch) emits an
//! event that can be stored and queried later, independent of `tracing`
//! output.

use chrono::{DateTime, Utc};

use crate::types::{EntityRef, TailPhase};

/// The kind of operation that generated an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailEventKind {
    Start,
    Stop,
    FetchChunk,
    FetchStatus,
    Poll,
}

impl std::fmt::Display for TailEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::FetchChunk => "fetch_chunk",
            Self::FetchStatus => "fetch_status",
            Self::Poll => "poll",
        };
        f.write_str(s)
    }
}

/// Outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEventOutcome {
    Success,
    Error(String),
}

impl std::fmt::Display for TailEventOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

/// An event emitted by a tail or poll session.
///
/// `generation` ties the event to one `start()`. `offset` is the log offset
/// the operation ran at and `phase` the session phase when it was recorded;
/// poll events carry neither.
#[derive(Debug, Clone)]
pub struct TailEvent {
    pub timestamp: DateTime<Utc>,
    pub entity: Option<EntityRef>,
    pub generation: u64,
    pub kind: TailEventKind,
    pub outcome: TailEventOutcome,
    pub offset: Option<u64>,
    pub phase: Option<TailPhase>,
    pub detail: String,
}

impl TailEvent {
    pub fn new(
        entity: Option<EntityRef>,
        generation: u64,
        kind: TailEventKind,
        outcome: TailEventOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            entity,
            generation,
            kind,
            outcome,
            offset: None,
            phase: None,
            detail: detail.into(),
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_phase(mut self, phase: TailPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, TailEventOutcome::Error(_))
    }
}

/// Receiver of tail events.
///
/// Implementations can persist events, forward them, or drop them.
pub trait TailEventSink: Send + Sync {
    fn record(&self, event: TailEvent);
}

/// In-memory event sink for testing.
#[derive(Default)]
pub struct InMemoryEventSink {
    events: std::sync::Mutex<Vec<TailEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TailEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self) -> usize {
        match self.events.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Number of recorded events of one kind.
    pub fn count_kind(&self, kind: TailEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }

    /// Offsets of successful chunk fetches, in recording order.
    pub fn chunk_offsets(&self) -> Vec<u64> {
        self.events()
            .iter()
            .filter(|e| e.kind == TailEventKind::FetchChunk && !e.is_error())
            .filter_map(|e| e.offset)
            .collect()
    }
}

impl TailEventSink for InMemoryEventSink {
    fn record(&self, event: TailEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// No-op event sink that discards all events.
pub struct NullEventSink;

impl TailEventSink for NullEventSink {
    fn record(&self, _event: TailEvent) {}
}
