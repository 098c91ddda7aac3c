//! Transport-agnostic domain types for log tailing and status polling.
//!
//! These types are decoupled from the JSON wire shapes; `http` converts
//! into them after decoding.

use chrono::{DateTime, Utc};

use crate::error::FetchError;

/// The resource family a log or status belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Job,
    Build,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Build => "build",
        }
    }

    /// Collection segment used in REST paths (`/jobs/{id}`, `/builds/{id}`).
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Job => "jobs",
            Self::Build => "builds",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (kind, id) pair naming one tailable entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn job(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Job, id)
    }

    pub fn build(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Build, id)
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Lifecycle state reported by the backend for a job, build or job group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    NotStarted,
    Pending,
    Queued,
    Dispatching,
    Dispatched,
    Processing,
    InProgress,
    Complete,
    Success,
    Failed,
    Failure,
    Rejected,
    Skipped,
    CancelPending,
    CancelProcessing,
    CancelComplete,
    Canceled,
}

impl EntityState {
    pub const ALL: [EntityState; 17] = [
        Self::NotStarted,
        Self::Pending,
        Self::Queued,
        Self::Dispatching,
        Self::Dispatched,
        Self::Processing,
        Self::InProgress,
        Self::Complete,
        Self::Success,
        Self::Failed,
        Self::Failure,
        Self::Rejected,
        Self::Skipped,
        Self::CancelPending,
        Self::CancelProcessing,
        Self::CancelComplete,
        Self::Canceled,
    ];

    /// Wire spelling, as the backend serializes it.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::Pending => "Pending",
            Self::Queued => "Queued",
            Self::Dispatching => "Dispatching",
            Self::Dispatched => "Dispatched",
            Self::Processing => "Processing",
            Self::InProgress => "InProgress",
            Self::Complete => "Complete",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Failure => "Failure",
            Self::Rejected => "Rejected",
            Self::Skipped => "Skipped",
            Self::CancelPending => "CancelPending",
            Self::CancelProcessing => "CancelProcessing",
            Self::CancelComplete => "CancelComplete",
            Self::Canceled => "Canceled",
        }
    }

    /// Human-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "Not Started",
            Self::Pending => "Pending",
            Self::Queued => "Queued",
            Self::Dispatching => "Dispatching",
            Self::Dispatched => "Dispatched",
            Self::Processing => "Processing",
            Self::InProgress => "In Progress",
            Self::Complete | Self::Success => "Complete",
            Self::Failed | Self::Failure => "Failed",
            Self::Rejected => "Rejected",
            Self::Skipped => "Skipped",
            Self::CancelPending | Self::CancelProcessing => "Canceling",
            Self::CancelComplete | Self::Canceled => "Canceled",
        }
    }

    /// Whether no further state transitions will occur.
    ///
    /// This is a fixed table; it is never inferred from labels.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::Success
                | Self::Failed
                | Self::Failure
                | Self::Rejected
                | Self::Skipped
                | Self::CancelComplete
                | Self::Canceled
        )
    }

    /// Whether the entity is still moving toward a terminal state.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Parse a state from its wire or lowercase spelling.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().to_ascii_lowercase() == wanted)
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status record of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatus {
    pub id: String,
    pub state: EntityState,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EntityStatus {
    pub fn new(id: impl Into<String>, state: EntityState) -> Self {
        Self {
            id: id.into(),
            state,
            created_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One paginated unit of log output.
///
/// `stop` is the offset to request next. The metadata never leaves the
/// session; only `lines` reach the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub start: u64,
    pub stop: u64,
    pub lines: Vec<String>,
    pub is_complete: bool,
}

/// How a received chunk relates to the offset it was requested at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    /// `start` matched the request; advance to `stop`.
    Advance { next_offset: u64 },
    /// Empty placeholder from a different offset; keep the current one.
    Unchanged,
}

impl LogChunk {
    pub fn new(start: u64, stop: u64, lines: Vec<String>, is_complete: bool) -> Self {
        Self {
            start,
            stop,
            lines,
            is_complete,
        }
    }

    /// Check continuation against the requested offset.
    pub fn progress(&self, requested: u64) -> Result<ChunkProgress, FetchError> {
        if self.stop < self.start {
            return Err(FetchError::Fatal {
                message: format!(
                    "malformed chunk: stop {} is before start {}",
                    self.stop, self.start
                ),
            });
        }
        if self.start == requested {
            return Ok(ChunkProgress::Advance {
                next_offset: self.stop.max(requested),
            });
        }
        if self.lines.is_empty() {
            return Ok(ChunkProgress::Unchanged);
        }
        Err(FetchError::Fatal {
            message: format!(
                "discontinuous chunk: requested offset {requested}, got start {}",
                self.start
            ),
        })
    }
}

/// Where a tail session currently is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailPhase {
    Idle,
    Fetching,
    Waiting,
    AwaitingStatus,
    Stopped,
}

impl TailPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Waiting => "waiting",
            Self::AwaitingStatus => "awaiting_status",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TailPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
