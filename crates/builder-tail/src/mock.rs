//! Scripted builder API for unit and scenario tests.
//!
//! Responses are queued per endpoint and served in order; every call is
//! recorded with the (virtual) time it was made, measured from the mock's
//! creation. An exhausted queue answers with a `Transient` error.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::service::{ChunkFetcher, JobGroupStatus, JobListFetcher, StatusFetcher};
use crate::types::{EntityKind, EntityState, EntityStatus, LogChunk};

/// A recorded call to the mock API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Chunk {
        kind: EntityKind,
        id: String,
        start: u64,
        at: Duration,
    },
    Status {
        kind: EntityKind,
        id: String,
        at: Duration,
    },
    ProjectJobs {
        origin: String,
        name: String,
        at: Duration,
    },
    JobGroup {
        id: String,
        at: Duration,
    },
}

struct Scripted<T> {
    delay: Duration,
    result: Result<T, FetchError>,
}

/// Mock implementation of every fetcher trait.
pub struct MockBuilderApi {
    created: Instant,
    chunks: Mutex<VecDeque<Scripted<LogChunk>>>,
    statuses: Mutex<VecDeque<Scripted<EntityStatus>>>,
    job_lists: Mutex<VecDeque<Scripted<Vec<EntityStatus>>>>,
    groups: Mutex<VecDeque<Scripted<JobGroupStatus>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockBuilderApi {
    fn default() -> Self {
        Self::new()
    }
}

fn push<T>(queue: &Mutex<VecDeque<Scripted<T>>>, delay: Duration, result: Result<T, FetchError>) {
    match queue.lock() {
        Ok(mut q) => q.push_back(Scripted { delay, result }),
        Err(poisoned) => poisoned.into_inner().push_back(Scripted { delay, result }),
    }
}

fn pop<T>(queue: &Mutex<VecDeque<Scripted<T>>>) -> Option<Scripted<T>> {
    match queue.lock() {
        Ok(mut q) => q.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

async fn serve<T>(queue: &Mutex<VecDeque<Scripted<T>>>, what: &str) -> Result<T, FetchError> {
    match pop(queue) {
        Some(scripted) => {
            if !scripted.delay.is_zero() {
                tokio::time::sleep(scripted.delay).await;
            }
            scripted.result
        }
        None => Err(FetchError::transient(format!("no scripted {what} response"))),
    }
}

impl MockBuilderApi {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            chunks: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            job_lists: Mutex::new(VecDeque::new()),
            groups: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a chunk response.
    pub fn with_chunk(self, chunk: LogChunk) -> Self {
        push(&self.chunks, Duration::ZERO, Ok(chunk));
        self
    }

    /// Queue a chunk failure.
    pub fn with_chunk_error(self, err: FetchError) -> Self {
        push(&self.chunks, Duration::ZERO, Err(err));
        self
    }

    /// Queue a chunk response that takes `delay` to arrive.
    pub fn with_slow_chunk(self, delay: Duration, result: Result<LogChunk, FetchError>) -> Self {
        push(&self.chunks, delay, result);
        self
    }

    pub fn with_status(self, status: EntityStatus) -> Self {
        push(&self.statuses, Duration::ZERO, Ok(status));
        self
    }

    pub fn with_status_error(self, err: FetchError) -> Self {
        push(&self.statuses, Duration::ZERO, Err(err));
        self
    }

    pub fn with_job_list(self, statuses: Vec<EntityStatus>) -> Self {
        push(&self.job_lists, Duration::ZERO, Ok(statuses));
        self
    }

    pub fn with_job_list_error(self, err: FetchError) -> Self {
        push(&self.job_lists, Duration::ZERO, Err(err));
        self
    }

    pub fn with_job_group(self, group: JobGroupStatus) -> Self {
        push(&self.groups, Duration::ZERO, Ok(group));
        self
    }

    /// Return all recorded calls.
    pub fn calls(&self) -> Vec<MockCall> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Return the number of recorded calls.
    pub fn call_count(&self) -> usize {
        match self.calls.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// `(start offset, time)` of every chunk request.
    pub fn chunk_calls(&self) -> Vec<(u64, Duration)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Chunk { start, at, .. } => Some((start, at)),
                _ => None,
            })
            .collect()
    }

    /// Time of every status request.
    pub fn status_calls(&self) -> Vec<Duration> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Status { at, .. } => Some(at),
                _ => None,
            })
            .collect()
    }

    fn elapsed(&self) -> Duration {
        Instant::now().duration_since(self.created)
    }

    fn record(&self, call: MockCall) {
        match self.calls.lock() {
            Ok(mut guard) => guard.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }
}

/// Helper to create a chunk from string slices.
pub fn test_chunk(start: u64, stop: u64, lines: &[&str], is_complete: bool) -> LogChunk {
    LogChunk::new(
        start,
        stop,
        lines.iter().map(|l| l.to_string()).collect(),
        is_complete,
    )
}

/// Helper to create a status with no timestamps.
pub fn test_status(id: &str, state: EntityState) -> EntityStatus {
    EntityStatus::new(id, state)
}

#[async_trait]
impl ChunkFetcher for MockBuilderApi {
    async fn fetch_chunk(
        &self,
        kind: EntityKind,
        id: &str,
        start: u64,
    ) -> Result<LogChunk, FetchError> {
        self.record(MockCall::Chunk {
            kind,
            id: id.to_string(),
            start,
            at: self.elapsed(),
        });
        serve(&self.chunks, "chunk").await
    }
}

#[async_trait]
impl StatusFetcher for MockBuilderApi {
    async fn fetch_status(&self, kind: EntityKind, id: &str) -> Result<EntityStatus, FetchError> {
        self.record(MockCall::Status {
            kind,
            id: id.to_string(),
            at: self.elapsed(),
        });
        serve(&self.statuses, "status").await
    }
}

#[async_trait]
impl JobListFetcher for MockBuilderApi {
    async fn list_project_jobs(
        &self,
        origin: &str,
        name: &str,
    ) -> Result<Vec<EntityStatus>, FetchError> {
        self.record(MockCall::ProjectJobs {
            origin: origin.to_string(),
            name: name.to_string(),
            at: self.elapsed(),
        });
        serve(&self.job_lists, "job list").await
    }

    async fn job_group(&self, group_id: &str) -> Result<JobGroupStatus, FetchError> {
        self.record(MockCall::JobGroup {
            id: group_id.to_string(),
            at: self.elapsed(),
        });
        serve(&self.groups, "job group").await
    }
}
