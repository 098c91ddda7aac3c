//! Fetcher traits: the seams between the tailing engine and the backend.
//!
//! Implementations issue exactly one request per call and never retry;
//! retry policy belongs to `TailSession`. `http::BuilderClient` talks to the
//! real REST API, `mock::MockBuilderApi` is scripted for tests.

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::{EntityKind, EntityStatus, LogChunk};

/// Fetches one log chunk starting at an offset.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch_chunk(
        &self,
        kind: EntityKind,
        id: &str,
        start: u64,
    ) -> Result<LogChunk, FetchError>;
}

/// Fetches the current status record of one entity.
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch_status(&self, kind: EntityKind, id: &str) -> Result<EntityStatus, FetchError>;
}

/// Fetches status collections used by list and group views.
#[async_trait]
pub trait JobListFetcher: Send + Sync {
    /// All jobs of a project, newest last.
    async fn list_project_jobs(
        &self,
        origin: &str,
        name: &str,
    ) -> Result<Vec<EntityStatus>, FetchError>;

    /// A job group: its own status followed by one status per project.
    async fn job_group(&self, group_id: &str) -> Result<JobGroupStatus, FetchError>;
}

/// Status of a scheduled job group and the projects it builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGroupStatus {
    pub group: EntityStatus,
    pub projects: Vec<ProjectStatus>,
}

/// One project row inside a job group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectStatus {
    pub name: String,
    pub job_id: Option<String>,
    pub status: EntityStatus,
}

impl JobGroupStatus {
    /// Every status the group tracks: the group row, then each project.
    pub fn statuses(&self) -> Vec<EntityStatus> {
        std::iter::once(self.group.clone())
            .chain(self.projects.iter().map(|p| p.status.clone()))
            .collect()
    }
}
