//! REST transport: implements the fetcher traits with reqwest against the
//! builder API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::service::{ChunkFetcher, JobGroupStatus, JobListFetcher, ProjectStatus, StatusFetcher};
use crate::types::{EntityKind, EntityState, EntityStatus, LogChunk};

/// Builder API client backed by a pooled reqwest client.
#[derive(Clone)]
pub struct BuilderClient {
    http: reqwest::Client,
    base_url: String,
    color: bool,
}

impl BuilderClient {
    pub fn new(config: &ClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = config.token.as_deref().filter(|t| !t.trim().is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|e| FetchError::fatal(format!("invalid authorization header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout.max(Duration::from_millis(1)))
            .build()
            .map_err(|e| FetchError::fatal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http,
            base_url: normalize_base_url(&config.base_url),
            color: config.color,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let url = self.url(path);
        debug!(%url, ?query, "GET");

        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| FetchError::fatal(format!("malformed response from {path}: {e}")))
    }
}

#[async_trait]
impl ChunkFetcher for BuilderClient {
    async fn fetch_chunk(
        &self,
        kind: EntityKind,
        id: &str,
        start: u64,
    ) -> Result<LogChunk, FetchError> {
        require_id(id)?;
        let mut query = vec![("start", start.to_string())];
        if self.color {
            query.push(("color", "true".to_string()));
        }
        let body: LogChunkBody = self
            .get_json(&format!("{}/{id}/log", kind.path_segment()), &query)
            .await?;
        Ok(LogChunk::new(
            body.start,
            body.stop,
            body.content,
            body.is_complete,
        ))
    }
}

#[async_trait]
impl StatusFetcher for BuilderClient {
    async fn fetch_status(&self, kind: EntityKind, id: &str) -> Result<EntityStatus, FetchError> {
        require_id(id)?;
        let body: StatusBody = self
            .get_json(&format!("{}/{id}", kind.path_segment()), &[])
            .await?;
        body.into_status()
    }
}

#[async_trait]
impl JobListFetcher for BuilderClient {
    async fn list_project_jobs(
        &self,
        origin: &str,
        name: &str,
    ) -> Result<Vec<EntityStatus>, FetchError> {
        require_id(origin)?;
        require_id(name)?;
        let body: JobListBody = self
            .get_json(&format!("projects/{origin}/{name}/jobs"), &[])
            .await?;
        body.data.into_iter().map(StatusBody::into_status).collect()
    }

    async fn job_group(&self, group_id: &str) -> Result<JobGroupStatus, FetchError> {
        require_id(group_id)?;
        let body: JobGroupBody = self
            .get_json(
                &format!("depot/pkgs/schedule/{group_id}"),
                &[("include_projects", "true".to_string())],
            )
            .await?;
        body.into_group()
    }
}

// -- wire types --

#[derive(Debug, Deserialize)]
struct LogChunkBody {
    #[serde(default)]
    start: u64,
    #[serde(default)]
    stop: u64,
    #[serde(default)]
    content: Vec<String>,
    #[serde(default)]
    is_complete: bool,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    id: serde_json::Value,
    state: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    build_started_at: Option<String>,
    #[serde(default)]
    build_finished_at: Option<String>,
}

impl StatusBody {
    fn into_status(self) -> Result<EntityStatus, FetchError> {
        Ok(EntityStatus {
            id: id_to_string(&self.id),
            state: parse_state(&self.state)?,
            created_at: parse_timestamp(self.created_at.as_deref()),
            started_at: parse_timestamp(self.build_started_at.as_deref()),
            finished_at: parse_timestamp(self.build_finished_at.as_deref()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct JobListBody {
    #[serde(default)]
    data: Vec<StatusBody>,
}

#[derive(Debug, Deserialize)]
struct JobGroupBody {
    id: serde_json::Value,
    state: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    projects: Vec<JobGroupProjectBody>,
}

#[derive(Debug, Deserialize)]
struct JobGroupProjectBody {
    name: String,
    state: String,
    #[serde(default)]
    job_id: Option<serde_json::Value>,
}

impl JobGroupBody {
    fn into_group(self) -> Result<JobGroupStatus, FetchError> {
        let mut group = EntityStatus::new(id_to_string(&self.id), parse_state(&self.state)?);
        group.created_at = parse_timestamp(self.created_at.as_deref());

        let projects = self
            .projects
            .into_iter()
            .map(|p| -> Result<ProjectStatus, FetchError> {
                // The backend reports "0" for projects that never got a job.
                let job_id = p
                    .job_id
                    .as_ref()
                    .map(id_to_string)
                    .filter(|id| !id.is_empty() && id != "0");
                let status_id = job_id.clone().unwrap_or_else(|| p.name.clone());
                Ok(ProjectStatus {
                    status: EntityStatus::new(status_id, parse_state(&p.state)?),
                    name: p.name,
                    job_id,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobGroupStatus { group, projects })
    }
}

// -- helpers --

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

fn require_id(id: &str) -> Result<(), FetchError> {
    if id.trim().is_empty() {
        return Err(FetchError::fatal("entity id is required"));
    }
    Ok(())
}

fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    };
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound { message },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Fatal { message },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            FetchError::Transient { message }
        }
        s if s.is_server_error() => FetchError::Transient { message },
        _ => FetchError::Fatal { message },
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        return FetchError::fatal(format!("malformed response: {err}"));
    }
    if err.is_builder() {
        return FetchError::fatal(err.to_string());
    }
    // Timeouts, refused connections and dropped bodies.
    FetchError::transient(err.to_string())
}

fn parse_state(raw: &str) -> Result<EntityState, FetchError> {
    EntityState::from_str(raw)
        .ok_or_else(|| FetchError::fatal(format!("malformed response: unknown state {raw:?}")))
}

fn id_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_adds_scheme() {
        assert_eq!(
            normalize_base_url("bldr.example.com/v1"),
            "http://bldr.example.com/v1"
        );
    }

    #[test]
    fn normalize_base_url_trims_slash_and_whitespace() {
        assert_eq!(
            normalize_base_url("  https://bldr.example.com/v1/  "),
            "https://bldr.example.com/v1"
        );
    }

    #[test]
    fn classify_not_found() {
        let err = classify_status(StatusCode::NOT_FOUND, "");
        assert_eq!(
            err,
            FetchError::NotFound {
                message: "404 Not Found".into()
            }
        );
    }

    #[test]
    fn classify_auth_is_fatal() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            FetchError::Fatal { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "nope"),
            FetchError::Fatal { .. }
        ));
    }

    #[test]
    fn classify_server_errors_are_transient() {
        for code in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(matches!(
                classify_status(code, ""),
                FetchError::Transient { .. }
            ));
        }
    }

    #[test]
    fn classify_keeps_body_detail() {
        let err = classify_status(StatusCode::BAD_REQUEST, "bad start\n");
        assert_eq!(err.message(), "400 Bad Request: bad start");
    }

    #[test]
    fn status_body_accepts_numeric_and_string_ids() {
        let numeric: StatusBody =
            serde_json::from_str(r#"{"id": 72, "state": "Dispatched"}"#).unwrap();
        assert_eq!(numeric.into_status().unwrap().id, "72");

        let text: StatusBody = serde_json::from_str(
            r#"{"id": "72", "state": "complete", "build_started_at": "2018-01-01T10:00:00Z",
                "build_finished_at": "2018-01-01T10:05:00+00:00"}"#,
        )
        .unwrap();
        let status = text.into_status().unwrap();
        assert_eq!(status.state, EntityState::Complete);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_some());
        assert!(status.created_at.is_none());
    }

    #[test]
    fn unknown_state_is_fatal() {
        let body: StatusBody = serde_json::from_str(r#"{"id": 1, "state": "Exploded"}"#).unwrap();
        assert!(matches!(body.into_status(), Err(FetchError::Fatal { .. })));
    }

    #[test]
    fn job_group_projects_without_jobs_use_name() {
        let body: JobGroupBody = serde_json::from_str(
            r#"{"id": "9", "state": "Pending", "projects": [
                {"name": "core/zlib", "state": "InProgress", "job_id": "31"},
                {"name": "core/gcc", "state": "NotStarted", "job_id": "0"}
            ]}"#,
        )
        .unwrap();
        let group = body.into_group().unwrap();
        assert_eq!(group.group.state, EntityState::Pending);
        assert_eq!(group.projects[0].job_id.as_deref(), Some("31"));
        assert_eq!(group.projects[0].status.id, "31");
        assert_eq!(group.projects[1].job_id, None);
        assert_eq!(group.projects[1].status.id, "core/gcc");
        assert_eq!(group.statuses().len(), 3);
    }

    #[test]
    fn chunk_body_defaults_missing_fields() {
        let body: LogChunkBody = serde_json::from_str("{}").unwrap();
        assert_eq!(body.start, 0);
        assert_eq!(body.stop, 0);
        assert!(body.content.is_empty());
        assert!(!body.is_complete);
    }
}
