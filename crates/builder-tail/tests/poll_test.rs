#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Tests for status polling and `wait_for_terminal`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use builder_tail::config::PollConfig;
use builder_tail::error::{FetchError, FetchErrorKind, WaitError};
use builder_tail::event::{InMemoryEventSink, TailEventKind};
use builder_tail::mock::{test_status, MockBuilderApi, MockCall};
use builder_tail::poll::{
    wait_for_terminal, EntityStatusSource, JobGroupSource, PollPhase, ProjectJobsSource,
    StatusPollSession, StatusSource,
};
use builder_tail::service::{JobGroupStatus, ProjectStatus};
use builder_tail::types::{EntityRef, EntityState, EntityStatus};

// ── Helpers ──

async fn settle() {
    tokio::time::sleep(Duration::from_secs(120)).await;
}

fn entity_session(api: &Arc<MockBuilderApi>, entities: Vec<EntityRef>) -> StatusPollSession {
    let source = EntityStatusSource::new(api.clone(), entities);
    StatusPollSession::new(Arc::new(source), &PollConfig::default())
}

fn status_times(api: &MockBuilderApi) -> Vec<u128> {
    api.status_calls().into_iter().map(|at| at.as_millis()).collect()
}

/// Source whose fetch takes `delay`; active for the first `active_polls`
/// fetches. Records when each fetch began and the peak concurrency.
struct SlowSource {
    origin: Instant,
    delay: Duration,
    active_polls: usize,
    started: Mutex<Vec<Duration>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowSource {
    fn new(delay: Duration, active_polls: usize) -> Self {
        Self {
            origin: Instant::now(),
            delay,
            active_polls,
            started: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn started_ms(&self) -> Vec<u128> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|at| at.as_millis())
            .collect()
    }
}

#[async_trait]
impl StatusSource for SlowSource {
    async fn fetch(&self) -> Result<Vec<EntityStatus>, FetchError> {
        let n = {
            let mut started = self.started.lock().unwrap();
            started.push(self.origin.elapsed());
            started.len()
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let state = if n <= self.active_polls {
            EntityState::InProgress
        } else {
            EntityState::Success
        };
        Ok(vec![test_status("1", state)])
    }

    fn describe(&self) -> String {
        "slow source".into()
    }
}

// ── StatusPollSession ──

#[tokio::test(start_paused = true)]
async fn polls_until_nothing_is_active() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_status(test_status("1", EntityState::InProgress))
            .with_status(test_status("2", EntityState::Success))
            .with_status(test_status("1", EntityState::Failure))
            .with_status(test_status("2", EntityState::Success)),
    );
    let session = entity_session(&api, vec![EntityRef::job("1"), EntityRef::job("2")]);
    session.start();
    settle().await;

    assert_eq!(status_times(&api), vec![0, 0, 10_000, 10_000]);
    assert_eq!(session.phase(), PollPhase::Stopped);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.polls, 2);
    assert!(!snapshot.any_active());
    assert_eq!(snapshot.statuses[0].state, EntityState::Failure);
}

#[tokio::test(start_paused = true)]
async fn empty_set_stops_after_first_poll() {
    let api = Arc::new(MockBuilderApi::new());
    let session = entity_session(&api, Vec::new());
    session.start();
    settle().await;

    assert_eq!(api.call_count(), 0);
    assert_eq!(session.snapshot().polls, 1);
    assert_eq!(session.phase(), PollPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_keeps_polling() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_status_error(FetchError::transient("503"))
            .with_status(test_status("1", EntityState::Success)),
    );
    let session = entity_session(&api, vec![EntityRef::build("1")]);
    session.start();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = session.snapshot();
    assert_eq!(snapshot.error, Some(FetchError::transient("503")));
    assert_eq!(session.phase(), PollPhase::Waiting);

    settle().await;
    let snapshot = session.snapshot();
    assert!(snapshot.error.is_none());
    assert_eq!(snapshot.polls, 2);
    assert_eq!(status_times(&api), vec![0, 10_000]);
    assert_eq!(session.phase(), PollPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_stops_polling() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_status(test_status("1", EntityState::Pending))
            .with_status_error(FetchError::fatal("401 Unauthorized")),
    );
    let session = entity_session(&api, vec![EntityRef::job("1")]);
    session.start();
    settle().await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.error.unwrap().kind(), FetchErrorKind::Fatal);
    // Last good statuses survive the failure.
    assert_eq!(snapshot.statuses[0].state, EntityState::Pending);
    assert_eq!(api.status_calls().len(), 2);
    assert_eq!(session.phase(), PollPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_next_poll() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_status(test_status("1", EntityState::Queued))
            .with_status(test_status("1", EntityState::Queued)),
    );
    let session = entity_session(&api, vec![EntityRef::job("1")]);
    session.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    session.stop();
    settle().await;

    assert_eq!(api.status_calls().len(), 1);
    assert_eq!(session.phase(), PollPhase::Stopped);
    assert_eq!(session.generation(), 2);
}

#[tokio::test(start_paused = true)]
async fn restart_resets_snapshot() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_status(test_status("1", EntityState::Dispatching))
            .with_status(test_status("1", EntityState::Success)),
    );
    let session = entity_session(&api, vec![EntityRef::job("1")]);
    session.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(session.snapshot().polls, 1);

    session.start();
    settle().await;
    assert_eq!(status_times(&api), vec![0, 1000]);
    assert_eq!(session.snapshot().polls, 1);
    assert_eq!(session.phase(), PollPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn subscribers_see_each_poll() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_status(test_status("1", EntityState::Processing))
            .with_status(test_status("1", EntityState::Complete)),
    );
    let session = entity_session(&api, vec![EntityRef::job("1")]);
    let mut rx = session.subscribe();
    session.start();

    rx.changed().await.unwrap();
    rx.changed().await.unwrap();
    let snapshot = rx.borrow_and_update().clone();
    assert!(snapshot.polls >= 1);

    settle().await;
    assert_eq!(rx.borrow().statuses[0].state, EntityState::Complete);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_never_overlaps_the_next_poll() {
    let source = Arc::new(SlowSource::new(Duration::from_secs(3), 2));
    let config = PollConfig {
        interval: Duration::from_secs(1),
    };
    let session = StatusPollSession::new(source.clone(), &config);
    session.start();
    settle().await;

    // Each poll waits the interval after the previous fetch finished.
    assert_eq!(source.started_ms(), vec![0, 4000, 8000]);
    assert_eq!(source.peak.load(Ordering::SeqCst), 1);
    assert_eq!(session.snapshot().polls, 3);
    assert_eq!(session.phase(), PollPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn zero_interval_is_raised_to_the_minimum() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_status(test_status("1", EntityState::Queued))
            .with_status(test_status("1", EntityState::Success)),
    );
    let source = EntityStatusSource::new(api.clone(), vec![EntityRef::job("1")]);
    let config = PollConfig {
        interval: Duration::ZERO,
    };
    let session = StatusPollSession::new(Arc::new(source), &config);
    session.start();
    settle().await;

    assert_eq!(status_times(&api), vec![0, 1000]);
    assert_eq!(session.phase(), PollPhase::Stopped);
}

#[tokio::test(start_paused = true)]
async fn project_jobs_source_polls_list() {
    let api = Arc::new(
        MockBuilderApi::new()
            .with_job_list(vec![
                test_status("10", EntityState::Pending),
                test_status("11", EntityState::Success),
            ])
            .with_job_list(vec![
                test_status("10", EntityState::Rejected),
                test_status("11", EntityState::Success),
            ]),
    );
    let source = ProjectJobsSource::new(api.clone(), "core", "nginx");
    let config = PollConfig {
        interval: Duration::from_secs(5),
    };
    let sink = Arc::new(InMemoryEventSink::new());
    let session = StatusPollSession::new(Arc::new(source), &config).with_event_sink(sink.clone());
    session.start();
    settle().await;

    let calls = api.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(
        &calls[1],
        MockCall::ProjectJobs { origin, name, at }
            if origin == "core" && name == "nginx" && at.as_millis() == 5000
    ));
    assert_eq!(sink.count_kind(TailEventKind::Poll), 2);
    assert!(sink.events()[0].detail.contains("jobs of core/nginx"));
}

#[tokio::test(start_paused = true)]
async fn job_group_source_tracks_group_and_projects() {
    let group = |group_state, project_state| JobGroupStatus {
        group: test_status("77", group_state),
        projects: vec![ProjectStatus {
            name: "core/nginx".into(),
            job_id: Some("101".into()),
            status: test_status("101", project_state),
        }],
    };
    let api = Arc::new(
        MockBuilderApi::new()
            .with_job_group(group(EntityState::Dispatching, EntityState::InProgress))
            .with_job_group(group(EntityState::Complete, EntityState::Success)),
    );
    let source = JobGroupSource::new(api.clone(), "77");
    let session = StatusPollSession::new(Arc::new(source), &PollConfig::default());
    session.start();
    settle().await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.statuses.len(), 2);
    assert_eq!(snapshot.statuses[0].id, "77");
    assert_eq!(snapshot.statuses[1].state, EntityState::Success);
    assert_eq!(api.call_count(), 2);
}

// ── wait_for_terminal ──

#[tokio::test(start_paused = true)]
async fn wait_returns_terminal_status_immediately() {
    let api = MockBuilderApi::new().with_status(test_status("1", EntityState::Canceled));
    let status = wait_for_terminal(
        &EntityRef::job("1"),
        Duration::from_secs(5),
        Duration::from_secs(30),
        CancellationToken::new(),
        &api,
    )
    .await
    .unwrap();

    assert_eq!(status.state, EntityState::Canceled);
    assert_eq!(api.status_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_polls_through_transitions_and_retries_transient() {
    let api = MockBuilderApi::new()
        .with_status(test_status("1", EntityState::Pending))
        .with_status_error(FetchError::transient("reset"))
        .with_status_error(FetchError::not_found("not yet"))
        .with_status(test_status("1", EntityState::Success));
    let status = wait_for_terminal(
        &EntityRef::job("1"),
        Duration::from_secs(5),
        Duration::from_secs(60),
        CancellationToken::new(),
        &api,
    )
    .await
    .unwrap();

    assert_eq!(status.state, EntityState::Success);
    assert_eq!(status_times(&api), vec![0, 5000, 10_000, 15_000]);
}

#[tokio::test(start_paused = true)]
async fn wait_with_zero_interval_still_advances() {
    let api = MockBuilderApi::new()
        .with_status(test_status("1", EntityState::Pending))
        .with_status(test_status("1", EntityState::Processing))
        .with_status(test_status("1", EntityState::Complete));
    let status = wait_for_terminal(
        &EntityRef::job("1"),
        Duration::ZERO,
        Duration::from_secs(60),
        CancellationToken::new(),
        &api,
    )
    .await
    .unwrap();

    assert_eq!(status.state, EntityState::Complete);
    assert_eq!(status_times(&api), vec![0, 1000, 2000]);
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_with_last_observed_state() {
    let mut api = MockBuilderApi::new();
    for _ in 0..5 {
        api = api.with_status(test_status("1", EntityState::InProgress));
    }
    let err = wait_for_terminal(
        &EntityRef::build("1"),
        Duration::from_secs(10),
        Duration::from_secs(25),
        CancellationToken::new(),
        &api,
    )
    .await
    .unwrap_err();

    assert_eq!(
        err,
        WaitError::Timeout {
            entity: "build 1".into(),
            waited: Duration::from_secs(25),
            last_observed: "InProgress".into(),
        }
    );
    assert_eq!(api.status_calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn wait_honours_cancellation() {
    let api = MockBuilderApi::new().with_status(test_status("1", EntityState::Queued));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let err = wait_for_terminal(
        &EntityRef::job("1"),
        Duration::from_secs(5),
        Duration::from_secs(60),
        cancel,
        &api,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        WaitError::Cancelled { ref last_observed, .. } if last_observed == "Queued"
    ));
}

#[tokio::test(start_paused = true)]
async fn wait_returns_fatal_errors() {
    let api = MockBuilderApi::new().with_status_error(FetchError::fatal("403 Forbidden"));
    let err = wait_for_terminal(
        &EntityRef::job("1"),
        Duration::from_secs(5),
        Duration::from_secs(60),
        CancellationToken::new(),
        &api,
    )
    .await
    .unwrap_err();

    assert_eq!(err, WaitError::Fetch(FetchError::fatal("403 Forbidden")));
}
