//! Fixed-interval status polling.
//!
//! A `StatusPollSession` re-fetches a collection of statuses (a set of
//! entities, a project's job list, or a job group) while any of them is
//! active and stops on its own once none are. `wait_for_terminal` blocks
//! on a single entity until it settles.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PollConfig, MIN_POLL_INTERVAL};
use crate::error::{FetchError, FetchErrorKind, WaitError};
use crate::event::{NullEventSink, TailEvent, TailEventKind, TailEventOutcome, TailEventSink};
use crate::service::{JobListFetcher, StatusFetcher};
use crate::types::{EntityRef, EntityStatus};

/// Something that yields the current statuses of the tracked entities.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<EntityStatus>, FetchError>;

    /// Short label used in logs and events.
    fn describe(&self) -> String;
}

/// A fixed set of jobs or builds, fetched one after another.
pub struct EntityStatusSource {
    fetcher: Arc<dyn StatusFetcher>,
    entities: Vec<EntityRef>,
}

impl EntityStatusSource {
    pub fn new(fetcher: Arc<dyn StatusFetcher>, entities: Vec<EntityRef>) -> Self {
        Self { fetcher, entities }
    }
}

#[async_trait]
impl StatusSource for EntityStatusSource {
    async fn fetch(&self) -> Result<Vec<EntityStatus>, FetchError> {
        let mut statuses = Vec::with_capacity(self.entities.len());
        for entity in &self.entities {
            statuses.push(self.fetcher.fetch_status(entity.kind, &entity.id).await?);
        }
        Ok(statuses)
    }

    fn describe(&self) -> String {
        match self.entities.as_slice() {
            [one] => one.to_string(),
            many => format!("{} entities", many.len()),
        }
    }
}

/// All jobs of one project.
pub struct ProjectJobsSource {
    fetcher: Arc<dyn JobListFetcher>,
    origin: String,
    name: String,
}

impl ProjectJobsSource {
    pub fn new(
        fetcher: Arc<dyn JobListFetcher>,
        origin: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            origin: origin.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl StatusSource for ProjectJobsSource {
    async fn fetch(&self) -> Result<Vec<EntityStatus>, FetchError> {
        self.fetcher.list_project_jobs(&self.origin, &self.name).await
    }

    fn describe(&self) -> String {
        format!("jobs of {}/{}", self.origin, self.name)
    }
}

/// A job group and its per-project statuses.
pub struct JobGroupSource {
    fetcher: Arc<dyn JobListFetcher>,
    group_id: String,
}

impl JobGroupSource {
    pub fn new(fetcher: Arc<dyn JobListFetcher>, group_id: impl Into<String>) -> Self {
        Self {
            fetcher,
            group_id: group_id.into(),
        }
    }
}

#[async_trait]
impl StatusSource for JobGroupSource {
    async fn fetch(&self) -> Result<Vec<EntityStatus>, FetchError> {
        Ok(self.fetcher.job_group(&self.group_id).await?.statuses())
    }

    fn describe(&self) -> String {
        format!("job group {}", self.group_id)
    }
}

/// What observers of a poll session see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSnapshot {
    /// Statuses from the last successful fetch.
    pub statuses: Vec<EntityStatus>,
    /// Failure of the last fetch, cleared by the next success.
    pub error: Option<FetchError>,
    /// Completed fetches in this generation, successful or not.
    pub polls: u64,
}

impl PollSnapshot {
    pub fn any_active(&self) -> bool {
        self.statuses.iter().any(|s| s.state.is_active())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollPhase {
    Idle,
    Polling,
    Waiting,
    Stopped,
}

struct PollShared {
    phase: PollPhase,
    generation: u64,
    cancel: CancellationToken,
}

fn lock(shared: &Mutex<PollShared>) -> MutexGuard<'_, PollShared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Polls a `StatusSource` while anything it tracks is active.
pub struct StatusPollSession {
    source: Arc<dyn StatusSource>,
    interval: Duration,
    events: Arc<dyn TailEventSink>,
    shared: Arc<Mutex<PollShared>>,
    snapshot: Arc<watch::Sender<PollSnapshot>>,
}

impl StatusPollSession {
    pub fn new(source: Arc<dyn StatusSource>, config: &PollConfig) -> Self {
        let (snapshot, _) = watch::channel(PollSnapshot::default());
        Self {
            source,
            interval: config.interval.max(MIN_POLL_INTERVAL),
            events: Arc::new(NullEventSink),
            shared: Arc::new(Mutex::new(PollShared {
                phase: PollPhase::Idle,
                generation: 0,
                cancel: CancellationToken::new(),
            })),
            snapshot: Arc::new(snapshot),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn TailEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Fetch immediately, then every interval until nothing is active.
    /// Restarting supersedes a running loop. Must be called from within a
    /// tokio runtime.
    pub fn start(&self) {
        let (generation, cancel) = {
            let mut shared = lock(&self.shared);
            shared.cancel.cancel();
            shared.generation += 1;
            shared.phase = PollPhase::Polling;
            shared.cancel = CancellationToken::new();
            self.snapshot.send_replace(PollSnapshot::default());
            (shared.generation, shared.cancel.clone())
        };
        debug!(source = %self.source.describe(), generation, "status poll started");

        let poller = Poller {
            source: Arc::clone(&self.source),
            interval: self.interval,
            events: Arc::clone(&self.events),
            shared: Arc::clone(&self.shared),
            snapshot: Arc::clone(&self.snapshot),
            cancel,
            generation,
        };
        tokio::spawn(poller.run());
    }

    pub fn stop(&self) {
        let mut shared = lock(&self.shared);
        shared.cancel.cancel();
        shared.generation += 1;
        shared.phase = PollPhase::Stopped;
    }

    pub fn phase(&self) -> PollPhase {
        lock(&self.shared).phase
    }

    pub fn generation(&self) -> u64 {
        lock(&self.shared).generation
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.snapshot.subscribe()
    }
}

impl Drop for StatusPollSession {
    fn drop(&mut self) {
        lock(&self.shared).cancel.cancel();
    }
}

struct Poller {
    source: Arc<dyn StatusSource>,
    interval: Duration,
    events: Arc<dyn TailEventSink>,
    shared: Arc<Mutex<PollShared>>,
    snapshot: Arc<watch::Sender<PollSnapshot>>,
    cancel: CancellationToken,
    generation: u64,
}

impl Poller {
    async fn run(self) {
        loop {
            if !self.apply(|_, shared| shared.phase = PollPhase::Polling) {
                return;
            }
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.source.fetch() => result,
            };

            match result {
                Ok(statuses) => {
                    let count = statuses.len();
                    let active = statuses.iter().filter(|s| s.state.is_active()).count();
                    if !self.apply(|snapshot, _| {
                        snapshot.send_modify(|snap| {
                            snap.statuses = statuses;
                            snap.error = None;
                            snap.polls += 1;
                        });
                    }) {
                        return;
                    }
                    self.record(TailEventOutcome::Success, format!("{active}/{count} active"));
                    if active == 0 {
                        debug!(source = %self.source.describe(), generation = self.generation, "nothing active, poll finished");
                        self.apply(|_, shared| shared.phase = PollPhase::Stopped);
                        return;
                    }
                }
                Err(err) => {
                    warn!(source = %self.source.describe(), error = %err, "status poll failed");
                    self.record(TailEventOutcome::Error(err.to_string()), "");
                    let fatal = err.kind() == FetchErrorKind::Fatal;
                    if !self.apply(|snapshot, shared| {
                        snapshot.send_modify(|snap| {
                            snap.error = Some(err);
                            snap.polls += 1;
                        });
                        if fatal {
                            shared.phase = PollPhase::Stopped;
                        }
                    }) {
                        return;
                    }
                    if fatal {
                        return;
                    }
                }
            }

            if !self.apply(|_, shared| shared.phase = PollPhase::Waiting) {
                return;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn apply(
        &self,
        mutate: impl FnOnce(&watch::Sender<PollSnapshot>, &mut PollShared),
    ) -> bool {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            return false;
        }
        mutate(&self.snapshot, &mut shared);
        true
    }

    fn record(&self, outcome: TailEventOutcome, detail: impl Into<String>) {
        self.events.record(TailEvent::new(
            None,
            self.generation,
            TailEventKind::Poll,
            outcome,
            format!("{}: {}", self.source.describe(), detail.into()),
        ));
    }
}

/// Poll one entity until it reaches a terminal state.
///
/// Fetches immediately, then every `interval`, raised to at least
/// `MIN_POLL_INTERVAL`. Not-found and transient failures are retried on the
/// next tick; a fatal failure is returned.
/// Ends with `Timeout` once `timeout` elapses and with `Cancelled` when
/// `cancel` fires.
pub async fn wait_for_terminal(
    entity: &EntityRef,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    fetcher: &dyn StatusFetcher,
) -> Result<EntityStatus, WaitError> {
    let interval = interval.max(MIN_POLL_INTERVAL);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_observed = String::from("unknown");
    let mut first = true;

    loop {
        let delay = if first { Duration::ZERO } else { interval };
        first = false;
        let next = async {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fetcher.fetch_status(entity.kind, &entity.id).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(WaitError::Cancelled {
                    entity: entity.to_string(),
                    last_observed,
                });
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(WaitError::Timeout {
                    entity: entity.to_string(),
                    waited: timeout,
                    last_observed,
                });
            }
            result = next => {
                match result {
                    Ok(status) => {
                        if status.is_terminal() {
                            return Ok(status);
                        }
                        last_observed = status.state.to_string();
                    }
                    Err(err) if err.kind() == FetchErrorKind::Fatal => return Err(err.into()),
                    Err(err) => {
                        debug!(entity = %entity, error = %err, "status unavailable, retrying");
                    }
                }
            }
        }
    }
}
