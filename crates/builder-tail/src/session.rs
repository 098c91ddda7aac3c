//! Log tailing over a pull-only chunk API.
//!
//! A `TailSession` repeatedly fetches log chunks for one job or build,
//! appending their lines to a `LogBuffer` that observers read through a
//! `LogView`. Each `start()` spawns one worker task tagged with a
//! generation number; `stop()` and a new `start()` bump the generation and
//! cancel the worker's token. Every buffer mutation re-checks the
//! generation under the session lock, so a superseded worker can never
//! touch the buffer again.
//!
//! Transitions:
//! - incomplete chunk, streaming: wait the continuation delay, fetch at the
//!   returned offset.
//! - incomplete chunk, not streaming: idle until `set_stream(true)`.
//! - complete chunk: wait the recheck delay, fetch and publish the status
//!   once, stop.
//! - not found while streaming: show the waiting indicator, wait the
//!   recheck delay, fetch and publish the status, then re-fetch the log.
//! - any other failure: surface it on the buffer and stop.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::{LogBuffer, LogView};
use crate::config::TailConfig;
use crate::error::FetchError;
use crate::event::{NullEventSink, TailEvent, TailEventKind, TailEventOutcome, TailEventSink};
use crate::service::{ChunkFetcher, StatusFetcher};
use crate::types::{ChunkProgress, EntityRef, TailPhase};

struct Shared {
    entity: Option<EntityRef>,
    next_offset: u64,
    phase: TailPhase,
    generation: u64,
    cancel: CancellationToken,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tails the log of one entity at a time.
pub struct TailSession {
    chunks: Arc<dyn ChunkFetcher>,
    statuses: Arc<dyn StatusFetcher>,
    config: TailConfig,
    events: Arc<dyn TailEventSink>,
    buffer: Arc<LogBuffer>,
    shared: Arc<Mutex<Shared>>,
    stream: watch::Sender<bool>,
}

impl TailSession {
    pub fn new(
        chunks: Arc<dyn ChunkFetcher>,
        statuses: Arc<dyn StatusFetcher>,
        config: TailConfig,
    ) -> Self {
        let (stream, _) = watch::channel(false);
        Self {
            chunks,
            statuses,
            config,
            events: Arc::new(NullEventSink),
            buffer: Arc::new(LogBuffer::new()),
            shared: Arc::new(Mutex::new(Shared {
                entity: None,
                next_offset: 0,
                phase: TailPhase::Idle,
                generation: 0,
                cancel: CancellationToken::new(),
            })),
            stream,
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn TailEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Start tailing `entity` from offset 0.
    ///
    /// Any running worker is superseded first, so at most one fetch loop
    /// exists per session. The buffer is cleared exactly once here. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, entity: EntityRef, stream: bool) {
        let (generation, cancel) = {
            let mut shared = lock(&self.shared);
            shared.cancel.cancel();
            shared.generation += 1;
            shared.entity = Some(entity.clone());
            shared.next_offset = 0;
            shared.phase = TailPhase::Fetching;
            shared.cancel = CancellationToken::new();
            self.buffer.reset();
            (shared.generation, shared.cancel.clone())
        };
        self.stream.send_replace(stream);

        debug!(kind = %entity.kind, id = %entity.id, generation, stream, "tail started");
        self.events.record(TailEvent::new(
            Some(entity.clone()),
            generation,
            TailEventKind::Start,
            TailEventOutcome::Success,
            format!("stream={stream}"),
        )
        .with_offset(0)
        .with_phase(TailPhase::Fetching));

        let worker = Worker {
            chunks: Arc::clone(&self.chunks),
            statuses: Arc::clone(&self.statuses),
            config: self.config.clone(),
            events: Arc::clone(&self.events),
            buffer: Arc::clone(&self.buffer),
            shared: Arc::clone(&self.shared),
            stream: self.stream.subscribe(),
            cancel,
            entity,
            generation,
        };
        tokio::spawn(worker.run());
    }

    /// Stop the session. Pending timers and in-flight requests are dropped
    /// and their results ignored.
    pub fn stop(&self) {
        let mut shared = lock(&self.shared);
        shared.cancel.cancel();
        shared.generation += 1;
        let was_running = shared.entity.is_some() && shared.phase != TailPhase::Stopped;
        shared.phase = TailPhase::Stopped;
        if !was_running {
            return;
        }
        self.buffer.set_waiting(false);
        self.buffer.close();

        if let Some(entity) = shared.entity.clone() {
            debug!(kind = %entity.kind, id = %entity.id, generation = shared.generation, "tail stopped");
            self.events.record(TailEvent::new(
                Some(entity),
                shared.generation,
                TailEventKind::Stop,
                TailEventOutcome::Success,
                "",
            )
            .with_offset(shared.next_offset)
            .with_phase(TailPhase::Stopped));
        }
    }

    /// Toggle streaming. Enabling it while idle resumes at the current
    /// offset immediately; disabling it affects the next scheduling
    /// decision only.
    pub fn set_stream(&self, stream: bool) {
        self.stream.send_replace(stream);
    }

    pub fn is_streaming(&self) -> bool {
        *self.stream.borrow()
    }

    pub fn phase(&self) -> TailPhase {
        lock(&self.shared).phase
    }

    pub fn generation(&self) -> u64 {
        lock(&self.shared).generation
    }

    pub fn next_offset(&self) -> u64 {
        lock(&self.shared).next_offset
    }

    pub fn entity(&self) -> Option<EntityRef> {
        lock(&self.shared).entity.clone()
    }

    /// Read-only handle onto the log buffer.
    pub fn view(&self) -> LogView {
        self.buffer.view()
    }
}

impl Drop for TailSession {
    fn drop(&mut self) {
        lock(&self.shared).cancel.cancel();
    }
}

/// One generation of a session's fetch loop.
struct Worker {
    chunks: Arc<dyn ChunkFetcher>,
    statuses: Arc<dyn StatusFetcher>,
    config: TailConfig,
    events: Arc<dyn TailEventSink>,
    buffer: Arc<LogBuffer>,
    shared: Arc<Mutex<Shared>>,
    stream: watch::Receiver<bool>,
    cancel: CancellationToken,
    entity: EntityRef,
    generation: u64,
}

impl Worker {
    async fn run(mut self) {
        let mut offset = 0;
        // Set once a not-found recheck observed a terminal status.
        let mut terminal_seen = false;

        loop {
            if !self.apply(|_, shared| shared.phase = TailPhase::Fetching) {
                return;
            }
            let fetched = self.guarded(self.chunks.fetch_chunk(
                self.entity.kind,
                &self.entity.id,
                offset,
            ));
            let Some(result) = fetched.await else {
                return;
            };
            let result = result.and_then(|chunk| {
                let progress = chunk.progress(offset)?;
                Ok((chunk, progress))
            });

            match result {
                Ok((chunk, progress)) => {
                    let next = match progress {
                        ChunkProgress::Advance { next_offset } => next_offset,
                        ChunkProgress::Unchanged => offset,
                    };
                    let count = chunk.lines.len();
                    let lines = chunk.lines;
                    if !self.apply(|buffer, shared| {
                        buffer.set_waiting(false);
                        buffer.append(lines);
                        shared.next_offset = next;
                    }) {
                        return;
                    }
                    debug!(
                        kind = %self.entity.kind,
                        id = %self.entity.id,
                        offset,
                        next,
                        lines = count,
                        complete = chunk.is_complete,
                        generation = self.generation,
                        "chunk appended"
                    );
                    self.record(
                        TailEventKind::FetchChunk,
                        TailEventOutcome::Success,
                        Some(offset),
                        format!("-> {next} ({count} lines)"),
                    );
                    offset = next;
                    terminal_seen = false;

                    if chunk.is_complete {
                        self.await_status().await;
                        return;
                    }
                    if *self.stream.borrow() {
                        if !self.apply(|_, shared| shared.phase = TailPhase::Waiting) {
                            return;
                        }
                        if !self.sleep(self.config.continuation_delay).await {
                            return;
                        }
                    } else if !self.idle().await {
                        return;
                    }
                }
                Err(err) => {
                    self.record(
                        TailEventKind::FetchChunk,
                        TailEventOutcome::Error(err.to_string()),
                        Some(offset),
                        "",
                    );
                    let streaming = *self.stream.borrow();
                    let recheck = err.is_retryable()
                        && (streaming || self.config.retry_not_found_when_idle)
                        && !(terminal_seen && self.config.stop_on_terminal_not_found);
                    if !recheck {
                        self.surface(err);
                        return;
                    }
                    match self.recheck().await {
                        Some(terminal) => terminal_seen = terminal,
                        None => return,
                    }
                }
            }
        }
    }

    /// Dual-armed not-found handling: after the recheck delay, fetch and
    /// publish the status, then let the loop re-fetch the log. Returns
    /// whether the status was terminal, or `None` when superseded.
    async fn recheck(&self) -> Option<bool> {
        if !self.apply(|buffer, shared| {
            buffer.set_waiting(true);
            shared.phase = TailPhase::Waiting;
        }) {
            return None;
        }
        debug!(
            kind = %self.entity.kind,
            id = %self.entity.id,
            generation = self.generation,
            "log not available yet, rechecking"
        );
        if !self.sleep(self.config.recheck_delay).await {
            return None;
        }
        self.fetch_status().await
    }

    /// Wait for the recheck delay, publish the final status once and stop.
    async fn await_status(&self) {
        if !self.apply(|_, shared| shared.phase = TailPhase::AwaitingStatus) {
            return;
        }
        if !self.sleep(self.config.recheck_delay).await {
            return;
        }
        if self.fetch_status().await.is_none() {
            return;
        }
        self.apply(|buffer, shared| {
            buffer.close();
            shared.phase = TailPhase::Stopped;
        });
        debug!(kind = %self.entity.kind, id = %self.entity.id, generation = self.generation, "tail finished");
    }

    /// Fetch and publish the entity status. Returns whether it is terminal
    /// (`false` on failure), or `None` when superseded.
    async fn fetch_status(&self) -> Option<bool> {
        let fetched = self.guarded(
            self.statuses
                .fetch_status(self.entity.kind, &self.entity.id),
        );
        match fetched.await? {
            Ok(status) => {
                let terminal = status.is_terminal();
                let state = status.state;
                if !self.apply(|buffer, _| buffer.publish_status(status)) {
                    return None;
                }
                self.record(
                    TailEventKind::FetchStatus,
                    TailEventOutcome::Success,
                    None,
                    state.as_str(),
                );
                Some(terminal)
            }
            Err(err) => {
                warn!(kind = %self.entity.kind, id = %self.entity.id, error = %err, "status check failed");
                let detail = err.to_string();
                if !self.apply(|buffer, _| buffer.status_failed(err)) {
                    return None;
                }
                self.record(
                    TailEventKind::FetchStatus,
                    TailEventOutcome::Error(detail),
                    None,
                    "",
                );
                Some(false)
            }
        }
    }

    /// Idle until streaming is re-enabled. Returns `false` when superseded.
    async fn idle(&mut self) -> bool {
        if !self.apply(|_, shared| shared.phase = TailPhase::Idle) {
            return false;
        }
        debug!(kind = %self.entity.kind, id = %self.entity.id, generation = self.generation, "streaming off, idle");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            changed = self.stream.wait_for(|on| *on) => changed.is_ok(),
        }
    }

    fn surface(&self, err: FetchError) {
        warn!(
            kind = %self.entity.kind,
            id = %self.entity.id,
            generation = self.generation,
            error = %err,
            "tail stopped on failure"
        );
        self.apply(|buffer, shared| {
            buffer.fail(err);
            buffer.close();
            shared.phase = TailPhase::Stopped;
        });
    }

    /// Run `mutate` only if this worker's generation is still current.
    fn apply(&self, mutate: impl FnOnce(&LogBuffer, &mut Shared)) -> bool {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            return false;
        }
        mutate(&self.buffer, &mut shared);
        true
    }

    /// Sleep unless cancelled first. Returns `false` when cancelled.
    async fn sleep(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Await a request under the configured timeout and the cancel token.
    /// `None` means cancelled; a timeout is a transient failure.
    async fn guarded<T>(
        &self,
        request: impl Future<Output = Result<T, FetchError>>,
    ) -> Option<Result<T, FetchError>> {
        let limit = self.config.request_timeout;
        let timed = async move {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, request).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::transient(format!(
                        "request timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => request.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = timed => Some(result),
        }
    }

    /// Record an event; `offset` defaults to the session's next offset.
    fn record(
        &self,
        kind: TailEventKind,
        outcome: TailEventOutcome,
        offset: Option<u64>,
        detail: impl Into<String>,
    ) {
        let (phase, next_offset) = {
            let shared = lock(&self.shared);
            (shared.phase, shared.next_offset)
        };
        self.events.record(
            TailEvent::new(
                Some(self.entity.clone()),
                self.generation,
                kind,
                outcome,
                detail,
            )
            .with_offset(offset.unwrap_or(next_offset))
            .with_phase(phase),
        );
    }
}
