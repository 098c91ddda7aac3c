//! builder-tail: live log tailing and status polling for builder jobs and builds.
//!
//! Provides:
//! - `TailSession`: incremental chunked log fetching into a `LogBuffer`
//! - `StatusPollSession`: interval status refresh while anything is active
//! - `BuilderClient`: reqwest-backed `ChunkFetcher`/`StatusFetcher`/`JobListFetcher`
//! - `MockBuilderApi`: scripted fetchers for tests
//!
//! Each session operation emits a `TailEvent` for audit/debugging via the
//! `TailEventSink` trait.

pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod logging;
pub mod mock;
pub mod poll;
pub mod service;
pub mod session;
pub mod types;

pub use buffer::{LogBuffer, LogSubscription, LogUpdate, LogView};
pub use error::{FetchError, FetchErrorKind};
pub use http::BuilderClient;
pub use poll::{wait_for_terminal, StatusPollSession};
pub use service::{ChunkFetcher, JobListFetcher, StatusFetcher};
pub use session::TailSession;
pub use types::{EntityKind, EntityRef, EntityState, EntityStatus, LogChunk, TailPhase};

/// Stable crate label used for bootstrap smoke tests.
pub fn crate_label() -> &'static str {
    "builder-tail"
}
