//! Interfaces consumed by the HTTP-facing agent servers. None of those
//! servers live in this crate; this module is purely the seam.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Session, StateMap, TrackEvent};
use crate::error::Result;

/// `ShouldSummarize`/`Summarize` is the entire surface the summary pool
/// needs; the summarizer's own model/prompt plumbing is out of scope.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn should_summarize(&self, session: &Session) -> bool;
    async fn summarize(&self, session: &Session, cancel: &CancellationToken) -> Result<String>;
}

/// Minimal surface for a caller that only needs track telemetry, so it
/// doesn't have to depend on the full `SessionService` trait object.
#[async_trait]
pub trait TrackService: Send + Sync {
    async fn append_track_event(
        &self,
        app: &str,
        user: &str,
        id: &str,
        event: TrackEvent,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn get_track_events(&self, session: &Session, track: &str) -> Result<Vec<TrackEvent>>;
}

/// Invoked around `append_event`. `next` performs the rest of the chain
/// (inner hooks, then the real write); a hook that returns early without
/// calling `next` short-circuits the operation.
#[async_trait]
pub trait AppendEventHook: Send + Sync {
    async fn handle(
        &self,
        session: &Session,
        event: &crate::domain::Event,
        next: AppendEventNext<'_>,
    ) -> Result<()>;
}

/// Invoked around `get_session`.
#[async_trait]
pub trait GetSessionHook: Send + Sync {
    async fn handle(&self, app: &str, user: &str, id: &str, next: GetSessionNext<'_>) -> Result<Arc<Session>>;
}

pub type AppendEventNext<'a> = &'a (dyn Fn() -> futures::future::BoxFuture<'a, Result<()>> + Send + Sync);
pub type GetSessionNext<'a> = &'a (dyn Fn() -> futures::future::BoxFuture<'a, Result<Arc<Session>>> + Send + Sync);

/// The full surface the HTTP agent servers depend on.
#[async_trait]
pub trait SessionServiceContract: Send + Sync {
    async fn create_session(&self, app: &str, user: &str, id: &str, cancel: &CancellationToken) -> Result<Arc<Session>>;
    async fn get_session(
        &self,
        app: &str,
        user: &str,
        id: &str,
        event_num: Option<usize>,
        event_time: Option<chrono::DateTime<chrono::Utc>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>>;
    async fn list_sessions(&self, app: &str, user: &str, cancel: &CancellationToken) -> Result<Vec<Arc<Session>>>;
    async fn delete_session(&self, app: &str, user: &str, id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn append_event(&self, session: &Arc<Session>, event: crate::domain::Event, cancel: &CancellationToken) -> Result<()>;
    async fn update_session_state(&self, session: &Arc<Session>, delta: StateMap, cancel: &CancellationToken) -> Result<()>;
    async fn update_user_state(&self, app: &str, user: &str, delta: StateMap, cancel: &CancellationToken) -> Result<()>;
    async fn enqueue_summary_job(&self, session: Arc<Session>, filter_key: &str, force: bool) -> Result<()>;
    async fn trim_conversations(&self, session: &Session, count: usize, cancel: &CancellationToken) -> Result<Vec<crate::domain::Event>>;
    async fn delete_event(&self, session: &Arc<Session>, event_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn close(&self);
}
