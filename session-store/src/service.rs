//! The `SessionService` facade: the only code that picks between the V1
//! and V2 backends, per the `CompatMode` matrix in `config.rs`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

use crate::backend::v1::V1Backend;
use crate::backend::v2::V2Backend;
use crate::backend::Backend;
use crate::config::{CompatMode, SessionServiceConfig};
use crate::contract::{AppendEventHook, GetSessionHook, Summarizer};
use crate::domain::{Event, EventFilter, Session, StateMap, StorageVersion, Summary, TrackEvent, STATE_PREFIX_APP, STATE_PREFIX_USER};
use crate::error::{Result, SessionError};
use crate::persist::{PersistJob, PersistPool};
use crate::summary::{SummaryJob, SummaryPool};

/// Version-routing logic, shared by the facade's inline path and the
/// persist pool's background path. Holds both backends unconditionally
/// (DualWrite needs V1 even when most reads never touch it).
pub struct Router {
    v1: Arc<dyn Backend>,
    v2: Arc<dyn Backend>,
    compat_mode: CompatMode,
}

impl Router {
    fn new(v1: Arc<dyn Backend>, v2: Arc<dyn Backend>, compat_mode: CompatMode) -> Self {
        Self { v1, v2, compat_mode }
    }

    pub async fn get_session(
        &self,
        app: &str,
        user: &str,
        id: &str,
        event_num: Option<usize>,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<Arc<Session>> {
        match self.v2.get_session(app, user, id, event_num, event_time).await {
            Ok(session) => Ok(session),
            Err(SessionError::NotFound(_)) if self.compat_mode.reads_v1() => {
                self.v1.get_session(app, user, id, event_num, event_time).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn create_session(&self, app: &str, user: &str, id: &str) -> Result<Arc<Session>> {
        if self.v2.exists(app, user, id).await? {
            return self.v2.get_session(app, user, id, None, None).await;
        }

        if self.compat_mode.reads_v1() && self.v1.exists(app, user, id).await? {
            if self.compat_mode.writes_v1() {
                if let Err(err) = self.v2.create_session(app, user, id).await {
                    if !matches!(err, SessionError::Conflict(_)) {
                        warn!(app, user, id, ?err, "failed to mirror v1 session into v2 on create");
                    }
                }
                return self.v1.get_session(app, user, id, None, None).await;
            }
        }

        let created = self.v2.create_session(app, user, id).await?;
        if self.compat_mode.writes_v1() {
            if let Err(err) = self.v1.create_session(app, user, id).await {
                warn!(app, user, id, ?err, "best-effort v1 create failed");
            }
        }
        Ok(created)
    }

    pub async fn exists(&self, app: &str, user: &str, id: &str) -> Result<bool> {
        if self.v2.exists(app, user, id).await? {
            return Ok(true);
        }
        if self.compat_mode.reads_v1() {
            return self.v1.exists(app, user, id).await;
        }
        Ok(false)
    }

    async fn resolve_write_target(&self, session: &Session) -> Result<StorageVersion> {
        if let Some(version) = session.storage_version() {
            return Ok(version);
        }
        let target = if self.v2.exists(&session.app_name, &session.user_id, &session.id).await? {
            StorageVersion::V2
        } else if self.compat_mode.reads_v1() && self.v1.exists(&session.app_name, &session.user_id, &session.id).await? {
            StorageVersion::V1
        } else {
            return Err(SessionError::NotFound(format!(
                "session {}/{}/{}",
                session.app_name, session.user_id, session.id
            )));
        };
        session.set_storage_version(target);
        Ok(target)
    }

    pub async fn persist_event(&self, session: &Session, event: Event) -> Result<()> {
        match self.resolve_write_target(session).await? {
            StorageVersion::V1 => self.v1.append_event(session, event).await,
            StorageVersion::V2 => {
                self.v2.append_event(session, event.clone()).await?;
                if self.compat_mode.writes_v1() {
                    if let Err(err) = self.v1.append_event(session, event).await {
                        if !matches!(err, SessionError::NotFound(_)) {
                            warn!(session = %session.id, ?err, "best-effort v1 append failed");
                        }
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn persist_track_event(&self, session: &Session, event: TrackEvent) -> Result<()> {
        match self.resolve_write_target(session).await? {
            StorageVersion::V1 => self.v1.append_track_event(session, event).await,
            StorageVersion::V2 => self.v2.append_track_event(session, event).await,
        }
    }

    pub async fn list_sessions(&self, app: &str, user: &str) -> Result<Vec<Arc<Session>>> {
        let mut sessions = self.v2.list_sessions(app, user).await?;
        if self.compat_mode.reads_v1() {
            let seen: HashSet<String> = sessions.iter().map(|s| s.id.clone()).collect();
            for session in self.v1.list_sessions(app, user).await? {
                if !seen.contains(&session.id) {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    pub async fn delete_session(&self, app: &str, user: &str, id: &str) -> Result<()> {
        self.v2.delete_session(app, user, id).await?;
        if self.compat_mode.reads_v1() {
            if let Err(err) = self.v1.delete_session(app, user, id).await {
                warn!(app, user, id, ?err, "best-effort v1 delete failed");
            }
        }
        Ok(())
    }

    pub async fn update_user_state(&self, app: &str, user: &str, delta: StateMap) -> Result<()> {
        self.v2.update_user_state(app, user, delta.clone()).await?;
        if self.compat_mode.writes_v1() {
            if let Err(err) = self.v1.update_user_state(app, user, delta).await {
                warn!(app, user, ?err, "best-effort v1 user-state update failed");
            }
        }
        Ok(())
    }

    pub async fn create_session_summary(&self, session: &Session, filter_key: &str, summary: Summary) -> Result<()> {
        let target = self.resolve_write_target(session).await?;
        let (app, user, id) = (&session.app_name, &session.user_id, &session.id);
        match target {
            StorageVersion::V1 => {
                self.v1.create_session_summary(app, user, id, filter_key, summary).await?;
            }
            StorageVersion::V2 => {
                self.v2.create_session_summary(app, user, id, filter_key, summary.clone()).await?;
                if self.compat_mode.writes_v1() {
                    if let Err(err) = self.v1.create_session_summary(app, user, id, filter_key, summary).await {
                        warn!(id, ?err, "best-effort v1 summary write failed");
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn trim_conversations(&self, session: &Session, count: usize) -> Result<Vec<Event>> {
        let target = self.resolve_write_target(session).await?;
        let (app, user, id) = (&session.app_name, &session.user_id, &session.id);
        match target {
            StorageVersion::V1 => self.v1.trim_conversations(app, user, id, count).await,
            StorageVersion::V2 => self.v2.trim_conversations(app, user, id, count).await,
        }
    }

    /// V2-only; no dual-delete under `DualWrite`, matching
    /// `trim_conversations`'s routing (the V1 layout has no per-event
    /// delete primitive to mirror into).
    pub async fn delete_event(&self, session: &Session, event_id: &str) -> Result<()> {
        match self.resolve_write_target(session).await? {
            StorageVersion::V1 => self.v1.delete_event(session, event_id).await,
            StorageVersion::V2 => self.v2.delete_event(session, event_id).await,
        }
    }
}

/// Rejects reserved-prefix keys per Invariant 2; used by both
/// `update_session_state` and `update_user_state`.
fn reject_reserved_prefixes(delta: &StateMap) -> Result<()> {
    for key in delta.keys() {
        if key.starts_with(STATE_PREFIX_APP) || key.starts_with(STATE_PREFIX_USER) {
            return Err(SessionError::Validation(format!(
                "state key {key:?} uses a reserved prefix; use update_user_state or the app-state channel"
            )));
        }
    }
    Ok(())
}

fn require_key(app: &str, user: &str, id: &str) -> Result<()> {
    if app.is_empty() || user.is_empty() || id.is_empty() {
        return Err(SessionError::Validation("app, user, and session id are all required".into()));
    }
    Ok(())
}

pub struct SessionServiceBuilder {
    v2_pool: fred::prelude::Pool,
    v1_pool: Option<fred::prelude::Pool>,
    config: SessionServiceConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
    append_hooks: Vec<Arc<dyn AppendEventHook>>,
    get_hooks: Vec<Arc<dyn GetSessionHook>>,
}

impl SessionServiceBuilder {
    pub fn new(pool: fred::prelude::Pool, config: SessionServiceConfig) -> Self {
        Self { v2_pool: pool, v1_pool: None, config, summarizer: None, append_hooks: Vec::new(), get_hooks: Vec::new() }
    }

    /// Use a different pool for the V1 backend (e.g. the legacy cluster
    /// during a migration). Defaults to the same pool as V2.
    pub fn with_v1_pool(mut self, pool: fred::prelude::Pool) -> Self {
        self.v1_pool = Some(pool);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_append_hook(mut self, hook: Arc<dyn AppendEventHook>) -> Self {
        self.append_hooks.push(hook);
        self
    }

    pub fn with_get_hook(mut self, hook: Arc<dyn GetSessionHook>) -> Self {
        self.get_hooks.push(hook);
        self
    }

    pub async fn build(self) -> Result<SessionService> {
        let v2_backend = V2Backend::new(self.v2_pool.clone(), self.config.clone());
        v2_backend.load_scripts().await?;

        let v1_pool = self.v1_pool.unwrap_or(self.v2_pool);
        let v1_backend = V1Backend::new(v1_pool, self.config.clone());

        let router = Arc::new(Router::new(Arc::new(v1_backend), Arc::new(v2_backend), self.config.compat_mode));

        let persist_pool = if self.config.enable_async_persist {
            Some(PersistPool::new(
                router.clone(),
                self.config.async_persister_num,
                self.config.persist_enqueue_capacity,
                self.config.persist_item_timeout,
            ))
        } else {
            None
        };

        let summarizer = self.summarizer.unwrap_or_else(|| Arc::new(NoopSummarizer));
        let summary_pool = SummaryPool::new(
            router.clone(),
            summarizer,
            self.config.async_summary_num,
            self.config.summary_queue_size,
            self.config.summary_job_timeout,
        );

        Ok(SessionService {
            router,
            config: self.config,
            persist_pool: tokio::sync::Mutex::new(persist_pool),
            summary_pool: tokio::sync::Mutex::new(Some(summary_pool)),
            append_hooks: self.append_hooks,
            get_hooks: self.get_hooks,
            closed: AtomicBool::new(false),
        })
    }
}

/// Default summarizer used when none is supplied: never fires.
struct NoopSummarizer;

#[async_trait::async_trait]
impl Summarizer for NoopSummarizer {
    async fn should_summarize(&self, _session: &Session) -> bool {
        false
    }

    async fn summarize(&self, _session: &Session, _cancel: &CancellationToken) -> Result<String> {
        Ok(String::new())
    }
}

pub struct SessionService {
    router: Arc<Router>,
    config: SessionServiceConfig,
    persist_pool: tokio::sync::Mutex<Option<PersistPool>>,
    summary_pool: tokio::sync::Mutex<Option<SummaryPool>>,
    append_hooks: Vec<Arc<dyn AppendEventHook>>,
    get_hooks: Vec<Arc<dyn GetSessionHook>>,
    closed: AtomicBool,
}

impl SessionService {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Shutdown);
        }
        Ok(())
    }

    pub async fn create_session(&self, app: &str, user: &str, id: &str, cancel: &CancellationToken) -> Result<Arc<Session>> {
        self.check_open()?;
        require_key(app, user, id)?;
        let span = info_span!("create_session", app, user, id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.router.create_session(app, user, id).instrument(span) => res,
        }
    }

    pub async fn get_session(
        &self,
        app: &str,
        user: &str,
        id: &str,
        filter: EventFilter,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>> {
        self.check_open()?;
        require_key(app, user, id)?;
        let router = self.router.clone();
        let get_hooks = &self.get_hooks;
        let span = info_span!("get_session", app, user, id);

        let op = async move {
            run_get_hooks(get_hooks, 0, app, user, id, filter.event_num, filter.event_time, &router).await
        }
        .instrument(span);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = op => {
                let session = res?;
                session.apply_event_filtering(&filter);
                session.ensure_event_start_with_user();
                Ok(session)
            }
        }
    }

    pub async fn list_sessions(&self, app: &str, user: &str, cancel: &CancellationToken) -> Result<Vec<Arc<Session>>> {
        self.check_open()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.router.list_sessions(app, user) => res,
        }
    }

    pub async fn delete_session(&self, app: &str, user: &str, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.check_open()?;
        require_key(app, user, id)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.router.delete_session(app, user, id) => res,
        }
    }

    /// Applies `event` to the in-memory session immediately, then either
    /// persists inline or enqueues into the persist pool, per
    /// `enable_async_persist`.
    pub async fn append_event(&self, session: &Arc<Session>, event: Event, cancel: &CancellationToken) -> Result<()> {
        self.check_open()?;
        let filter = EventFilter { event_num: Some(self.config.session_event_limit), event_time: None };
        session.update_user_session(event.clone(), &filter);

        let persist_guard = self.persist_pool.lock().await;
        if let Some(pool) = persist_guard.as_ref() {
            let job = PersistJob::Event { session: session.clone(), event };
            return pool.enqueue(job, cancel).await;
        }
        drop(persist_guard);

        let router = self.router.clone();
        let run = run_append_hooks(&self.append_hooks, 0, session, &event, &router);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = run => res,
        }
    }

    pub async fn append_track_event(&self, session: &Arc<Session>, event: TrackEvent, cancel: &CancellationToken) -> Result<()> {
        self.check_open()?;
        session.append_track_event(event.clone());

        let persist_guard = self.persist_pool.lock().await;
        if let Some(pool) = persist_guard.as_ref() {
            let job = PersistJob::Track { session: session.clone(), event };
            return pool.enqueue(job, cancel).await;
        }
        drop(persist_guard);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.router.persist_track_event(session, event) => res,
        }
    }

    pub fn get_track_events(&self, session: &Session, track: &str) -> Result<Vec<TrackEvent>> {
        session.get_track_events(track)
    }

    /// Merges session-scoped state through the same atomic append path
    /// used for events, by synthesizing a state-only event.
    pub async fn update_session_state(&self, session: &Arc<Session>, delta: StateMap, cancel: &CancellationToken) -> Result<()> {
        self.check_open()?;
        reject_reserved_prefixes(&delta)?;
        let mut event = Event::new(uuid::Uuid::new_v4().to_string(), "system");
        event.state_delta = delta;
        self.append_event(session, event, cancel).await
    }

    pub async fn update_user_state(&self, app: &str, user: &str, delta: StateMap, cancel: &CancellationToken) -> Result<()> {
        self.check_open()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.router.update_user_state(app, user, delta) => res,
        }
    }

    pub async fn enqueue_summary_job(&self, session: Arc<Session>, filter_key: &str, force: bool) -> Result<()> {
        self.check_open()?;
        let guard = self.summary_pool.lock().await;
        match guard.as_ref() {
            Some(pool) => {
                pool.enqueue(SummaryJob { session, filter_key: filter_key.to_string(), force }).await;
                Ok(())
            }
            None => Err(SessionError::Shutdown),
        }
    }

    pub async fn trim_conversations(&self, session: &Session, count: usize, cancel: &CancellationToken) -> Result<Vec<Event>> {
        self.check_open()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.router.trim_conversations(session, count) => res,
        }
    }

    /// Removes one event by id, e.g. for moderation/redaction. Updates
    /// the in-memory copy immediately, same as `append_event`.
    pub async fn delete_event(&self, session: &Arc<Session>, event_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.check_open()?;
        session.remove_event(event_id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.router.delete_event(session, event_id) => res,
        }
    }

    /// One-shot close: stops accepting new work, drains both pools. Safe
    /// to call more than once; only the first call does anything. Takes
    /// `&self` so it can be invoked through a shared `Arc<dyn
    /// SessionServiceContract>` the way an HTTP server would hold it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.persist_pool.lock().await.take() {
            pool.close().await;
        }
        if let Some(pool) = self.summary_pool.lock().await.take() {
            pool.close().await;
        }
    }
}

#[async_trait::async_trait]
impl crate::contract::SessionServiceContract for SessionService {
    async fn create_session(&self, app: &str, user: &str, id: &str, cancel: &CancellationToken) -> Result<Arc<Session>> {
        self.create_session(app, user, id, cancel).await
    }

    async fn get_session(
        &self,
        app: &str,
        user: &str,
        id: &str,
        event_num: Option<usize>,
        event_time: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Session>> {
        self.get_session(app, user, id, EventFilter { event_num, event_time }, cancel).await
    }

    async fn list_sessions(&self, app: &str, user: &str, cancel: &CancellationToken) -> Result<Vec<Arc<Session>>> {
        self.list_sessions(app, user, cancel).await
    }

    async fn delete_session(&self, app: &str, user: &str, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.delete_session(app, user, id, cancel).await
    }

    async fn append_event(&self, session: &Arc<Session>, event: Event, cancel: &CancellationToken) -> Result<()> {
        self.append_event(session, event, cancel).await
    }

    async fn update_session_state(&self, session: &Arc<Session>, delta: StateMap, cancel: &CancellationToken) -> Result<()> {
        self.update_session_state(session, delta, cancel).await
    }

    async fn update_user_state(&self, app: &str, user: &str, delta: StateMap, cancel: &CancellationToken) -> Result<()> {
        self.update_user_state(app, user, delta, cancel).await
    }

    async fn enqueue_summary_job(&self, session: Arc<Session>, filter_key: &str, force: bool) -> Result<()> {
        self.enqueue_summary_job(session, filter_key, force).await
    }

    async fn trim_conversations(&self, session: &Session, count: usize, cancel: &CancellationToken) -> Result<Vec<Event>> {
        self.trim_conversations(session, count, cancel).await
    }

    async fn delete_event(&self, session: &Arc<Session>, event_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.delete_event(session, event_id, cancel).await
    }

    async fn close(&self) {
        self.close().await
    }
}

#[async_trait::async_trait]
impl crate::contract::TrackService for SessionService {
    async fn append_track_event(
        &self,
        app: &str,
        user: &str,
        id: &str,
        event: TrackEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_open()?;
        let session = self.router.get_session(app, user, id, Some(0), None).await?;
        self.append_track_event(&session, event, cancel).await
    }

    async fn get_track_events(&self, session: &Session, track: &str) -> Result<Vec<TrackEvent>> {
        self.get_track_events(session, track)
    }
}

#[cfg(test)]
mod simulation_tests {
    //! In-memory variants of the fake-backend scenarios that also run
    //! live against Redis in `tests/compat_mode_live.rs`. These run
    //! unconditionally (no `--ignored`) since `FakeBackend` never touches
    //! the network.

    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::domain::{Choice, Message, Response, Role, Summary};

    struct FakeBackend {
        sessions: AsyncMutex<HashMap<(String, String, String), Arc<Session>>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self { sessions: AsyncMutex::new(HashMap::new()) }
        }

        fn key(app: &str, user: &str, id: &str) -> (String, String, String) {
            (app.to_string(), user.to_string(), id.to_string())
        }
    }

    #[async_trait::async_trait]
    impl Backend for FakeBackend {
        async fn create_session(&self, app: &str, user: &str, id: &str) -> Result<Arc<Session>> {
            let mut sessions = self.sessions.lock().await;
            let key = Self::key(app, user, id);
            if let Some(existing) = sessions.get(&key) {
                return Ok(existing.clone());
            }
            let session = Arc::new(Session::new(app, user, id));
            sessions.insert(key, session.clone());
            Ok(session)
        }

        async fn get_session(
            &self,
            app: &str,
            user: &str,
            id: &str,
            _event_num: Option<usize>,
            _event_time: Option<DateTime<Utc>>,
        ) -> Result<Arc<Session>> {
            self.sessions
                .lock()
                .await
                .get(&Self::key(app, user, id))
                .cloned()
                .ok_or_else(|| SessionError::NotFound(format!("fake session {app}/{user}/{id}")))
        }

        async fn exists(&self, app: &str, user: &str, id: &str) -> Result<bool> {
            Ok(self.sessions.lock().await.contains_key(&Self::key(app, user, id)))
        }

        async fn append_event(&self, session: &Session, event: Event) -> Result<()> {
            session.update_user_session(event, &EventFilter::default());
            Ok(())
        }

        async fn append_track_event(&self, session: &Session, event: TrackEvent) -> Result<()> {
            session.append_track_event(event);
            Ok(())
        }

        async fn list_sessions(&self, app: &str, user: &str) -> Result<Vec<Arc<Session>>> {
            Ok(self
                .sessions
                .lock()
                .await
                .values()
                .filter(|s| s.app_name == app && s.user_id == user)
                .cloned()
                .collect())
        }

        async fn delete_session(&self, app: &str, user: &str, id: &str) -> Result<()> {
            self.sessions.lock().await.remove(&Self::key(app, user, id));
            Ok(())
        }

        async fn update_user_state(&self, _app: &str, _user: &str, _delta: StateMap) -> Result<()> {
            Ok(())
        }

        async fn create_session_summary(
            &self,
            app: &str,
            user: &str,
            id: &str,
            filter_key: &str,
            summary: Summary,
        ) -> Result<bool> {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(&Self::key(app, user, id))
                .ok_or_else(|| SessionError::NotFound(format!("fake session {app}/{user}/{id}")))?;
            Ok(session.set_summary_if_newer(filter_key, summary))
        }

        async fn trim_conversations(&self, _app: &str, _user: &str, _id: &str, _count: usize) -> Result<Vec<Event>> {
            Ok(Vec::new())
        }
    }

    fn fake_router(mode: CompatMode) -> Arc<Router> {
        let backend = Arc::new(FakeBackend::new());
        Arc::new(Router::new(backend.clone(), backend, mode))
    }

    fn fake_service(router: Arc<Router>) -> SessionService {
        SessionService {
            router,
            config: SessionServiceConfig::default(),
            persist_pool: tokio::sync::Mutex::new(None),
            summary_pool: tokio::sync::Mutex::new(None),
            append_hooks: Vec::new(),
            get_hooks: Vec::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn turn(author: &str, text: &str) -> Event {
        let mut event = Event::new(uuid::Uuid::new_v4().to_string(), author);
        event.response = Some(Response {
            choices: vec![Choice { message: Some(Message { content: Some(text.to_string()), tool_calls: vec![] }), delta: None }],
        });
        event
    }

    /// S1 — round-trip: a user turn then an assistant turn come back in
    /// order, user first.
    #[tokio::test]
    async fn round_trip_preserves_order_and_user_start() {
        let service = fake_service(fake_router(CompatMode::None));
        let cancel = CancellationToken::new();

        let session = service.create_session("A", "U", "S", &cancel).await.unwrap();
        service.append_event(&session, turn("user", "hi"), &cancel).await.unwrap();
        service.append_event(&session, turn("assistant", "hello"), &cancel).await.unwrap();

        let filter = EventFilter { event_num: Some(10), event_time: None };
        let loaded = service.get_session("A", "U", "S", filter, &cancel).await.unwrap();
        let events = loaded.get_events();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].role(), Role::User);
        assert_eq!(events[1].response.as_ref().unwrap().choices[0].message.as_ref().unwrap().content.as_deref(), Some("hello"));
    }

    /// S3 — summary idempotence: two jobs for the same filter key race;
    /// the one whose summary carries the later timestamp wins regardless
    /// of which one the pool happened to finish last.
    #[tokio::test]
    async fn concurrent_summary_jobs_resolve_by_newer_timestamp() {
        let router = fake_router(CompatMode::None);
        let session = router.create_session("A", "U", "S").await.unwrap();

        struct RaceSummarizer {
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl Summarizer for RaceSummarizer {
            async fn should_summarize(&self, _session: &Session) -> bool {
                true
            }

            async fn summarize(&self, _session: &Session, _cancel: &CancellationToken) -> Result<String> {
                let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
                if first {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok("delayed-but-newer".to_string())
                } else {
                    Ok("fast-but-older".to_string())
                }
            }
        }

        let summarizer: Arc<dyn Summarizer> = Arc::new(RaceSummarizer { calls: AtomicUsize::new(0) });
        let pool = SummaryPool::new(router, summarizer, 2, 10, Duration::from_secs(5));

        pool.enqueue(SummaryJob { session: session.clone(), filter_key: String::new(), force: true }).await;
        pool.enqueue(SummaryJob { session: session.clone(), filter_key: String::new(), force: true }).await;
        pool.close().await;

        let stored = session.get_summary("").expect("a summary must be stored");
        assert_eq!(stored.text, "delayed-but-newer");
    }

    /// S6 — reserved-prefix rejection: an `app:`-prefixed key in
    /// `UpdateSessionState` is rejected and state stays untouched.
    #[tokio::test]
    async fn update_session_state_rejects_reserved_prefixes() {
        let service = fake_service(fake_router(CompatMode::None));
        let cancel = CancellationToken::new();
        let session = service.create_session("A", "U", "S", &cancel).await.unwrap();

        let mut delta = StateMap::new();
        delta.insert("app:foo".to_string(), serde_json::json!("bar"));
        let err = service.update_session_state(&session, delta, &cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(session.get_state_value("app:foo"), None);
    }
}

fn run_append_hooks<'a>(
    hooks: &'a [Arc<dyn AppendEventHook>],
    idx: usize,
    session: &'a Session,
    event: &'a Event,
    router: &'a Router,
) -> futures::future::BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        if idx == hooks.len() {
            return router.persist_event(session, event.clone()).await;
        }
        let next: crate::contract::AppendEventNext =
            &|| run_append_hooks(hooks, idx + 1, session, event, router);
        hooks[idx].handle(session, event, next).await
    })
}

#[allow(clippy::too_many_arguments)]
fn run_get_hooks<'a>(
    hooks: &'a [Arc<dyn GetSessionHook>],
    idx: usize,
    app: &'a str,
    user: &'a str,
    id: &'a str,
    event_num: Option<usize>,
    event_time: Option<DateTime<Utc>>,
    router: &'a Router,
) -> futures::future::BoxFuture<'a, Result<Arc<Session>>> {
    Box::pin(async move {
        if idx == hooks.len() {
            return router.get_session(app, user, id, event_num, event_time).await;
        }
        let next: crate::contract::GetSessionNext =
            &|| run_get_hooks(hooks, idx + 1, app, user, id, event_num, event_time, router);
        hooks[idx].handle(app, user, id, next).await
    })
}
