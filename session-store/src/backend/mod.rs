//! V1 and V2 storage backends. Neither is exported as a pluggable
//! extension point — the facade in [`crate::service`] is the only code
//! that picks between them, per the `CompatMode` matrix.

pub mod v1;
pub mod v2;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Session;
use crate::error::{Result, SessionError};

/// Internal shape both backends implement so the facade can route to
/// either without matching on a version tag at every call site.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_session(&self, app: &str, user: &str, id: &str) -> Result<Arc<Session>>;
    async fn get_session(
        &self,
        app: &str,
        user: &str,
        id: &str,
        event_num: Option<usize>,
        event_time: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Arc<Session>>;
    async fn exists(&self, app: &str, user: &str, id: &str) -> Result<bool>;
    async fn append_event(&self, session: &Session, event: crate::domain::Event) -> Result<()>;
    async fn append_track_event(&self, session: &Session, event: crate::domain::TrackEvent) -> Result<()>;
    /// Deletes a single event by id. V2-only: its atomic `DeleteEvent`
    /// script needs the evtdata/evtidx key split the legacy layout
    /// doesn't have. The default errs so a misrouted call surfaces
    /// clearly instead of silently no-op'ing.
    async fn delete_event(&self, session: &Session, event_id: &str) -> Result<()> {
        let _ = (session, event_id);
        Err(SessionError::Validation("delete_event is only supported by the v2 backend".into()))
    }
    async fn list_sessions(&self, app: &str, user: &str) -> Result<Vec<Arc<Session>>>;
    async fn delete_session(&self, app: &str, user: &str, id: &str) -> Result<()>;
    async fn update_user_state(&self, app: &str, user: &str, delta: crate::domain::StateMap) -> Result<()>;
    async fn create_session_summary(
        &self,
        app: &str,
        user: &str,
        id: &str,
        filter_key: &str,
        summary: crate::domain::Summary,
    ) -> Result<bool>;
    async fn trim_conversations(
        &self,
        app: &str,
        user: &str,
        id: &str,
        count: usize,
    ) -> Result<Vec<crate::domain::Event>>;
}
