//! Configuration surface enumerated in the design's external-interfaces
//! section. Builder-style `with_*` setters over a `Default` base, in the
//! same idiom as the rest of the runtime's config structs.

use std::time::Duration;

use crate::domain::StorageVersion;
use crate::keys::KeyPrefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompatMode {
    /// Reads and writes go to V2 only.
    None,
    /// Reads try V2 first, fall back to V1. Writes go to V2 only; V1 is
    /// read-only.
    #[default]
    Legacy,
    /// Reads try V2 first, fall back to V1. Writes go to both, with V1
    /// best-effort.
    DualWrite,
}

impl CompatMode {
    pub fn reads_v1(&self) -> bool {
        !matches!(self, CompatMode::None)
    }

    pub fn writes_v1(&self) -> bool {
        matches!(self, CompatMode::DualWrite)
    }
}

/// The storage version a brand-new session is created in is always V2;
/// this exists only so backend code can talk about "the other version"
/// generically.
pub fn other_version(v: StorageVersion) -> StorageVersion {
    match v {
        StorageVersion::V1 => StorageVersion::V2,
        StorageVersion::V2 => StorageVersion::V1,
    }
}

#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    pub session_event_limit: usize,
    pub session_ttl: Option<Duration>,
    pub app_state_ttl: Option<Duration>,
    pub user_state_ttl: Option<Duration>,
    pub enable_async_persist: bool,
    pub async_persister_num: usize,
    pub async_summary_num: usize,
    pub summary_queue_size: usize,
    pub summary_job_timeout: Duration,
    pub compat_mode: CompatMode,
    pub key_prefix: KeyPrefix,
    pub persist_enqueue_capacity: usize,
    pub persist_item_timeout: Duration,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            session_event_limit: 1000,
            session_ttl: None,
            app_state_ttl: None,
            user_state_ttl: None,
            enable_async_persist: false,
            async_persister_num: 10,
            async_summary_num: 3,
            summary_queue_size: 100,
            summary_job_timeout: Duration::from_secs(60),
            compat_mode: CompatMode::default(),
            key_prefix: KeyPrefix::default(),
            persist_enqueue_capacity: 100,
            persist_item_timeout: Duration::from_secs(2),
        }
    }
}

impl SessionServiceConfig {
    pub fn with_session_event_limit(mut self, limit: usize) -> Self {
        self.session_event_limit = limit;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub fn with_app_state_ttl(mut self, ttl: Duration) -> Self {
        self.app_state_ttl = Some(ttl);
        self
    }

    pub fn with_user_state_ttl(mut self, ttl: Duration) -> Self {
        self.user_state_ttl = Some(ttl);
        self
    }

    pub fn with_compat_mode(mut self, mode: CompatMode) -> Self {
        self.compat_mode = mode;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = KeyPrefix(prefix.into());
        self
    }

    pub fn with_async_persist(mut self, enabled: bool) -> Self {
        self.enable_async_persist = enabled;
        self
    }

    pub fn with_async_persister_num(mut self, n: usize) -> Self {
        self.async_persister_num = n;
        self
    }

    pub fn with_async_summary_num(mut self, n: usize) -> Self {
        self.async_summary_num = n;
        self
    }

    pub fn session_ttl_secs(&self) -> i64 {
        self.session_ttl.map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    pub fn app_state_ttl_secs(&self) -> i64 {
        self.app_state_ttl.map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    pub fn user_state_ttl_secs(&self) -> i64 {
        self.user_state_ttl.map(|d| d.as_secs() as i64).unwrap_or(0)
    }
}
