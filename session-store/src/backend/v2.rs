//! New layout: one JSON meta string per session, event data/time-index
//! split so individual events are cheap to update or delete by id. Every
//! key for one user shares the hash tag `{appName:userID}`, so the V2
//! atomic scripts in [`crate::scripts`] always execute on a single slot.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fred::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Backend;
use crate::config::SessionServiceConfig;
use crate::domain::{
    Event, Session, StateMap, StorageVersion, Summary, TrackEvent, STATE_PREFIX_APP,
    STATE_PREFIX_TEMP, STATE_PREFIX_USER,
};
use crate::error::{Result, SessionError};
use crate::keys::{KeyBuilder, V2_SUMMARY_FIELD};
use crate::scripts::V2Scripts;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetaBlob {
    id: String,
    app_name: String,
    user_id: String,
    state: StateMap,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn split_state(delta: &StateMap) -> (StateMap, StateMap, StateMap) {
    let mut app = StateMap::new();
    let mut user = StateMap::new();
    let mut session = StateMap::new();
    for (k, v) in delta {
        if let Some(rest) = k.strip_prefix(STATE_PREFIX_APP) {
            app.insert(rest.to_string(), v.clone());
        } else if let Some(rest) = k.strip_prefix(STATE_PREFIX_USER) {
            user.insert(rest.to_string(), v.clone());
        } else if !k.starts_with(STATE_PREFIX_TEMP) {
            session.insert(k.clone(), v.clone());
        }
    }
    (app, user, session)
}

fn merge_state(app: &StateMap, user: &StateMap, session: &StateMap) -> StateMap {
    let mut merged = session.clone();
    for (k, v) in app {
        merged.insert(format!("{STATE_PREFIX_APP}{k}"), v.clone());
    }
    for (k, v) in user {
        merged.insert(format!("{STATE_PREFIX_USER}{k}"), v.clone());
    }
    merged
}

pub struct V2Backend {
    pool: Pool,
    keys: KeyBuilder,
    scripts: V2Scripts,
    config: SessionServiceConfig,
}

impl V2Backend {
    pub fn new(pool: Pool, config: SessionServiceConfig) -> Self {
        let keys = KeyBuilder::new(config.key_prefix.clone());
        Self { pool, keys, scripts: V2Scripts::new(), config }
    }

    /// Loads all V2 Lua scripts into the Redis node cache. Call once at
    /// service start; `evalsha` calls fall back to `EVAL` regardless, so
    /// skipping this only costs a round trip on first use.
    pub async fn load_scripts(&self) -> Result<()> {
        self.scripts.load(&self.pool).await
    }

    async fn read_app_state(&self, app: &str) -> Result<StateMap> {
        let raw: HashMap<String, String> = self.pool.hgetall(self.keys.app_state(app)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(k, v)| serde_json::from_str::<Value>(&v).ok().map(|value| (k, value)))
            .collect())
    }

    async fn read_user_state(&self, app: &str, user: &str) -> Result<StateMap> {
        let raw: HashMap<String, String> = self.pool.hgetall(self.keys.v2_user_state(app, user)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(k, v)| serde_json::from_str::<Value>(&v).ok().map(|value| (k, value)))
            .collect())
    }

    async fn read_summaries(&self, app: &str, user: &str, id: &str) -> Result<HashMap<String, Summary>> {
        let key = self.keys.v2_summaries(app, user, id);
        let raw: Option<String> = self.pool.hget(key, V2_SUMMARY_FIELD).await?;
        match raw {
            Some(s) => Ok(serde_json::from_str(&s).unwrap_or_default()),
            None => Ok(HashMap::new()),
        }
    }

    /// App-state and user-state hashes outlive any one session and carry
    /// their own TTLs, independent of `session_ttl_secs`.
    async fn refresh_ttl(&self, key: &str, ttl: i64) -> Result<()> {
        if ttl > 0 {
            let _: () = self.pool.expire(key, ttl, None).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for V2Backend {
    async fn create_session(&self, app: &str, user: &str, id: &str) -> Result<Arc<Session>> {
        let meta_key = self.keys.v2_meta(app, user, id);
        let now = Utc::now();
        let blob = MetaBlob {
            id: id.to_string(),
            app_name: app.to_string(),
            user_id: user.to_string(),
            state: StateMap::new(),
            created_at: now,
            updated_at: now,
        };
        let set: bool = self
            .pool
            .set(&meta_key, serde_json::to_string(&blob)?, None, Some(SetOptions::NX), false)
            .await?;
        if !set {
            return Err(SessionError::Conflict(format!("v2 session {app}/{user}/{id} already exists")));
        }
        self.refresh_ttl(&meta_key, self.config.session_ttl_secs()).await?;

        let session = Session::new(app, user, id);
        session.set_storage_version(StorageVersion::V2);
        Ok(Arc::new(session))
    }

    async fn get_session(
        &self,
        app: &str,
        user: &str,
        id: &str,
        event_num: Option<usize>,
        event_time: Option<DateTime<Utc>>,
    ) -> Result<Arc<Session>> {
        let meta_key = self.keys.v2_meta(app, user, id);
        let raw: Option<String> = self.pool.get(&meta_key).await?;
        let blob: MetaBlob = match raw {
            Some(s) => serde_json::from_str(&s)?,
            None => return Err(SessionError::NotFound(format!("v2 session {app}/{user}/{id}"))),
        };

        let app_state = self.read_app_state(app).await?;
        let user_state = self.read_user_state(app, user).await?;
        let merged = merge_state(&app_state, &user_state, &blob.state);
        self.refresh_ttl(&self.keys.app_state(app), self.config.app_state_ttl_secs()).await?;
        self.refresh_ttl(&self.keys.v2_user_state(app, user), self.config.user_state_ttl_secs()).await?;

        let evtdata_key = self.keys.v2_event_data(app, user, id);
        let evtidx_key = self.keys.v2_event_index(app, user, id);
        let limit = event_num.map(|n| n as i64).unwrap_or(-1);
        let raw_events = self
            .scripts
            .load_events(&self.pool, &evtdata_key, &evtidx_key, &meta_key, 0, limit, self.config.session_ttl_secs(), true)
            .await?;

        let mut events: Vec<Event> = raw_events
            .into_iter()
            .filter_map(|s| serde_json::from_str::<Event>(&s).ok())
            .collect();
        events.reverse(); // script returns newest-first when reverse=1
        if let Some(after) = event_time {
            events.retain(|e| e.timestamp > after);
        }

        let summaries = self.read_summaries(app, user, id).await?;

        let session = Session::new(app, user, id);
        session.set_state(merged);
        session.set_events(events);
        session.set_summaries(summaries);
        session.set_storage_version(StorageVersion::V2);
        Ok(Arc::new(session))
    }

    async fn exists(&self, app: &str, user: &str, id: &str) -> Result<bool> {
        let meta_key = self.keys.v2_meta(app, user, id);
        Ok(self.pool.exists(meta_key).await?)
    }

    async fn append_event(&self, session: &Session, event: Event) -> Result<()> {
        let (app, user, id) = (session.app_name.clone(), session.user_id.clone(), session.id.clone());
        let meta_key = self.keys.v2_meta(&app, &user, &id);
        let evtdata_key = self.keys.v2_event_data(&app, &user, &id);
        let evtidx_key = self.keys.v2_event_index(&app, &user, &id);

        let (app_delta, user_delta, _session_delta) = split_state(&event.state_delta);
        let ts = event.timestamp.timestamp_nanos_opt().unwrap_or_default();
        let event_json = serde_json::to_string(&event)?;

        let stored = self
            .scripts
            .append_event(
                &self.pool,
                &meta_key,
                &evtdata_key,
                &evtidx_key,
                &event.id,
                &event_json,
                ts,
                self.config.session_ttl_secs(),
                event.is_valid_for_history(),
            )
            .await?;
        if !stored {
            return Err(SessionError::NotFound(format!("v2 session {app}/{user}/{id}")));
        }

        if !app_delta.is_empty() {
            let app_key = self.keys.app_state(&app);
            for (k, v) in &app_delta {
                let _: () = self.pool.hset(&app_key, (k.as_str(), serde_json::to_string(v)?)).await?;
            }
            self.refresh_ttl(&app_key, self.config.app_state_ttl_secs()).await?;
        }
        if !user_delta.is_empty() {
            let user_key = self.keys.v2_user_state(&app, &user);
            for (k, v) in &user_delta {
                let _: () = self.pool.hset(&user_key, (k.as_str(), serde_json::to_string(v)?)).await?;
            }
            self.refresh_ttl(&user_key, self.config.user_state_ttl_secs()).await?;
        }
        Ok(())
    }

    async fn append_track_event(&self, session: &Session, event: TrackEvent) -> Result<()> {
        let key = self.keys.v2_track(&session.app_name, &session.user_id, &session.id, &event.track);
        let score = event.timestamp.timestamp_nanos_opt().unwrap_or_default() as f64;
        let _: () = self
            .pool
            .zadd(key, None, None, false, false, (score, serde_json::to_string(&event)?))
            .await?;
        Ok(())
    }

    async fn list_sessions(&self, app: &str, user: &str) -> Result<Vec<Arc<Session>>> {
        let pattern = self.keys.v2_meta(app, user, "*");
        let mut cursor = 0u64;
        let mut out = Vec::new();
        loop {
            let (next, found): (u64, Vec<String>) = self.pool.scan_page(cursor.to_string(), pattern.as_str(), Some(100), None).await?;
            for key in found {
                let id = key.rsplit(':').next().unwrap_or_default().to_string();
                if id.is_empty() {
                    continue;
                }
                let raw: Option<String> = self.pool.get(&key).await?;
                if let Some(raw) = raw {
                    if let Ok(blob) = serde_json::from_str::<MetaBlob>(&raw) {
                        let session = Session::new(app, user, &id);
                        session.set_state(blob.state);
                        session.set_storage_version(StorageVersion::V2);
                        out.push(Arc::new(session));
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }

    async fn delete_session(&self, app: &str, user: &str, id: &str) -> Result<()> {
        let keys = [
            self.keys.v2_meta(app, user, id),
            self.keys.v2_event_data(app, user, id),
            self.keys.v2_event_index(app, user, id),
            self.keys.v2_summaries(app, user, id),
        ];
        let _: () = self.pool.del(keys.to_vec()).await?;
        Ok(())
    }

    async fn update_user_state(&self, app: &str, user: &str, delta: StateMap) -> Result<()> {
        let key = self.keys.v2_user_state(app, user);
        for (k, v) in &delta {
            let _: () = self.pool.hset(&key, (k.as_str(), serde_json::to_string(v)?)).await?;
        }
        self.refresh_ttl(&key, self.config.user_state_ttl_secs()).await
    }

    async fn delete_event(&self, session: &Session, event_id: &str) -> Result<()> {
        let evtdata_key = self.keys.v2_event_data(&session.app_name, &session.user_id, &session.id);
        let evtidx_key = self.keys.v2_event_index(&session.app_name, &session.user_id, &session.id);
        self.scripts.delete_event(&self.pool, &evtdata_key, &evtidx_key, event_id).await
    }

    async fn create_session_summary(
        &self,
        app: &str,
        user: &str,
        id: &str,
        filter_key: &str,
        summary: Summary,
    ) -> Result<bool> {
        let key = self.keys.v2_summaries(app, user, id);
        let ns = summary.updated_at_ns;
        let json = serde_json::to_string(&summary)?;
        self.scripts
            .summaries_set_if_newer(&self.pool, &key, V2_SUMMARY_FIELD, filter_key, &json, ns, self.config.session_ttl_secs())
            .await
    }

    async fn trim_conversations(
        &self,
        app: &str,
        user: &str,
        id: &str,
        count: usize,
    ) -> Result<Vec<Event>> {
        let evtdata_key = self.keys.v2_event_data(app, user, id);
        let evtidx_key = self.keys.v2_event_index(app, user, id);
        let raw = self
            .scripts
            .trim_conversations(&self.pool, &evtdata_key, &evtidx_key, count as i64)
            .await?;
        let mut events: Vec<Event> = raw.into_iter().filter_map(|s| serde_json::from_str(&s).ok()).collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
