//! Legacy layout: one hash of session blobs per app, one event ZSET per
//! session. Hash tag is `{appName}`, which concentrates every user of an
//! app onto one Redis Cluster slot — see `DESIGN.md` for why V2 exists.

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
use crate::keys::KeyBuilder;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionBlob {
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

pub struct V1Backend {
    pool: Pool,
    keys: KeyBuilder,
    config: SessionServiceConfig,
}

impl V1Backend {
    pub fn new(pool: Pool, config: SessionServiceConfig) -> Self {
        let keys = KeyBuilder::new(config.key_prefix.clone());
        Self { pool, keys, config }
    }

    async fn read_app_state(&self, app: &str) -> Result<StateMap> {
        let raw: HashMap<String, String> = self.pool.hgetall(self.keys.app_state(app)).await?;
        Ok(decode_field_map(raw))
    }

    async fn read_user_state(&self, app: &str, user: &str) -> Result<StateMap> {
        let raw: HashMap<String, String> = self.pool.hgetall(self.keys.v1_user_state(app, user)).await?;
        Ok(decode_field_map(raw))
    }

    async fn read_events(&self, app: &str, user: &str, id: &str) -> Result<Vec<Event>> {
        let key = self.keys.v1_events(app, user, id);
        let raw: Vec<String> = self.pool.zrange(key, 0, -1, None, false, None, false).await?;
        Ok(raw
            .into_iter()
            .filter_map(|s| serde_json::from_str::<Event>(&s).ok())
            .collect())
    }

    async fn read_summaries(&self, app: &str, user: &str, id: &str) -> Result<HashMap<String, Summary>> {
        let key = self.keys.v1_summaries(app);
        let raw: Option<String> = self.pool.hget(key, id).await?;
        match raw {
            Some(s) => Ok(serde_json::from_str(&s).unwrap_or_default()),
            None => Ok(HashMap::new()),
        }
    }

    /// App-state and user-state hashes outlive any one session and carry
    /// their own TTLs (`config.app_state_ttl_secs`/`user_state_ttl_secs`)
    /// independent of `session_ttl_secs`; callers must pass the TTL that
    /// matches the keys being touched.
    async fn refresh_ttls(&self, keys: &[String], ttl: i64) -> Result<()> {
        if ttl <= 0 {
            return Ok(());
        }
        for key in keys {
            let _: () = self.pool.expire(key, ttl, None).await?;
        }
        Ok(())
    }
}

fn decode_field_map(raw: HashMap<String, String>) -> StateMap {
    raw.into_iter()
        .filter_map(|(k, v)| serde_json::from_str::<Value>(&v).ok().map(|value| (k, value)))
        .collect()
}

#[async_trait]
impl Backend for V1Backend {
    async fn create_session(&self, app: &str, user: &str, id: &str) -> Result<Arc<Session>> {
        let key = self.keys.v1_sessions(app);
        let existing: Option<String> = self.pool.hget(&key, id).await?;
        if let Some(raw) = existing {
            let blob: SessionBlob = serde_json::from_str(&raw)?;
            let session = Session::new(app, user, id);
            session.set_state(blob.state);
            session.set_storage_version(StorageVersion::V1);
            return Ok(Arc::new(session));
        }

        let now = Utc::now();
        let blob = SessionBlob {
            id: id.to_string(),
            app_name: app.to_string(),
            user_id: user.to_string(),
            state: StateMap::new(),
            created_at: now,
            updated_at: now,
        };
        let _: () = self.pool.hset(&key, (id, serde_json::to_string(&blob)?)).await?;
        self.refresh_ttls(&[key], self.config.session_ttl_secs()).await?;

        let session = Session::new(app, user, id);
        session.set_storage_version(StorageVersion::V1);
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
        let key = self.keys.v1_sessions(app);
        let raw: Option<String> = self.pool.hget(&key, id).await?;
        let blob: SessionBlob = match raw {
            Some(s) => serde_json::from_str(&s)?,
            None => return Err(SessionError::NotFound(format!("v1 session {app}/{user}/{id}"))),
        };

        let app_state = self.read_app_state(app).await?;
        let user_state = self.read_user_state(app, user).await?;
        let merged = merge_state(&app_state, &user_state, &blob.state);

        let mut events = self.read_events(app, user, id).await?;
        if let Some(num) = event_num {
            if events.len() > num {
                let start = events.len() - num;
                events.drain(0..start);
            }
        }
        if let Some(after) = event_time {
            events.retain(|e| e.timestamp > after);
        }

        let summaries = self.read_summaries(app, user, id).await?;

        let session = Session::new(app, user, id);
        session.set_state(merged);
        session.set_events(events);
        session.set_summaries(summaries);
        session.set_storage_version(StorageVersion::V1);

        self.refresh_ttls(&[key, self.keys.v1_events(app, user, id)], self.config.session_ttl_secs()).await?;
        self.refresh_ttls(&[self.keys.app_state(app)], self.config.app_state_ttl_secs()).await?;
        self.refresh_ttls(&[self.keys.v1_user_state(app, user)], self.config.user_state_ttl_secs()).await?;

        Ok(Arc::new(session))
    }

    async fn exists(&self, app: &str, _user: &str, id: &str) -> Result<bool> {
        let key = self.keys.v1_sessions(app);
        Ok(self.pool.hexists(key, id).await?)
    }

    async fn append_event(&self, session: &Session, event: Event) -> Result<()> {
        let (app, user, id) = (session.app_name.clone(), session.user_id.clone(), session.id.clone());
        let (app_delta, user_delta, session_delta) = split_state(&event.state_delta);

        let meta_key = self.keys.v1_sessions(&app);
        let raw: Option<String> = self.pool.hget(&meta_key, &id).await?;
        let mut blob: SessionBlob = match raw {
            Some(s) => serde_json::from_str(&s)?,
            None => return Err(SessionError::NotFound(format!("v1 session {app}/{user}/{id}"))),
        };
        blob.state.extend(session_delta);
        blob.updated_at = event.timestamp;

        let pipeline = self.pool.next().pipeline();
        let _: () = pipeline.hset(&meta_key, (id.as_str(), serde_json::to_string(&blob)?)).await?;
        if event.is_valid_for_history() {
            let evt_key = self.keys.v1_events(&app, &user, &id);
            let score = event.timestamp.timestamp_nanos_opt().unwrap_or_default() as f64;
            let _: () = pipeline.zadd(evt_key, None, None, false, false, (score, serde_json::to_string(&event)?)).await?;
        }
        let _: Vec<Value> = pipeline.all().await?;

        if !app_delta.is_empty() {
            let app_key = self.keys.app_state(&app);
            for (k, v) in &app_delta {
                let _: () = self.pool.hset(&app_key, (k.as_str(), serde_json::to_string(v)?)).await?;
            }
            self.refresh_ttls(&[app_key], self.config.app_state_ttl_secs()).await?;
        }
        if !user_delta.is_empty() {
            let user_key = self.keys.v1_user_state(&app, &user);
            for (k, v) in &user_delta {
                let _: () = self.pool.hset(&user_key, (k.as_str(), serde_json::to_string(v)?)).await?;
            }
            self.refresh_ttls(&[user_key], self.config.user_state_ttl_secs()).await?;
        }

        self.refresh_ttls(&[meta_key, self.keys.v1_events(&app, &user, &id)], self.config.session_ttl_secs()).await?;
        Ok(())
    }

    async fn append_track_event(&self, session: &Session, event: TrackEvent) -> Result<()> {
        let key = self.keys.v1_track(&session.app_name, &session.user_id, &session.id, &event.track);
        let score = event.timestamp.timestamp_nanos_opt().unwrap_or_default() as f64;
        let _: () = self
            .pool
            .zadd(key, None, None, false, false, (score, serde_json::to_string(&event)?))
            .await?;
        Ok(())
    }

    async fn list_sessions(&self, app: &str, user: &str) -> Result<Vec<Arc<Session>>> {
        let key = self.keys.v1_sessions(app);
        let raw: HashMap<String, String> = self.pool.hgetall(key).await?;
        let mut out = Vec::new();
        for (id, blob_json) in raw {
            let blob: SessionBlob = match serde_json::from_str(&blob_json) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if blob.user_id != user {
                continue;
            }
            let session = Session::new(app, user, &id);
            session.set_state(blob.state);
            session.set_storage_version(StorageVersion::V1);
            out.push(Arc::new(session));
        }
        Ok(out)
    }

    async fn delete_session(&self, app: &str, user: &str, id: &str) -> Result<()> {
        let _: () = self.pool.hdel(self.keys.v1_sessions(app), id).await?;
        let _: () = self.pool.del(self.keys.v1_events(app, user, id)).await?;
        let _: () = self.pool.hdel(self.keys.v1_summaries(app), id).await?;
        Ok(())
    }

    async fn update_user_state(&self, app: &str, user: &str, delta: StateMap) -> Result<()> {
        let key = self.keys.v1_user_state(app, user);
        for (k, v) in &delta {
            let _: () = self.pool.hset(&key, (k.as_str(), serde_json::to_string(v)?)).await?;
        }
        self.refresh_ttls(&[key], self.config.user_state_ttl_secs()).await
    }

    async fn create_session_summary(
        &self,
        app: &str,
        _user: &str,
        id: &str,
        filter_key: &str,
        summary: Summary,
    ) -> Result<bool> {
        let key = self.keys.v1_summaries(app);
        let raw: Option<String> = self.pool.hget(&key, id).await?;
        let mut map: HashMap<String, Summary> = match raw {
            Some(s) => serde_json::from_str(&s).unwrap_or_default(),
            None => HashMap::new(),
        };
        let write = match map.get(filter_key) {
            Some(existing) if existing.updated_at_ns > summary.updated_at_ns => false,
            _ => true,
        };
        if write {
            map.insert(filter_key.to_string(), summary);
            let _: () = self.pool.hset(&key, (id, serde_json::to_string(&map)?)).await?;
        }
        Ok(write)
    }

    async fn trim_conversations(
        &self,
        app: &str,
        user: &str,
        id: &str,
        count: usize,
    ) -> Result<Vec<Event>> {
        let key = self.keys.v1_events(app, user, id);
        let mut seen_request_ids: Vec<String> = Vec::new();
        let mut scanned: Vec<(String, Event)> = Vec::new();
        let batch_size = 100i64;
        let mut start = 0i64;

        loop {
            let stop = start + batch_size - 1;
            let raw: Vec<String> = self.pool.zrevrange(&key, start, stop, false).await?;
            if raw.is_empty() {
                break;
            }
            for member in &raw {
                if let Ok(event) = serde_json::from_str::<Event>(member) {
                    if !seen_request_ids.contains(&event.request_id) && seen_request_ids.len() < count {
                        seen_request_ids.push(event.request_id.clone());
                    }
                    scanned.push((member.clone(), event));
                }
            }
            start += batch_size;
            if seen_request_ids.len() >= count {
                break;
            }
        }

        let mut deleted = Vec::new();
        for (member, event) in scanned {
            if seen_request_ids.contains(&event.request_id) {
                let _: () = self.pool.zrem(&key, member).await?;
                deleted.push(event);
            }
        }
        deleted.sort_by_key(|e| e.timestamp);
        Ok(deleted)
    }
}
