//! Session/Event/State/Summary/Track value types and the in-memory
//! mutations the facade applies before ever touching Redis.
//!
//! `Session` carries two independent locks — one over events/state/tracks
//! (they are mutated together by `update_user_session`), one over
//! summaries (mutated independently by the summary pool). Neither lock is
//! ever held across an `.await`; every public method here is synchronous.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, SessionError};

pub type StateMap = HashMap<String, Value>;

pub const STATE_PREFIX_APP: &str = "app:";
pub const STATE_PREFIX_USER: &str = "user:";
pub const STATE_PREFIX_TEMP: &str = "temp:";
pub const STATE_KEY_TRACKS: &str = "tracks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Other,
}

impl Role {
    pub fn from_author(author: &str) -> Role {
        if author.eq_ignore_ascii_case("user") {
            Role::User
        } else {
            Role::Other
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty()) || !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub delta: Option<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

impl Response {
    fn has_valid_content(&self) -> bool {
        self.choices.iter().any(|c| {
            c.message.as_ref().is_some_and(Message::has_content)
                || c.delta.as_ref().is_some_and(Message::has_content)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    #[serde(default)]
    pub request_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub response: Option<Response>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub state_delta: StateMap,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default)]
    pub done: bool,
}

impl Event {
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            request_id: String::new(),
            author: author.into(),
            timestamp: Utc::now(),
            response: None,
            usage: None,
            state_delta: StateMap::new(),
            object: String::new(),
            is_partial: false,
            done: false,
        }
    }

    pub fn role(&self) -> Role {
        Role::from_author(&self.author)
    }

    /// An event is valid for history iff it carries a non-partial response
    /// with non-empty content or tool calls. Every event still applies its
    /// `state_delta` regardless of this flag.
    pub fn is_valid_for_history(&self) -> bool {
        match &self.response {
            Some(resp) => !self.is_partial && resp.has_valid_content(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub text: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub updated_at: DateTime<Utc>,
    /// Denormalized epoch-nanosecond copy of `updated_at`, so the
    /// `SummariesSetIfNewer` Lua script can compare two stored summaries
    /// with a plain numeric `<=` instead of parsing RFC3339 strings.
    #[serde(default)]
    pub updated_at_ns: i64,
}

impl Summary {
    pub fn new(text: impl Into<String>, topics: Vec<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            topics,
            updated_at,
            updated_at_ns: updated_at.timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    pub track: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageVersion {
    V1,
    V2,
}

/// Non-persisted per-session annotations. `version` is stamped in on load
/// so later writes route in O(1) without a fresh existence probe.
#[derive(Debug, Default)]
pub struct ServiceMeta {
    pub version: Option<StorageVersion>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_num: Option<usize>,
    pub event_time: Option<DateTime<Utc>>,
}

struct CoreState {
    events: Vec<Event>,
    state: StateMap,
    tracks: HashMap<String, Vec<TrackEvent>>,
    updated_at: DateTime<Utc>,
}

pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub hash: u32,
    core: RwLock<CoreState>,
    summaries: RwLock<HashMap<String, Summary>>,
    service_meta: Mutex<ServiceMeta>,
}

impl Session {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>, id: impl Into<String>) -> Self {
        let app_name = app_name.into();
        let user_id = user_id.into();
        let id = id.into();
        let now = Utc::now();
        let hash = fingerprint(&format!("{app_name}:{user_id}:{id}"));
        Self {
            id,
            app_name,
            user_id,
            created_at: now,
            hash,
            core: RwLock::new(CoreState {
                events: Vec::new(),
                state: StateMap::new(),
                tracks: HashMap::new(),
                updated_at: now,
            }),
            summaries: RwLock::new(HashMap::new()),
            service_meta: Mutex::new(ServiceMeta::default()),
        }
    }

    pub fn set_storage_version(&self, version: StorageVersion) {
        self.service_meta.lock().unwrap().version = Some(version);
    }

    pub fn storage_version(&self) -> Option<StorageVersion> {
        self.service_meta.lock().unwrap().version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.core.read().unwrap().updated_at
    }

    pub fn state_snapshot(&self) -> StateMap {
        self.core.read().unwrap().state.clone()
    }

    pub fn set_state(&self, state: StateMap) {
        self.core.write().unwrap().state = state;
    }

    pub fn get_state_value(&self, key: &str) -> Option<Value> {
        self.core.read().unwrap().state.get(key).cloned()
    }

    pub fn get_events(&self) -> Vec<Event> {
        self.core.read().unwrap().events.clone()
    }

    pub fn get_event_count(&self) -> usize {
        self.core.read().unwrap().events.len()
    }

    pub fn set_events(&self, events: Vec<Event>) {
        self.core.write().unwrap().events = events;
    }

    /// Drops a single event from the in-memory history by id, mirroring
    /// the backend's `DeleteEvent` so a caller sees the removal without
    /// waiting on a reload.
    pub fn remove_event(&self, event_id: &str) {
        let mut core = self.core.write().unwrap();
        core.events.retain(|e| e.id != event_id);
        core.updated_at = Utc::now();
    }

    pub fn summaries_snapshot(&self) -> HashMap<String, Summary> {
        self.summaries.read().unwrap().clone()
    }

    pub fn set_summaries(&self, summaries: HashMap<String, Summary>) {
        *self.summaries.write().unwrap() = summaries;
    }

    /// Set a single summary in memory if it is newer-wins against whatever
    /// is already cached, mirroring the server-side rule in
    /// `SummariesSetIfNewer` so the in-process view never regresses either.
    pub fn set_summary_if_newer(&self, filter_key: &str, summary: Summary) -> bool {
        let mut summaries = self.summaries.write().unwrap();
        match summaries.get(filter_key) {
            Some(existing) if existing.updated_at > summary.updated_at => false,
            _ => {
                summaries.insert(filter_key.to_string(), summary);
                true
            }
        }
    }

    pub fn get_summary(&self, filter_key: &str) -> Option<Summary> {
        self.summaries.read().unwrap().get(filter_key).cloned()
    }

    /// Applies an event to the session: appends it to history if it is
    /// valid-for-history, always merges its `state_delta`, then re-runs
    /// filtering and the user-start trim. Returns whether anything changed.
    pub fn update_user_session(&self, event: Event, filter: &EventFilter) -> bool {
        let mut changed = false;
        {
            let mut core = self.core.write().unwrap();
            if event.is_valid_for_history() {
                core.events.push(event.clone());
                changed = true;
            }
            if !event.state_delta.is_empty() {
                for (k, v) in &event.state_delta {
                    if !k.starts_with(STATE_PREFIX_TEMP) {
                        core.state.insert(k.clone(), v.clone());
                    }
                }
                changed = true;
            }
            if changed {
                core.updated_at = event.timestamp;
            }
        }
        self.apply_event_filtering(filter);
        self.ensure_event_start_with_user();
        changed
    }

    /// First trims to the last `event_num` events (if set and > 0), then
    /// drops events with `timestamp <= event_time` (if set). If nothing
    /// survives and no user-role event would have survived either, leaves
    /// an empty list.
    pub fn apply_event_filtering(&self, filter: &EventFilter) {
        let mut core = self.core.write().unwrap();
        if let Some(num) = filter.event_num {
            if num > 0 && core.events.len() > num {
                let start = core.events.len() - num;
                core.events.drain(0..start);
            }
        }
        if let Some(after) = filter.event_time {
            core.events.retain(|e| e.timestamp > after);
        }
    }

    /// Strips leading non-user events so the stored/returned history always
    /// begins with a user-role event (or is empty).
    pub fn ensure_event_start_with_user(&self) {
        let mut core = self.core.write().unwrap();
        let first_user = core.events.iter().position(|e| e.role() == Role::User);
        match first_user {
            Some(0) => {}
            Some(idx) => {
                core.events.drain(0..idx);
            }
            None => core.events.clear(),
        }
    }

    /// Appends a defensive copy of `event` to the named track, refreshes
    /// the `"tracks"` index in state, and bumps `updated_at`.
    pub fn append_track_event(&self, event: TrackEvent) {
        let mut core = self.core.write().unwrap();
        let stored = event.clone();
        let now = stored.timestamp;
        core.tracks.entry(stored.track.clone()).or_default().push(stored);
        let track_names: Vec<&String> = core
            .tracks
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(name, _)| name)
            .collect();
        let names_json = serde_json::to_value(&track_names).unwrap_or(Value::Array(Vec::new()));
        core.state.insert(STATE_KEY_TRACKS.to_string(), names_json);
        core.updated_at = now;
    }

    pub fn get_track_events(&self, track: &str) -> Result<Vec<TrackEvent>> {
        let core = self.core.read().unwrap();
        match core.tracks.get(track) {
            Some(events) => Ok(events.clone()),
            None => Err(SessionError::NotFound(format!("track not found: {track}"))),
        }
    }

    pub fn set_tracks(&self, tracks: HashMap<String, Vec<TrackEvent>>) {
        self.core.write().unwrap().tracks = tracks;
    }

    pub fn tracks_snapshot(&self) -> HashMap<String, Vec<TrackEvent>> {
        self.core.read().unwrap().tracks.clone()
    }

    pub fn clone_deep(&self) -> Session {
        let core = self.core.read().unwrap();
        let cloned = Session {
            id: self.id.clone(),
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
            hash: self.hash,
            core: RwLock::new(CoreState {
                events: core.events.clone(),
                state: core.state.clone(),
                tracks: core.tracks.clone(),
                updated_at: core.updated_at,
            }),
            summaries: RwLock::new(self.summaries.read().unwrap().clone()),
            service_meta: Mutex::new(self.service_meta.lock().unwrap().clone()),
        };
        cloned
    }
}

impl Clone for ServiceMeta {
    fn clone(&self) -> Self {
        ServiceMeta { version: self.version }
    }
}

/// Stable 32-bit FNV-1a fingerprint, used solely for deterministic shard
/// selection in the async persist/summary pools — not a security hash.
pub fn fingerprint(s: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET;
    for byte in s.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_event(request_id: &str, text: &str, ts: i64) -> Event {
        let mut e = Event::new("inv", "user");
        e.request_id = request_id.to_string();
        e.timestamp = DateTime::from_timestamp(ts, 0).unwrap();
        e.response = Some(Response {
            choices: vec![Choice {
                message: Some(Message { content: Some(text.to_string()), tool_calls: vec![] }),
                delta: None,
            }],
        });
        e
    }

    fn assistant_event(request_id: &str, text: &str, ts: i64) -> Event {
        let mut e = user_event(request_id, text, ts);
        e.author = "assistant".to_string();
        e
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint("a:b:c"), fingerprint("a:b:c"));
        assert_ne!(fingerprint("a:b:c"), fingerprint("a:b:d"));
    }

    #[test]
    fn event_validity_gates_history_but_not_state_delta() {
        let session = Session::new("app", "user", "sess");
        let mut partial = user_event("r1", "hi", 1);
        partial.is_partial = true;
        partial.state_delta.insert("k".into(), Value::String("v".into()));

        session.update_user_session(partial, &EventFilter::default());

        assert_eq!(session.get_event_count(), 0);
        assert_eq!(session.get_state_value("k"), Some(Value::String("v".into())));
    }

    #[test]
    fn user_start_property_drops_leading_non_user_events() {
        let session = Session::new("app", "user", "sess");
        session.update_user_session(assistant_event("r1", "stray", 1), &EventFilter::default());
        session.update_user_session(user_event("r1", "hi", 2), &EventFilter::default());
        session.update_user_session(assistant_event("r1", "hello", 3), &EventFilter::default());

        let events = session.get_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].role(), Role::User);
    }

    #[test]
    fn filter_monotonicity_event_num() {
        let session = Session::new("app", "user", "sess");
        for i in 0..5 {
            session.update_user_session(user_event("r1", "m", i), &EventFilter::default());
        }
        session.apply_event_filtering(&EventFilter { event_num: Some(2), event_time: None });
        assert!(session.get_event_count() <= 2);
    }

    #[test]
    fn filter_monotonicity_event_time() {
        let session = Session::new("app", "user", "sess");
        for i in 0..5 {
            session.update_user_session(user_event("r1", "m", i), &EventFilter::default());
        }
        session.apply_event_filtering(&EventFilter { event_num: None, event_time: Some(DateTime::from_timestamp(2, 0).unwrap()) });
        assert!(session.get_events().iter().all(|e| e.timestamp.timestamp() > 2));
    }

    #[test]
    fn track_events_are_deep_copied() {
        let session = Session::new("app", "user", "sess");
        let mut payload = Value::Array(vec![Value::from(1)]);
        session.append_track_event(TrackEvent { track: "t".into(), payload: payload.clone(), timestamp: Utc::now() });

        if let Value::Array(arr) = &mut payload {
            arr.push(Value::from(2));
        }

        let stored = session.get_track_events("t").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, Value::Array(vec![Value::from(1)]));
    }

    #[test]
    fn track_index_reflects_known_tracks() {
        let session = Session::new("app", "user", "sess");
        session.append_track_event(TrackEvent { track: "alpha".into(), payload: Value::Null, timestamp: Utc::now() });
        let names = session.get_state_value(STATE_KEY_TRACKS).unwrap();
        assert_eq!(names, serde_json::json!(["alpha"]));
    }

    #[test]
    fn get_track_events_not_found() {
        let session = Session::new("app", "user", "sess");
        assert!(session.get_track_events("missing").is_err());
    }

    #[test]
    fn summary_newer_wins() {
        let session = Session::new("app", "user", "sess");
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        assert!(session.set_summary_if_newer("", Summary::new("A", vec![], t1)));
        assert!(!session.set_summary_if_newer("", Summary::new("stale", vec![], t0)));
        assert_eq!(session.get_summary("").unwrap().text, "A");

        let t2 = t1 + chrono::Duration::seconds(10);
        assert!(session.set_summary_if_newer("", Summary::new("B", vec![], t2)));
        assert_eq!(session.get_summary("").unwrap().text, "B");
    }

    #[test]
    fn clone_deep_copies_state() {
        let session = Session::new("app", "user", "sess");
        session.update_user_session(user_event("r1", "hi", 1), &EventFilter::default());
        let clone = session.clone_deep();
        assert_eq!(clone.get_event_count(), session.get_event_count());
        assert_eq!(clone.hash, session.hash);
    }
}
