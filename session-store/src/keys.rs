//! Per-version Redis key layouts and the Redis Cluster hash-tag policy.
//!
//! V1 tags on `{appName}`, colocating every user of an app in one slot.
//! V2 tags on `{appName:userID}`, trading that cross-user atomicity away
//! for even load distribution — see `DESIGN.md` for the rationale this
//! crate inherited from the spec's hash-tag discussion.

#[derive(Debug, Clone, Default)]
pub struct KeyPrefix(pub String);

impl KeyPrefix {
    fn apply(&self, key: String) -> String {
        if self.0.is_empty() {
            key
        } else {
            format!("{}{}", self.0, key)
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: KeyPrefix,
}

impl KeyBuilder {
    pub fn new(prefix: KeyPrefix) -> Self {
        Self { prefix }
    }

    // ---- V1 layout: hash tag = {appName} ----

    pub fn v1_sessions(&self, app: &str) -> String {
        self.prefix.apply(format!("sess:{{{app}}}"))
    }

    pub fn v1_events(&self, app: &str, user: &str, session: &str) -> String {
        self.prefix.apply(format!("event:{{{app}}}:{user}:{session}"))
    }

    pub fn v1_summaries(&self, app: &str) -> String {
        self.prefix.apply(format!("sesssum:{{{app}}}"))
    }

    pub fn v1_track(&self, app: &str, user: &str, session: &str, track: &str) -> String {
        self.prefix.apply(format!("track:{{{app}}}:{user}:{session}:{track}"))
    }

    pub fn app_state(&self, app: &str) -> String {
        self.prefix.apply(format!("appstate:{{{app}}}"))
    }

    pub fn v1_user_state(&self, app: &str, user: &str) -> String {
        self.prefix.apply(format!("userstate:{{{app}}}:{user}"))
    }

    // ---- V2 layout: hash tag = {appName:userID} ----

    fn v2_tag(&self, app: &str, user: &str) -> String {
        format!("{{{app}:{user}}}")
    }

    pub fn v2_meta(&self, app: &str, user: &str, session: &str) -> String {
        let tag = self.v2_tag(app, user);
        self.prefix.apply(format!("v2:meta:{tag}:{session}"))
    }

    pub fn v2_event_data(&self, app: &str, user: &str, session: &str) -> String {
        let tag = self.v2_tag(app, user);
        self.prefix.apply(format!("v2:evtdata:{tag}:{session}"))
    }

    pub fn v2_event_index(&self, app: &str, user: &str, session: &str) -> String {
        let tag = self.v2_tag(app, user);
        self.prefix.apply(format!("v2:evtidx:time:{tag}:{session}"))
    }

    pub fn v2_summaries(&self, app: &str, user: &str, session: &str) -> String {
        let tag = self.v2_tag(app, user);
        self.prefix.apply(format!("v2:sesssum:{tag}:{session}"))
    }

    pub fn v2_track(&self, app: &str, user: &str, session: &str, track: &str) -> String {
        let tag = self.v2_tag(app, user);
        self.prefix.apply(format!("v2:track:{tag}:{session}:{track}"))
    }

    pub fn v2_user_state(&self, app: &str, user: &str) -> String {
        let tag = self.v2_tag(app, user);
        self.prefix.apply(format!("v2:userstate:{tag}"))
    }
}

/// Field used by V2's summary hash: all filter-key summaries live under a
/// single fixed field so `SummariesSetIfNewer` can read-modify-write the
/// whole map atomically in one script invocation.
pub const V2_SUMMARY_FIELD: &str = "data";
