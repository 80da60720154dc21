//! Exercises `backend::v2` against a real Redis instance. Gated behind
//! `--ignored` so `cargo test` stays green offline.

use fred::prelude::*;
use session_store::backend::v2::V2Backend;
use session_store::backend::Backend;
use session_store::config::SessionServiceConfig;
use session_store::domain::Event;

const ENV_REDIS_URL: &str = "REDIS_URL";

fn required_env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| {
        panic!("{name} is required for live v2 backend tests; run with --ignored against a local redis-server")
    })
}

async fn connect() -> RedisPool {
    let url = required_env(ENV_REDIS_URL);
    let config = Config::from_url(&url).expect("parse redis url");
    let pool = Builder::from_config(config).build_pool(2).expect("build pool");
    pool.init().await.expect("connect");
    pool
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a live redis-server; run with --ignored"]
async fn create_then_get_round_trips_state() {
    let pool = connect().await;
    let backend = V2Backend::new(pool, SessionServiceConfig::default());
    backend.load_scripts().await.expect("load scripts");

    let app = unique("app");
    let user = unique("user");
    let id = unique("sess");

    backend.create_session(&app, &user, &id).await.expect("create");
    let loaded = backend.get_session(&app, &user, &id, None, None).await.expect("get");
    assert_eq!(loaded.id, id);
    assert_eq!(loaded.get_event_count(), 0);

    backend.delete_session(&app, &user, &id).await.expect("cleanup");
}

#[tokio::test]
#[ignore = "requires a live redis-server; run with --ignored"]
async fn create_refuses_to_overwrite() {
    let pool = connect().await;
    let backend = V2Backend::new(pool, SessionServiceConfig::default());
    backend.load_scripts().await.expect("load scripts");

    let app = unique("app");
    let user = unique("user");
    let id = unique("sess");

    backend.create_session(&app, &user, &id).await.expect("first create");
    let second = backend.create_session(&app, &user, &id).await;
    assert!(matches!(second, Err(session_store::SessionError::Conflict(_))));

    backend.delete_session(&app, &user, &id).await.expect("cleanup");
}

#[tokio::test]
#[ignore = "requires a live redis-server; run with --ignored"]
async fn append_event_merges_state_and_stores_valid_events() {
    let pool = connect().await;
    let backend = V2Backend::new(pool, SessionServiceConfig::default());
    backend.load_scripts().await.expect("load scripts");

    let app = unique("app");
    let user = unique("user");
    let id = unique("sess");

    let session = backend.create_session(&app, &user, &id).await.expect("create");

    let mut event = Event::new("inv-1", "user");
    event.state_delta.insert("topic".into(), serde_json::json!("pricing"));
    event.response = Some(session_store::domain::Response {
        choices: vec![session_store::domain::Choice {
            message: Some(session_store::domain::Message { content: Some("hi".into()), tool_calls: vec![] }),
            delta: None,
        }],
    });

    backend.append_event(&session, event).await.expect("append");

    let reloaded = backend.get_session(&app, &user, &id, None, None).await.expect("get");
    assert_eq!(reloaded.get_event_count(), 1);
    assert_eq!(reloaded.get_state_value("topic"), Some(serde_json::json!("pricing")));

    backend.delete_session(&app, &user, &id).await.expect("cleanup");
}

#[tokio::test]
#[ignore = "requires a live redis-server; run with --ignored"]
async fn trim_conversations_keeps_most_recent_distinct_request_ids() {
    let pool = connect().await;
    let backend = V2Backend::new(pool, SessionServiceConfig::default());
    backend.load_scripts().await.expect("load scripts");

    let app = unique("app");
    let user = unique("user");
    let id = unique("sess");
    let session = backend.create_session(&app, &user, &id).await.expect("create");

    for i in 0..6 {
        let mut event = Event::new("inv", "user");
        event.request_id = format!("r{}", i / 2);
        event.response = Some(session_store::domain::Response {
            choices: vec![session_store::domain::Choice {
                message: Some(session_store::domain::Message { content: Some("m".into()), tool_calls: vec![] }),
                delta: None,
            }],
        });
        backend.append_event(&session, event).await.expect("append");
    }

    let trimmed = backend.trim_conversations(&app, &user, &id, 1).await.expect("trim");
    assert!(!trimmed.is_empty());

    backend.delete_session(&app, &user, &id).await.expect("cleanup");
}

#[tokio::test]
#[ignore = "requires a live redis-server; run with --ignored"]
async fn delete_event_removes_only_the_targeted_event() {
    let pool = connect().await;
    let backend = V2Backend::new(pool, SessionServiceConfig::default());
    backend.load_scripts().await.expect("load scripts");

    let app = unique("app");
    let user = unique("user");
    let id = unique("sess");
    let session = backend.create_session(&app, &user, &id).await.expect("create");

    let kept = Event::new("inv", "user");
    let kept_id = kept.id.clone();
    backend.append_event(&session, kept).await.expect("append kept");

    let doomed = Event::new("inv", "user");
    let doomed_id = doomed.id.clone();
    backend.append_event(&session, doomed).await.expect("append doomed");

    backend.delete_event(&session, &doomed_id).await.expect("delete");

    let reloaded = backend.get_session(&app, &user, &id, None, None).await.expect("reload");
    let events = reloaded.get_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, kept_id);

    backend.delete_session(&app, &user, &id).await.expect("cleanup");
}
