//! Exercises `backend::v1` against a real Redis instance.

use fred::prelude::*;
use session_store::backend::v1::V1Backend;
use session_store::backend::Backend;
use session_store::config::SessionServiceConfig;
use session_store::domain::{Choice, Event, Message, Response};

const ENV_REDIS_URL: &str = "REDIS_URL";

fn required_env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| {
        panic!("{name} is required for live v1 backend tests; run with --ignored against a local redis-server")
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

fn valid_event(author: &str, request_id: &str) -> Event {
    let mut event = Event::new("inv", author);
    event.request_id = request_id.to_string();
    event.response = Some(Response {
        choices: vec![Choice { message: Some(Message { content: Some("hi".into()), tool_calls: vec![] }), delta: None }],
    });
    event
}

#[tokio::test]
#[ignore = "requires a live redis-server; run with --ignored"]
async fn create_is_idempotent_by_id() {
    let pool = connect().await;
    let backend = V1Backend::new(pool, SessionServiceConfig::default());

    let app = unique("app");
    let user = unique("user");
    let id = unique("sess");

    let first = backend.create_session(&app, &user, &id).await.expect("first create");
    backend
        .append_event(&first, valid_event("user", "r1"))
        .await
        .expect("append");

    let second = backend.create_session(&app, &user, &id).await.expect("second create returns existing");
    assert_eq!(second.get_state_value("anything"), None);

    let reloaded = backend.get_session(&app, &user, &id, None, None).await.expect("get");
    assert_eq!(reloaded.get_event_count(), 1);

    backend.delete_session(&app, &user, &id).await.expect("cleanup");
}

#[tokio::test]
#[ignore = "requires a live redis-server; run with --ignored"]
async fn list_sessions_filters_by_user() {
    let pool = connect().await;
    let backend = V1Backend::new(pool, SessionServiceConfig::default());

    let app = unique("app");
    let user_a = unique("user-a");
    let user_b = unique("user-b");
    let id_a = unique("sess-a");
    let id_b = unique("sess-b");

    backend.create_session(&app, &user_a, &id_a).await.expect("create a");
    backend.create_session(&app, &user_b, &id_b).await.expect("create b");

    let listed = backend.list_sessions(&app, &user_a).await.expect("list");
    assert!(listed.iter().all(|s| s.user_id == user_a));
    assert!(listed.iter().any(|s| s.id == id_a));

    backend.delete_session(&app, &user_a, &id_a).await.expect("cleanup a");
    backend.delete_session(&app, &user_b, &id_b).await.expect("cleanup b");
}
