//! Walks through the core session lifecycle against a real Redis
//! instance: create, append a turn, read back, force a summary, trim.
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo run -p redis-session-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use session_store::{
    Choice, CompatMode, Event, Message, Response, Session, SessionServiceBuilder, SessionServiceConfig,
    Summarizer,
};
use tokio_util::sync::CancellationToken;

struct EchoSummarizer;

#[async_trait]
impl Summarizer for EchoSummarizer {
    async fn should_summarize(&self, session: &Session) -> bool {
        session.get_event_count() >= 2
    }

    async fn summarize(&self, session: &Session, _cancel: &CancellationToken) -> session_store::Result<String> {
        Ok(format!("{} turns so far", session.get_event_count()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let config = Config::from_url(&redis_url)?;
    let pool = Builder::from_config(config).build_pool(2)?;
    pool.init().await?;

    let service_config = SessionServiceConfig::default()
        .with_compat_mode(CompatMode::None)
        .with_session_ttl(Duration::from_secs(3600));

    let service = SessionServiceBuilder::new(pool, service_config)
        .with_summarizer(Arc::new(EchoSummarizer))
        .build()
        .await?;

    let cancel = CancellationToken::new();
    let session = service.create_session("demo-app", "demo-user", "demo-session", &cancel).await?;
    tracing::info!(id = %session.id, "session ready");

    let mut turn = Event::new("inv-1", "user");
    turn.response = Some(Response {
        choices: vec![Choice {
            message: Some(Message { content: Some("hello there".to_string()), tool_calls: vec![] }),
            delta: None,
        }],
    });
    service.append_event(&session, turn, &cancel).await?;

    service.enqueue_summary_job(session.clone(), "", true).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reloaded = service
        .get_session("demo-app", "demo-user", "demo-session", Default::default(), &cancel)
        .await?;
    tracing::info!(events = reloaded.get_event_count(), "reloaded session");

    service.close().await;
    Ok(())
}
