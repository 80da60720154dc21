//! Sharded worker pool for event/track-event writes. Shard = `hash % N`
//! so that work for one session always drains through the same worker,
//! which is what gives per-session FIFO ordering without a global lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::domain::{Event, Session, TrackEvent};
use crate::error::{Result, SessionError};
use crate::service::Router;

pub enum PersistJob {
    Event { session: Arc<Session>, event: Event },
    Track { session: Arc<Session>, event: TrackEvent },
}

pub struct PersistPool {
    senders: Vec<mpsc::Sender<PersistJob>>,
    handles: Vec<JoinHandle<()>>,
    item_timeout: Duration,
}

impl PersistPool {
    pub fn new(router: Arc<Router>, worker_num: usize, queue_capacity: usize, item_timeout: Duration) -> Self {
        let mut senders = Vec::with_capacity(worker_num);
        let mut handles = Vec::with_capacity(worker_num);

        for shard in 0..worker_num {
            let (tx, rx) = mpsc::channel(queue_capacity);
            let router = router.clone();
            let handle = tokio::spawn(run_worker(shard, rx, router, item_timeout));
            senders.push(tx);
            handles.push(handle);
        }

        Self { senders, handles, item_timeout }
    }

    /// Enqueues persist work for `session`, racing the send against
    /// `cancel`. Never blocks indefinitely: a full channel either accepts
    /// the job once a slot frees up or the operation is cancelled first.
    pub async fn enqueue(&self, job: PersistJob, cancel: &CancellationToken) -> Result<()> {
        let shard = self.shard_for(&job);
        let sender = &self.senders[shard];
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = sender.send(job) => res.map_err(|_| SessionError::Shutdown),
        }
    }

    fn shard_for(&self, job: &PersistJob) -> usize {
        let hash = match job {
            PersistJob::Event { session, .. } => session.hash,
            PersistJob::Track { session, .. } => session.hash,
        };
        hash as usize % self.senders.len()
    }

    /// Closes every sender and waits for all workers to drain and exit.
    pub async fn close(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(?err, "persist worker panicked");
            }
        }
    }

    pub fn item_timeout(&self) -> Duration {
        self.item_timeout
    }
}

async fn run_worker(shard: usize, mut rx: mpsc::Receiver<PersistJob>, router: Arc<Router>, timeout: Duration) {
    while let Some(job) = rx.recv().await {
        let result = tokio::time::timeout(timeout, apply(&router, job)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(shard, ?err, "persist job failed"),
            Err(_) => warn!(shard, "persist job timed out"),
        }
    }
}

async fn apply(router: &Router, job: PersistJob) -> Result<()> {
    match job {
        PersistJob::Event { session, event } => router.persist_event(&session, event).await,
        PersistJob::Track { session, event } => router.persist_track_event(&session, event).await,
    }
}
