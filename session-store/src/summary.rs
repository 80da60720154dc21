//! Bounded queue + fixed worker pool driving the external [`Summarizer`].
//! Persistence always goes through `SummariesSetIfNewer`, which is what
//! makes two summarizers racing on the same filter key safe.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::contract::Summarizer;
use crate::domain::{Session, Summary};
use crate::service::Router;

pub struct SummaryJob {
    pub session: Arc<Session>,
    pub filter_key: String,
    pub force: bool,
}

pub struct SummaryPool {
    sender: mpsc::Sender<SummaryJob>,
    handles: Vec<JoinHandle<()>>,
}

impl SummaryPool {
    pub fn new(
        router: Arc<Router>,
        summarizer: Arc<dyn Summarizer>,
        worker_num: usize,
        queue_capacity: usize,
        job_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(worker_num);

        for worker in 0..worker_num {
            let rx = rx.clone();
            let router = router.clone();
            let summarizer = summarizer.clone();
            // Weak on purpose: the pool's `sender` must be the only strong
            // sender alive, or `close()`'s `drop(self.sender)` never brings
            // the channel's sender count to zero and workers never see
            // `recv() -> None`.
            let cascade_tx = tx.downgrade();
            handles.push(tokio::spawn(run_worker(worker, rx, router, summarizer, job_timeout, cascade_tx)));
        }

        Self { sender: tx, handles }
    }

    /// Offers a job to the bounded queue without blocking; callers that
    /// need a debounce should check the queue depth themselves.
    pub async fn enqueue(&self, job: SummaryJob) {
        if self.sender.send(job).await.is_err() {
            warn!("summary pool is closed, dropping job");
        }
    }

    pub async fn close(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SummaryJob>>>,
    router: Arc<Router>,
    summarizer: Arc<dyn Summarizer>,
    job_timeout: Duration,
    cascade_tx: mpsc::WeakSender<SummaryJob>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        let result = tokio::time::timeout(job_timeout, run_job(&router, summarizer.as_ref(), &job)).await;
        match result {
            Ok(Ok(cascade)) => {
                if cascade {
                    if let Some(tx) = cascade_tx.upgrade() {
                        let _ = tx
                            .send(SummaryJob { session: job.session.clone(), filter_key: String::new(), force: true })
                            .await;
                    }
                }
            }
            Ok(Err(err)) => warn!(worker, filter_key = %job.filter_key, ?err, "summary job failed"),
            Err(_) => warn!(worker, filter_key = %job.filter_key, "summary job timed out"),
        }
    }
}

/// Runs one summarize-and-persist cycle. Returns whether the caller
/// should additionally cascade a full-session summary job.
async fn run_job(router: &Router, summarizer: &(dyn Summarizer), job: &SummaryJob) -> crate::error::Result<bool> {
    if !job.force && !summarizer.should_summarize(&job.session).await {
        return Ok(false);
    }

    let cancel = tokio_util::sync::CancellationToken::new();
    let text = summarizer.summarize(&job.session, &cancel).await?;
    let summary = Summary::new(text, Vec::new(), Utc::now());

    job.session.set_summary_if_newer(&job.filter_key, summary.clone());
    router
        .create_session_summary(&job.session, &job.filter_key, summary)
        .await?;

    Ok(!job.filter_key.is_empty())
}
