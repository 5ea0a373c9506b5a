//! Background enrichment: a bounded job queue feeding a worker pool that
//! calls the completion collaborator and re-ingests its output as ordinary
//! items.
//!
//! Jobs are best-effort. Enqueueing never blocks, and a full queue drops the
//! job. Completion timeouts and errors are logged and swallowed. A job whose
//! window has disappeared is a no-op.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ctxwarden_state::{ContextItem, Priority, WindowId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EnrichmentConfig, SummarizationConfig};
use crate::error::{CtxwardenError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::segmenter::{segments, should_summarize, Message, Segment};
use crate::store::{ContextStore, ItemSpec};

const SUMMARY_INSTRUCTION: &str = "Summarize the following conversation segment. \
Keep decisions, facts and open questions; drop pleasantries.";

// -- completion collaborator -------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion unavailable: {0}")]
    Unavailable(String),

    #[error("completion rejected: {0}")]
    Rejected(String),
}

/// Text generation backend.
#[async_trait]
pub trait CompletionClient: Send + Sync + 'static {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<Completion, CompletionError>;
}

// -- jobs --------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentJob {
    /// Turn a history segment into a `Summary` item.
    Summarize {
        job_id: String,
        window_id: WindowId,
        /// `"<start_id>..<end_id>"`
        source_ref: String,
        messages: Vec<Message>,
    },
}

impl EnrichmentJob {
    pub fn summarize(window_id: WindowId, segment: &Segment<'_>) -> Self {
        EnrichmentJob::Summarize {
            job_id: Uuid::new_v4().to_string(),
            window_id,
            source_ref: segment.source_ref(),
            messages: segment.messages.to_vec(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EnrichmentJob::Summarize { .. } => "summarize",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            EnrichmentJob::Summarize { job_id, .. } => job_id,
        }
    }

    pub fn window_id(&self) -> &WindowId {
        match self {
            EnrichmentJob::Summarize { window_id, .. } => window_id,
        }
    }
}

/// Sending half of the job queue.
#[derive(Debug, Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::Sender<EnrichmentJob>,
}

impl EnrichmentQueue {
    /// Queue without workers; the receiver is handed to the caller.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<EnrichmentJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false when the job was dropped.
    pub fn enqueue(&self, job: EnrichmentJob) -> bool {
        let kind = job.kind();
        let window_id = job.window_id().to_string();
        let job_id = job.job_id().to_string();

        match self.tx.try_send(job) {
            Ok(()) => {
                obs::emit_enrichment_enqueued(&job_id, kind, &window_id);
                true
            }
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "queue closed",
                };
                METRICS.inc_enrichment_dropped();
                obs::emit_enrichment_dropped(kind, &window_id, reason);
                false
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

// -- workers -----------------------------------------------------------------

/// Worker pool draining an [`EnrichmentQueue`].
///
/// Workers exit once every queue handle is dropped and the queue is empty.
#[derive(Debug)]
pub struct EnrichmentWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl EnrichmentWorkers {
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        config: &EnrichmentConfig,
        store: ContextStore,
        client: Arc<dyn CompletionClient>,
    ) -> (EnrichmentQueue, Self) {
        let (queue, rx) = EnrichmentQueue::bounded(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let timeout = config.completion_timeout();

        let handles = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let store = store.clone();
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        run_job(&store, client.as_ref(), timeout, job).await;
                    }
                    debug!(worker, "enrichment worker stopped");
                })
            })
            .collect();

        (queue, Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for the workers to drain the queue and exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "enrichment worker panicked");
            }
        }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn run_job(
    store: &ContextStore,
    client: &dyn CompletionClient,
    timeout: Duration,
    job: EnrichmentJob,
) {
    let job_id = job.job_id().to_string();
    let window_id = job.window_id().clone();

    match execute(store, client, timeout, job).await {
        Ok(Some(item)) => {
            METRICS.inc_enrichment_completed();
            obs::emit_enrichment_completed(
                &job_id,
                window_id.as_str(),
                item.id.as_str(),
                item.token_count,
            );
        }
        Ok(None) => debug!(job_id = %job_id, window_id = %window_id, "window gone, job skipped"),
        Err(e) => {
            METRICS.inc_enrichment_failed();
            obs::emit_enrichment_failed(&job_id, window_id.as_str(), &e);
        }
    }
}

/// `Ok(None)` when the target window no longer exists.
pub(crate) async fn execute(
    store: &ContextStore,
    client: &dyn CompletionClient,
    timeout: Duration,
    job: EnrichmentJob,
) -> Result<Option<ContextItem>> {
    let EnrichmentJob::Summarize {
        window_id,
        source_ref,
        messages,
        ..
    } = job;

    match store.window(&window_id).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    }

    let request = CompletionRequest {
        system: SUMMARY_INSTRUCTION.to_string(),
        messages,
    };
    let completion = match tokio::time::timeout(timeout, client.complete(request)).await {
        Err(_) => {
            return Err(CtxwardenError::CollaboratorTimeout {
                collaborator: "completion".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Ok(Err(e)) => return Err(CtxwardenError::Collaborator(e.to_string())),
        Ok(Ok(completion)) => completion,
    };

    let text = completion.text.trim();
    if text.is_empty() {
        return Err(CtxwardenError::Collaborator(
            "completion returned empty text".to_string(),
        ));
    }

    let spec = ItemSpec::summary(text)
        .with_priority(Priority::High)
        .with_source_ref(source_ref);
    match store.add_item(&window_id, spec).await {
        Ok(item) => Ok(Some(item)),
        // deleted while the completion was in flight
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

// -- summarization pipeline --------------------------------------------------

/// Schedules one `Summarize` job per segment of a long history. A segment is
/// scheduled at most once per window.
#[derive(Debug, Clone)]
pub struct SummarizationPipeline {
    config: SummarizationConfig,
    queue: EnrichmentQueue,
    seen: Arc<Mutex<HashSet<(WindowId, String)>>>,
}

impl SummarizationPipeline {
    pub fn new(config: SummarizationConfig, queue: EnrichmentQueue) -> Self {
        Self {
            config,
            queue,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    /// Returns the number of jobs enqueued. Dropped jobs are not remembered,
    /// so a later call can schedule them again.
    pub fn schedule(&self, window_id: &WindowId, messages: &[Message]) -> Result<usize> {
        if !should_summarize(
            messages,
            self.config.token_threshold,
            self.config.count_threshold,
        ) {
            return Ok(0);
        }

        let plan = segments(messages, self.config.segment_size, self.config.segment_overlap)?;
        let mut scheduled = 0;
        for segment in plan.iter() {
            let key = (window_id.clone(), segment.digest());
            if self.is_seen(&key) {
                continue;
            }
            if self
                .queue
                .enqueue(EnrichmentJob::summarize(window_id.clone(), &segment))
            {
                self.mark_seen(key);
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Drop dedupe state for a window, e.g. after its conversation was deleted.
    pub fn forget_window(&self, window_id: &WindowId) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(w, _)| w != window_id);
    }

    fn is_seen(&self, key: &(WindowId, String)) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    fn mark_seen(&self, key: (WindowId, String)) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::Role;

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::new(format!("m{i}"), Role::User, "hello"))
            .collect()
    }

    fn pipeline(capacity: usize) -> (SummarizationPipeline, mpsc::Receiver<EnrichmentJob>) {
        let (queue, rx) = EnrichmentQueue::bounded(capacity);
        let config = SummarizationConfig {
            token_threshold: 10_000,
            count_threshold: 5,
            segment_size: 4,
            segment_overlap: 1,
        };
        (SummarizationPipeline::new(config, queue), rx)
    }

    #[tokio::test]
    async fn schedules_each_segment_once() {
        let (pipeline, mut rx) = pipeline(16);
        let window = WindowId::from("w-1");
        let msgs = history(10);

        assert_eq!(pipeline.schedule(&window, &msgs).unwrap(), 3);
        assert_eq!(pipeline.schedule(&window, &msgs).unwrap(), 0);

        let mut refs = Vec::new();
        while let Ok(job) = rx.try_recv() {
            let EnrichmentJob::Summarize { source_ref, .. } = job;
            refs.push(source_ref);
        }
        assert_eq!(refs, vec!["m0..m3", "m3..m6", "m6..m9"]);
    }

    #[tokio::test]
    async fn below_threshold_schedules_nothing() {
        let (pipeline, _rx) = pipeline(16);
        assert_eq!(
            pipeline.schedule(&WindowId::from("w-1"), &history(4)).unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn full_queue_drops_and_allows_retry() {
        let (pipeline, mut rx) = pipeline(1);
        let window = WindowId::from("w-1");
        let msgs = history(10);

        assert_eq!(pipeline.schedule(&window, &msgs).unwrap(), 1);
        rx.try_recv().unwrap();
        assert_eq!(pipeline.schedule(&window, &msgs).unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects() {
        let (queue, rx) = EnrichmentQueue::bounded(4);
        drop(rx);
        let msgs = history(5);
        let plan = segments(&msgs, 4, 1).unwrap();
        let segment = plan.iter().next().unwrap();
        assert!(!queue.enqueue(EnrichmentJob::summarize(WindowId::from("w"), &segment)));
    }
}
