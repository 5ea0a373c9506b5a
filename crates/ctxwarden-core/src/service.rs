//! Message-append entry point tying the store to background summarization.

use std::sync::Arc;

use ctxwarden_state::{ContextItem, ContextWindow, ConversationId};
use tracing::{instrument, warn};

use crate::config::CtxwardenConfig;
use crate::enrichment::{CompletionClient, EnrichmentWorkers, SummarizationPipeline};
use crate::error::Result;
use crate::segmenter::Message;
use crate::store::{ContextStore, ItemSpec};

/// Appends messages to a conversation's active window and feeds the history
/// to the summarization pipeline once the append has committed.
pub struct ContextService {
    store: ContextStore,
    config: CtxwardenConfig,
    pipeline: SummarizationPipeline,
    workers: EnrichmentWorkers,
}

impl ContextService {
    /// Spawns the enrichment workers; must be called inside a tokio runtime.
    pub fn spawn(
        store: ContextStore,
        config: CtxwardenConfig,
        client: Arc<dyn CompletionClient>,
    ) -> Self {
        let (queue, workers) = EnrichmentWorkers::spawn(&config.enrichment, store.clone(), client);
        let pipeline = SummarizationPipeline::new(config.summarization.clone(), queue);
        Self {
            store,
            config,
            pipeline,
            workers,
        }
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn pipeline(&self) -> &SummarizationPipeline {
        &self.pipeline
    }

    /// Add `message` to the active window (created on first use) and schedule
    /// summarization of `history`, which should end with `message`.
    ///
    /// Scheduling problems are logged; they never fail the append.
    #[instrument(skip(self, message, history), fields(conversation_id = %conversation_id, message_id = %message.id))]
    pub async fn append_message(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
        history: &[Message],
    ) -> Result<ContextItem> {
        let window = self
            .store
            .get_or_create_active_window(conversation_id, self.config.default_max_tokens)
            .await?;
        let item = self
            .store
            .add_item(
                &window.id,
                ItemSpec::message(message.id.clone(), message.content.clone()),
            )
            .await?;

        if let Err(e) = self.pipeline.schedule(&window.id, history) {
            warn!(window_id = %window.id, error = %e, "summarization not scheduled");
        }
        Ok(item)
    }

    /// Start a fresh active window. Dedupe state of the retired window is
    /// dropped; jobs already queued for it still land there.
    pub async fn rotate_window(
        &self,
        conversation_id: &ConversationId,
        new_max_tokens: u64,
    ) -> Result<ContextWindow> {
        let previous = self.store.active_window(conversation_id).await?;
        let window = self.store.rotate_window(conversation_id, new_max_tokens).await?;
        if let Some(previous) = previous {
            self.pipeline.forget_window(&previous.id);
        }
        Ok(window)
    }

    /// Delete a conversation and its dedupe state.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        let windows: Vec<_> = self
            .store
            .windows(false)
            .await?
            .into_iter()
            .filter(|w| &w.conversation_id == conversation_id)
            .map(|w| w.id)
            .collect();
        self.store.delete_conversation(conversation_id).await?;
        for window_id in &windows {
            self.pipeline.forget_window(window_id);
        }
        Ok(())
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        let Self {
            pipeline, workers, ..
        } = self;
        drop(pipeline);
        workers.join().await;
    }
}
