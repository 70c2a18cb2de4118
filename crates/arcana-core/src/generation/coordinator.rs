//! Single-flight entry point for generations

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::params::GenerationParameters;
use super::stream::FragmentStream;
use crate::error::GenerationError;
use crate::model::ModelLifecycleManager;
use crate::prompt::{PromptAssembler, ReadingInput};
use crate::runtime::{GenerationJob, GenerationOutcome};

/// Keeps at most one generation in flight. A new request cancels the
/// previous one (last caller wins); requests are never queued behind each
/// other.
pub struct GenerationCoordinator {
    manager: Arc<ModelLifecycleManager>,
    assembler: Arc<dyn PromptAssembler>,
}

impl GenerationCoordinator {
    pub fn new(manager: Arc<ModelLifecycleManager>, assembler: Arc<dyn PromptAssembler>) -> Self {
        Self { manager, assembler }
    }

    pub fn manager(&self) -> &Arc<ModelLifecycleManager> {
        &self.manager
    }

    /// Start generating from an already formatted prompt.
    ///
    /// Errors, including validation failures, arrive as the stream's only or
    /// final item. Must be called from within a Tokio runtime.
    pub fn request_generation(&self, prompt: &str, params: GenerationParameters) -> FragmentStream {
        let worker = self.manager.worker();
        if worker.cancel_generation() {
            debug!("Superseding the running generation");
        }

        if prompt.trim().is_empty() {
            return FragmentStream::failed(GenerationError::InvalidInput(
                "prompt is empty".to_string(),
            ));
        }
        if let Err(e) = params.validate() {
            return FragmentStream::failed(e);
        }

        // Claim the slot before checking the state: an eviction flips the
        // state first and cancels the slot second, so this job is either
        // refused here or cancelled by it.
        let id = Uuid::new_v4();
        let cancel = worker.begin_generation(id);
        if !self.manager.is_loaded() {
            worker.cancel_generation();
            return FragmentStream::failed(GenerationError::ModelNotLoaded);
        }

        let (sink, receiver) = mpsc::unbounded_channel();
        let job = GenerationJob {
            id,
            prompt: prompt.to_string(),
            params,
            cancel,
            sink,
        };

        match worker.submit(job) {
            Ok(done) => {
                debug!(%id, "Generation queued");
                self.watch_outcome(id, done);
                FragmentStream::new(id, receiver)
            }
            Err(e) => FragmentStream::failed(e),
        }
    }

    /// Assemble a reading prompt and start generating it.
    pub fn request_reading(
        &self,
        input: &ReadingInput,
        params: GenerationParameters,
    ) -> FragmentStream {
        if input.cards.is_empty() {
            self.manager.worker().cancel_generation();
            return FragmentStream::failed(GenerationError::InvalidInput(
                "a reading needs at least one card".to_string(),
            ));
        }

        let prompt = self.assembler.assemble(input);
        self.request_generation(&prompt, params)
    }

    /// Cancel the running generation, if any. Its stream ends with
    /// `Cancelled` within one token.
    pub fn cancel_current(&self) -> bool {
        let cancelled = self.manager.worker().cancel_generation();
        if cancelled {
            info!("Generation cancelled by caller");
        }
        cancelled
    }

    /// Log the outcome once the worker is done, and reload the model after a
    /// failed decode.
    fn watch_outcome(&self, id: Uuid, done: oneshot::Receiver<GenerationOutcome>) {
        let manager = self.manager.clone();
        tokio::spawn(async move {
            match done.await {
                Ok(Ok(summary)) => info!(
                    %id,
                    prompt_tokens = summary.prompt_tokens,
                    generated_tokens = summary.generated_tokens,
                    finish = ?summary.finish,
                    "Generation complete"
                ),
                Ok(Err(GenerationError::Cancelled)) => debug!(%id, "Generation cancelled"),
                Ok(Err(e)) if e.requires_reload() => {
                    error!(%id, "Generation failed, reloading model: {}", e);
                    if let Err(e) = manager.reload().await {
                        error!("Reload after failed decode did not succeed: {}", e);
                    }
                }
                Ok(Err(e)) => warn!(%id, "Generation failed: {}", e),
                Err(_) => warn!(%id, "Inference worker dropped the generation"),
            }
        });
    }
}
