//! Dedicated inference thread
//!
//! The native handles are not thread-safe, so exactly one OS thread creates,
//! uses and frees them. Everything else talks to that thread through a
//! command queue; commands run strictly in the order they were sent, which
//! means a cancelled generation has fully stopped before the next command
//! touches the model.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::backend::NativeBackend;
use crate::config::ModelConfig;
use crate::error::{BackendError, GenerationError, Result};
use crate::generation::{FragmentResult, GenerationEngine, GenerationParameters, GenerationSummary};
use crate::model::{ConstructionStep, ModelResource};

/// Progress callback invoked on the worker thread while a model loads
pub type StepCallback = Box<dyn FnMut(ConstructionStep) + Send>;

/// Outcome of a generation, sent once the worker is done with it
pub type GenerationOutcome = std::result::Result<GenerationSummary, GenerationError>;

/// One generation request as the worker sees it
pub struct GenerationJob {
    /// Id the job was registered under with [`InferenceWorker::begin_generation`]
    pub id: Uuid,
    pub prompt: String,
    pub params: GenerationParameters,
    pub cancel: CancellationToken,
    pub sink: mpsc::UnboundedSender<FragmentResult>,
}

enum WorkerCommand {
    Load {
        path: PathBuf,
        config: ModelConfig,
        on_step: StepCallback,
        reply: oneshot::Sender<std::result::Result<(), BackendError>>,
    },
    Unload {
        reply: oneshot::Sender<bool>,
    },
    Generate {
        job: GenerationJob,
        reply: oneshot::Sender<GenerationOutcome>,
    },
}

/// The generation holding the single-flight slot
struct ActiveGeneration {
    id: Uuid,
    cancel: CancellationToken,
}

type Slot = Arc<Mutex<Option<ActiveGeneration>>>;

/// Handle to the inference thread. Cheap to clone; the thread exits once
/// every handle is dropped, releasing any loaded model on its way out.
#[derive(Clone)]
pub struct InferenceWorker {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    current: Slot,
}

impl InferenceWorker {
    pub fn spawn(backend: Arc<dyn NativeBackend>) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let current: Slot = Arc::new(Mutex::new(None));

        let slot = current.clone();
        std::thread::Builder::new()
            .name("arcana-inference".to_string())
            .spawn(move || run(backend, receiver, slot))?;

        Ok(Self { commands, current })
    }

    /// Build the model resource on the worker. Any previously loaded
    /// resource is released first.
    pub async fn load(
        &self,
        path: PathBuf,
        config: ModelConfig,
        on_step: StepCallback,
    ) -> std::result::Result<(), BackendError> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerCommand::Load {
            path,
            config,
            on_step,
            reply,
        })
        .map_err(|_| unavailable())?;
        response.await.map_err(|_| unavailable())?
    }

    /// Release the resource. Returns whether one was loaded.
    pub async fn unload(&self) -> std::result::Result<bool, BackendError> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerCommand::Unload { reply })
            .map_err(|_| unavailable())?;
        response.await.map_err(|_| unavailable())
    }

    /// Queue a generation. The returned receiver resolves once the worker
    /// has finished with it, after the last item reached the sink.
    pub fn submit(
        &self,
        job: GenerationJob,
    ) -> std::result::Result<oneshot::Receiver<GenerationOutcome>, GenerationError> {
        let (reply, response) = oneshot::channel();
        self.send(WorkerCommand::Generate { job, reply })
            .map_err(|_| GenerationError::WorkerUnavailable)?;
        Ok(response)
    }

    /// Cancel whatever generation holds the slot and register `id` with a
    /// fresh token. The worker clears the slot once that job has finished.
    pub fn begin_generation(&self, id: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        let active = ActiveGeneration {
            id,
            cancel: cancel.clone(),
        };
        if let Some(previous) = lock(&self.current).replace(active) {
            previous.cancel.cancel();
        }
        cancel
    }

    /// Cancel the current generation, if any. Returns whether one was running.
    pub fn cancel_generation(&self) -> bool {
        match lock(&self.current).take() {
            Some(active) => {
                let running = !active.cancel.is_cancelled();
                active.cancel.cancel();
                running
            }
            None => false,
        }
    }

    fn send(&self, command: WorkerCommand) -> std::result::Result<(), ()> {
        self.commands.send(command).map_err(|_| {
            error!("Inference worker is gone");
        })
    }

}

fn lock(slot: &Mutex<Option<ActiveGeneration>>) -> MutexGuard<'_, Option<ActiveGeneration>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Free the slot if `id` still holds it; a newer generation keeps its place.
fn release_slot(slot: &Mutex<Option<ActiveGeneration>>, id: Uuid) {
    let mut current = lock(slot);
    if current.as_ref().is_some_and(|active| active.id == id) {
        *current = None;
    }
}

fn unavailable() -> BackendError {
    BackendError::Unavailable("inference worker stopped".to_string())
}

fn run(
    backend: Arc<dyn NativeBackend>,
    mut receiver: mpsc::UnboundedReceiver<WorkerCommand>,
    slot: Slot,
) {
    info!("Inference worker started ({})", backend.name());
    let mut resource: Option<ModelResource> = None;

    while let Some(command) = receiver.blocking_recv() {
        match command {
            WorkerCommand::Load {
                path,
                config,
                on_step,
                reply,
            } => {
                if resource.take().is_some() {
                    debug!("Releasing previous model before load");
                }
                let result = ModelResource::create(backend.as_ref(), &path, &config, on_step)
                    .map(|loaded| {
                        resource = Some(loaded);
                    });
                if let Err(e) = &result {
                    error!("Model construction failed: {}", e);
                }
                let _ = reply.send(result);
            }
            WorkerCommand::Unload { reply } => {
                let released = resource.take().is_some();
                let _ = reply.send(released);
            }
            WorkerCommand::Generate { job, reply } => {
                let outcome = generate(resource.as_mut(), &job);
                if let Err(e) = &outcome {
                    let _ = job.sink.send(Err(e.clone()));
                }
                // Before the sink drops, so a caller who saw the stream end
                // never finds this job still in the slot.
                release_slot(&slot, job.id);
                let _ = reply.send(outcome);
            }
        }
    }

    drop(resource);
    info!("Inference worker stopped");
}

fn generate(resource: Option<&mut ModelResource>, job: &GenerationJob) -> GenerationOutcome {
    let resource = resource.ok_or(GenerationError::ModelNotLoaded)?;
    GenerationEngine::new(resource).generate(&job.prompt, &job.params, &job.cancel, |fragment| {
        job.sink.send(Ok(fragment)).is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn job(
        worker: &InferenceWorker,
        prompt: &str,
    ) -> (GenerationJob, UnboundedReceiverStream<FragmentResult>) {
        let id = Uuid::new_v4();
        let (sink, rx) = mpsc::unbounded_channel();
        let job = GenerationJob {
            id,
            prompt: prompt.to_string(),
            params: GenerationParameters::default(),
            cancel: worker.begin_generation(id),
            sink,
        };
        (job, UnboundedReceiverStream::new(rx))
    }

    #[tokio::test]
    async fn test_load_generate_unload() {
        let backend = ScriptedBackend::new(["Wheel", " of", " Fortune"]);
        let worker = InferenceWorker::spawn(Arc::new(backend.clone())).expect("spawn");

        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        worker
            .load(
                PathBuf::from("model.gguf"),
                ModelConfig::default(),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .expect("load");
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert_eq!(backend.live_handles(), (1, 1, 1));

        let (job, stream) = job(&worker, "spin");
        let done = worker.submit(job).expect("submit");
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert!(done.await.expect("reply").is_ok());

        assert!(worker.unload().await.expect("unload"));
        assert!(!worker.unload().await.expect("unload"));
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_generate_without_model_reports_error_on_stream() {
        let worker = InferenceWorker::spawn(Arc::new(ScriptedBackend::new(["a"]))).expect("spawn");

        let (job, stream) = job(&worker, "hello");
        let done = worker.submit(job).expect("submit");
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items, vec![Err(GenerationError::ModelNotLoaded)]);
        assert_eq!(done.await.expect("reply"), Err(GenerationError::ModelNotLoaded));
    }

    #[tokio::test]
    async fn test_begin_generation_cancels_previous_token() {
        let worker = InferenceWorker::spawn(Arc::new(ScriptedBackend::new(["a"]))).expect("spawn");

        let first = worker.begin_generation(Uuid::new_v4());
        let second = worker.begin_generation(Uuid::new_v4());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        assert!(worker.cancel_generation());
        assert!(second.is_cancelled());
        assert!(!worker.cancel_generation());
    }

    #[tokio::test]
    async fn test_finished_generation_frees_the_slot() {
        let backend = ScriptedBackend::new(["a", "b"]);
        let worker = InferenceWorker::spawn(Arc::new(backend)).expect("spawn");
        worker
            .load(PathBuf::from("model.gguf"), ModelConfig::default(), Box::new(|_| {}))
            .await
            .expect("load");

        let (job, stream) = job(&worker, "hi");
        let done = worker.submit(job).expect("submit");
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);

        // The stream ending means the job is out of the slot.
        assert!(!worker.cancel_generation());
        assert!(done.await.expect("reply").is_ok());
    }

    #[tokio::test]
    async fn test_finished_job_does_not_free_a_newer_generation() {
        let worker = InferenceWorker::spawn(Arc::new(ScriptedBackend::new(["a"]))).expect("spawn");

        let (old, stream) = job(&worker, "old");
        let newer = worker.begin_generation(Uuid::new_v4());
        let done = worker.submit(old).expect("submit");
        let _: Vec<_> = stream.collect().await;
        let _ = done.await;

        assert!(!newer.is_cancelled());
        assert!(worker.cancel_generation());
        assert!(newer.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_nothing_behind() {
        let backend = ScriptedBackend::new(["a"]);
        let worker = InferenceWorker::spawn(Arc::new(backend.clone())).expect("spawn");

        backend.fail_sampler(true);
        let result = worker
            .load(PathBuf::from("m.gguf"), ModelConfig::default(), Box::new(|_| {}))
            .await;
        assert!(matches!(result, Err(BackendError::Sampler(_))));
        assert_eq!(backend.live_handles(), (0, 0, 0));
        assert!(!worker.unload().await.expect("unload"));
    }
}
