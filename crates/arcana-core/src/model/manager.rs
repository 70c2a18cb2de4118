//! Model lifecycle management

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::artifact::{locate_artifact, ModelArtifactDescriptor};
use super::resource::ConstructionStep;
use super::state::ModelLifecycleState;
use crate::backend::NativeBackend;
use crate::capability::{CapabilityGate, CapabilitySnapshot, CapabilityVerdict, DeviceProbe};
use crate::config::EngineConfig;
use crate::error::{ModelError, Result};
use crate::runtime::InferenceWorker;

/// Owns the single model slot and its observable state.
///
/// `load()` and `unload()` never interleave: `load()` first claims the state
/// machine by moving `NotLoaded` to `Checking` (so concurrent callers are
/// turned away), then both run under the same transition lock.
pub struct ModelLifecycleManager {
    config: EngineConfig,
    gate: CapabilityGate,
    probe: Arc<dyn DeviceProbe>,
    worker: InferenceWorker,
    state: Arc<watch::Sender<ModelLifecycleState>>,
    transition: Mutex<()>,
}

enum Claim {
    Claimed,
    AlreadyLoaded,
    Busy,
    Failed(ModelError),
}

impl ModelLifecycleManager {
    /// Create a manager and start its inference worker thread.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn NativeBackend>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Result<Self> {
        let worker = InferenceWorker::spawn(backend)?;
        let (state, _) = watch::channel(ModelLifecycleState::NotLoaded);

        Ok(Self {
            gate: CapabilityGate::new(&config.capability),
            config,
            probe,
            worker,
            state: Arc::new(state),
            transition: Mutex::new(()),
        })
    }

    pub fn state(&self) -> ModelLifecycleState {
        self.state.borrow().clone()
    }

    /// Observe every state change, load progress included.
    pub fn subscribe(&self) -> watch::Receiver<ModelLifecycleState> {
        self.state.subscribe()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.borrow().is_loaded()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker(&self) -> &InferenceWorker {
        &self.worker
    }

    /// Fresh device reading and the gate's verdict on it.
    pub fn capability(&self) -> (CapabilitySnapshot, CapabilityVerdict) {
        let snapshot = self.gate.snapshot(self.probe.as_ref());
        let verdict = self.gate.evaluate(&snapshot);
        (snapshot, verdict)
    }

    /// Gate check plus artifact lookup, without loading anything.
    ///
    /// On failure the state becomes `Error(DeviceNotSupported | ModelNotFound)`,
    /// unless a load currently owns the state machine.
    pub fn check_availability(&self) -> bool {
        if self.is_loaded() {
            return true;
        }

        let result = self.check_device().and_then(|_| self.find_artifact().map(|_| ()));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Local inference unavailable: {}", e);
                self.state.send_if_modified(|state| {
                    if state.is_busy() || state.is_loaded() {
                        return false;
                    }
                    *state = ModelLifecycleState::Error(e);
                    true
                });
                false
            }
        }
    }

    /// Load the model. Succeeds immediately when already loaded; returns
    /// `AlreadyLoading` while another load runs, and the stored error while
    /// in `Error` (call [`reset_error`](Self::reset_error) to retry).
    pub async fn load(&self) -> std::result::Result<(), ModelError> {
        match self.claim() {
            Claim::Claimed => {}
            Claim::AlreadyLoaded => return Ok(()),
            Claim::Busy => {
                debug!("Load requested while another load is in progress");
                return Err(ModelError::AlreadyLoading);
            }
            Claim::Failed(e) => return Err(e),
        }

        let _transition = self.transition.lock().await;
        info!("Loading model");

        match self.run_load().await {
            Ok(()) => {
                self.state.send_replace(ModelLifecycleState::Loaded);
                info!("Model loaded");
                Ok(())
            }
            Err(e) => {
                warn!("Model load failed: {}", e);
                self.state.send_replace(ModelLifecycleState::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Release the model if one is loaded. Safe to call in any state; an
    /// in-progress load finishes first.
    pub async fn unload(&self) {
        let _transition = self.transition.lock().await;
        self.release().await;
    }

    /// Drop the worker's resource and settle the state. Caller holds the
    /// transition lock.
    async fn release(&self) {
        match self.worker.unload().await {
            Ok(true) => info!("Model unloaded"),
            Ok(false) => debug!("Unload requested with no model loaded"),
            Err(e) => warn!("Unload could not reach the inference worker: {}", e),
        }

        self.state.send_if_modified(|state| {
            if state.is_busy() || *state == ModelLifecycleState::NotLoaded {
                return false;
            }
            *state = ModelLifecycleState::NotLoaded;
            true
        });
    }

    /// Unload, then load again. Used once a generation left the native
    /// context in an unknown state.
    pub async fn reload(&self) -> std::result::Result<(), ModelError> {
        info!("Reloading model");
        self.unload().await;
        self.load().await
    }

    /// Evict the model: cancel any running generation, then unload.
    /// Returns whether a loaded model was evicted; a load in progress is
    /// left alone.
    pub async fn on_memory_pressure(&self) -> bool {
        if !self.is_loaded() {
            debug!("Memory pressure with no model loaded");
            return false;
        }

        let _transition = self.transition.lock().await;
        // Leave `Loaded` before touching the slot so no new generation can
        // slip in between the cancel and the unload.
        let evicting = self.state.send_if_modified(|state| {
            if !state.is_loaded() {
                return false;
            }
            *state = ModelLifecycleState::NotLoaded;
            true
        });
        if !evicting {
            debug!("Model left the loaded state before eviction");
            return false;
        }

        warn!("Memory pressure, evicting model");
        if self.worker.cancel_generation() {
            debug!("Cancelled in-flight generation for eviction");
        }
        self.release().await;
        true
    }

    /// Leave `Error` for `NotLoaded` so a new load may be attempted.
    pub fn reset_error(&self) -> std::result::Result<(), ModelError> {
        let mut current = ModelLifecycleState::NotLoaded;
        let reset = self.state.send_if_modified(|state| {
            if let ModelLifecycleState::Error(_) = state {
                *state = ModelLifecycleState::NotLoaded;
                true
            } else {
                current = state.clone();
                false
            }
        });

        if reset {
            info!("Lifecycle error cleared");
            Ok(())
        } else {
            Err(ModelError::InvalidTransition(format!(
                "reset_error is only valid from error, state is {}",
                current
            )))
        }
    }

    fn claim(&self) -> Claim {
        let mut claim = Claim::Claimed;
        self.state.send_if_modified(|state| match state {
            ModelLifecycleState::NotLoaded => {
                *state = ModelLifecycleState::Checking;
                true
            }
            ModelLifecycleState::Loaded => {
                claim = Claim::AlreadyLoaded;
                false
            }
            ModelLifecycleState::Checking | ModelLifecycleState::Loading { .. } => {
                claim = Claim::Busy;
                false
            }
            ModelLifecycleState::Error(e) => {
                claim = Claim::Failed(e.clone());
                false
            }
        });
        claim
    }

    async fn run_load(&self) -> std::result::Result<(), ModelError> {
        let snapshot = self.check_device()?;

        let required = self.config.working_set_bytes();
        let available = snapshot.available_memory_bytes;
        if available == 0 {
            warn!("Available memory unknown, skipping headroom check");
        } else if available < required {
            return Err(ModelError::InsufficientMemory {
                available,
                required,
            });
        }

        let path = self.find_artifact()?;
        self.advance(0.1);

        let descriptor = ModelArtifactDescriptor::new(
            &path,
            self.config.expected_model_size_bytes,
            self.config.size_tolerance,
        );
        let size = descriptor.verify()?;
        debug!("Artifact {:?} verified ({} bytes)", path, size);
        self.advance(0.3);

        let state = self.state.clone();
        self.worker
            .load(
                path,
                self.config.model.clone(),
                Box::new(move |step| advance(&state, step_progress(step))),
            )
            .await
            .map_err(|e| ModelError::LoadingFailed(e.to_string()))
    }

    fn check_device(&self) -> std::result::Result<CapabilitySnapshot, ModelError> {
        let snapshot = self.gate.snapshot(self.probe.as_ref());
        let verdict = self.gate.evaluate(&snapshot);
        if verdict.capable {
            Ok(snapshot)
        } else {
            Err(ModelError::DeviceNotSupported(
                verdict.reason.unwrap_or_default(),
            ))
        }
    }

    fn find_artifact(&self) -> std::result::Result<std::path::PathBuf, ModelError> {
        locate_artifact(&self.config.artifact_candidates()).ok_or(ModelError::ModelNotFound)
    }

    fn advance(&self, progress: f32) {
        advance(&self.state, progress);
    }
}

/// Move load progress forward, never backward.
fn advance(state: &watch::Sender<ModelLifecycleState>, progress: f32) {
    state.send_if_modified(|current| match current {
        ModelLifecycleState::Loading { progress: p } if *p >= progress => false,
        ModelLifecycleState::Loading { progress: p } => {
            *p = progress;
            true
        }
        ModelLifecycleState::Checking => {
            *current = ModelLifecycleState::Loading { progress };
            true
        }
        _ => false,
    });
}

fn step_progress(step: ConstructionStep) -> f32 {
    match step {
        ConstructionStep::ModelLoaded => 0.7,
        ConstructionStep::ContextCreated => 0.85,
        ConstructionStep::SamplerCreated => 0.95,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::DeviceFacts;
    use crate::testing::{model_fixture, roomy_device, ScriptedBackend};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn manager(
        backend: &ScriptedBackend,
        config: EngineConfig,
        device: DeviceFacts,
    ) -> ModelLifecycleManager {
        ModelLifecycleManager::new(config, Arc::new(backend.clone()), Arc::new(device))
            .expect("manager")
    }

    #[tokio::test]
    async fn test_load_and_unload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = manager(&backend, model_fixture(dir.path()), roomy_device());

        assert_ok!(manager.load().await);
        assert_eq!(manager.state(), ModelLifecycleState::Loaded);
        assert_eq!(backend.live_handles(), (1, 1, 1));

        // A second load is a no-op.
        assert_ok!(manager.load().await);
        assert_eq!(backend.models_loaded(), 1);

        manager.unload().await;
        assert_eq!(manager.state(), ModelLifecycleState::NotLoaded);
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = manager(&backend, model_fixture(dir.path()), roomy_device());

        manager.unload().await;
        manager.unload().await;
        assert_eq!(manager.state(), ModelLifecycleState::NotLoaded);
    }

    #[tokio::test]
    async fn test_concurrent_load_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]).with_load_delay(Duration::from_millis(200));
        let manager = Arc::new(manager(&backend, model_fixture(dir.path()), roomy_device()));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.load().await }
        });

        let mut states = manager.subscribe();
        states
            .wait_for(|s| matches!(s, ModelLifecycleState::Loading { .. }))
            .await
            .expect("loading");

        assert_eq!(manager.load().await, Err(ModelError::AlreadyLoading));
        assert_eq!(first.await.expect("join"), Ok(()));
        assert_eq!(backend.models_loaded(), 1);
        assert_eq!(manager.state(), ModelLifecycleState::Loaded);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = Arc::new(manager(&backend, model_fixture(dir.path()), roomy_device()));

        let mut states = manager.subscribe();
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                let done = !state.is_busy();
                seen.push(state);
                if done {
                    break;
                }
            }
            seen
        });

        manager.load().await.expect("load");
        let seen = observer.await.expect("join");

        let progress: Vec<f32> = seen.iter().map(|s| s.progress()).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
        assert_eq!(seen.last(), Some(&ModelLifecycleState::Loaded));
    }

    #[tokio::test]
    async fn test_context_failure_leaves_no_stale_resource() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = manager(&backend, model_fixture(dir.path()), roomy_device());

        backend.fail_context(true);
        let result = manager.load().await;
        assert!(matches!(result, Err(ModelError::LoadingFailed(_))));
        assert!(matches!(
            manager.state(),
            ModelLifecycleState::Error(ModelError::LoadingFailed(_))
        ));
        assert_eq!(backend.live_handles(), (0, 0, 0));

        // Error is sticky until reset.
        backend.fail_context(false);
        assert!(matches!(
            manager.load().await,
            Err(ModelError::LoadingFailed(_))
        ));

        manager.reset_error().expect("reset");
        manager.load().await.expect("load");
        assert_eq!(backend.models_loaded(), 2);
        assert_eq!(backend.live_handles(), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_unsupported_device() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let device = DeviceFacts {
            physical_memory_bytes: 4 * 1024 * 1024 * 1024,
            available_memory_bytes: 2 * 1024 * 1024 * 1024,
            hardware_id: "iPhone12,1".to_string(),
        };
        let manager = manager(&backend, model_fixture(dir.path()), device);

        assert!(!manager.check_availability());
        assert!(matches!(
            manager.state(),
            ModelLifecycleState::Error(ModelError::DeviceNotSupported(_))
        ));
        assert!(matches!(
            manager.load().await,
            Err(ModelError::DeviceNotSupported(_))
        ));
        assert_eq!(backend.models_loaded(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_headroom() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let config = model_fixture(dir.path());
        let required = config.working_set_bytes();
        let device = DeviceFacts {
            available_memory_bytes: required - 1,
            ..roomy_device()
        };
        let manager = manager(&backend, config, device);

        assert_eq!(
            manager.load().await,
            Err(ModelError::InsufficientMemory {
                available: required - 1,
                required
            })
        );
        assert!(manager.state().error().is_some_and(ModelError::is_retryable));
    }

    #[tokio::test]
    async fn test_missing_and_corrupted_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let mut config = model_fixture(dir.path());
        config.model_file_name = "absent.gguf".to_string();
        let manager = manager(&backend, config, roomy_device());

        assert!(!manager.check_availability());
        assert_eq!(
            manager.state(),
            ModelLifecycleState::Error(ModelError::ModelNotFound)
        );

        let mut config = model_fixture(dir.path());
        config.expected_model_size_bytes *= 2;
        let manager = self::manager(&backend, config, roomy_device());
        assert!(matches!(
            manager.load().await,
            Err(ModelError::ModelCorrupted { .. })
        ));
        assert_eq!(backend.models_loaded(), 0);
    }

    #[tokio::test]
    async fn test_reset_error_only_from_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = manager(&backend, model_fixture(dir.path()), roomy_device());

        assert!(matches!(
            manager.reset_error(),
            Err(ModelError::InvalidTransition(_))
        ));
        manager.load().await.expect("load");
        assert_err!(manager.reset_error());
        assert_eq!(manager.state(), ModelLifecycleState::Loaded);
    }

    #[tokio::test]
    async fn test_memory_pressure_evicts_loaded_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = manager(&backend, model_fixture(dir.path()), roomy_device());

        assert!(!manager.on_memory_pressure().await);

        manager.load().await.expect("load");
        assert!(manager.on_memory_pressure().await);
        assert_eq!(manager.state(), ModelLifecycleState::NotLoaded);
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_unload_waits_for_running_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]).with_load_delay(Duration::from_millis(200));
        let manager = Arc::new(manager(&backend, model_fixture(dir.path()), roomy_device()));

        let load = tokio::spawn({
            let manager = manager.clone();
            async move { manager.load().await }
        });

        let mut states = manager.subscribe();
        states
            .wait_for(|s| matches!(s, ModelLifecycleState::Loading { .. }))
            .await
            .expect("loading");

        manager.unload().await;
        assert_ok!(load.await.expect("join"));
        assert_eq!(manager.state(), ModelLifecycleState::NotLoaded);
        assert_eq!(backend.models_loaded(), 1);
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_memory_pressure_during_load_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]).with_load_delay(Duration::from_millis(200));
        let manager = Arc::new(manager(&backend, model_fixture(dir.path()), roomy_device()));

        let load = tokio::spawn({
            let manager = manager.clone();
            async move { manager.load().await }
        });

        let mut states = manager.subscribe();
        states
            .wait_for(|s| matches!(s, ModelLifecycleState::Loading { .. }))
            .await
            .expect("loading");

        assert!(!manager.on_memory_pressure().await);
        assert_ok!(load.await.expect("join"));
        assert_eq!(manager.state(), ModelLifecycleState::Loaded);
        assert_eq!(backend.live_handles(), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_eviction_leaves_loaded_before_unloading() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = Arc::new(manager(&backend, model_fixture(dir.path()), roomy_device()));
        manager.load().await.expect("load");

        let mut states = manager.subscribe();
        states.borrow_and_update();
        assert!(manager.on_memory_pressure().await);

        // The only change published is the single step out of `Loaded`.
        assert!(states.has_changed().expect("sender alive"));
        assert_eq!(*states.borrow_and_update(), ModelLifecycleState::NotLoaded);
        assert!(!states.has_changed().expect("sender alive"));
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_reload_builds_a_fresh_resource() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = ScriptedBackend::new(["a"]);
        let manager = manager(&backend, model_fixture(dir.path()), roomy_device());

        manager.load().await.expect("load");
        manager.reload().await.expect("reload");
        assert_eq!(backend.models_loaded(), 2);
        assert_eq!(backend.live_handles(), (1, 1, 1));
    }
}
