//! The loaded native model, its context and its sampler, as one unit

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::backend::{NativeBackend, NativeContext, NativeModel, NativeSampler};
use crate::config::ModelConfig;
use crate::error::BackendError;

/// Milestones of [`ModelResource::create`], reported as they complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionStep {
    ModelLoaded,
    ContextCreated,
    SamplerCreated,
}

/// Exclusively owned model + context + sampler.
///
/// Either all three handles are live or none are. Fields are declared in
/// release order (sampler, context, model) so dropping the resource frees
/// them in reverse order of creation.
pub struct ModelResource {
    sampler: Box<dyn NativeSampler>,
    context: Box<dyn NativeContext>,
    model: Box<dyn NativeModel>,
    path: PathBuf,
}

/// Mutable view of the three handles, borrowed for one generation
pub struct ResourceParts<'a> {
    pub model: &'a dyn NativeModel,
    pub context: &'a mut dyn NativeContext,
    pub sampler: &'a mut dyn NativeSampler,
}

impl ModelResource {
    /// Construct all three handles. On any failure, the handles already
    /// created are released (context before model) before the error returns.
    pub fn create(
        backend: &dyn NativeBackend,
        path: &Path,
        config: &ModelConfig,
        mut on_step: impl FnMut(ConstructionStep),
    ) -> Result<Self, BackendError> {
        info!("Loading model from {:?} with {}", path, backend.name());

        let model = backend.load_model(path, config)?;
        on_step(ConstructionStep::ModelLoaded);

        let context = match model.new_context(config) {
            Ok(context) => context,
            Err(e) => {
                release_partial(None, model);
                return Err(e);
            }
        };
        on_step(ConstructionStep::ContextCreated);

        let sampler = match model.new_sampler() {
            Ok(sampler) => sampler,
            Err(e) => {
                release_partial(Some(context), model);
                return Err(e);
            }
        };
        on_step(ConstructionStep::SamplerCreated);

        Ok(Self {
            sampler,
            context,
            model,
            path: path.to_path_buf(),
        })
    }

    pub fn parts(&mut self) -> ResourceParts<'_> {
        ResourceParts {
            model: self.model.as_ref(),
            context: self.context.as_mut(),
            sampler: self.sampler.as_mut(),
        }
    }
}

impl Drop for ModelResource {
    fn drop(&mut self) {
        debug!("Releasing model resource for {:?}", self.path);
    }
}

/// Rollback for a construction that failed part-way.
fn release_partial(context: Option<Box<dyn NativeContext>>, model: Box<dyn NativeModel>) {
    debug!(
        "Rolling back partial model construction (context created: {})",
        context.is_some()
    );
    drop(context);
    drop(model);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_create_reports_steps_in_order() {
        let backend = ScriptedBackend::new(["a"]);
        let mut steps = Vec::new();
        let resource = ModelResource::create(
            &backend,
            Path::new("model.gguf"),
            &ModelConfig::default(),
            |step| steps.push(step),
        )
        .expect("created");

        assert_eq!(
            steps,
            vec![
                ConstructionStep::ModelLoaded,
                ConstructionStep::ContextCreated,
                ConstructionStep::SamplerCreated
            ]
        );
        assert_eq!(backend.live_handles(), (1, 1, 1));
        drop(resource);
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }

    #[test]
    fn test_context_failure_releases_model() {
        let backend = ScriptedBackend::new(["a"]);
        backend.fail_context(true);

        let result = ModelResource::create(
            &backend,
            Path::new("model.gguf"),
            &ModelConfig::default(),
            |_| {},
        );
        assert!(matches!(result, Err(BackendError::Context(_))));
        assert_eq!(backend.models_loaded(), 1);
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }

    #[test]
    fn test_sampler_failure_releases_context_and_model() {
        let backend = ScriptedBackend::new(["a"]);
        backend.fail_sampler(true);

        let result = ModelResource::create(
            &backend,
            Path::new("model.gguf"),
            &ModelConfig::default(),
            |_| {},
        );
        assert!(matches!(result, Err(BackendError::Sampler(_))));
        assert_eq!(backend.live_handles(), (0, 0, 0));
    }
}
