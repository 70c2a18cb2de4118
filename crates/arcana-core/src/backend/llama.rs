//! llama.cpp backend via `llama-cpp-2`
//!
//! `LlamaContext` borrows the `LlamaModel` it was created from, which does
//! not fit a resource that owns both. The context wrapper therefore keeps its
//! own `Arc` to the model and stores the context with an erased lifetime.
//! Its `Drop` impl frees the context explicitly, so the model outlives it no
//! matter how the fields are ordered.

use std::any::Any;
use std::mem::ManuallyDrop;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tracing::{info, warn};

use super::{NativeBackend, NativeContext, NativeModel, NativeSampler, SamplerStage, TokenId};
use crate::config::ModelConfig;
use crate::error::BackendError;

/// llama.cpp treats any layer count above the model's depth as "all layers".
const ALL_GPU_LAYERS: u32 = 999;

/// Owns the process-wide llama.cpp backend. Create exactly one per process.
pub struct LlamaCppBackend {
    backend: Arc<LlamaBackend>,
}

impl LlamaCppBackend {
    pub fn new() -> Result<Self, BackendError> {
        let backend = LlamaBackend::init().map_err(|e| BackendError::Init(e.to_string()))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl NativeBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn load_model(
        &self,
        path: &Path,
        config: &ModelConfig,
    ) -> Result<Box<dyn NativeModel>, BackendError> {
        let gpu_layers = if config.offloads_all_layers() {
            ALL_GPU_LAYERS
        } else {
            config.gpu_layers as u32
        };

        if !config.use_mmap {
            warn!("use_mmap = false is not exposed by llama-cpp-2; the file stays memory-mapped");
        }

        let params = LlamaModelParams::default()
            .with_n_gpu_layers(gpu_layers)
            .with_use_mlock(config.use_mlock);

        let model = LlamaModel::load_from_file(&self.backend, path, &params)
            .map_err(|e| BackendError::ModelLoad(format!("{}: {}", path.display(), e)))?;

        info!(
            "llama.cpp model loaded from {:?} ({} GPU layers)",
            path, gpu_layers
        );

        Ok(Box::new(LlamaNativeModel {
            model: Arc::new(model),
            backend: self.backend.clone(),
        }))
    }
}

struct LlamaNativeModel {
    model: Arc<LlamaModel>,
    backend: Arc<LlamaBackend>,
}

impl NativeModel for LlamaNativeModel {
    fn new_context(&self, config: &ModelConfig) -> Result<Box<dyn NativeContext>, BackendError> {
        let threads = config.threads.max(1) as i32;
        let params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.context_size))
            .with_n_batch(config.batch_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let context = self
            .model
            .new_context(&self.backend, params)
            .map_err(|e| BackendError::Context(e.to_string()))?;

        // SAFETY: the context borrows `*self.model`, which lives in an `Arc`
        // heap allocation that never moves. `LlamaNativeContext` holds a clone
        // of that `Arc` and its `Drop` impl frees the context while that clone
        // is still alive.
        let context: LlamaContext<'static> = unsafe { std::mem::transmute(context) };

        let n_batch = config.batch_size.max(1) as usize;
        Ok(Box::new(LlamaNativeContext {
            context: ManuallyDrop::new(context),
            batch: LlamaBatch::new(n_batch, 1),
            n_batch,
            n_ctx: config.context_size,
            _model: self.model.clone(),
        }))
    }

    fn new_sampler(&self) -> Result<Box<dyn NativeSampler>, BackendError> {
        Ok(Box::new(LlamaNativeSampler {
            chain: LlamaSampler::greedy(),
        }))
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        self.model
            .str_to_token(text, AddBos::Always)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| BackendError::Tokenize(e.to_string()))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| BackendError::Detokenize(e.to_string()))
    }
}

/// A context plus the model reference that keeps its borrow valid.
///
/// `context` really borrows `*_model`. It is only ever released by the `Drop`
/// impl below, which runs before any field (the `Arc` included) is dropped.
struct LlamaNativeContext {
    context: ManuallyDrop<LlamaContext<'static>>,
    batch: LlamaBatch,
    n_batch: usize,
    n_ctx: u32,
    _model: Arc<LlamaModel>,
}

impl Drop for LlamaNativeContext {
    fn drop(&mut self) {
        // SAFETY: `context` is not used again, and `_model` is dropped only
        // after this body returns.
        unsafe { ManuallyDrop::drop(&mut self.context) }
    }
}

impl NativeContext for LlamaNativeContext {
    fn context_size(&self) -> u32 {
        self.n_ctx
    }

    fn clear_cache(&mut self) {
        self.context.clear_kv_cache();
    }

    fn decode(&mut self, tokens: &[TokenId], start_pos: u32) -> Result<(), BackendError> {
        let last = tokens.len().saturating_sub(1);

        // llama.cpp rejects batches larger than n_batch, so long prompts go
        // through in slices; only the final token requests logits.
        for (chunk_index, chunk) in tokens.chunks(self.n_batch).enumerate() {
            self.batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let index = chunk_index * self.n_batch + offset;
                let position = start_pos as i32 + index as i32;
                self.batch
                    .add(LlamaToken::new(token), position, &[0], index == last)
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
            }
            self.context
                .decode(&mut self.batch)
                .map_err(|e| BackendError::Decode(e.to_string()))?;
        }

        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct LlamaNativeSampler {
    chain: LlamaSampler,
}

impl NativeSampler for LlamaNativeSampler {
    fn reset_chain(&mut self, stages: &[SamplerStage]) -> Result<(), BackendError> {
        let samplers: Vec<LlamaSampler> = stages
            .iter()
            .map(|stage| match *stage {
                SamplerStage::Temperature(t) => LlamaSampler::temp(t),
                SamplerStage::TopK(k) => LlamaSampler::top_k(k),
                SamplerStage::TopP(p) => LlamaSampler::top_p(p, 1),
                SamplerStage::RepetitionPenalty { last_n, penalty } => {
                    LlamaSampler::penalties(last_n, penalty, 0.0, 0.0)
                }
                SamplerStage::Distribution { seed } => LlamaSampler::dist(seed),
            })
            .collect();

        if samplers.is_empty() {
            return Err(BackendError::Sampler("empty sampler chain".to_string()));
        }

        self.chain = LlamaSampler::chain_simple(samplers);
        Ok(())
    }

    fn sample(&mut self, context: &mut dyn NativeContext) -> Result<TokenId, BackendError> {
        let context = context
            .as_any_mut()
            .downcast_mut::<LlamaNativeContext>()
            .ok_or_else(|| {
                BackendError::Sampler("sampler used with a non-llama context".to_string())
            })?;

        // `sample` also feeds the token back into the chain's history.
        let token = self.chain.sample(&context.context, -1);
        Ok(token.0)
    }
}
