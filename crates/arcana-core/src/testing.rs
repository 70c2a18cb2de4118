//! Scripted in-process backend for tests
//!
//! Emits a fixed list of text pieces, one per sampled token, then an
//! end-of-generation token. Failures, delays and endless output can be
//! switched on per test, and live-handle counters expose leaks.

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{NativeBackend, NativeContext, NativeModel, NativeSampler, SamplerStage, TokenId};
use crate::capability::DeviceFacts;
use crate::config::{EngineConfig, ModelConfig};
use crate::error::BackendError;

/// Token id the scripted model treats as end-of-generation.
pub const EOG_TOKEN: TokenId = 0;

const PROMPT_TOKEN_BASE: TokenId = 10_000;

const FIXTURE_SIZE_BYTES: u64 = 64 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Write a small artifact into `dir` and return a config that finds and
/// accepts it as the bundled model.
pub fn model_fixture(dir: &Path) -> EngineConfig {
    let config = EngineConfig {
        bundled_model_dir: dir.to_path_buf(),
        fallback_model_dir: dir.join("fallback"),
        model_file_name: "fixture.gguf".to_string(),
        expected_model_size_bytes: FIXTURE_SIZE_BYTES,
        memory_overhead_bytes: 1024,
        ..EngineConfig::default()
    };
    if let Err(e) = std::fs::write(
        dir.join(&config.model_file_name),
        vec![0u8; FIXTURE_SIZE_BYTES as usize],
    ) {
        panic!("failed to write model fixture: {}", e);
    }
    config
}

/// An unlisted device with plenty of memory.
pub fn roomy_device() -> DeviceFacts {
    DeviceFacts {
        physical_memory_bytes: 16 * GIB,
        available_memory_bytes: 8 * GIB,
        hardware_id: "TestRig1,1".to_string(),
    }
}

#[derive(Default)]
struct Script {
    pieces: Vec<Vec<u8>>,
    endless: AtomicBool,
    token_delay_ms: AtomicU64,
    load_delay_ms: AtomicU64,
    fail_model: AtomicBool,
    fail_context: AtomicBool,
    fail_sampler: AtomicBool,
    fail_decode_at: Mutex<Option<usize>>,
    live_models: AtomicUsize,
    live_contexts: AtomicUsize,
    live_samplers: AtomicUsize,
    models_loaded: AtomicUsize,
    cache_clears: AtomicUsize,
    last_chain: Mutex<Vec<SamplerStage>>,
}

/// Cloneable handle; clones share one script and one set of counters.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<Script>,
}

impl ScriptedBackend {
    pub fn new<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Arc::new(Script {
                pieces: pieces
                    .into_iter()
                    .map(|piece| Into::<String>::into(piece).into_bytes())
                    .collect(),
                ..Script::default()
            }),
        }
    }

    /// Script raw token bytes, for pieces that split a UTF-8 character.
    pub fn from_bytes<I, B>(pieces: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Self {
            script: Arc::new(Script {
                pieces: pieces.into_iter().map(Into::into).collect(),
                ..Script::default()
            }),
        }
    }

    /// Cycle through the pieces forever instead of ending.
    pub fn endless(self) -> Self {
        self.script.endless.store(true, Ordering::SeqCst);
        self
    }

    /// Sleep inside every single-token decode.
    pub fn with_token_delay(self, delay: Duration) -> Self {
        self.script
            .token_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Sleep inside `load_model`.
    pub fn with_load_delay(self, delay: Duration) -> Self {
        self.script
            .load_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn fail_model(&self, fail: bool) {
        self.script.fail_model.store(fail, Ordering::SeqCst);
    }

    pub fn fail_context(&self, fail: bool) {
        self.script.fail_context.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sampler(&self, fail: bool) {
        self.script.fail_sampler.store(fail, Ordering::SeqCst);
    }

    /// Fail the n-th decode call of each generation (0 is the prompt).
    pub fn fail_decode_at(&self, call: Option<usize>) {
        *lock(&self.script.fail_decode_at) = call;
    }

    /// `(models, contexts, samplers)` currently alive.
    pub fn live_handles(&self) -> (usize, usize, usize) {
        (
            self.script.live_models.load(Ordering::SeqCst),
            self.script.live_contexts.load(Ordering::SeqCst),
            self.script.live_samplers.load(Ordering::SeqCst),
        )
    }

    /// Number of successful `load_model` calls so far.
    pub fn models_loaded(&self) -> usize {
        self.script.models_loaded.load(Ordering::SeqCst)
    }

    pub fn cache_clears(&self) -> usize {
        self.script.cache_clears.load(Ordering::SeqCst)
    }

    /// Chain installed by the most recent `reset_chain`.
    pub fn last_chain(&self) -> Vec<SamplerStage> {
        lock(&self.script.last_chain).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn pause(millis: u64) {
    if millis > 0 {
        std::thread::sleep(Duration::from_millis(millis));
    }
}

impl NativeBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load_model(
        &self,
        _path: &Path,
        _config: &ModelConfig,
    ) -> Result<Box<dyn NativeModel>, BackendError> {
        pause(self.script.load_delay_ms.load(Ordering::SeqCst));
        if self.script.fail_model.load(Ordering::SeqCst) {
            return Err(BackendError::ModelLoad("scripted model failure".into()));
        }
        self.script.models_loaded.fetch_add(1, Ordering::SeqCst);
        self.script.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedModel {
    script: Arc<Script>,
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.script.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NativeModel for ScriptedModel {
    fn new_context(&self, config: &ModelConfig) -> Result<Box<dyn NativeContext>, BackendError> {
        if self.script.fail_context.load(Ordering::SeqCst) {
            return Err(BackendError::Context("scripted context failure".into()));
        }
        self.script.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            script: self.script.clone(),
            n_ctx: config.context_size,
            step: 0,
            decode_calls: 0,
        }))
    }

    fn new_sampler(&self) -> Result<Box<dyn NativeSampler>, BackendError> {
        if self.script.fail_sampler.load(Ordering::SeqCst) {
            return Err(BackendError::Sampler("scripted sampler failure".into()));
        }
        self.script.live_samplers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSampler {
            script: self.script.clone(),
            configured: false,
        }))
    }

    /// One token per whitespace-separated word.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError> {
        if text.contains('\0') {
            return Err(BackendError::Tokenize("NUL byte in prompt".into()));
        }
        Ok((0..text.split_whitespace().count())
            .map(|i| PROMPT_TOKEN_BASE + i as TokenId)
            .collect())
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        let index = (token - 1) as usize;
        self.script
            .pieces
            .get(index)
            .cloned()
            .ok_or_else(|| BackendError::Detokenize(format!("unknown token {}", token)))
    }
}

struct ScriptedContext {
    script: Arc<Script>,
    n_ctx: u32,
    /// Generated tokens decoded since the prompt
    step: usize,
    decode_calls: usize,
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.script.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NativeContext for ScriptedContext {
    fn context_size(&self) -> u32 {
        self.n_ctx
    }

    fn clear_cache(&mut self) {
        self.script.cache_clears.fetch_add(1, Ordering::SeqCst);
        self.step = 0;
        self.decode_calls = 0;
    }

    fn decode(&mut self, tokens: &[TokenId], start_pos: u32) -> Result<(), BackendError> {
        let call = self.decode_calls;
        self.decode_calls += 1;
        if *lock(&self.script.fail_decode_at) == Some(call) {
            return Err(BackendError::Decode(format!("scripted failure at call {}", call)));
        }
        if start_pos as usize + tokens.len() > self.n_ctx as usize {
            return Err(BackendError::Decode("position beyond context window".into()));
        }

        if start_pos > 0 {
            pause(self.script.token_delay_ms.load(Ordering::SeqCst));
            self.step += tokens.len();
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct ScriptedSampler {
    script: Arc<Script>,
    configured: bool,
}

impl Drop for ScriptedSampler {
    fn drop(&mut self) {
        self.script.live_samplers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NativeSampler for ScriptedSampler {
    fn reset_chain(&mut self, stages: &[SamplerStage]) -> Result<(), BackendError> {
        *lock(&self.script.last_chain) = stages.to_vec();
        self.configured = !stages.is_empty();
        Ok(())
    }

    fn sample(&mut self, context: &mut dyn NativeContext) -> Result<TokenId, BackendError> {
        if !self.configured {
            return Err(BackendError::Sampler("chain not configured".into()));
        }
        let context = context
            .as_any_mut()
            .downcast_mut::<ScriptedContext>()
            .ok_or_else(|| BackendError::Sampler("foreign context".into()))?;

        let pieces = self.script.pieces.len();
        let step = context.step;
        if step < pieces {
            Ok(step as TokenId + 1)
        } else if pieces > 0 && self.script.endless.load(Ordering::SeqCst) {
            Ok((step % pieces) as TokenId + 1)
        } else {
            Ok(EOG_TOKEN)
        }
    }
}
