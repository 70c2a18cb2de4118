//! Configuration types for the Arcana inference engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::generation::GenerationParameters;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Read-only directory the model ships in
    #[serde(default = "default_bundled_model_dir")]
    pub bundled_model_dir: PathBuf,

    /// Writable directory checked when the bundled copy is missing (side-loading)
    #[serde(default = "default_fallback_model_dir")]
    pub fallback_model_dir: PathBuf,

    /// File name of the GGUF artifact in either directory
    #[serde(default = "default_model_file_name")]
    pub model_file_name: String,

    /// Size the artifact is expected to have on disk
    #[serde(default = "default_expected_model_size_bytes")]
    pub expected_model_size_bytes: u64,

    /// Accepted relative deviation from the expected size
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: f64,

    /// Working memory needed on top of the model file (KV cache, scratch buffers)
    #[serde(default = "default_memory_overhead_bytes")]
    pub memory_overhead_bytes: u64,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub capability: CapabilityConfig,

    /// Sampling defaults applied when a request leaves a parameter out
    #[serde(default)]
    pub generation: GenerationParameters,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bundled_model_dir: default_bundled_model_dir(),
            fallback_model_dir: default_fallback_model_dir(),
            model_file_name: default_model_file_name(),
            expected_model_size_bytes: default_expected_model_size_bytes(),
            size_tolerance: default_size_tolerance(),
            memory_overhead_bytes: default_memory_overhead_bytes(),
            model: ModelConfig::default(),
            capability: CapabilityConfig::default(),
            generation: GenerationParameters::default(),
        }
    }
}

impl EngineConfig {
    /// Artifact locations in lookup order: bundled first, then fallback.
    pub fn artifact_candidates(&self) -> [PathBuf; 2] {
        [
            self.bundled_model_dir.join(&self.model_file_name),
            self.fallback_model_dir.join(&self.model_file_name),
        ]
    }

    /// Memory the loaded model is estimated to occupy.
    pub fn working_set_bytes(&self) -> u64 {
        self.expected_model_size_bytes
            .saturating_add(self.memory_overhead_bytes)
    }
}

fn default_bundled_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_fallback_model_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("arcana")
        .join("models")
}

fn default_model_file_name() -> String {
    "arcana-reader-1.5b-q4_k_m.gguf".to_string()
}

fn default_expected_model_size_bytes() -> u64 {
    1_117_320_736
}

fn default_size_tolerance() -> f64 {
    0.05
}

fn default_memory_overhead_bytes() -> u64 {
    512 * MIB
}

/// Native model and context settings, fixed for the lifetime of one load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Context window in tokens (prompt + generated)
    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// Layers offloaded to the GPU: 0 = CPU only, negative = all
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: i32,

    /// Threads used for decoding
    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Maximum tokens submitted to a single native decode call
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Memory-map the model file instead of reading it
    #[serde(default = "default_use_mmap")]
    pub use_mmap: bool,

    /// Pin model pages in RAM
    #[serde(default)]
    pub use_mlock: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_size: default_context_size(),
            gpu_layers: default_gpu_layers(),
            threads: default_threads(),
            batch_size: default_batch_size(),
            use_mmap: default_use_mmap(),
            use_mlock: false,
        }
    }
}

impl ModelConfig {
    pub fn offloads_all_layers(&self) -> bool {
        self.gpu_layers < 0
    }
}

fn default_context_size() -> u32 {
    2048
}

fn default_gpu_layers() -> i32 {
    // Apple GPUs share memory with the CPU, so full offload costs nothing extra.
    if cfg!(target_os = "macos") || cfg!(target_os = "ios") {
        -1
    } else {
        0
    }
}

fn default_threads() -> u32 {
    get_num_cpus().min(4) as u32
}

fn default_batch_size() -> u32 {
    512
}

fn default_use_mmap() -> bool {
    true
}

/// Device requirements for attempting local inference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Hardware identifiers known to run the model well
    #[serde(default = "default_allowed_hardware")]
    pub allowed_hardware: Vec<String>,

    /// Physical memory that qualifies an unlisted device
    #[serde(default = "default_min_physical_memory_bytes")]
    pub min_physical_memory_bytes: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            allowed_hardware: default_allowed_hardware(),
            min_physical_memory_bytes: default_min_physical_memory_bytes(),
        }
    }
}

fn default_allowed_hardware() -> Vec<String> {
    [
        // iPhone 15 Pro / Pro Max
        "iPhone16,1",
        "iPhone16,2",
        // iPhone 16 family
        "iPhone17,1",
        "iPhone17,2",
        "iPhone17,3",
        "iPhone17,4",
        // iPad Pro (M4)
        "iPad16,3",
        "iPad16,4",
        "iPad16,5",
        "iPad16,6",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_physical_memory_bytes() -> u64 {
    8 * GIB
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Load the model at startup instead of on the first request to `/v1/model/load`
    #[serde(default)]
    pub preload: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
            cors_origins: vec!["*".to_string()],
            preload: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

fn default_cors_enabled() -> bool {
    true
}

fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}
