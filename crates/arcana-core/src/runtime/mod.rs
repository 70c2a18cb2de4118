//! Threading runtime for the native handles

mod worker;

pub use worker::{GenerationJob, GenerationOutcome, InferenceWorker, StepCallback};
