//! Token-by-token generation against a loaded [`ModelResource`]

use encoding_rs::{CoderResult, Decoder, UTF_8};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::params::GenerationParameters;
use crate::backend::{NativeContext, SamplerStage, TokenId};
use crate::error::GenerationError;
use crate::model::{ModelResource, ResourceParts};

/// One piece of generated text, in emission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextFragment {
    pub index: u32,
    pub text: String,
}

/// Why a successful generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model produced an end-of-generation token
    EndOfGeneration,
    MaxTokens,
    /// The context window filled up before either of the above
    ContextFull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub prompt_tokens: usize,
    pub generated_tokens: u32,
    pub fragments: u32,
    pub finish: FinishReason,
    pub elapsed: Duration,
}

/// Per-generation bookkeeping, dropped when the generation ends
#[derive(Debug)]
pub struct GenerationSession {
    /// Position the next decoded token occupies
    pub cursor: usize,
    pub generated: u32,
    pub cancel: CancellationToken,
}

impl GenerationSession {
    fn new(prompt_tokens: usize, cancel: CancellationToken) -> Self {
        Self {
            cursor: prompt_tokens,
            generated: 0,
            cancel,
        }
    }
}

/// Runs generations on the thread that owns the resource.
pub struct GenerationEngine<'a> {
    resource: &'a mut ModelResource,
}

impl<'a> GenerationEngine<'a> {
    pub fn new(resource: &'a mut ModelResource) -> Self {
        Self { resource }
    }

    /// Generate a continuation of `prompt`, handing each fragment to `emit`.
    ///
    /// `emit` returns `false` once nobody is listening any more; the
    /// generation then cancels itself. The KV cache is cleared first, so no
    /// state from earlier generations leaks into this one.
    pub fn generate(
        &mut self,
        prompt: &str,
        params: &GenerationParameters,
        cancel: &CancellationToken,
        mut emit: impl FnMut(TextFragment) -> bool,
    ) -> Result<GenerationSummary, GenerationError> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        let ResourceParts {
            model,
            context,
            sampler,
        } = self.resource.parts();

        let prompt_tokens = model
            .tokenize(prompt)
            .map_err(|e| GenerationError::TokenizeFailed(e.to_string()))?;
        if prompt_tokens.is_empty() {
            return Err(GenerationError::TokenizeFailed(
                "prompt produced no tokens".to_string(),
            ));
        }

        let context_size = context.context_size() as usize;
        if prompt_tokens.len() >= context_size {
            return Err(GenerationError::ContextOverflow {
                prompt_tokens: prompt_tokens.len(),
                context_size,
            });
        }

        context.clear_cache();
        context
            .decode(&prompt_tokens, 0)
            .map_err(|e| GenerationError::DecodeFailed(format!("prompt: {}", e)))?;

        sampler
            .reset_chain(&sampler_chain(params, context_size as u32))
            .map_err(|e| GenerationError::DecodeFailed(format!("sampler: {}", e)))?;

        debug!(
            prompt_tokens = prompt_tokens.len(),
            context_size,
            max_output_tokens = params.max_output_tokens,
            "Prompt decoded"
        );

        let mut session = GenerationSession::new(prompt_tokens.len(), cancel.clone());
        let mut decoder = UTF_8.new_decoder_without_bom_handling();
        let mut fragments = 0u32;
        let mut finish = FinishReason::MaxTokens;

        while session.generated < params.max_output_tokens {
            if session.cancel.is_cancelled() {
                debug!(generated = session.generated, "Generation cancelled");
                return Err(GenerationError::Cancelled);
            }

            let token = sampler
                .sample(&mut *context)
                .map_err(|e| GenerationError::DecodeFailed(format!("sample: {}", e)))?;
            if model.is_end_of_generation(token) {
                finish = FinishReason::EndOfGeneration;
                break;
            }

            let text = match model.token_bytes(token) {
                Ok(bytes) => decode_piece(&mut decoder, &bytes, false),
                Err(e) => {
                    warn!("Dropping undecodable token {}: {}", token, e);
                    String::new()
                }
            };
            if !text.is_empty() {
                let fragment = TextFragment {
                    index: fragments,
                    text,
                };
                if !emit(fragment) {
                    session.cancel.cancel();
                    return Err(GenerationError::Cancelled);
                }
                fragments += 1;
            }
            session.generated += 1;

            if session.cursor >= context_size {
                finish = FinishReason::ContextFull;
                break;
            }
            decode_next(&mut *context, token, session.cursor)?;
            session.cursor += 1;

            std::thread::yield_now();
        }

        // A trailing partial character comes out as U+FFFD rather than vanishing.
        let tail = decode_piece(&mut decoder, &[], true);
        if !tail.is_empty() {
            if !emit(TextFragment {
                index: fragments,
                text: tail,
            }) {
                session.cancel.cancel();
                return Err(GenerationError::Cancelled);
            }
            fragments += 1;
        }

        let summary = GenerationSummary {
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: session.generated,
            fragments,
            finish,
            elapsed: started.elapsed(),
        };
        debug!(
            generated_tokens = summary.generated_tokens,
            finish = ?summary.finish,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Generation finished"
        );
        Ok(summary)
    }
}

fn decode_next(
    context: &mut dyn NativeContext,
    token: TokenId,
    position: usize,
) -> Result<(), GenerationError> {
    context
        .decode(&[token], position as u32)
        .map_err(|e| GenerationError::DecodeFailed(format!("token: {}", e)))
}

/// Sampler chain in fixed order: temperature, top-k, top-p, repetition
/// penalty over the whole context window, then the seeded draw.
pub fn sampler_chain(params: &GenerationParameters, context_size: u32) -> Vec<SamplerStage> {
    vec![
        SamplerStage::Temperature(params.temperature),
        SamplerStage::TopK(params.top_k.min(i32::MAX as u32) as i32),
        SamplerStage::TopP(params.top_p),
        SamplerStage::RepetitionPenalty {
            last_n: context_size.min(i32::MAX as u32) as i32,
            penalty: params.repetition_penalty,
        },
        SamplerStage::Distribution { seed: params.seed },
    ]
}

/// Decode a token's bytes, holding back an incomplete trailing character
/// until the bytes that complete it arrive. `last` flushes whatever is held.
fn decode_piece(decoder: &mut Decoder, bytes: &[u8], last: bool) -> String {
    let mut text = String::new();
    let mut input = bytes;
    loop {
        text.reserve(output_room(decoder, input.len()));
        let (result, read, _) = decoder.decode_to_string(input, &mut text, last);
        input = &input[read..];
        match result {
            CoderResult::InputEmpty => return text,
            CoderResult::OutputFull => continue,
        }
    }
}

fn output_room(decoder: &Decoder, input_len: usize) -> usize {
    decoder
        .max_utf8_buffer_length(input_len)
        .unwrap_or(input_len.saturating_mul(3))
        .max(4)
}
