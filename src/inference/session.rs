//! Inference session
//!
//! A session owns one context, its sampler chain, a fixed-capacity batch and
//! the pending-bytes decoder, and borrows the model it was created from. It
//! exposes prompt ingestion and single-token decode steps; the loop that drives
//! them lives in [`crate::inference::generate`].
//!
//! Fields are declared in release order. Rust drops struct fields top to
//! bottom, so teardown frees the sampler, then the batch, then the context.
//! The model and backend are owned by the caller of
//! [`open_session`](crate::inference::loader::open_session) and outlive it.

use thiserror::Error;

use crate::inference::batch::{BatchError, TokenBatch};
use crate::inference::decoder::Utf8Decoder;
use crate::inference::runtime::{Context, Model, SamplerParams, TokenId};
use crate::storage::known_good::LoadConfig;
use crate::storage::settings::SessionSettings;

/// Returned by [`Session::model_description`] when the runtime has none
pub const MISSING_DESCRIPTION: &str = "[Failed to get model description]";

/// Errors that can occur while creating or driving a session
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Could not initialize context: {0}")]
    CouldNotInitializeContext(String),

    #[error("Batch capacity exceeded ({capacity} tokens)")]
    BatchCapacityExceeded { capacity: usize },

    #[error("Sampler returned invalid token {0}")]
    InvalidSampledToken(TokenId),

    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Detokenization failed: {0}")]
    Detokenization(String),

    #[error("No prompt has been ingested")]
    NotIngested,

    #[error("Cannot run {requested} parallel sequences, the session allows 1 to {max}")]
    ParallelSequences { requested: u32, max: usize },
}

impl From<BatchError> for SessionError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::CapacityExceeded { capacity } => {
                SessionError::BatchCapacityExceeded { capacity }
            }
        }
    }
}

/// Why a session stopped generating. All variants leave `is_done() == true`.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    /// The model emitted an end-of-generation token
    EndOfGeneration,
    /// The token budget was used up
    LengthBudget,
    /// A stop sequence appeared in the output
    StopSequence(String),
    /// A step failed; output produced before the failure was kept
    Failed(SessionError),
}

impl FinishReason {
    pub fn error(&self) -> Option<&SessionError> {
        match self {
            FinishReason::Failed(e) => Some(e),
            _ => None,
        }
    }
}

pub struct Session<'m, M: Model + 'm> {
    sampler: <M::Context<'m> as Context>::Sampler,
    pub(super) batch: TokenBatch,
    pub(super) context: M::Context<'m>,
    pub(super) model: &'m M,
    sampler_params: SamplerParams,
    loaded: LoadConfig,
    backend_name: &'static str,
    prompt_tokens: Vec<TokenId>,
    decoder: Utf8Decoder,
    token_budget: u32,
    /// Position at which generation stops
    n_len: i32,
    /// Position of the next token
    n_cur: i32,
    /// Tokens generated since the last ingest
    n_decode: i32,
    finish: Option<FinishReason>,
}

impl<'m, M: Model + 'm> Session<'m, M> {
    pub(crate) fn new(
        model: &'m M,
        context: M::Context<'m>,
        settings: &SessionSettings,
        loaded: LoadConfig,
        backend_name: &'static str,
    ) -> Self {
        let sampler_params = SamplerParams {
            temperature: settings.temperature,
            seed: settings.seed,
        };
        let sampler = context.new_sampler(&sampler_params);
        let batch = TokenBatch::new(
            settings.batch_capacity as usize,
            settings.max_sequence_ids_per_token as usize,
        );

        Self {
            sampler,
            batch,
            context,
            model,
            sampler_params,
            loaded,
            backend_name,
            prompt_tokens: Vec::new(),
            decoder: Utf8Decoder::new(),
            token_budget: settings.max_tokens,
            n_len: 0,
            n_cur: 0,
            n_decode: 0,
            finish: None,
        }
    }

    /// Sets how many tokens the next ingested prompt may generate
    pub fn set_token_budget(&mut self, max_tokens: u32) {
        self.token_budget = max_tokens;
    }

    pub fn token_budget(&self) -> u32 {
        self.token_budget
    }

    pub fn is_done(&self) -> bool {
        self.finish.is_some()
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish.as_ref()
    }

    /// Marks the session done. The first recorded reason wins.
    pub fn mark_done(&mut self, reason: FinishReason) {
        if self.finish.is_none() {
            tracing::debug!("Generation finished: {:?}", reason);
            self.finish = Some(reason);
        }
    }

    /// The (context length, GPU layers) pair this session was created with
    pub fn loaded_config(&self) -> LoadConfig {
        self.loaded
    }

    pub fn context_length(&self) -> u32 {
        self.context.n_ctx()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_tokens.len()
    }

    /// Position of the next generated token
    pub fn cursor(&self) -> i32 {
        self.n_cur
    }

    /// Tokens generated since the last ingest
    pub fn generated_tokens(&self) -> usize {
        self.n_decode as usize
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch.capacity()
    }

    pub(super) fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn model_description(&self) -> String {
        let description = self.model.description();
        if description.is_empty() {
            MISSING_DESCRIPTION.to_string()
        } else {
            description
        }
    }

    /// Tokenizes `prompt` and decodes it in a single batch.
    ///
    /// Only the last prompt token requests logits. Exceeding the context window
    /// with prompt plus budget is logged, not rejected.
    pub fn ingest(&mut self, prompt: &str) -> Result<(), SessionError> {
        tracing::debug!("Ingesting prompt ({} bytes)", prompt.len());

        self.finish = None;
        self.decoder.reset();
        self.n_cur = 0;
        self.n_decode = 0;

        let tokens = self
            .model
            .tokenize(prompt, true)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;

        let n_ctx = self.context.n_ctx() as usize;
        let n_kv_req = tokens.len() + self.token_budget as usize;
        if n_kv_req > n_ctx {
            tracing::warn!(
                "Required KV cache size is not big enough: n_kv_req={} > n_ctx={}",
                n_kv_req,
                n_ctx
            );
        }

        self.batch.clear();
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            if let Err(e) = self.batch.push(token, i as i32, &[0], i == last) {
                let error = SessionError::from(e);
                self.mark_done(FinishReason::Failed(error.clone()));
                return Err(error);
            }
        }
        self.prompt_tokens = tokens;

        self.decode_pending()?;

        self.n_cur = self.batch.len() as i32;
        self.n_len = self
            .n_cur
            .saturating_add(i32::try_from(self.token_budget).unwrap_or(i32::MAX));
        tracing::debug!(
            "Prompt decoded: {} tokens, generation stops at position {}",
            self.n_cur,
            self.n_len
        );
        Ok(())
    }

    /// Samples one token, feeds it back and returns the newly complete text.
    ///
    /// Per-step failures end generation with [`FinishReason::Failed`] and still
    /// return whatever text was decoded. Calling `step` on a finished session
    /// returns an empty string.
    pub fn step(&mut self) -> Result<String, SessionError> {
        if self.is_done() {
            return Ok(String::new());
        }

        if self.batch.is_empty() {
            tracing::error!("Batch has no tokens for sampling");
            self.mark_done(FinishReason::Failed(SessionError::NotIngested));
            return Err(SessionError::NotIngested);
        }

        let index = self.batch.len() as i32 - 1;
        let token = self.context.sample(&mut self.sampler, index);

        if token < 0 {
            tracing::error!("Sampler returned invalid token {}", token);
            self.mark_done(FinishReason::Failed(SessionError::InvalidSampledToken(token)));
            return Ok(self.decoder.flush());
        }

        if self.model.is_end_of_generation(token) {
            self.mark_done(FinishReason::EndOfGeneration);
            return Ok(self.decoder.flush());
        }

        if self.n_cur >= self.n_len {
            self.mark_done(FinishReason::LengthBudget);
            return Ok(self.decoder.flush());
        }

        let bytes = match self.model.token_to_bytes(token) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.mark_done(FinishReason::Failed(SessionError::Detokenization(e.to_string())));
                return Ok(self.decoder.flush());
            }
        };
        let mut fragment = self.decoder.append(&bytes);

        self.batch.clear();
        if let Err(e) = self.batch.push(token, self.n_cur, &[0], true) {
            self.mark_done(FinishReason::Failed(e.into()));
            fragment.push_str(&self.decoder.flush());
            return Ok(fragment);
        }

        self.n_decode += 1;
        self.n_cur += 1;

        if self.decode_pending().is_err() {
            fragment.push_str(&self.decoder.flush());
            return Ok(fragment);
        }

        if self.n_cur >= self.n_len {
            self.mark_done(FinishReason::LengthBudget);
            fragment.push_str(&self.decoder.flush());
        }

        Ok(fragment)
    }

    /// Starts a fresh conversation without reloading the model.
    pub fn clear(&mut self) {
        self.prompt_tokens.clear();
        self.decoder.reset();
        self.batch.clear();
        self.context.clear_memory();
        self.sampler = self.context.new_sampler(&self.sampler_params);
        self.finish = None;
        self.n_len = 0;
        self.n_cur = 0;
        self.n_decode = 0;
        tracing::debug!("Session cleared");
    }

    /// Decodes the current batch.
    ///
    /// A failure with pending tokens ends the session. A failure with an empty
    /// batch, or on an already finished session, is only a warning.
    pub(super) fn decode_pending(&mut self) -> Result<(), SessionError> {
        match self.context.decode(&self.batch) {
            Ok(()) => Ok(()),
            Err(e) if !self.batch.is_empty() && !self.is_done() => {
                tracing::error!("llama_decode failed: {}", e);
                let error = SessionError::DecodeFailure(e.to_string());
                self.mark_done(FinishReason::Failed(error.clone()));
                Err(error)
            }
            Err(e) => {
                tracing::warn!("{}, no tokens or already done, continuing", e);
                Ok(())
            }
        }
    }
}
