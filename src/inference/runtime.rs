//! Runtime seam
//!
//! The session never touches the native runtime directly. Everything it needs
//! (model loading, context creation, tokenization, sampling and decode) goes
//! through the three traits below, so the fallback cascade and the generation
//! loop can run against llama.cpp in production and a scripted runtime in tests.
//!
//! Ownership mirrors the native library: a [`Backend`] hands out models that
//! borrow it, and a [`Model`] hands out contexts that borrow the model. Dropping
//! a value releases the native resource, so the borrow checker enforces the
//! release order (context before model, model before backend).

use std::path::Path;

use thiserror::Error;

use crate::inference::batch::TokenBatch;

/// Vocabulary id as returned by the runtime. Negative values are invalid.
pub type TokenId = i32;

/// Errors reported by the runtime seam
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model with n_gpu_layers={gpu_layers}: {reason}")]
    ModelLoad { gpu_layers: u32, reason: String },

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Failed to convert token {token} to bytes: {reason}")]
    Detokenize { token: TokenId, reason: String },

    #[error("Failed to stage batch: {0}")]
    Batch(String),

    #[error("llama_decode returned status {0}")]
    Decode(i32),
}

/// Parameters used when creating a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window in tokens
    pub n_ctx: u32,
    /// Threads used for generation and batch processing
    pub n_threads: u32,
    /// Maximum tokens submitted per decode
    pub n_batch: u32,
    /// Maximum sequence ids per token
    pub n_seq_max: u32,
}

/// Parameters for the sampler chain (temperature shaping, then distribution draw)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerParams {
    pub temperature: f32,
    pub seed: u32,
}

/// Entry point of a runtime: loads models.
pub trait Backend {
    type Model<'b>: Model
    where
        Self: 'b;

    /// Short label used in benchmark reports
    fn name(&self) -> &'static str;

    /// Whether layers can be offloaded to a GPU at all
    fn supports_gpu_offload(&self) -> bool;

    /// Loads the model file with `gpu_layers` layers offloaded.
    fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<Self::Model<'_>, RuntimeError>;
}

/// A loaded model.
pub trait Model {
    type Context<'m>: Context
    where
        Self: 'm;

    fn new_context(&self, params: &ContextParams) -> Result<Self::Context<'_>, RuntimeError>;

    /// Human readable description. May be empty if the runtime has none.
    fn description(&self) -> String;

    fn size_bytes(&self) -> u64;

    fn n_params(&self) -> u64;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, RuntimeError>;

    /// Raw bytes of a token piece. Pieces may end in the middle of a UTF-8 sequence.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, RuntimeError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;
}

/// Runtime state bound to a model: KV cache, threads and logits.
pub trait Context {
    type Sampler;

    fn n_ctx(&self) -> u32;

    fn new_sampler(&self, params: &SamplerParams) -> Self::Sampler;

    /// Samples from the logits of batch row `index` of the last decode.
    fn sample(&mut self, sampler: &mut Self::Sampler, index: i32) -> TokenId;

    /// Runs one blocking decode over the occupied part of `batch`.
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError>;

    /// Drops all KV cache state.
    fn clear_memory(&mut self);
}
