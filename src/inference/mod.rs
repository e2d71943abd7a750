//! LLM inference engine
//!
//! This module handles model loading with GPU-offload fallback, the inference
//! session and its generation loop, and the llama.cpp runtime behind them.

pub mod batch;
pub mod bench;
pub mod decoder;
pub mod engine;
pub mod generate;
pub mod llama;
pub mod loader;
pub mod model;
pub mod runtime;
pub mod session;
pub mod streaming;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main types for convenience
pub use batch::{BatchError, TokenBatch, DEFAULT_BATCH_CAPACITY};
pub use bench::{BenchReport, PhaseStats};
pub use decoder::Utf8Decoder;
pub use engine::{EngineError, SessionHandle, SessionInfo};
pub use generate::{for_each_token, generate, stream, Completion, GenerationOptions, TokenStream};
pub use loader::{gpu_layer_candidates, load_model_with_fallback, open_session, FULL_OFFLOAD_LAYERS};
pub use model::{check_model_file, validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use runtime::{Backend, Context, Model, RuntimeError, TokenId};
pub use session::{FinishReason, Session, SessionError};
pub use streaming::StreamToken;
