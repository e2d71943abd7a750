//! llama.cpp runtime
//!
//! Implements the runtime traits on top of `llama-cpp-2`. The safe wrapper
//! already ties `LlamaContext<'m>` to the model it was created from, so the
//! ownership chain backend → model → context is expressed with plain borrows.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, DecodeError, LogOptions};

use crate::inference::batch::TokenBatch;
use crate::inference::runtime::{
    Backend, Context, ContextParams, Model, RuntimeError, SamplerParams, TokenId,
};

/// Process-wide llama.cpp backend
pub struct LlamaCppBackend {
    backend: LlamaBackend,
}

impl LlamaCppBackend {
    /// Initializes llama.cpp and routes its log output into `tracing`.
    ///
    /// llama.cpp allows a single backend per process.
    pub fn init() -> Result<Self, RuntimeError> {
        send_logs_to_tracing(LogOptions::default());
        let backend =
            LlamaBackend::init().map_err(|e| RuntimeError::BackendInit(e.to_string()))?;
        tracing::info!("LlamaBackend initialized ({})", compiled_backend_name());
        Ok(Self { backend })
    }
}

fn compiled_backend_name() -> &'static str {
    if cfg!(feature = "metal") {
        "Metal"
    } else if cfg!(feature = "cuda") {
        "CUDA"
    } else if cfg!(feature = "vulkan") {
        "Vulkan"
    } else {
        "CPU"
    }
}

impl Backend for LlamaCppBackend {
    type Model<'b> = LlamaCppModel<'b>;

    fn name(&self) -> &'static str {
        compiled_backend_name()
    }

    fn supports_gpu_offload(&self) -> bool {
        self.backend.supports_gpu_offload()
    }

    fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<LlamaCppModel<'_>, RuntimeError> {
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params).map_err(|e| {
            RuntimeError::ModelLoad {
                gpu_layers,
                reason: e.to_string(),
            }
        })?;

        tracing::info!(
            "Model loaded: {} params, {} vocab, {} ctx train",
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );
        Ok(LlamaCppModel {
            backend: &self.backend,
            model,
        })
    }
}

pub struct LlamaCppModel<'b> {
    backend: &'b LlamaBackend,
    model: LlamaModel,
}

impl<'b> Model for LlamaCppModel<'b> {
    type Context<'m> = LlamaCppContext<'m> where Self: 'm;

    fn new_context(&self, params: &ContextParams) -> Result<LlamaCppContext<'_>, RuntimeError> {
        let threads = i32::try_from(params.n_threads).unwrap_or(1);
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_seq_max(params.n_seq_max.max(1))
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let context = self
            .model
            .new_context(self.backend, ctx_params)
            .map_err(|e| RuntimeError::ContextCreate(e.to_string()))?;

        let n_seq_max = i32::try_from(params.n_seq_max.max(1)).unwrap_or(1);
        Ok(LlamaCppContext {
            batch: LlamaBatch::new(params.n_batch as usize, n_seq_max),
            context,
        })
    }

    fn description(&self) -> String {
        let name = self
            .model
            .meta_val_str("general.name")
            .or_else(|_| self.model.meta_val_str("general.architecture"))
            .unwrap_or_default();
        if name.is_empty() {
            return name;
        }
        match self.model.meta_val_str("general.size_label") {
            Ok(size) if !size.is_empty() => format!("{name} {size}"),
            _ => name,
        }
    }

    fn size_bytes(&self) -> u64 {
        self.model.size() as u64
    }

    fn n_params(&self) -> u64 {
        self.model.n_params() as u64
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, RuntimeError> {
        let add_bos = if add_bos {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| RuntimeError::Tokenize(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, RuntimeError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Plaintext)
            .map_err(|e| RuntimeError::Detokenize {
                token,
                reason: e.to_string(),
            })
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }
}

/// A llama context plus the native batch it decodes from
pub struct LlamaCppContext<'m> {
    batch: LlamaBatch,
    context: LlamaContext<'m>,
}

impl Context for LlamaCppContext<'_> {
    type Sampler = LlamaSampler;

    fn n_ctx(&self) -> u32 {
        self.context.n_ctx()
    }

    fn new_sampler(&self, params: &SamplerParams) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(params.seed),
        ])
    }

    fn sample(&mut self, sampler: &mut LlamaSampler, index: i32) -> TokenId {
        let token = sampler.sample(&self.context, index);
        sampler.accept(token);
        token.0
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError> {
        self.batch.clear();
        for entry in batch.iter() {
            self.batch
                .add(LlamaToken::new(entry.token), entry.pos, entry.seq_ids, entry.logits)
                .map_err(|e| RuntimeError::Batch(e.to_string()))?;
        }

        self.context.decode(&mut self.batch).map_err(|e| {
            let status = match e {
                DecodeError::NoKvCacheSlot => 1,
                DecodeError::Unknown(code) => code,
                _ => -1,
            };
            RuntimeError::Decode(status)
        })
    }

    fn clear_memory(&mut self) {
        self.context.clear_kv_cache();
    }
}
