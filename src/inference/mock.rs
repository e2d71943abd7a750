//! Scripted runtime for tests
//!
//! Prompt bytes tokenize to `1000 + byte` after a BOS token. Generated tokens
//! are `100 + i` for the i-th scripted piece; once the script runs out the
//! sampler returns [`EOG_TOKEN`]. Every load, release and decode is appended to
//! a shared event log.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::inference::batch::TokenBatch;
use crate::inference::loader::open_session;
use crate::inference::runtime::{
    Backend, Context, ContextParams, Model, RuntimeError, SamplerParams, TokenId,
};
use crate::inference::session::Session;
use crate::storage::known_good::MemoryStore;
use crate::storage::settings::SessionSettings;
use crate::system::probe::StartGuess;

pub const BOS_TOKEN: TokenId = 1;
pub const EOG_TOKEN: TokenId = 2;
const PIECE_BASE: TokenId = 100;
const BYTE_BASE: TokenId = 1000;

#[derive(Debug, Clone, Default)]
pub struct MockEvents(Arc<Mutex<Vec<String>>>);

impl MockEvents {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Events starting with `prefix`, in order
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFailure {
    Never,
    /// Fails whenever the model was loaded with GPU layers
    WithGpu,
    Always,
}

#[derive(Clone)]
pub struct MockRuntime {
    pub gpu_offload: bool,
    pub loadable: Arc<dyn Fn(u32) -> bool + Send + Sync>,
    pub context_failure: ContextFailure,
    pub pieces: Vec<Vec<u8>>,
    pub invalid_at: Option<usize>,
    pub decode_fails_at: Option<usize>,
    pub description: String,
    pub events: MockEvents,
}

impl MockRuntime {
    pub fn with_pieces(pieces: Vec<Vec<u8>>) -> Self {
        Self {
            gpu_offload: false,
            loadable: Arc::new(|_| true),
            context_failure: ContextFailure::Never,
            pieces,
            invalid_at: None,
            decode_fails_at: None,
            description: "mock 7B Q4_0".to_string(),
            events: MockEvents::default(),
        }
    }

    pub fn scripted(pieces: &[&str]) -> Self {
        Self::with_pieces(pieces.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    /// Loads succeed only for the given layer counts
    pub fn loadable_only(mut self, layers: &[u32]) -> Self {
        let allowed = layers.to_vec();
        self.loadable = Arc::new(move |n| allowed.contains(&n));
        self
    }
}

pub struct MockBackend {
    runtime: MockRuntime,
}

impl MockBackend {
    pub fn new(runtime: MockRuntime) -> Self {
        runtime.events.push("init backend");
        Self { runtime }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.runtime.events.push("free backend");
    }
}

impl Backend for MockBackend {
    type Model<'b> = MockModel<'b>;

    fn name(&self) -> &'static str {
        "Mock"
    }

    fn supports_gpu_offload(&self) -> bool {
        self.runtime.gpu_offload
    }

    fn load_model(&self, _path: &Path, gpu_layers: u32) -> Result<MockModel<'_>, RuntimeError> {
        self.runtime.events.push(format!("load gpu_layers={gpu_layers}"));
        if (self.runtime.loadable)(gpu_layers) {
            Ok(MockModel {
                runtime: &self.runtime,
                gpu_layers,
            })
        } else {
            Err(RuntimeError::ModelLoad {
                gpu_layers,
                reason: "out of device memory".to_string(),
            })
        }
    }
}

pub struct MockModel<'b> {
    runtime: &'b MockRuntime,
    gpu_layers: u32,
}

impl Drop for MockModel<'_> {
    fn drop(&mut self) {
        self.runtime
            .events
            .push(format!("free model gpu_layers={}", self.gpu_layers));
    }
}

impl<'b> Model for MockModel<'b> {
    type Context<'m> = MockContext<'m> where Self: 'm;

    fn new_context(&self, params: &ContextParams) -> Result<MockContext<'_>, RuntimeError> {
        self.runtime.events.push(format!(
            "init context n_ctx={} threads={} gpu_layers={}",
            params.n_ctx, params.n_threads, self.gpu_layers
        ));
        let fails = match self.runtime.context_failure {
            ContextFailure::Never => false,
            ContextFailure::WithGpu => self.gpu_layers > 0,
            ContextFailure::Always => true,
        };
        if fails {
            return Err(RuntimeError::ContextCreate("metal backend unavailable".to_string()));
        }
        Ok(MockContext {
            runtime: self.runtime,
            n_ctx: params.n_ctx,
            generated: 0,
        })
    }

    fn description(&self) -> String {
        self.runtime.description.clone()
    }

    fn size_bytes(&self) -> u64 {
        4 * 1024 * 1024 * 1024
    }

    fn n_params(&self) -> u64 {
        7_000_000_000
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>, RuntimeError> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text.bytes().map(|b| BYTE_BASE + TokenId::from(b)));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, RuntimeError> {
        if token >= BYTE_BASE {
            return Ok(vec![(token - BYTE_BASE) as u8]);
        }
        let index = (token - PIECE_BASE) as usize;
        match self.runtime.pieces.get(index) {
            Some(piece) if token >= PIECE_BASE => Ok(piece.clone()),
            _ => Err(RuntimeError::Detokenize {
                token,
                reason: "unknown token".to_string(),
            }),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }
}

pub struct MockSampler {
    events: MockEvents,
}

impl Drop for MockSampler {
    fn drop(&mut self) {
        self.events.push("free sampler");
    }
}

pub struct MockContext<'m> {
    runtime: &'m MockRuntime,
    n_ctx: u32,
    /// Tokens decoded since the last prompt
    generated: usize,
}

impl Drop for MockContext<'_> {
    fn drop(&mut self) {
        self.runtime.events.push("free context");
    }
}

impl Context for MockContext<'_> {
    type Sampler = MockSampler;

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn new_sampler(&self, params: &SamplerParams) -> MockSampler {
        self.runtime.events.push(format!(
            "init sampler temp={} seed={}",
            params.temperature, params.seed
        ));
        MockSampler {
            events: self.runtime.events.clone(),
        }
    }

    fn sample(&mut self, _sampler: &mut MockSampler, _index: i32) -> TokenId {
        if self.runtime.invalid_at == Some(self.generated) {
            return -1;
        }
        if self.generated < self.runtime.pieces.len() {
            PIECE_BASE + self.generated as TokenId
        } else {
            EOG_TOKEN
        }
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), RuntimeError> {
        let positions: Vec<i32> = batch.iter().map(|e| e.pos).collect();
        let logits: Vec<bool> = batch.iter().map(|e| e.logits).collect();
        self.runtime
            .events
            .push(format!("decode positions={positions:?} logits={logits:?}"));

        match positions.first() {
            None => return Err(RuntimeError::Decode(-1)),
            Some(0) => self.generated = 0,
            Some(_) => self.generated += 1,
        }
        if self.runtime.decode_fails_at == Some(self.generated) {
            return Err(RuntimeError::Decode(1));
        }
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.runtime.events.push("clear memory");
        self.generated = 0;
    }
}

/// Opens a CPU-only session on a [`MockBackend`] and runs `f` against it.
pub fn with_session<R>(
    runtime: MockRuntime,
    settings: &SessionSettings,
    f: impl for<'m, 'b> FnOnce(&mut Session<'m, MockModel<'b>>) -> R,
) -> R {
    with_session_in_context(runtime, 2048, settings, f)
}

/// Like [`with_session`], with a context window of `context_length` tokens.
pub fn with_session_in_context<R>(
    runtime: MockRuntime,
    context_length: u32,
    settings: &SessionSettings,
    f: impl for<'m, 'b> FnOnce(&mut Session<'m, MockModel<'b>>) -> R,
) -> R {
    let backend = MockBackend::new(runtime);
    let guess = StartGuess {
        context_length,
        gpu_layers: 0,
        had_saved_config: true,
    };
    let mut store = MemoryStore::default();
    open_session(
        &backend,
        Path::new("mock.gguf"),
        guess,
        settings,
        &mut store,
        f,
    )
    .expect("mock session should open")
}
