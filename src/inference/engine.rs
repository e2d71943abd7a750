//! Session handle
//!
//! Async-friendly front end for a session.
//!
//! # Architecture
//!
//! llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain raw
//! pointers that are not `Send`, and a session borrows its model. The backend,
//! model, context, sampler and batch are therefore created, used and released on
//! one dedicated worker thread. The handle talks to it over a command channel;
//! replies come back on `tokio` oneshot channels so callers can `await` them.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};

use crate::inference::bench::BenchReport;
use crate::inference::generate::{self, Completion, GenerationOptions};
use crate::inference::llama::LlamaCppBackend;
use crate::inference::loader::open_session;
use crate::inference::model::{check_model_file, ModelError};
use crate::inference::runtime::{Backend, Model, RuntimeError};
use crate::inference::session::{FinishReason, Session, SessionError};
use crate::inference::streaming::StreamToken;
use crate::storage::known_good::{JsonFileStore, KeyValueStore, LoadConfig};
use crate::storage::settings::SessionSettings;
use crate::storage::StorageError;
use crate::system::probe::probe;
use crate::system::resources::{MemoryProbe, SystemMemory};

/// A warm-up pass slower than this means the device is too slow to benchmark
pub const WARMUP_LIMIT: Duration = Duration::from_secs(5);

/// Errors surfaced by [`SessionHandle`]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Model path is empty")]
    PathEmpty,

    #[error("Could not locate model: {0}")]
    ModelNotFound(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Warm-up took {0:.2}s, aborting benchmark")]
    BenchmarkAborted(f64),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::PathEmpty => EngineError::PathEmpty,
            ModelError::NotFound(path) => EngineError::ModelNotFound(path),
            other => EngineError::ModelValidation(other.to_string()),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

/// What the worker loaded
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub model_path: PathBuf,
    pub model_description: String,
    pub backend: String,
    /// Configuration that worked, as persisted to the store
    pub loaded: LoadConfig,
    pub context_length: u32,
    pub batch_capacity: usize,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate {
        prompt: String,
        options: GenerationOptions,
        response_tx: oneshot::Sender<Result<Completion, EngineError>>,
    },
    Stream {
        prompt: String,
        options: GenerationOptions,
        token_tx: tokio_mpsc::UnboundedSender<StreamToken>,
    },
    Clear {
        response_tx: oneshot::Sender<()>,
    },
    Benchmark {
        pp: u32,
        tg: u32,
        pl: u32,
        repeats: u32,
        response_tx: oneshot::Sender<Result<BenchReport, EngineError>>,
    },
    Shutdown,
}

/// Handle to a loaded session running on its own worker thread.
///
/// Commands are served one at a time in the order they were sent. Dropping the
/// handle shuts the worker down, which releases the sampler, batch, context,
/// model and backend in that order.
pub struct SessionHandle {
    command_tx: Option<Sender<WorkerCommand>>,
    worker_handle: Option<JoinHandle<()>>,
    info: SessionInfo,
    settings: SessionSettings,
}

impl SessionHandle {
    /// Loads `model_path` with llama.cpp, using the last-known-good store in the
    /// data directory and the system memory probe.
    pub async fn create(
        model_path: impl Into<PathBuf>,
        settings: SessionSettings,
    ) -> Result<Self, EngineError> {
        let store = JsonFileStore::open_default()?;
        Self::create_with(
            LlamaCppBackend::init,
            model_path,
            settings,
            Box::new(store),
            Box::new(SystemMemory),
        )
        .await
    }

    /// Loads `model_path` on a runtime produced by `init_backend`.
    ///
    /// The backend is constructed on the worker thread, so it need not be `Send`.
    pub async fn create_with<B, F>(
        init_backend: F,
        model_path: impl Into<PathBuf>,
        mut settings: SessionSettings,
        store: Box<dyn KeyValueStore + Send>,
        memory: Box<dyn MemoryProbe + Send>,
    ) -> Result<Self, EngineError>
    where
        B: Backend + 'static,
        F: FnOnce() -> Result<B, RuntimeError> + Send + 'static,
    {
        let model_path = model_path.into();
        check_model_file(&model_path)?;
        settings.validate();

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = Worker {
            model_path,
            settings: settings.clone(),
            store,
            memory,
        };
        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || worker.run(init_backend, command_rx, ready_tx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let ready = ready_rx
            .await
            .map_err(|_| EngineError::WorkerError("worker exited during load".to_string()));

        let info = match ready {
            Ok(Ok(info)) => info,
            Ok(Err(e)) | Err(e) => {
                let _ = handle.join();
                return Err(e);
            }
        };

        tracing::info!(
            "Session ready: {} (n_ctx={}, n_gpu_layers={})",
            info.model_description,
            info.loaded.context_length,
            info.loaded.gpu_layers
        );
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            info,
            settings,
        })
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn model_description(&self) -> &str {
        &self.info.model_description
    }

    /// Generation options built from the session settings
    pub fn default_options(&self) -> GenerationOptions {
        GenerationOptions::from(&self.settings)
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| EngineError::WorkerError("worker stopped".to_string()))?
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Runs a full generation and returns the completion.
    pub async fn generate(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<Completion, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::Generate {
            prompt: prompt.to_string(),
            options,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }

    /// Generates text with streaming output.
    ///
    /// Dropping the receiver stops generation at the next step boundary.
    pub fn generate_stream(
        &self,
        prompt: &str,
        options: GenerationOptions,
    ) -> Result<tokio_mpsc::UnboundedReceiver<StreamToken>, EngineError> {
        let (token_tx, token_rx) = tokio_mpsc::unbounded_channel();
        self.send(WorkerCommand::Stream {
            prompt: prompt.to_string(),
            options,
            token_tx,
        })?;
        Ok(token_rx)
    }

    /// Starts a fresh conversation without reloading the model.
    pub async fn clear(&self) -> Result<(), EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::Clear { response_tx })?;
        response_rx
            .await
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Runs a warm-up pass, then the requested benchmark.
    pub async fn benchmark(
        &self,
        pp: u32,
        tg: u32,
        pl: u32,
        repeats: u32,
    ) -> Result<BenchReport, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::Benchmark {
            pp,
            tg,
            pl,
            repeats,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Everything the worker thread needs to open the session
struct Worker {
    model_path: PathBuf,
    settings: SessionSettings,
    store: Box<dyn KeyValueStore + Send>,
    memory: Box<dyn MemoryProbe + Send>,
}

impl Worker {
    /// Worker thread main.
    ///
    /// Owns the backend for the whole session; the model and context live
    /// inside [`open_session`] and are gone by the time the backend drops.
    fn run<B, F>(
        self,
        init_backend: F,
        command_rx: Receiver<WorkerCommand>,
        ready_tx: oneshot::Sender<Result<SessionInfo, EngineError>>,
    ) where
        B: Backend,
        F: FnOnce() -> Result<B, RuntimeError>,
    {
        let backend = match init_backend() {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!("Failed to init backend: {}", e);
                let _ = ready_tx.send(Err(EngineError::BackendInit(e.to_string())));
                return;
            }
        };

        let Worker {
            model_path,
            settings,
            mut store,
            memory,
        } = self;
        let guess = probe(store.as_ref(), memory.as_ref());
        let mut ready = Some(ready_tx);

        let result = open_session(
            &backend,
            &model_path,
            guess,
            &settings,
            store.as_mut(),
            |session| {
                let info = SessionInfo {
                    model_path: model_path.clone(),
                    model_description: session.model_description(),
                    backend: session.backend_name().to_string(),
                    loaded: session.loaded_config(),
                    context_length: session.context_length(),
                    batch_capacity: session.batch_capacity(),
                };
                if let Some(tx) = ready.take() {
                    if tx.send(Ok(info)).is_err() {
                        tracing::debug!("Caller went away during load");
                        return;
                    }
                }
                run_command_loop(session, &command_rx);
            },
        );

        if let Err(e) = result {
            tracing::error!("Failed to open session: {}", e);
            if let Some(tx) = ready.take() {
                let _ = tx.send(Err(e.into()));
            }
        }
        tracing::info!("Worker thread shutting down");
    }
}

fn run_command_loop<M: Model>(session: &mut Session<'_, M>, command_rx: &Receiver<WorkerCommand>) {
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate {
                prompt,
                options,
                response_tx,
            }) => {
                let result = generate::generate(session, &prompt, &options).map_err(EngineError::from);
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Stream {
                prompt,
                options,
                token_tx,
            }) => stream_to_channel(session, &prompt, &options, &token_tx),
            Ok(WorkerCommand::Clear { response_tx }) => {
                session.clear();
                let _ = response_tx.send(());
            }
            Ok(WorkerCommand::Benchmark {
                pp,
                tg,
                pl,
                repeats,
                response_tx,
            }) => {
                let _ = response_tx.send(run_benchmark(session, pp, tg, pl, repeats));
            }
            Ok(WorkerCommand::Shutdown) => break,
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Pushes fragments to `token_tx` until generation ends or the receiver is gone.
fn stream_to_channel<M: Model>(
    session: &mut Session<'_, M>,
    prompt: &str,
    options: &GenerationOptions,
    token_tx: &tokio_mpsc::UnboundedSender<StreamToken>,
) {
    let mut tokens = match generate::stream(session, prompt, options) {
        Ok(tokens) => tokens,
        Err(e) => {
            let _ = token_tx.send(StreamToken::Error(e));
            return;
        }
    };

    loop {
        if token_tx.is_closed() {
            tracing::debug!("Receiver dropped, stopping generation");
            return;
        }
        let Some(item) = tokens.next() else {
            break;
        };
        let failed = item.is_err();
        if token_tx.send(StreamToken::from(item)).is_err() || failed {
            return;
        }
    }

    let reason = tokens
        .finish_reason()
        .cloned()
        .unwrap_or(FinishReason::EndOfGeneration);
    let _ = token_tx.send(StreamToken::Done(reason));
}

fn check_warmup(elapsed: Duration) -> Result<(), EngineError> {
    if elapsed > WARMUP_LIMIT {
        tracing::warn!("Heat up time is too long, aborting benchmark");
        return Err(EngineError::BenchmarkAborted(elapsed.as_secs_f64()));
    }
    Ok(())
}

fn run_benchmark<M: Model>(
    session: &mut Session<'_, M>,
    pp: u32,
    tg: u32,
    pl: u32,
    repeats: u32,
) -> Result<BenchReport, EngineError> {
    tracing::info!("Running benchmark on {}", session.model_description());

    let started = Instant::now();
    session.benchmark(8, 4, 1, 1)?;
    let elapsed = started.elapsed();
    tracing::info!("Heat up time: {:.2} seconds", elapsed.as_secs_f64());
    check_warmup(elapsed)?;

    let report = session.benchmark(pp, tg, pl, repeats)?;
    Ok(report)
}
