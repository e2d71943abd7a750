//! PocketLLM - on-device LLM inference from the command line

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pocketllm::inference::llama::LlamaCppBackend;
use pocketllm::inference::runtime::Backend;
use pocketllm::inference::{EngineError, GenerationOptions, SessionHandle, StreamToken};
use pocketllm::storage::known_good::{JsonFileStore, LoadConfig};
use pocketllm::storage::settings::{load_settings, SessionSettings};
use pocketllm::system::{inference_threads, probe, FixedMemory, MemoryProbe, SystemMemory};

#[derive(Parser)]
#[command(name = "pocketllm", about = "On-device LLM inference", version)]
struct Cli {
    /// Override the detected available memory, in bytes
    #[arg(long, global = true, env = "POCKETLLM_AVAILABLE_MEMORY")]
    available_memory: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a completion for a prompt.
    Run {
        /// Path to a GGUF model file.
        #[arg(short, long, env = "POCKETLLM_MODEL")]
        model: PathBuf,

        /// Prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Maximum tokens to generate.
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Sampling temperature.
        #[arg(long)]
        temperature: Option<f32>,

        /// Sampler seed.
        #[arg(long)]
        seed: Option<u32>,

        /// Stop sequence; may be repeated.
        #[arg(long = "stop")]
        stop_sequences: Vec<String>,

        /// Print fragments as they are generated.
        #[arg(long)]
        stream: bool,
    },
    /// Measure prompt processing and generation throughput.
    Bench {
        #[arg(short, long, env = "POCKETLLM_MODEL")]
        model: PathBuf,

        /// Prompt tokens per round.
        #[arg(long, default_value_t = 512)]
        pp: u32,

        /// Generated tokens per round.
        #[arg(long, default_value_t = 128)]
        tg: u32,

        /// Parallel sequences.
        #[arg(long, default_value_t = 1)]
        pl: u32,

        #[arg(long, default_value_t = 3)]
        repeats: u32,
    },
    /// Show the starting guess, the saved configuration and GPU offload support.
    Info,
    /// Forget the saved last-known-good configuration.
    Forget,
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pocketllm=info")),
        )
        .init();

    info!("Starting PocketLLM v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let memory: Box<dyn MemoryProbe + Send> = match cli.available_memory {
        Some(bytes) => Box::new(FixedMemory(Some(bytes))),
        None => Box::new(SystemMemory),
    };

    match cli.command {
        Commands::Run {
            model,
            prompt,
            max_tokens,
            temperature,
            seed,
            stop_sequences,
            stream,
        } => {
            let mut settings = load_settings();
            if let Some(max_tokens) = max_tokens {
                settings.max_tokens = max_tokens;
            }
            if let Some(temperature) = temperature {
                settings.temperature = temperature;
            }
            if let Some(seed) = seed {
                settings.seed = seed;
            }
            if !stop_sequences.is_empty() {
                settings.stop_sequences = stop_sequences;
            }
            cmd_run(model, settings, memory, &prompt, stream).await
        }
        Commands::Bench {
            model,
            pp,
            tg,
            pl,
            repeats,
        } => {
            let handle = open(model, load_settings(), memory).await?;
            let report = handle.benchmark(pp, tg, pl, repeats).await?;
            println!("{report}");
            Ok(())
        }
        Commands::Info => cmd_info(memory.as_ref()),
        Commands::Forget => {
            let mut store = JsonFileStore::open_default()?;
            LoadConfig::forget(&mut store)?;
            println!("Forgot saved configuration in {}", store.path().display());
            Ok(())
        }
    }
}

async fn open(
    model: PathBuf,
    settings: SessionSettings,
    memory: Box<dyn MemoryProbe + Send>,
) -> Result<SessionHandle, EngineError> {
    let store = JsonFileStore::open_default()?;
    SessionHandle::create_with(LlamaCppBackend::init, model, settings, Box::new(store), memory).await
}

async fn cmd_run(
    model: PathBuf,
    settings: SessionSettings,
    memory: Box<dyn MemoryProbe + Send>,
    prompt: &str,
    stream: bool,
) -> Result<(), EngineError> {
    let handle = open(model, settings, memory).await?;
    let options: GenerationOptions = handle.default_options();

    if !stream {
        let completion = handle.generate(prompt, options).await?;
        println!("{}", completion.text);
        info!(
            "Finished ({:?}): {} prompt tokens, {} generated",
            completion.finish_reason, completion.prompt_tokens, completion.generated_tokens
        );
        return Ok(());
    }

    let mut rx = handle.generate_stream(prompt, options)?;
    let mut stdout = std::io::stdout();
    while let Some(item) = rx.recv().await {
        match item {
            StreamToken::Token(fragment) => {
                print!("{fragment}");
                let _ = stdout.flush();
            }
            StreamToken::Done(reason) => {
                println!();
                info!("Finished: {:?}", reason);
            }
            StreamToken::Error(e) => {
                println!();
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn cmd_info(memory: &dyn MemoryProbe) -> Result<(), EngineError> {
    let store = JsonFileStore::open_default()?;

    println!("PocketLLM v{}", env!("CARGO_PKG_VERSION"));
    println!();

    match memory.available_bytes() {
        Some(bytes) => println!("Available memory: {} MB", bytes / 1024 / 1024),
        None => println!("Available memory: unknown"),
    }
    println!("Inference threads: {}", inference_threads());

    let guess = probe(&store, memory);
    println!(
        "Starting guess: n_ctx={}, n_gpu_layers={} ({})",
        guess.context_length,
        guess.gpu_layers,
        if guess.had_saved_config {
            "saved"
        } else {
            "memory tier"
        }
    );

    match LoadConfig::read(&store) {
        Some(saved) => println!(
            "Saved config: n_ctx={}, n_gpu_layers={} ({})",
            saved.context_length,
            saved.gpu_layers,
            store.path().display()
        ),
        None => println!("Saved config: none"),
    }

    let backend = LlamaCppBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
    println!(
        "Backend: {} (GPU offload {})",
        backend.name(),
        if backend.supports_gpu_offload() {
            "supported"
        } else {
            "unavailable"
        }
    );
    Ok(())
}
