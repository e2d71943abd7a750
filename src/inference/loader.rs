//! Model loading with GPU-offload fallback
//!
//! GPU memory ceilings on mobile hardware are unpredictable, so loading walks a
//! descending list of GPU-offload layer counts until one fits, then falls back
//! to CPU-only. Attempts run strictly one after another: a failed attempt is
//! fully released before the next starts. The first (load, context) pair that
//! works is persisted so later cold starts need a single attempt.

use std::path::Path;

use crate::inference::runtime::{Backend, ContextParams, Model, RuntimeError};
use crate::inference::session::{Session, SessionError};
use crate::storage::known_good::{KeyValueStore, LoadConfig};
use crate::storage::settings::SessionSettings;
use crate::system::probe::StartGuess;
use crate::system::resources::inference_threads;

/// Layer count requesting that every layer be offloaded
pub const FULL_OFFLOAD_LAYERS: u32 = i32::MAX as u32;

/// First cascade candidate when nothing was saved
const SEED_CANDIDATE: u32 = 1024;

/// Starting guesses at or above this use the long GPU ladder
const HIGH_TIER_LAYERS: u32 = 999;

/// Candidate GPU-layer counts, strictly descending and ending at zero.
///
/// The list is seeded from the starting guess and the tier it falls into;
/// anything not strictly below the previous entry is dropped. A high-tier
/// guess that was not saved only picks the ladder and is not tried itself.
pub fn gpu_layer_candidates(start_gpu_layers: u32, had_saved_config: bool) -> Vec<u32> {
    let mut raw = Vec::with_capacity(10);
    if !had_saved_config {
        raw.push(SEED_CANDIDATE);
    }
    if had_saved_config || start_gpu_layers < HIGH_TIER_LAYERS {
        raw.push(start_gpu_layers);
    }
    if start_gpu_layers >= HIGH_TIER_LAYERS {
        raw.extend([512, 256, 128, 64, 32, 16, 8, 0]);
    } else if start_gpu_layers >= 64 {
        raw.extend([32, 16, 8, 0]);
    } else {
        raw.extend([8, 0]);
    }

    let mut candidates: Vec<u32> = Vec::with_capacity(raw.len());
    for candidate in raw {
        if candidates.last().map_or(true, |&last| candidate < last) {
            candidates.push(candidate);
        }
    }
    candidates
}

fn try_load<'b, B: Backend>(
    backend: &'b B,
    path: &Path,
    gpu_layers: u32,
) -> Result<B::Model<'b>, RuntimeError> {
    tracing::info!("Attempting model load with n_gpu_layers={}", gpu_layers);
    match backend.load_model(path, gpu_layers) {
        Ok(model) => {
            tracing::info!("Model loaded with n_gpu_layers={}", gpu_layers);
            Ok(model)
        }
        Err(e) => {
            tracing::warn!("Could not load with n_gpu_layers={}: {}", gpu_layers, e);
            Err(e)
        }
    }
}

/// Loads the model, walking the fallback cascade.
///
/// Returns the model together with the GPU layer count that worked.
pub fn load_model_with_fallback<'b, B: Backend>(
    backend: &'b B,
    path: &Path,
    guess: &StartGuess,
) -> Result<(B::Model<'b>, u32), SessionError> {
    if !backend.supports_gpu_offload() {
        tracing::info!("GPU offload unavailable. Forcing n_gpu_layers=0");
        return try_load(backend, path, 0)
            .map(|model| (model, 0))
            .map_err(|e| SessionError::CouldNotInitializeContext(e.to_string()));
    }

    if !guess.had_saved_config {
        tracing::info!("Attempting full GPU offload first");
        if let Ok(model) = try_load(backend, path, FULL_OFFLOAD_LAYERS) {
            return Ok((model, FULL_OFFLOAD_LAYERS));
        }
    }

    for candidate in gpu_layer_candidates(guess.gpu_layers, guess.had_saved_config) {
        if let Ok(model) = try_load(backend, path, candidate) {
            return Ok((model, candidate));
        }
    }

    tracing::warn!("GPU attempts failed. Trying CPU-only fallback");
    try_load(backend, path, 0)
        .map(|model| (model, 0))
        .map_err(|e| {
            tracing::error!("CPU-only model load also failed");
            SessionError::CouldNotInitializeContext(e.to_string())
        })
}

fn context_params(context_length: u32, settings: &SessionSettings) -> ContextParams {
    ContextParams {
        n_ctx: context_length,
        n_threads: inference_threads(),
        n_batch: settings.batch_capacity,
        n_seq_max: settings.max_sequence_ids_per_token,
    }
}

fn remember(store: &mut dyn KeyValueStore, config: LoadConfig) {
    if let Err(e) = config.write(store) {
        tracing::warn!("Failed to persist working config: {}", e);
    }
}

/// Loads a model, creates its context and runs `run` against the new session.
///
/// If context creation fails for a GPU-loaded model, the model is released and
/// the whole load is retried CPU-only. Everything acquired here is released
/// before this returns, context first, model last; the backend belongs to the
/// caller.
pub fn open_session<'b, B, F, R>(
    backend: &'b B,
    path: &Path,
    guess: StartGuess,
    settings: &SessionSettings,
    store: &mut dyn KeyValueStore,
    run: F,
) -> Result<R, SessionError>
where
    B: Backend,
    F: for<'m> FnOnce(&mut Session<'m, B::Model<'b>>) -> R,
{
    let (model, gpu_layers) = load_model_with_fallback(backend, path, &guess)?;
    let params = context_params(guess.context_length, settings);
    tracing::debug!("Creating context: {:?}", params);

    let context_error = match model.new_context(&params) {
        Ok(context) => {
            let loaded = LoadConfig {
                context_length: guess.context_length,
                gpu_layers,
            };
            remember(store, loaded);
            let mut session = Session::new(&model, context, settings, loaded, backend.name());
            tracing::info!("Loaded model description: {}", session.model_description());
            return Ok(run(&mut session));
        }
        Err(e) => e,
    };

    if gpu_layers == 0 {
        tracing::error!("CPU-only context init failed: {}", context_error);
        return Err(SessionError::CouldNotInitializeContext(context_error.to_string()));
    }

    tracing::warn!(
        "Context init failed with n_gpu_layers={} ({}), retrying CPU-only",
        gpu_layers,
        context_error
    );
    drop(model);

    let cpu_model = backend.load_model(path, 0).map_err(|e| {
        tracing::error!("CPU-only model load failed: {}", e);
        SessionError::CouldNotInitializeContext(e.to_string())
    })?;
    let context = cpu_model.new_context(&params).map_err(|e| {
        tracing::error!("CPU-only context init failed: {}", e);
        SessionError::CouldNotInitializeContext(e.to_string())
    })?;

    let loaded = LoadConfig {
        context_length: guess.context_length,
        gpu_layers: 0,
    };
    remember(store, loaded);
    let mut session = Session::new(&cpu_model, context, settings, loaded, backend.name());
    tracing::info!(
        "Loaded model description (CPU-only fallback): {}",
        session.model_description()
    );
    Ok(run(&mut session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{ContextFailure, MockBackend, MockRuntime};
    use crate::storage::known_good::MemoryStore;
    use crate::system::probe::probe;
    use crate::system::resources::FixedMemory;

    fn fresh_guess() -> StartGuess {
        StartGuess {
            context_length: 2048,
            gpu_layers: 999,
            had_saved_config: false,
        }
    }

    fn open(
        runtime: MockRuntime,
        guess: StartGuess,
        store: &mut MemoryStore,
    ) -> Result<LoadConfig, SessionError> {
        let backend = MockBackend::new(runtime);
        open_session(
            &backend,
            Path::new("model.gguf"),
            guess,
            &SessionSettings::default(),
            store,
            |session| session.loaded_config(),
        )
    }

    fn attempted_layers(runtime: &MockRuntime) -> Vec<u32> {
        runtime
            .events
            .matching("load gpu_layers=")
            .iter()
            .map(|e| e["load gpu_layers=".len()..].parse().unwrap())
            .collect()
    }

    #[test]
    fn test_candidates_by_tier() {
        assert_eq!(
            gpu_layer_candidates(999, false),
            vec![1024, 512, 256, 128, 64, 32, 16, 8, 0]
        );
        assert_eq!(
            gpu_layer_candidates(5000, false),
            vec![1024, 512, 256, 128, 64, 32, 16, 8, 0]
        );
        assert_eq!(gpu_layer_candidates(64, false), vec![1024, 64, 32, 16, 8, 0]);
        assert_eq!(gpu_layer_candidates(16, false), vec![1024, 16, 8, 0]);
        assert_eq!(gpu_layer_candidates(64, true), vec![64, 32, 16, 8, 0]);
    }

    #[test]
    fn test_saved_high_tier_value_is_retried() {
        assert_eq!(
            gpu_layer_candidates(999, true),
            vec![999, 512, 256, 128, 64, 32, 16, 8, 0]
        );
        assert_eq!(
            gpu_layer_candidates(FULL_OFFLOAD_LAYERS, true)[..2],
            [FULL_OFFLOAD_LAYERS, 512]
        );
    }

    #[test]
    fn test_candidates_strictly_descending() {
        for start in [0, 1, 5, 8, 9, 32, 63, 64, 100, 512, 998, 999, 1024, 5000, FULL_OFFLOAD_LAYERS] {
            for saved in [true, false] {
                let list = gpu_layer_candidates(start, saved);
                assert!(list.windows(2).all(|w| w[0] > w[1]), "{start} {saved}: {list:?}");
                assert_eq!(list.last(), Some(&0));
            }
        }
    }

    #[test]
    fn test_first_full_offload_success_is_persisted() {
        let mut runtime = MockRuntime::scripted(&[]);
        runtime.gpu_offload = true;
        let mut store = MemoryStore::default();

        let loaded = open(runtime.clone(), fresh_guess(), &mut store).unwrap();

        assert_eq!(loaded.gpu_layers, FULL_OFFLOAD_LAYERS);
        assert_eq!(attempted_layers(&runtime), vec![FULL_OFFLOAD_LAYERS]);
        assert_eq!(LoadConfig::read(&store), Some(loaded));
    }

    #[test]
    fn test_cascade_reaches_cpu_once_in_descending_order() {
        let mut runtime = MockRuntime::scripted(&[]).loadable_only(&[0]);
        runtime.gpu_offload = true;
        let mut store = MemoryStore::default();

        let loaded = open(runtime.clone(), fresh_guess(), &mut store).unwrap();

        let attempts = attempted_layers(&runtime);
        let mut expected = vec![FULL_OFFLOAD_LAYERS];
        expected.extend(gpu_layer_candidates(999, false));
        assert_eq!(attempts, expected);
        assert!(attempts.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(loaded.gpu_layers, 0);
        assert_eq!(
            LoadConfig::read(&store),
            Some(LoadConfig {
                context_length: 2048,
                gpu_layers: 0
            })
        );
    }

    #[test]
    fn test_cascade_stops_at_first_working_candidate() {
        let mut runtime = MockRuntime::scripted(&[]).loadable_only(&[128, 64, 0]);
        runtime.gpu_offload = true;
        let mut store = MemoryStore::default();

        let loaded = open(runtime.clone(), fresh_guess(), &mut store).unwrap();

        assert_eq!(loaded.gpu_layers, 128);
        assert_eq!(
            attempted_layers(&runtime),
            vec![FULL_OFFLOAD_LAYERS, 1024, 512, 256, 128]
        );
    }

    #[test]
    fn test_saved_config_loads_in_one_attempt() {
        let mut runtime = MockRuntime::scripted(&[]);
        runtime.gpu_offload = true;
        let mut store = MemoryStore::default();
        LoadConfig {
            context_length: 1024,
            gpu_layers: 64,
        }
        .write(&mut store)
        .unwrap();

        let guess = probe(&store, &FixedMemory(None));
        let loaded = open(runtime.clone(), guess, &mut store).unwrap();

        assert_eq!(attempted_layers(&runtime), vec![64]);
        assert_eq!(
            loaded,
            LoadConfig {
                context_length: 1024,
                gpu_layers: 64
            }
        );
    }

    #[test]
    fn test_successful_load_feeds_next_probe() {
        let mut runtime = MockRuntime::scripted(&[]).loadable_only(&[64, 0]);
        runtime.gpu_offload = true;
        let mut store = MemoryStore::default();
        let guess = StartGuess {
            context_length: 1024,
            gpu_layers: 64,
            had_saved_config: false,
        };
        open(runtime, guess, &mut store).unwrap();

        let next = probe(&store, &FixedMemory(Some(16_000_000_000)));
        assert_eq!(
            next,
            StartGuess {
                context_length: 1024,
                gpu_layers: 64,
                had_saved_config: true
            }
        );
    }

    #[test]
    fn test_cpu_only_device_makes_single_attempt() {
        let runtime = MockRuntime::scripted(&[]);
        let mut store = MemoryStore::default();

        let loaded = open(runtime.clone(), fresh_guess(), &mut store).unwrap();

        assert_eq!(attempted_layers(&runtime), vec![0]);
        assert_eq!(loaded.gpu_layers, 0);
    }

    #[test]
    fn test_safety_net_retries_cpu_after_exhausted_cascade() {
        let mut runtime = MockRuntime::scripted(&[]).loadable_only(&[]);
        runtime.gpu_offload = true;
        let mut store = MemoryStore::default();

        let err = open(runtime.clone(), fresh_guess(), &mut store).unwrap_err();

        assert!(matches!(err, SessionError::CouldNotInitializeContext(_)));
        let attempts = attempted_layers(&runtime);
        assert_eq!(attempts.last(), Some(&0));
        assert_eq!(attempts.iter().filter(|&&n| n == 0).count(), 2);
        assert_eq!(LoadConfig::read(&store), None);
    }

    #[test]
    fn test_context_failure_on_gpu_retries_cpu() {
        let mut runtime = MockRuntime::scripted(&[]);
        runtime.gpu_offload = true;
        runtime.context_failure = ContextFailure::WithGpu;
        let events = runtime.events.clone();
        let mut store = MemoryStore::default();

        let loaded = open(runtime, fresh_guess(), &mut store).unwrap();

        assert_eq!(loaded.gpu_layers, 0);
        let log = events.snapshot();
        let free_gpu = log
            .iter()
            .position(|e| e == &format!("free model gpu_layers={FULL_OFFLOAD_LAYERS}"))
            .unwrap();
        let load_cpu = log.iter().position(|e| e == "load gpu_layers=0").unwrap();
        assert!(free_gpu < load_cpu, "GPU model must be released first: {log:?}");
        assert_eq!(LoadConfig::read(&store).unwrap().gpu_layers, 0);
    }

    #[test]
    fn test_context_failure_everywhere_is_terminal_and_releases_once() {
        let mut runtime = MockRuntime::scripted(&[]);
        runtime.gpu_offload = true;
        runtime.context_failure = ContextFailure::Always;
        let events = runtime.events.clone();
        let mut store = MemoryStore::default();

        let err = open(runtime, fresh_guess(), &mut store).unwrap_err();
        assert!(matches!(err, SessionError::CouldNotInitializeContext(_)));

        let log = events.snapshot();
        let loads = events.matching("load gpu_layers=");
        let frees = events.matching("free model");
        assert_eq!(loads.len(), 2);
        assert_eq!(frees.len(), 2);
        assert!(events.matching("free context").is_empty());
        assert_eq!(log.last().map(String::as_str), Some("free backend"));
        assert_eq!(LoadConfig::read(&store), None);
    }

    #[test]
    fn test_session_teardown_order() {
        let runtime = MockRuntime::scripted(&["a"]);
        let events = runtime.events.clone();
        let mut store = MemoryStore::default();

        open(runtime, fresh_guess(), &mut store).unwrap();

        let releases: Vec<String> = events
            .snapshot()
            .into_iter()
            .filter(|e| e.starts_with("free"))
            .collect();
        assert_eq!(
            releases,
            vec![
                "free sampler".to_string(),
                "free context".to_string(),
                "free model gpu_layers=0".to_string(),
                "free backend".to_string(),
            ]
        );
    }
}
