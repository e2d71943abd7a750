//! Starting guess for the load configuration
//!
//! A saved last-known-good pair always wins. Without one, available memory is
//! bucketed into three tiers with fixed (context length, GPU layers) defaults.

use crate::storage::known_good::{KeyValueStore, LoadConfig};
use crate::system::resources::MemoryProbe;

const LOW_MEMORY_BYTES: u64 = 2_000_000_000;
const MID_MEMORY_BYTES: u64 = 4_000_000_000;

/// Where the fallback cascade starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartGuess {
    pub context_length: u32,
    pub gpu_layers: u32,
    pub had_saved_config: bool,
}

/// Memory tier defaults as (context length, GPU layers)
pub fn tier_defaults(available_bytes: u64) -> (u32, u32) {
    if available_bytes < LOW_MEMORY_BYTES {
        (512, 16)
    } else if available_bytes < MID_MEMORY_BYTES {
        (1024, 64)
    } else {
        (2048, 999)
    }
}

/// Produces the starting guess. Never fails: unknown memory maps to the
/// lowest tier.
pub fn probe(store: &dyn KeyValueStore, memory: &dyn MemoryProbe) -> StartGuess {
    if let Some(saved) = LoadConfig::read(store) {
        tracing::info!(
            "Using saved config: n_ctx={}, n_gpu_layers={}",
            saved.context_length,
            saved.gpu_layers
        );
        return StartGuess {
            context_length: saved.context_length,
            gpu_layers: saved.gpu_layers,
            had_saved_config: true,
        };
    }

    let available = memory.available_bytes().unwrap_or(0);
    tracing::info!("Available memory: {} MB", available / 1024 / 1024);

    let (context_length, gpu_layers) = tier_defaults(available);
    tracing::info!(
        "Starting guess: n_ctx={}, n_gpu_layers={}",
        context_length,
        gpu_layers
    );

    StartGuess {
        context_length,
        gpu_layers,
        had_saved_config: false,
    }
}
