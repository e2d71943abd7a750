//! Settings storage
//!
//! Manages persistence of session parameters (sampling, batch sizing, length
//! budget and stop sequences).

use crate::inference::batch::DEFAULT_BATCH_CAPACITY;
use crate::storage::{get_data_dir, write_json, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Largest batch the session will allocate
pub const MAX_BATCH_CAPACITY: u32 = 8192;

/// Largest number of sequence ids per batch slot
pub const MAX_SEQUENCE_IDS: u32 = 64;

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Temperature for sampling (0.0 - 2.0)
    pub temperature: f32,
    /// Seed for the distribution sampler
    pub seed: u32,
    /// Fixed number of token slots in the batch buffer
    pub batch_capacity: u32,
    /// Sequence ids stored per batch slot
    pub max_sequence_ids_per_token: u32,
    /// Maximum number of tokens to generate per prompt
    pub max_tokens: u32,
    /// Generation stops once any of these appears in the output
    pub stop_sequences: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            seed: 1234,
            batch_capacity: DEFAULT_BATCH_CAPACITY as u32,
            max_sequence_ids_per_token: 1,
            max_tokens: 128,
            stop_sequences: Vec::new(),
        }
    }
}

impl SessionSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        if !self.temperature.is_finite() {
            self.temperature = 0.5;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if self.batch_capacity == 0 {
            self.batch_capacity = DEFAULT_BATCH_CAPACITY as u32;
        } else if self.batch_capacity > MAX_BATCH_CAPACITY {
            tracing::warn!(
                "batch_capacity {} exceeds {}, clamping",
                self.batch_capacity, MAX_BATCH_CAPACITY
            );
            self.batch_capacity = MAX_BATCH_CAPACITY;
        }

        if self.max_sequence_ids_per_token == 0 {
            self.max_sequence_ids_per_token = 1;
        } else if self.max_sequence_ids_per_token > MAX_SEQUENCE_IDS {
            tracing::warn!(
                "max_sequence_ids_per_token {} exceeds {}, clamping",
                self.max_sequence_ids_per_token, MAX_SEQUENCE_IDS
            );
            self.max_sequence_ids_per_token = MAX_SEQUENCE_IDS;
        }

        if self.max_tokens == 0 {
            self.max_tokens = 128;
        }

        self.stop_sequences.retain(|s| !s.is_empty());
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> SessionSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            SessionSettings::default()
        }
    }
}

/// Loads and validates settings from `path`
pub fn load_settings_from(path: &Path) -> Result<SessionSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(SessionSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: SessionSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &SessionSettings) -> Result<(), StorageError> {
    save_settings_to(&get_settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &SessionSettings) -> Result<(), StorageError> {
    write_json(path, settings)?;
    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
