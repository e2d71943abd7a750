//! Model file checks
//!
//! Cheap checks run before handing a path to the native loader: the path is
//! non-empty, the file exists, and it starts with a supported GGUF header.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

/// Errors that can occur while checking a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model path is empty")]
    PathEmpty,

    #[error("Could not locate model at {0}")]
    NotFound(String),

    #[error("Failed to read model file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fixed-size header at the start of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

/// Runs every pre-load check on `path` and returns the parsed header.
pub fn check_model_file(path: &Path) -> Result<GgufHeader, ModelError> {
    if path.as_os_str().is_empty() {
        return Err(ModelError::PathEmpty);
    }
    if !path.is_file() {
        return Err(ModelError::NotFound(path.display().to_string()));
    }
    let header = validate_gguf(path)?;
    tracing::debug!(
        "GGUF v{} header: {} tensors, {} metadata entries",
        header.version,
        header.tensor_count,
        header.metadata_kv_count
    );
    Ok(header)
}

/// Reads and validates the GGUF header of `path`.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    file.by_ref()
        .take(HEADER_LEN as u64)
        .read_to_end(&mut header)?;
    parse_header(&header)
}

fn parse_header(bytes: &[u8]) -> Result<GgufHeader, ModelError> {
    if bytes.len() < HEADER_LEN {
        return Err(ModelError::FileTooSmall);
    }

    let u32_at = |at: usize| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[at..at + 4]);
        u32::from_le_bytes(buf)
    };
    let u64_at = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[at..at + 8]);
        u64::from_le_bytes(buf)
    };

    let magic = u32_at(0);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = u32_at(4);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: u64_at(8),
        metadata_kv_count: u64_at(16),
    })
}
