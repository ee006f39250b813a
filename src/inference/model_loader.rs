//! GGUF header validation.
//!
//! Reads just the fixed-size GGUF header so a wrong path or a non-GGUF file
//! fails fast with a clear error instead of deep inside the engine.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// "GGUF" read as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// GGUF versions the engine can load.
pub const SUPPORTED_VERSIONS: [u32; 2] = [2, 3];

#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("Model file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Fixed-size header at the start of every GGUF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
    /// File size in bytes.
    pub file_size: u64,
}

impl GgufHeader {
    /// Parse the header from a reader positioned at the start of the file.
    pub fn parse<R: Read>(reader: &mut R, file_size: u64) -> Result<Self, ModelLoaderError> {
        let magic = read_u32(reader)?;
        if magic != GGUF_MAGIC {
            return Err(ModelLoaderError::InvalidFormat(format!(
                "bad magic 0x{magic:08X}"
            )));
        }

        let version = read_u32(reader)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ModelLoaderError::InvalidFormat(format!(
                "unsupported version {version}"
            )));
        }

        let tensor_count = read_u64(reader)?;
        let metadata_kv_count = read_u64(reader)?;

        Ok(Self {
            version,
            tensor_count,
            metadata_kv_count,
            file_size,
        })
    }
}

/// Check that `path` is a readable GGUF file and return its header.
pub fn inspect(path: &Path) -> Result<GgufHeader, ModelLoaderError> {
    if !path.is_file() {
        return Err(ModelLoaderError::FileNotFound(path.display().to_string()));
    }

    let file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let header = GgufHeader::parse(&mut reader, file_size).map_err(|e| match e {
        ModelLoaderError::IoError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            ModelLoaderError::InvalidFormat("truncated header".to_string())
        }
        other => other,
    })?;

    info!(
        path = %path.display(),
        version = header.version,
        tensors = header.tensor_count,
        metadata = header.metadata_kv_count,
        size_mb = header.file_size / (1024 * 1024),
        "GGUF header"
    );

    Ok(header)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ModelLoaderError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, ModelLoaderError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Bytes of a minimal GGUF header, for building test fixtures.
pub fn header_bytes(version: u32, tensor_count: u64, metadata_kv_count: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&version.to_le_bytes());
    bytes.extend_from_slice(&tensor_count.to_le_bytes());
    bytes.extend_from_slice(&metadata_kv_count.to_le_bytes());
    bytes
}
