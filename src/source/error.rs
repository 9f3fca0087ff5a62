//! Error types for array-store access.

use thiserror::Error;

/// Failures while fetching raw objects from a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    #[error("cannot connect to {url}")]
    Connect { url: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while interpreting Zarr metadata or chunk payloads.
#[derive(Debug, Error)]
pub enum ZarrError {
    #[error("missing metadata object: {0}")]
    MissingMetadata(String),

    #[error("invalid metadata in {key}: {message}")]
    InvalidMetadata { key: String, message: String },

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("corrupt chunk {key}: {message}")]
    CorruptChunk { key: String, message: String },

    #[error("decompression failed: {0}")]
    Decompress(String),
}
