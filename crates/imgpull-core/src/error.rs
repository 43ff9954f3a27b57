//! Error types for imgpull core operations.
//!
//! This module defines the error types used throughout the `imgpull-core` crate.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in imgpull core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Image reference could not be parsed.
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference {
        /// The reference as supplied.
        reference: String,
        /// Reason the reference was rejected.
        reason: String,
    },

    /// Digest string is malformed.
    #[error("Invalid digest '{digest}': {reason}")]
    InvalidDigest {
        /// The digest as supplied.
        digest: String,
        /// Reason the digest was rejected.
        reason: String,
    },

    /// Digest uses an algorithm this crate cannot compute.
    #[error("Unsupported digest algorithm: {algorithm}")]
    UnsupportedDigestAlgorithm {
        /// Algorithm name.
        algorithm: String,
    },

    /// Content did not hash to the expected digest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest declared by the descriptor.
        expected: String,
        /// Digest computed over the content.
        actual: String,
    },

    /// Manifest document is structurally invalid.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest {
        /// Reason the manifest was rejected.
        reason: String,
    },

    /// Platform string could not be parsed.
    #[error("Invalid platform '{platform}': expected os/arch[/variant]")]
    InvalidPlatform {
        /// The platform as supplied.
        platform: String,
    },

    /// A staged blob could not be read.
    #[error("Failed to read blob at {path}: {source}")]
    BlobReadError {
        /// Blob path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Reading a blob or writing the archive failed.
    #[error("Failed to write archive at {path}: {source}")]
    ArchiveWriteError {
        /// Path being written or read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
