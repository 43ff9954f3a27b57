//! Error types for registry operations.

use std::fmt;
use std::path::PathBuf;

use imgpull_core::{Digest, Platform};
use thiserror::Error;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Why a blob download attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Connection, TLS or body transfer error.
    Network(String),
    /// The registry or CDN answered with an error status.
    Status(u16),
    /// The body did not hash to the descriptor's digest.
    DigestMismatch {
        /// Expected digest.
        expected: Digest,
        /// Digest of the received bytes.
        actual: Digest,
    },
    /// The body was longer than the descriptor's size.
    SizeExceeded {
        /// Declared size.
        expected: u64,
    },
    /// No data arrived within the read timeout.
    Stalled,
}

impl FetchFailure {
    /// True if another attempt could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::DigestMismatch { .. } | Self::SizeExceeded { .. } | Self::Stalled => {
                true
            }
            Self::Status(status) => is_transient_status(*status),
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(message) => write!(f, "network error: {message}"),
            Self::Status(status) => write!(f, "HTTP status {status}"),
            Self::DigestMismatch { expected, actual } => {
                write!(f, "digest mismatch: expected {expected}, got {actual}")
            }
            Self::SizeExceeded { expected } => {
                write!(f, "body exceeded declared size of {expected} bytes")
            }
            Self::Stalled => f.write_str("download stalled past the read timeout"),
        }
    }
}

pub(crate) const fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// Errors that can occur while pulling an image.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry refused access.
    #[error("Authentication failed for {registry}/{repository}: {message}")]
    Auth {
        /// Registry host.
        registry: String,
        /// Repository path.
        repository: String,
        /// What was rejected.
        message: String,
    },

    /// The registry has no manifest for the reference.
    #[error("Manifest not found: {repository}:{reference}")]
    ManifestNotFound {
        /// Repository path.
        repository: String,
        /// Tag or digest.
        reference: String,
    },

    /// The registry returned a manifest type this client does not handle.
    #[error("Unsupported manifest media type: {media_type}")]
    UnsupportedMediaType {
        /// Media type returned.
        media_type: String,
    },

    /// The manifest list has no entry for the requested platform.
    #[error("No manifest for platform {requested}; available: {}", list_platforms(.available))]
    PlatformNotFound {
        /// Platform requested.
        requested: Platform,
        /// Platforms the list offers.
        available: Vec<Platform>,
    },

    /// A blob could not be downloaded and verified.
    #[error("Failed to fetch blob {digest} after {attempts} attempt(s): {cause}")]
    BlobFetch {
        /// Blob digest.
        digest: Digest,
        /// Attempts made.
        attempts: u32,
        /// Failure of the last attempt.
        cause: FetchFailure,
    },

    /// A manifest fetched by digest hashed to something else.
    #[error("Manifest digest mismatch: expected {expected}, got {actual}")]
    ManifestDigestMismatch {
        /// Digest requested.
        expected: Digest,
        /// Digest of the body received.
        actual: Digest,
    },

    /// Unexpected HTTP status.
    #[error("HTTP error from registry: {status} for {url}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Request URL.
        url: String,
    },

    /// Failed to connect.
    #[error("Failed to connect to {url}: {source}")]
    ConnectionFailed {
        /// Request URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The request did not complete in time.
    #[error("Request to {url} timed out")]
    Timeout {
        /// Request URL.
        url: String,
    },

    /// A URL could not be built.
    #[error("Invalid URL: {url}")]
    InvalidUrl {
        /// URL string.
        url: String,
    },

    /// Configuration cannot be used.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },

    /// The pull was cancelled by the caller.
    #[error("Pull cancelled")]
    Cancelled,

    /// File I/O error.
    #[error("File I/O error at {path}: {source}")]
    IoError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    JsonError {
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Error from manifest parsing or archive writing.
    #[error(transparent)]
    Core(#[from] imgpull_core::Error),
}

impl RegistryError {
    /// True for failures another attempt could fix: connection errors,
    /// timeouts, 5xx/408/429 responses and transient blob failures.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => is_transient_status(*status),
            Self::BlobFetch { cause, .. } => cause.is_transient(),
            _ => false,
        }
    }

    /// True if this is an archive write failure.
    #[must_use]
    pub const fn is_archive_write(&self) -> bool {
        matches!(self, Self::Core(imgpull_core::Error::ArchiveWriteError { .. }))
    }
}

fn list_platforms(platforms: &[Platform]) -> String {
    if platforms.is_empty() {
        return "none".to_string();
    }
    platforms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map_or_else(|| "unknown".to_string(), |u| crate::router::sanitize_url(u.as_str()));
        if err.is_timeout() {
            Self::Timeout { url }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                url,
            }
        } else {
            Self::ConnectionFailed { url, source: err }
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError { source: err }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            path: PathBuf::new(),
            source: err,
        }
    }
}
