//! Progress events.
//!
//! The pull pipeline never prints. It reports [`ProgressEvent`]s to a
//! [`ProgressSink`] supplied by the caller; events are advisory and a sink
//! cannot influence control flow.

use std::path::PathBuf;

use crate::digest::Digest;
use crate::platform::Platform;

/// Something observable happened during a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The manifest for the requested platform is known.
    ManifestResolved {
        /// Manifest digest.
        digest: Digest,
        /// Platform the manifest was selected for.
        platform: Platform,
        /// Number of layers.
        layers: usize,
    },

    /// A blob download started.
    BlobStarted {
        /// Blob digest.
        digest: Digest,
        /// Declared size, if known.
        total: Option<u64>,
    },

    /// More bytes of a blob arrived. `downloaded` never decreases for a digest.
    BlobProgress {
        /// Blob digest.
        digest: Digest,
        /// Bytes received so far.
        downloaded: u64,
        /// Declared size, if known.
        total: Option<u64>,
    },

    /// A blob attempt failed and will be retried.
    BlobRetry {
        /// Blob digest.
        digest: Digest,
        /// Attempt about to start, 1-based.
        attempt: u32,
        /// Why the previous attempt failed.
        reason: String,
    },

    /// A blob was downloaded and verified.
    BlobCompleted {
        /// Blob digest.
        digest: Digest,
        /// Blobs completed so far.
        completed: usize,
        /// Blobs in this pull.
        total: usize,
    },

    /// The archive was written.
    ArchiveWritten {
        /// Output path.
        path: PathBuf,
        /// Number of layers in the archive.
        layers: usize,
    },
}

/// Receiver of progress events.
pub trait ProgressSink: Send + Sync {
    /// Handles one event. Called from download tasks; must not block for long.
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ManifestResolved {
                digest,
                platform,
                layers,
            } => tracing::debug!(%digest, %platform, layers, "manifest resolved"),
            ProgressEvent::BlobStarted { digest, total } => {
                tracing::debug!(%digest, ?total, "blob download started");
            }
            ProgressEvent::BlobProgress {
                digest,
                downloaded,
                total,
            } => tracing::trace!(%digest, downloaded, ?total, "blob progress"),
            ProgressEvent::BlobRetry {
                digest,
                attempt,
                reason,
            } => tracing::debug!(%digest, attempt, %reason, "blob retry"),
            ProgressEvent::BlobCompleted {
                digest,
                completed,
                total,
            } => tracing::debug!(%digest, completed, total, "blob completed"),
            ProgressEvent::ArchiveWritten { path, layers } => {
                tracing::debug!(path = %path.display(), layers, "archive written");
            }
        }
    }
}
