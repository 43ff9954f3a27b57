//! End-to-end pull: resolve, download, verify, write the archive.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imgpull_core::{
    ArchiveBuilder, Digest, FetchedBlob, ImageReference, Platform, ProgressEvent, ProgressSink,
    TracingProgress,
};

use crate::auth::AuthClient;
use crate::config::PullConfig;
use crate::error::{RegistryError, Result};
use crate::fetcher::LayerFetcher;
use crate::resolver::ManifestResolver;
use crate::router::NetworkRouter;

/// Outcome of a successful pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSummary {
    /// Reference that was pulled.
    pub reference: ImageReference,
    /// Digest of the single-platform manifest.
    pub manifest_digest: Digest,
    /// Platform of the image.
    pub platform: Platform,
    /// Layer ids in the archive, lowest first.
    pub layer_ids: Vec<String>,
    /// Bytes downloaded or staged, config included.
    pub total_bytes: u64,
    /// Archive path.
    pub output: PathBuf,
}

/// Pulls images into `docker load` archives.
///
/// # Examples
///
/// ```rust,no_run
/// use std::path::Path;
/// use imgpull_registry::{ImagePuller, PullConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let puller = ImagePuller::new(PullConfig::new())?;
/// let reference = "alpine:3.18".parse()?;
/// let summary = puller.pull(&reference, Path::new("alpine_3.18.tar")).await?;
/// println!("wrote {} layers", summary.layer_ids.len());
/// # Ok(())
/// # }
/// ```
pub struct ImagePuller {
    config: PullConfig,
    progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ImagePuller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePuller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ImagePuller {
    /// Creates a puller. Progress goes to `tracing` until
    /// [`with_progress`](Self::with_progress) replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidConfig`] if the configuration fails
    /// [`PullConfig::validate`].
    pub fn new(config: PullConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            progress: Arc::new(TracingProgress),
        })
    }

    /// Sends progress events to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PullConfig {
        &self.config
    }

    /// Pulls `reference` into an archive at `output`.
    ///
    /// # Errors
    ///
    /// Returns the first failure of resolution, download or archive writing.
    /// On any failure `output` is left untouched and staged blobs are removed.
    pub async fn pull(&self, reference: &ImageReference, output: &Path) -> Result<PullSummary> {
        self.pull_until(reference, output, std::future::pending()).await
    }

    /// Like [`pull`](Self::pull), but gives up with
    /// [`RegistryError::Cancelled`] as soon as `cancel` completes.
    ///
    /// In-flight requests are dropped and staged blobs removed. A cancel
    /// arriving while the archive is being written takes effect once the
    /// write finishes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Cancelled`] or the pull's own failure.
    pub async fn pull_until<C>(&self, reference: &ImageReference, output: &Path, cancel: C) -> Result<PullSummary>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            () = cancel => {
                tracing::warn!(reference = %reference, "pull cancelled");
                Err(RegistryError::Cancelled)
            }
            result = self.run(reference, output) => result,
        }
    }

    async fn run(&self, reference: &ImageReference, output: &Path) -> Result<PullSummary> {
        let api_host = reference.api_host();
        let base = self.config.registry_base(api_host)?;

        let mut router = NetworkRouter::new(&self.config)?.with_api_host(api_host);
        if let Some(host) = base.host_str() {
            router = router.with_api_host(host);
        }
        let router = Arc::new(router);
        let auth = Arc::new(AuthClient::new(router.clone(), &self.config, reference.registry()));
        let resolver = ManifestResolver::new(router.clone(), auth.clone(), base.clone(), &self.config);

        tracing::info!(
            reference = %reference,
            platform = %self.config.platform,
            registry = %crate::router::sanitize_url(base.as_str()),
            "pulling image"
        );
        let resolved = resolver.resolve(reference, &self.config.platform).await?;
        self.progress.on_event(&ProgressEvent::ManifestResolved {
            digest: resolved.digest.clone(),
            platform: resolved.platform.clone(),
            layers: resolved.manifest.layers.len(),
        });

        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".imgpull-")
            .tempdir_in(&parent)
            .map_err(|source| RegistryError::IoError {
                path: parent.clone(),
                source,
            })?;

        let fetcher = LayerFetcher::new(router, auth, base, reference.repository(), &self.config)
            .with_progress(self.progress.clone());

        let mut wanted = Vec::with_capacity(resolved.manifest.layers.len() + 1);
        let embedded = match &resolved.embedded_config {
            Some(bytes) => {
                let path = staging.path().join("config.json");
                std::fs::write(&path, bytes).map_err(|source| RegistryError::IoError {
                    path: path.clone(),
                    source,
                })?;
                Some(FetchedBlob::verify_file(resolved.manifest.config.clone(), path)?)
            }
            None => {
                wanted.push(resolved.manifest.config.clone());
                None
            }
        };
        wanted.extend(resolved.manifest.layers.iter().cloned());

        let mut blobs = fetcher.fetch_all(&wanted, staging.path()).await?;
        let config = match embedded {
            Some(config) => config,
            None if !blobs.is_empty() => blobs.remove(0),
            None => {
                return Err(imgpull_core::Error::InvalidManifest {
                    reason: "config blob missing from download batch".to_string(),
                }
                .into())
            }
        };
        let total_bytes = config.size() + blobs.iter().map(FetchedBlob::size).sum::<u64>();

        let archive = ArchiveBuilder::for_reference(reference).build(&resolved.manifest, &config, &blobs, output)?;
        self.progress.on_event(&ProgressEvent::ArchiveWritten {
            path: archive.path.clone(),
            layers: archive.layer_ids.len(),
        });

        if let Err(e) = staging.close() {
            tracing::warn!(error = %e, "failed to remove staging directory");
        }

        Ok(PullSummary {
            reference: reference.clone(),
            manifest_digest: resolved.digest,
            platform: resolved.platform,
            layer_ids: archive.layer_ids,
            total_bytes,
            output: archive.path,
        })
    }
}
