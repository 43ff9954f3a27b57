//! Concurrent, verified blob downloads.
//!
//! Each blob streams into `<dest>.partial` while being hashed. Only a body
//! whose digest matches the descriptor is renamed to `dest` and returned as
//! a [`FetchedBlob`]; anything else is deleted and retried.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use imgpull_core::{Descriptor, Digest, FetchedBlob, NoProgress, ProgressEvent, ProgressSink};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::auth::AuthClient;
use crate::config::PullConfig;
use crate::error::{FetchFailure, RegistryError, Result};
use crate::retry::{retry, RetryPolicy};
use crate::router::{follow_redirects, NetworkRouter};

/// Downloads blobs of one repository.
pub struct LayerFetcher {
    router: Arc<NetworkRouter>,
    auth: Arc<AuthClient>,
    base: Url,
    repository: String,
    retry: RetryPolicy,
    read_timeout: Duration,
    max_concurrent: usize,
    progress: Arc<dyn ProgressSink>,
    high_water: Mutex<HashMap<Digest, u64>>,
    completed: AtomicUsize,
    total: AtomicUsize,
}

impl std::fmt::Debug for LayerFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerFetcher")
            .field("base", &self.base.as_str())
            .field("repository", &self.repository)
            .field("max_concurrent", &self.max_concurrent)
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LayerFetcher {
    /// Creates a fetcher for `repository` on the registry at `base`.
    #[must_use]
    pub fn new(
        router: Arc<NetworkRouter>,
        auth: Arc<AuthClient>,
        base: Url,
        repository: impl Into<String>,
        config: &PullConfig,
    ) -> Self {
        Self {
            router,
            auth,
            base,
            repository: repository.into(),
            retry: config.retry.clone(),
            read_timeout: config.read_timeout,
            max_concurrent: config.max_concurrent_downloads.max(1),
            progress: Arc::new(NoProgress),
            high_water: Mutex::new(HashMap::new()),
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    /// Reports download progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Downloads every descriptor into `dir`, at most `max_concurrent` at a
    /// time, and returns the blobs in the order given.
    ///
    /// Descriptors sharing a digest are downloaded once. The first failure
    /// stops the batch; downloads still in flight are dropped and their
    /// partial files removed.
    ///
    /// # Errors
    ///
    /// Returns the first [`RegistryError::BlobFetch`] or
    /// [`RegistryError::Auth`] encountered.
    pub async fn fetch_all(&self, descriptors: &[Descriptor], dir: &Path) -> Result<Vec<FetchedBlob>> {
        let mut seen = HashSet::new();
        let unique: Vec<&Descriptor> = descriptors
            .iter()
            .filter(|d| seen.insert(&d.digest))
            .collect();
        self.total.fetch_add(unique.len(), Ordering::SeqCst);
        tracing::debug!(
            blobs = unique.len(),
            concurrency = self.max_concurrent,
            "downloading blobs"
        );

        let fetched: HashMap<Digest, FetchedBlob> = stream::iter(unique)
            .map(|descriptor| async move {
                let dest = dir.join(blob_file_name(&descriptor.digest));
                let blob = self.fetch(descriptor, &dest).await?;
                Ok::<_, RegistryError>((descriptor.digest.clone(), blob))
            })
            .buffer_unordered(self.max_concurrent)
            .try_collect()
            .await?;

        Ok(descriptors
            .iter()
            .filter_map(|d| fetched.get(&d.digest).cloned())
            .collect())
    }

    /// Downloads one blob to `dest`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::BlobFetch`] naming the attempts made and the
    /// last failure, or [`RegistryError::Auth`] if access is refused.
    pub async fn fetch(&self, descriptor: &Descriptor, dest: &Path) -> Result<FetchedBlob> {
        let digest = &descriptor.digest;
        let total = (descriptor.size > 0).then_some(descriptor.size);
        self.progress.on_event(&ProgressEvent::BlobStarted {
            digest: digest.clone(),
            total,
        });

        let last_failure = Mutex::new(None::<String>);
        let blob = retry(&self.retry, "blob", |attempt| {
            let last_failure = &last_failure;
            async move {
                if attempt > 1 {
                    self.progress.on_event(&ProgressEvent::BlobRetry {
                        digest: digest.clone(),
                        attempt,
                        reason: last_failure.lock().take().unwrap_or_default(),
                    });
                }
                let result = self.attempt(descriptor, dest, attempt).await;
                if let Err(e) = &result {
                    *last_failure.lock() = Some(e.to_string());
                }
                result
            }
        })
        .await?;

        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.on_event(&ProgressEvent::BlobCompleted {
            digest: digest.clone(),
            completed,
            total: self.total.load(Ordering::SeqCst).max(completed),
        });
        tracing::debug!(digest = %digest, size = blob.size(), "blob verified");
        Ok(blob)
    }

    async fn attempt(&self, descriptor: &Descriptor, dest: &Path, attempt: u32) -> Result<FetchedBlob> {
        let partial = partial_path(dest);
        match self.download(descriptor, &partial, attempt).await {
            Ok((computed, size)) if computed == descriptor.digest => {
                tokio::fs::rename(&partial, dest)
                    .await
                    .map_err(|source| RegistryError::IoError {
                        path: dest.to_path_buf(),
                        source,
                    })?;
                Ok(FetchedBlob::from_verified(descriptor.clone(), dest, &computed, size)?)
            }
            Ok((computed, _)) => {
                remove_partial(&partial).await;
                Err(blob_error(
                    descriptor,
                    attempt,
                    FetchFailure::DigestMismatch {
                        expected: descriptor.digest.clone(),
                        actual: computed,
                    },
                ))
            }
            Err(e) => {
                remove_partial(&partial).await;
                Err(e)
            }
        }
    }

    async fn download(&self, descriptor: &Descriptor, partial: &Path, attempt: u32) -> Result<(Digest, u64)> {
        let digest = &descriptor.digest;
        let path = format!("v2/{}/blobs/{digest}", self.repository);
        let url = self.base.join(&path).map_err(|_| RegistryError::InvalidUrl {
            url: format!("{}{path}", self.base),
        })?;
        let (client, _) = self.router.client_for(&url)?;

        let transport = |e: RegistryError| transport_failure(descriptor, attempt, e);
        let response = self
            .auth
            .send(&self.repository, self.read_timeout, |authorization| {
                let mut request = client.get(url.clone());
                if let Some(value) = authorization {
                    request = request.header(AUTHORIZATION, value);
                }
                Ok(request)
            })
            .await
            .map_err(transport)?;
        let authorization = self.auth.authorization(&self.repository);
        let mut response = follow_redirects(
            &self.router,
            response,
            self.read_timeout,
            &HeaderMap::new(),
            authorization.as_deref(),
        )
        .await
        .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(blob_error(descriptor, attempt, FetchFailure::Status(status.as_u16())));
        }

        let io_err = |source| RegistryError::IoError {
            path: partial.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::File::create(partial).await.map_err(io_err)?;
        let mut hasher = digest.algorithm().hasher();
        let total = (descriptor.size > 0).then_some(descriptor.size);
        let mut received = 0u64;

        loop {
            let chunk = match tokio::time::timeout(self.read_timeout, response.chunk()).await {
                Err(_) => return Err(blob_error(descriptor, attempt, FetchFailure::Stalled)),
                Ok(Err(e)) => {
                    return Err(blob_error(descriptor, attempt, FetchFailure::Network(e.to_string())));
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            };
            received += chunk.len() as u64;
            if let Some(expected) = total {
                if received > expected {
                    return Err(blob_error(descriptor, attempt, FetchFailure::SizeExceeded { expected }));
                }
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(io_err)?;
            self.report(digest, received, total);
        }
        file.flush().await.map_err(io_err)?;

        Ok((hasher.finalize(), received))
    }

    fn report(&self, digest: &Digest, downloaded: u64, total: Option<u64>) {
        {
            let mut high_water = self.high_water.lock();
            let mark = high_water.entry(digest.clone()).or_insert(0);
            if downloaded <= *mark {
                return;
            }
            *mark = downloaded;
        }
        self.progress.on_event(&ProgressEvent::BlobProgress {
            digest: digest.clone(),
            downloaded,
            total,
        });
    }
}

/// File name a blob is staged under.
fn blob_file_name(digest: &Digest) -> String {
    format!("{}-{}", digest.algorithm().as_str(), digest.hex())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

async fn remove_partial(partial: &Path) {
    if let Err(e) = tokio::fs::remove_file(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %partial.display(), error = %e, "failed to remove partial download");
        }
    }
}

fn blob_error(descriptor: &Descriptor, attempt: u32, cause: FetchFailure) -> RegistryError {
    RegistryError::BlobFetch {
        digest: descriptor.digest.clone(),
        attempts: attempt,
        cause,
    }
}

fn transport_failure(descriptor: &Descriptor, attempt: u32, err: RegistryError) -> RegistryError {
    let cause = match err {
        RegistryError::ConnectionFailed { source, .. } => FetchFailure::Network(source.to_string()),
        RegistryError::Timeout { .. } => FetchFailure::Stalled,
        RegistryError::Http { status, .. } => FetchFailure::Status(status),
        other => return other,
    };
    blob_error(descriptor, attempt, cause)
}
