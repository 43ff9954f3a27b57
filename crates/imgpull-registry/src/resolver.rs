//! Manifest resolution.
//!
//! Turns a reference into the single-platform image manifest to download,
//! descending through a manifest list or OCI index when the registry
//! returns one.

use std::sync::Arc;
use std::time::Duration;

use imgpull_core::manifest::media_type;
use imgpull_core::{Digest, ImageManifest, ImageReference, ManifestDocument, ManifestKind, Platform};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use url::Url;

use crate::auth::AuthClient;
use crate::config::PullConfig;
use crate::error::{RegistryError, Result};
use crate::retry::{retry, RetryPolicy};
use crate::router::{follow_redirects, sanitize_url, NetworkRouter};

const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

/// A manifest ready for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedManifest {
    /// Single-platform manifest. Schema-1 documents arrive converted.
    pub manifest: ImageManifest,
    /// Digest of the manifest document.
    pub digest: Digest,
    /// Kind of the manifest document as served.
    pub kind: ManifestKind,
    /// Platform the manifest was selected for.
    pub platform: Platform,
    /// Digest of the manifest list it was selected from, if any.
    pub index_digest: Option<Digest>,
    /// Config bytes synthesized from a schema-1 manifest; there is no config
    /// blob to download in that case.
    pub embedded_config: Option<Vec<u8>>,
}

struct FetchedDocument {
    document: ManifestDocument,
    digest: Digest,
}

/// Fetches and resolves manifests for one registry.
#[derive(Debug)]
pub struct ManifestResolver {
    router: Arc<NetworkRouter>,
    auth: Arc<AuthClient>,
    base: Url,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl ManifestResolver {
    /// Creates a resolver against the registry API at `base`.
    #[must_use]
    pub fn new(router: Arc<NetworkRouter>, auth: Arc<AuthClient>, base: Url, config: &PullConfig) -> Self {
        Self {
            router,
            auth,
            base,
            retry: config.retry.clone(),
            request_timeout: config.request_timeout,
        }
    }

    /// Resolves `reference` to the manifest for `platform`.
    ///
    /// Single-platform manifests are returned as-is whatever `platform`
    /// says; the registry only knows one.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::ManifestNotFound`] if the registry has no such manifest
    /// - [`RegistryError::PlatformNotFound`] if a list has no matching entry
    /// - [`RegistryError::UnsupportedMediaType`] for unknown or nested documents
    /// - [`RegistryError::ManifestDigestMismatch`] if a by-digest fetch does not verify
    pub async fn resolve(&self, reference: &ImageReference, platform: &Platform) -> Result<ResolvedManifest> {
        let repository = reference.repository();
        let top = self
            .fetch(repository, &reference.reference().to_string(), reference.digest())
            .await?;

        match top.document {
            ManifestDocument::OciIndex(list) | ManifestDocument::DockerList(list) => {
                let entry = list
                    .select(platform)
                    .ok_or_else(|| RegistryError::PlatformNotFound {
                        requested: platform.clone(),
                        available: list.available_platforms(),
                    })?;
                let selected = entry.platform.clone().unwrap_or_else(|| platform.clone());
                tracing::info!(
                    platform = %selected,
                    digest = %entry.digest,
                    "selected platform manifest"
                );

                let child = self
                    .fetch(repository, &entry.digest.to_string(), Some(&entry.digest))
                    .await?;
                if child.document.kind().is_index() {
                    return Err(RegistryError::UnsupportedMediaType {
                        media_type: format!("{} (nested index)", child.document.kind().media_type()),
                    });
                }
                finish(child, selected, Some(top.digest))
            }
            document => finish(
                FetchedDocument {
                    document,
                    digest: top.digest,
                },
                platform.clone(),
                None,
            ),
        }
    }

    async fn fetch(
        &self,
        repository: &str,
        reference: &str,
        expected: Option<&Digest>,
    ) -> Result<FetchedDocument> {
        let path = format!("v2/{repository}/manifests/{reference}");
        let url = self.base.join(&path).map_err(|_| RegistryError::InvalidUrl {
            url: format!("{}{path}", self.base),
        })?;

        let (content_type, header_digest, body) = retry(&self.retry, "manifest", |_| {
            self.fetch_once(repository, reference, &url)
        })
        .await?;

        let kind = ManifestKind::detect(content_type.as_deref(), &body).ok_or_else(|| {
            RegistryError::UnsupportedMediaType {
                media_type: content_type.clone().unwrap_or_else(|| "unknown".to_string()),
            }
        })?;

        let digest = match expected {
            // Signed schema-1 bodies do not hash to their digest.
            Some(expected) if kind == ManifestKind::Schema1 => expected.clone(),
            Some(expected) => {
                let actual = expected.compute_like(&body);
                if &actual != expected {
                    return Err(RegistryError::ManifestDigestMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
                actual
            }
            None => header_digest.unwrap_or_else(|| Digest::sha256_of(&body)),
        };

        tracing::debug!(
            repository,
            reference,
            media_type = kind.media_type(),
            digest = %digest,
            "fetched manifest"
        );
        Ok(FetchedDocument {
            document: ManifestDocument::parse(kind, &body)?,
            digest,
        })
    }

    async fn fetch_once(
        &self,
        repository: &str,
        reference: &str,
        url: &Url,
    ) -> Result<(Option<String>, Option<Digest>, Vec<u8>)> {
        let (client, _) = self.router.client_for(url)?;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(media_type::ACCEPT));
        let response = self
            .auth
            .send(repository, self.request_timeout, |authorization| {
                let mut request = client.get(url.clone()).headers(headers.clone());
                if let Some(value) = authorization {
                    request = request.header(AUTHORIZATION, value);
                }
                Ok(request)
            })
            .await?;
        let authorization = self.auth.authorization(repository);
        let response = follow_redirects(
            &self.router,
            response,
            self.request_timeout,
            &headers,
            authorization.as_deref(),
        )
        .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::ManifestNotFound {
                repository: repository.to_string(),
                reference: reference.to_string(),
            });
        }
        let response_url = sanitize_url(response.url().as_str());
        if !status.is_success() {
            return Err(RegistryError::Http {
                status: status.as_u16(),
                url: response_url,
            });
        }

        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let header_digest = headers
            .get(CONTENT_DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<Digest>().ok());

        let body = tokio::time::timeout(self.request_timeout, response.bytes())
            .await
            .map_err(|_| RegistryError::Timeout { url: response_url })??;
        Ok((content_type, header_digest, body.to_vec()))
    }
}

fn finish(fetched: FetchedDocument, platform: Platform, index_digest: Option<Digest>) -> Result<ResolvedManifest> {
    let kind = fetched.document.kind();
    let (manifest, embedded_config) = match fetched.document {
        ManifestDocument::OciManifest(manifest) | ManifestDocument::DockerV2(manifest) => (manifest, None),
        ManifestDocument::Schema1(legacy) => {
            tracing::warn!(
                digest = %fetched.digest,
                "registry served a deprecated schema 1 manifest, converting"
            );
            let (manifest, config) = legacy.to_image_manifest()?;
            (manifest, Some(config))
        }
        ManifestDocument::OciIndex(_) | ManifestDocument::DockerList(_) => {
            return Err(RegistryError::UnsupportedMediaType {
                media_type: kind.media_type().to_string(),
            });
        }
    };
    Ok(ResolvedManifest {
        manifest,
        digest: fetched.digest,
        kind,
        platform,
        index_digest,
        embedded_config,
    })
}
