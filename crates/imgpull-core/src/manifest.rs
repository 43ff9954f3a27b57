//! Manifest documents served by Docker Registry v2 and OCI distribution APIs.
//!
//! A registry answers a manifest request with one of five document kinds.
//! [`ManifestKind::detect`] decides which one from the response's
//! `Content-Type` and body, and [`ManifestDocument::parse`] yields a tagged
//! value the resolver pattern-matches on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::platform::Platform;

/// Media type strings understood by the resolver.
pub mod media_type {
    /// OCI image manifest.
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

    /// OCI image index.
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    /// Docker image manifest, schema 2.
    pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

    /// Docker manifest list.
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    /// Signed Docker schema 1 manifest.
    pub const DOCKER_MANIFEST_V1_SIGNED: &str =
        "application/vnd.docker.distribution.manifest.v1+prettyjws";

    /// Unsigned Docker schema 1 manifest.
    pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";

    /// Docker image config.
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

    /// Gzip-compressed Docker layer.
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Value for the `Accept` header of manifest requests.
    pub const ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
        application/vnd.oci.image.index.v1+json, \
        application/vnd.docker.distribution.manifest.v2+json, \
        application/vnd.docker.distribution.manifest.list.v2+json, \
        application/vnd.docker.distribution.manifest.v1+prettyjws, \
        application/vnd.docker.distribution.manifest.v1+json";

    /// Content types some registries send that say nothing about the document.
    pub(crate) const GENERIC: [&str; 3] = ["application/json", "text/plain", "application/octet-stream"];
}

/// Digest of the gzip-compressed empty tar that Docker uses for metadata-only layers.
pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46ac";

/// The five manifest document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    /// OCI image manifest.
    OciManifest,
    /// OCI image index.
    OciIndex,
    /// Docker image manifest, schema 2.
    DockerV2,
    /// Docker manifest list.
    DockerList,
    /// Legacy Docker schema 1 manifest, signed or not.
    Schema1,
}

impl ManifestKind {
    /// Maps a media type (parameters allowed) to a kind.
    #[must_use]
    pub fn from_media_type(value: &str) -> Option<Self> {
        match essence(value).as_str() {
            media_type::OCI_MANIFEST => Some(Self::OciManifest),
            media_type::OCI_INDEX => Some(Self::OciIndex),
            media_type::DOCKER_MANIFEST_V2 => Some(Self::DockerV2),
            media_type::DOCKER_MANIFEST_LIST => Some(Self::DockerList),
            media_type::DOCKER_MANIFEST_V1_SIGNED | media_type::DOCKER_MANIFEST_V1 => {
                Some(Self::Schema1)
            }
            _ => None,
        }
    }

    /// Canonical media type for this kind.
    #[must_use]
    pub const fn media_type(self) -> &'static str {
        match self {
            Self::OciManifest => media_type::OCI_MANIFEST,
            Self::OciIndex => media_type::OCI_INDEX,
            Self::DockerV2 => media_type::DOCKER_MANIFEST_V2,
            Self::DockerList => media_type::DOCKER_MANIFEST_LIST,
            Self::Schema1 => media_type::DOCKER_MANIFEST_V1_SIGNED,
        }
    }

    /// True for multi-platform lists.
    #[must_use]
    pub const fn is_index(self) -> bool {
        matches!(self, Self::OciIndex | Self::DockerList)
    }

    /// Decides the kind of a manifest response.
    ///
    /// A specific `Content-Type` wins. When it is absent or generic the body's
    /// `mediaType` field decides, then the document's shape. Returns `None`
    /// for a type outside the supported set.
    #[must_use]
    pub fn detect(content_type: Option<&str>, body: &[u8]) -> Option<Self> {
        let declared = content_type
            .map(essence)
            .filter(|t| !t.is_empty() && !media_type::GENERIC.contains(&t.as_str()));
        if let Some(declared) = declared {
            return Self::from_media_type(&declared);
        }

        let shape: ManifestShape = serde_json::from_slice(body).ok()?;
        if let Some(media_type) = shape.media_type {
            return Self::from_media_type(&media_type);
        }
        if shape.schema_version == Some(1) {
            return Some(Self::Schema1);
        }
        if shape.manifests.is_some() {
            return Some(Self::OciIndex);
        }
        if shape.config.is_some() {
            return Some(Self::OciManifest);
        }
        None
    }
}

fn essence(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestShape {
    schema_version: Option<u32>,
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
    config: Option<serde_json::Value>,
}

/// Content descriptor: (media type, digest, size), optionally with a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,

    /// Content digest.
    pub digest: Digest,

    /// Size in bytes; 0 when unknown.
    #[serde(default)]
    pub size: u64,

    /// Alternate download locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Platform, present on manifest list entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }

    /// True for the well-known empty layer blob.
    #[must_use]
    pub fn is_empty_layer(&self) -> bool {
        self.digest.to_string() == EMPTY_LAYER_DIGEST
    }
}

/// A single-platform image manifest (OCI or Docker schema 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version, always 2.
    pub schema_version: u32,

    /// Media type, when the document declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Image config blob.
    pub config: Descriptor,

    /// Layers, lowest first.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A multi-platform manifest list or OCI index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    /// Schema version, always 2.
    pub schema_version: u32,

    /// Media type, when the document declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Per-platform manifest descriptors.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    /// Entries that carry a platform.
    pub fn entries(&self) -> impl Iterator<Item = (&Descriptor, &Platform)> {
        self.manifests
            .iter()
            .filter_map(|d| d.platform.as_ref().map(|p| (d, p)))
    }

    /// Platforms an image is available for, excluding attestation entries.
    #[must_use]
    pub fn available_platforms(&self) -> Vec<Platform> {
        self.entries()
            .map(|(_, p)| p)
            .filter(|p| !p.is_unknown())
            .cloned()
            .collect()
    }

    /// Selects the entry for `requested`.
    ///
    /// os and architecture must match exactly. With a requested variant an
    /// exact variant match is preferred; otherwise any variant is accepted.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_core::{ManifestList, Platform};
    ///
    /// let list: ManifestList = serde_json::from_str(r#"{
    ///     "schemaVersion": 2,
    ///     "manifests": [{
    ///         "mediaType": "application/vnd.oci.image.manifest.v1+json",
    ///         "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
    ///         "size": 100,
    ///         "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}
    ///     }]
    /// }"#).unwrap();
    ///
    /// assert!(list.select(&Platform::new("linux", "arm64")).is_some());
    /// assert!(list.select(&Platform::new("linux", "amd64")).is_none());
    /// ```
    #[must_use]
    pub fn select(&self, requested: &Platform) -> Option<&Descriptor> {
        let mut candidates = self
            .entries()
            .filter(|(_, p)| p.matches_os_arch(requested))
            .peekable();
        let first = candidates.peek().map(|(d, _)| *d);
        if requested.variant.is_none() {
            return first;
        }
        candidates
            .find(|(_, p)| p.variant == requested.variant)
            .map(|(d, _)| d)
            .or(first)
    }
}

/// A legacy schema 1 manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema1Manifest {
    /// Schema version, always 1.
    pub schema_version: u32,

    /// Repository name.
    #[serde(default)]
    pub name: String,

    /// Tag.
    #[serde(default)]
    pub tag: String,

    /// Architecture.
    #[serde(default)]
    pub architecture: String,

    /// Layers, topmost first.
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,

    /// v1 image JSON per layer, topmost first.
    #[serde(default)]
    pub history: Vec<V1History>,
}

/// One `fsLayers` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    /// Layer digest.
    pub blob_sum: Digest,
}

/// One `history` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1History {
    /// Serialized v1 image JSON.
    pub v1_compatibility: String,
}

#[derive(Debug, Default, Deserialize)]
struct V1Compatibility {
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

impl Schema1Manifest {
    /// Converts to a schema 2 shaped manifest plus a synthesized config blob.
    ///
    /// Layers are reversed into lowest-first order. The config is built from
    /// the topmost history entry; its descriptor digest is the SHA-256 of the
    /// returned bytes. Layer sizes are unknown and reported as 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] if the manifest has no layers.
    pub fn to_image_manifest(&self) -> Result<(ImageManifest, Vec<u8>)> {
        if self.fs_layers.is_empty() {
            return Err(Error::InvalidManifest {
                reason: "schema 1 manifest has no fsLayers".to_string(),
            });
        }

        let top: V1Compatibility = self
            .history
            .first()
            .and_then(|h| serde_json::from_str(&h.v1_compatibility).ok())
            .unwrap_or_default();

        let architecture = top
            .architecture
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| self.architecture.clone());
        let config = serde_json::json!({
            "architecture": architecture,
            "os": top.os.unwrap_or_else(|| "linux".to_string()),
            "created": top.created,
            "config": top.config.unwrap_or(serde_json::Value::Null),
            "rootfs": { "type": "layers", "diff_ids": [] },
        });
        let config_bytes = serde_json::to_vec(&config)?;
        let config_size = config_bytes.len() as u64;

        let layers = self
            .fs_layers
            .iter()
            .rev()
            .map(|l| Descriptor::new(media_type::DOCKER_LAYER_GZIP, l.blob_sum.clone(), 0))
            .collect();

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_type::DOCKER_MANIFEST_V2.to_string()),
            config: Descriptor::new(
                media_type::DOCKER_CONFIG,
                Digest::sha256_of(&config_bytes),
                config_size,
            ),
            layers,
            annotations: None,
        };
        Ok((manifest, config_bytes))
    }
}

/// A parsed manifest response, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDocument {
    /// OCI image manifest.
    OciManifest(ImageManifest),
    /// OCI image index.
    OciIndex(ManifestList),
    /// Docker schema 2 manifest.
    DockerV2(ImageManifest),
    /// Docker manifest list.
    DockerList(ManifestList),
    /// Docker schema 1 manifest.
    Schema1(Schema1Manifest),
}

impl ManifestDocument {
    /// Parses `body` as a document of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] if the body does not have the shape
    /// `kind` requires.
    pub fn parse(kind: ManifestKind, body: &[u8]) -> Result<Self> {
        let invalid = |e: serde_json::Error| Error::InvalidManifest {
            reason: format!("{} document: {e}", kind.media_type()),
        };
        Ok(match kind {
            ManifestKind::OciManifest => Self::OciManifest(serde_json::from_slice(body).map_err(invalid)?),
            ManifestKind::DockerV2 => Self::DockerV2(serde_json::from_slice(body).map_err(invalid)?),
            ManifestKind::OciIndex => Self::OciIndex(serde_json::from_slice(body).map_err(invalid)?),
            ManifestKind::DockerList => Self::DockerList(serde_json::from_slice(body).map_err(invalid)?),
            ManifestKind::Schema1 => Self::Schema1(serde_json::from_slice(body).map_err(invalid)?),
        })
    }

    /// Kind of this document.
    #[must_use]
    pub const fn kind(&self) -> ManifestKind {
        match self {
            Self::OciManifest(_) => ManifestKind::OciManifest,
            Self::OciIndex(_) => ManifestKind::OciIndex,
            Self::DockerV2(_) => ManifestKind::DockerV2,
            Self::DockerList(_) => ManifestKind::DockerList,
            Self::Schema1(_) => ManifestKind::Schema1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D1: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    const D2: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";
    const D3: &str = "sha256:3333333333333333333333333333333333333333333333333333333333333333";

    fn index_json() -> String {
        format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": [
                    {{"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "{D1}", "size": 10,
                      "platform": {{"os": "linux", "architecture": "amd64"}}}},
                    {{"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "{D2}", "size": 10,
                      "platform": {{"os": "linux", "architecture": "arm", "variant": "v6"}}}},
                    {{"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "{D3}", "size": 10,
                      "platform": {{"os": "linux", "architecture": "arm", "variant": "v7"}}}},
                    {{"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "{D1}", "size": 10,
                      "platform": {{"os": "unknown", "architecture": "unknown"}}}}
                ]
            }}"#
        )
    }

    #[test]
    fn test_detect_from_content_type() {
        let kind = ManifestKind::detect(
            Some("application/vnd.docker.distribution.manifest.list.v2+json; charset=utf-8"),
            b"{}",
        );
        assert_eq!(kind, Some(ManifestKind::DockerList));
    }

    #[test]
    fn test_detect_unknown_content_type() {
        assert_eq!(
            ManifestKind::detect(Some("application/vnd.example.thing+json"), b"{}"),
            None
        );
    }

    #[test]
    fn test_detect_generic_content_type_uses_body() {
        let body = index_json();
        assert_eq!(
            ManifestKind::detect(Some("application/json"), body.as_bytes()),
            Some(ManifestKind::OciIndex)
        );
    }

    #[test]
    fn test_detect_structural() {
        assert_eq!(
            ManifestKind::detect(None, br#"{"schemaVersion":1,"fsLayers":[]}"#),
            Some(ManifestKind::Schema1)
        );
        assert_eq!(
            ManifestKind::detect(None, br#"{"schemaVersion":2,"manifests":[]}"#),
            Some(ManifestKind::OciIndex)
        );
        assert_eq!(ManifestKind::detect(None, b"not json"), None);
    }

    #[test]
    fn test_select_exact_platform() {
        let list: ManifestList = serde_json::from_str(&index_json()).unwrap();
        let entry = list.select(&Platform::new("linux", "amd64")).unwrap();
        assert_eq!(entry.digest.to_string(), D1);
    }

    #[test]
    fn test_select_prefers_exact_variant() {
        let list: ManifestList = serde_json::from_str(&index_json()).unwrap();
        let entry = list
            .select(&Platform::new("linux", "arm").with_variant("v7"))
            .unwrap();
        assert_eq!(entry.digest.to_string(), D3);
    }

    #[test]
    fn test_select_falls_back_to_any_variant() {
        let list: ManifestList = serde_json::from_str(&index_json()).unwrap();
        let entry = list
            .select(&Platform::new("linux", "arm").with_variant("v5"))
            .unwrap();
        assert_eq!(entry.digest.to_string(), D2);
    }

    #[test]
    fn test_select_missing_platform() {
        let list: ManifestList = serde_json::from_str(&index_json()).unwrap();
        assert!(list.select(&Platform::new("linux", "s390x")).is_none());
        let available = list.available_platforms();
        assert_eq!(available.len(), 3);
        assert!(available.iter().all(|p| !p.is_unknown()));
    }

    #[test]
    fn test_parse_image_manifest() {
        let body = format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "config": {{"mediaType": "application/vnd.docker.container.image.v1+json", "digest": "{D1}", "size": 1470}},
                "layers": [
                    {{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": "{D2}", "size": 3370706}}
                ]
            }}"#
        );
        let doc = ManifestDocument::parse(ManifestKind::DockerV2, body.as_bytes()).unwrap();
        assert_eq!(doc.kind(), ManifestKind::DockerV2);
        let ManifestDocument::DockerV2(manifest) = doc else {
            panic!("expected docker v2 manifest");
        };
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].size, 3_370_706);
    }

    #[test]
    fn test_parse_wrong_shape() {
        let err = ManifestDocument::parse(ManifestKind::OciManifest, br#"{"schemaVersion":2}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidManifest { .. }));
    }

    #[test]
    fn test_schema1_conversion() {
        let body = format!(
            r#"{{
                "schemaVersion": 1,
                "name": "library/busybox",
                "tag": "old",
                "architecture": "amd64",
                "fsLayers": [{{"blobSum": "{D2}"}}, {{"blobSum": "{EMPTY_LAYER_DIGEST}"}}],
                "history": [
                    {{"v1Compatibility": "{{\"architecture\":\"amd64\",\"os\":\"linux\",\"created\":\"2016-01-01T00:00:00Z\",\"config\":{{\"Cmd\":[\"sh\"]}}}}"}},
                    {{"v1Compatibility": "{{}}"}}
                ],
                "signatures": []
            }}"#
        );
        let doc = ManifestDocument::parse(ManifestKind::Schema1, body.as_bytes()).unwrap();
        let ManifestDocument::Schema1(schema1) = doc else {
            panic!("expected schema 1 manifest");
        };
        let (manifest, config) = schema1.to_image_manifest().unwrap();
        assert_eq!(manifest.layers[0].digest.to_string(), EMPTY_LAYER_DIGEST);
        assert_eq!(manifest.layers[1].digest.to_string(), D2);
        assert!(manifest.layers[0].is_empty_layer());
        assert_eq!(manifest.config.digest, Digest::sha256_of(&config));

        let parsed: serde_json::Value = serde_json::from_slice(&config).unwrap();
        assert_eq!(parsed["os"], "linux");
        assert_eq!(parsed["created"], "2016-01-01T00:00:00Z");
        assert_eq!(parsed["config"]["Cmd"][0], "sh");
    }

    #[test]
    fn test_schema1_without_layers() {
        let schema1: Schema1Manifest =
            serde_json::from_str(r#"{"schemaVersion":1,"fsLayers":[]}"#).unwrap();
        assert!(schema1.to_image_manifest().is_err());
    }
}
