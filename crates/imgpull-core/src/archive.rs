//! Runtime-loadable image archives.
//!
//! Writes the tar layout produced by `docker save` and accepted by
//! `docker load`:
//!
//! ```text
//! manifest.json              [{"Config", "RepoTags", "Layers"}]
//! <config-hex>.json          image config, byte for byte
//! repositories               {"name": {"tag": "<top layer id>"}}
//! <layer-id>/VERSION         "1.0"
//! <layer-id>/json            v1 layer metadata
//! <layer-id>/layer.tar       uncompressed layer content
//! ```
//!
//! Layer ids are chain ids: the first is the first layer's digest hex, each
//! later one hashes the previous id together with the layer's digest, so
//! images sharing a layer prefix share those ids. Every tar header is
//! normalized (mtime 0, uid/gid 0), so equal inputs give byte-identical
//! archives.
//!
//! A config whose `rootfs.diff_ids` is an empty list, as synthesized for
//! schema 1 images, gets the digests of the written `layer.tar` entries and
//! is stored under the digest of the rewritten bytes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::DateTime;
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};

use crate::blob::FetchedBlob;
use crate::digest::{Digest, DigestAlgorithm, DigestHasher};
use crate::error::{Error, Result};
use crate::manifest::ImageManifest;
use crate::reference::ImageReference;

const LAYER_VERSION: &[u8] = b"1.0";
const EPOCH: &str = "1970-01-01T00:00:00Z";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Computes chain ids for layers given lowest first.
///
/// # Examples
///
/// ```
/// use imgpull_core::{archive::layer_chain_ids, Digest};
///
/// let base = Digest::sha256_of(b"base");
/// let ids = layer_chain_ids([&base]);
/// assert_eq!(ids, vec![base.hex().to_string()]);
/// ```
pub fn layer_chain_ids<'a, I>(digests: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a Digest>,
{
    let mut ids: Vec<String> = Vec::new();
    for digest in digests {
        let id = match ids.last() {
            None => digest.hex().to_string(),
            Some(parent) => Digest::sha256_of(format!("{parent} {digest}").as_bytes())
                .hex()
                .to_string(),
        };
        ids.push(id);
    }
    ids
}

/// What was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Output path.
    pub path: PathBuf,
    /// Layer ids, lowest first.
    pub layer_ids: Vec<String>,
    /// `RepoTags` written to `manifest.json`.
    pub repo_tags: Vec<String>,
    /// Digest of the config entry written; differs from the config blob's
    /// only when empty `diff_ids` were filled in.
    pub config_digest: Digest,
}

/// Assembles verified blobs into an archive.
///
/// # Examples
///
/// ```rust,no_run
/// use imgpull_core::{ArchiveBuilder, FetchedBlob, ImageManifest, ImageReference};
/// use std::path::Path;
///
/// fn write(manifest: &ImageManifest, config: &FetchedBlob, layers: &[FetchedBlob]) -> imgpull_core::Result<()> {
///     let reference: ImageReference = "alpine:3.18".parse()?;
///     ArchiveBuilder::for_reference(&reference)
///         .build(manifest, config, layers, Path::new("alpine_3.18.tar"))?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    repo_tag: Option<(String, String)>,
}

impl ArchiveBuilder {
    /// Creates a builder that writes no repository tags.
    #[must_use]
    pub const fn new() -> Self {
        Self { repo_tag: None }
    }

    /// Creates a builder tagging the image as `reference` names it.
    ///
    /// Digest references have no tag; their archives carry empty `RepoTags`.
    #[must_use]
    pub fn for_reference(reference: &ImageReference) -> Self {
        match reference.tag() {
            Some(tag) => Self::new().with_repo_tag(reference.familiar_name(), tag),
            None => Self::new(),
        }
    }

    /// Sets the repository name and tag.
    #[must_use]
    pub fn with_repo_tag(mut self, name: impl Into<String>, tag: impl Into<String>) -> Self {
        self.repo_tag = Some((name.into(), tag.into()));
        self
    }

    /// Writes the archive to `output`.
    ///
    /// `layers` must be in manifest order. The archive is written to a
    /// temporary file beside `output` and renamed into place only when
    /// complete; on failure nothing is left at `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidManifest`] if the blobs do not match the
    /// manifest, and [`Error::ArchiveWriteError`] on any filesystem failure.
    pub fn build(
        &self,
        manifest: &ImageManifest,
        config: &FetchedBlob,
        layers: &[FetchedBlob],
        output: &Path,
    ) -> Result<ArchiveSummary> {
        check_blobs(manifest, config, layers)?;

        let config_bytes = std::fs::read(config.path()).map_err(write_err(config.path()))?;
        let image_config: ImageConfig = serde_json::from_slice(&config_bytes).unwrap_or_default();

        let layer_ids = layer_chain_ids(manifest.layers.iter().map(|d| &d.digest));
        let repo_tags: Vec<String> = self
            .repo_tag
            .iter()
            .map(|(name, tag)| format!("{name}:{tag}"))
            .collect();

        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(write_err(&parent))?;
        let mut staged = tempfile::Builder::new()
            .prefix(".imgpull-")
            .suffix(".tar.partial")
            .tempfile_in(&parent)
            .map_err(write_err(output))?;

        let config_digest;
        {
            let mut tar = tar::Builder::new(BufWriter::new(staged.as_file_mut()));

            let mut diff_ids = Vec::with_capacity(layers.len());
            for (index, (id, blob)) in layer_ids.iter().zip(layers).enumerate() {
                let metadata = LayerMetadata {
                    id,
                    parent: index.checked_sub(1).map(|i| layer_ids[i].as_str()),
                    created: image_config.created_or_epoch(),
                    container_config: ContainerConfig::default(),
                    architecture: image_config.architecture.as_deref(),
                    os: image_config.os.as_deref(),
                    throwaway: blob.descriptor().is_empty_layer(),
                };

                append_dir(&mut tar, &format!("{id}/"), output)?;
                append_bytes(&mut tar, &format!("{id}/VERSION"), LAYER_VERSION, output)?;
                append_bytes(&mut tar, &format!("{id}/json"), &serde_json::to_vec(&metadata)?, output)?;
                diff_ids.push(append_layer(&mut tar, &format!("{id}/layer.tar"), blob.path(), &parent, output)?);
            }

            let (config_bytes, digest) = match fill_diff_ids(&config_bytes, &diff_ids)? {
                Some(filled) => {
                    let digest = Digest::sha256_of(&filled);
                    tracing::debug!(config = %digest, layers = diff_ids.len(), "filled config diff_ids");
                    (filled, digest)
                }
                None => (config_bytes, config.digest().clone()),
            };
            let config_name = format!("{}.json", digest.hex());
            append_bytes(&mut tar, &config_name, &config_bytes, output)?;
            config_digest = digest;

            let mut repositories: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
            if let (Some((name, tag)), Some(top)) = (&self.repo_tag, layer_ids.last()) {
                repositories
                    .entry(name.as_str())
                    .or_default()
                    .insert(tag.as_str(), top.as_str());
            }
            append_bytes(&mut tar, "repositories", &serde_json::to_vec(&repositories)?, output)?;

            let index = vec![ManifestEntry {
                config: &config_name,
                repo_tags: &repo_tags,
                layers: layer_ids.iter().map(|id| format!("{id}/layer.tar")).collect(),
            }];
            append_bytes(&mut tar, "manifest.json", &serde_json::to_vec(&index)?, output)?;

            let mut writer = tar.into_inner().map_err(write_err(output))?;
            writer.flush().map_err(write_err(output))?;
        }

        staged
            .persist(output)
            .map_err(|e| write_err(output)(e.error))?;

        tracing::info!(
            path = %output.display(),
            layers = layer_ids.len(),
            config = %config_digest,
            "Wrote image archive"
        );

        Ok(ArchiveSummary {
            path: output.to_path_buf(),
            layer_ids,
            repo_tags,
            config_digest,
        })
    }
}

fn check_blobs(manifest: &ImageManifest, config: &FetchedBlob, layers: &[FetchedBlob]) -> Result<()> {
    if config.digest() != &manifest.config.digest {
        return Err(Error::InvalidManifest {
            reason: format!(
                "config blob {} does not match manifest config {}",
                config.digest(),
                manifest.config.digest
            ),
        });
    }
    if layers.len() != manifest.layers.len() {
        return Err(Error::InvalidManifest {
            reason: format!(
                "manifest lists {} layers but {} blobs were supplied",
                manifest.layers.len(),
                layers.len()
            ),
        });
    }
    if let Some((expected, blob)) = manifest
        .layers
        .iter()
        .zip(layers)
        .find(|(d, b)| &d.digest != b.digest())
    {
        return Err(Error::InvalidManifest {
            reason: format!(
                "layer blob {} is out of order, expected {}",
                blob.digest(),
                expected.digest
            ),
        });
    }
    Ok(())
}

fn write_err(path: &Path) -> impl Fn(io::Error) -> Error + '_ {
    move |source| Error::ArchiveWriteError {
        path: path.to_path_buf(),
        source,
    }
}

fn header(entry_type: EntryType, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(if entry_type == EntryType::Directory { 0o755 } else { 0o644 });
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_dir<W: Write>(tar: &mut tar::Builder<W>, name: &str, output: &Path) -> Result<()> {
    let mut header = header(EntryType::Directory, 0);
    tar.append_data(&mut header, name, io::empty())
        .map_err(write_err(output))
}

fn append_bytes<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    output: &Path,
) -> Result<()> {
    let mut header = header(EntryType::Regular, data.len() as u64);
    tar.append_data(&mut header, name, data)
        .map_err(write_err(output))
}

/// Appends a layer, decompressing gzip content first so the entry size is
/// known. Returns the digest of the entry's content.
fn append_layer<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    blob: &Path,
    scratch_dir: &Path,
    output: &Path,
) -> Result<Digest> {
    let mut file = File::open(blob).map_err(write_err(blob))?;
    let mut magic = [0u8; 2];
    let read = read_prefix(&mut file, &mut magic).map_err(write_err(blob))?;
    file.seek(SeekFrom::Start(0)).map_err(write_err(blob))?;

    let (content, size) = if read == GZIP_MAGIC.len() && magic == GZIP_MAGIC {
        let mut scratch = tempfile::tempfile_in(scratch_dir).map_err(write_err(scratch_dir))?;
        let mut decoder = MultiGzDecoder::new(BufReader::new(file));
        let size = io::copy(&mut decoder, &mut scratch).map_err(write_err(blob))?;
        scratch.seek(SeekFrom::Start(0)).map_err(write_err(blob))?;
        (scratch, size)
    } else {
        let size = file.metadata().map_err(write_err(blob))?.len();
        (file, size)
    };

    let mut reader = HashingReader {
        inner: BufReader::new(content),
        hasher: DigestAlgorithm::Sha256.hasher(),
    };
    let mut header = header(EntryType::Regular, size);
    tar.append_data(&mut header, name, &mut reader)
        .map_err(write_err(output))?;
    Ok(reader.hasher.finalize())
}

struct HashingReader<R> {
    inner: R,
    hasher: DigestHasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Rewrites `config` with `diff_ids` when its `rootfs.diff_ids` is an empty
/// list. `None` leaves the config untouched.
fn fill_diff_ids(config: &[u8], diff_ids: &[Digest]) -> Result<Option<Vec<u8>>> {
    if diff_ids.is_empty() {
        return Ok(None);
    }
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(config) else {
        return Ok(None);
    };
    let Some(ids) = value
        .pointer_mut("/rootfs/diff_ids")
        .and_then(serde_json::Value::as_array_mut)
    else {
        return Ok(None);
    };
    if !ids.is_empty() {
        return Ok(None);
    }
    ids.extend(diff_ids.iter().map(|d| serde_json::Value::String(d.to_string())));
    Ok(Some(serde_json::to_vec(&value)?))
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    #[serde(rename = "Config")]
    config: &'a str,
    #[serde(rename = "RepoTags")]
    repo_tags: &'a [String],
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Fields of the image config used for layer metadata.
#[derive(Debug, Default, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    created: Option<String>,
}

impl ImageConfig {
    fn created_or_epoch(&self) -> &str {
        self.created
            .as_deref()
            .filter(|c| DateTime::parse_from_rfc3339(c).is_ok())
            .unwrap_or(EPOCH)
    }
}

#[derive(Serialize)]
struct LayerMetadata<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<&'a str>,
    created: &'a str,
    container_config: ContainerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    architecture: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    os: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    throwaway: bool,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    hostname: String,
    domainname: String,
    user: String,
    attach_stdin: bool,
    attach_stdout: bool,
    attach_stderr: bool,
    tty: bool,
    open_stdin: bool,
    stdin_once: bool,
    env: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    image: String,
    volumes: Option<BTreeMap<String, serde_json::Value>>,
    working_dir: String,
    entrypoint: Option<Vec<String>>,
    on_build: Option<Vec<String>>,
    labels: Option<BTreeMap<String, String>>,
}
