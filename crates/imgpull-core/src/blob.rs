//! Verified local blobs.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::manifest::Descriptor;

/// A blob on local disk whose content matched its descriptor's digest.
///
/// Values only exist after verification; an unverified download never
/// becomes a `FetchedBlob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlob {
    descriptor: Descriptor,
    path: PathBuf,
    size: u64,
}

impl FetchedBlob {
    /// Wraps a file whose digest the caller computed while writing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DigestMismatch`] if `computed` differs from the
    /// descriptor's digest.
    pub fn from_verified(
        descriptor: Descriptor,
        path: impl Into<PathBuf>,
        computed: &Digest,
        size: u64,
    ) -> Result<Self> {
        if computed != &descriptor.digest {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: computed.to_string(),
            });
        }
        Ok(Self {
            descriptor,
            path: path.into(),
            size,
        })
    }

    /// Hashes the file at `path` and wraps it if it matches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlobReadError`] if the file cannot be read and
    /// [`Error::DigestMismatch`] if its content does not match.
    pub fn verify_file(descriptor: Descriptor, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let read_err = |source| Error::BlobReadError {
            path: path.clone(),
            source,
        };
        let mut file = File::open(&path).map_err(read_err)?;
        let mut hasher = descriptor.digest.algorithm().hasher();
        let size = io::copy(&mut file, &mut hasher).map_err(read_err)?;
        let computed = hasher.finalize();
        Self::from_verified(descriptor, path, &computed, size)
    }

    /// Descriptor this blob satisfies.
    #[must_use]
    pub const fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Digest of the content.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    /// Location on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the content in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Always true; present so callers can assert the invariant.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        true
    }
}
