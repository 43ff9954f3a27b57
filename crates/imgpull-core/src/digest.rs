//! Content digests.
//!
//! Every blob a registry serves is addressed by an `algorithm:hex` digest.
//! [`Digest`] parses and validates that form, and [`DigestHasher`] computes
//! one incrementally while content is streamed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{Error, Result};

/// Hash algorithms accepted in content digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    /// SHA-256, used by virtually every registry.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl DigestAlgorithm {
    /// Returns the algorithm name as it appears in a digest string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded hash.
    #[must_use]
    pub const fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    /// Creates an incremental hasher for this algorithm.
    #[must_use]
    pub fn hasher(self) -> DigestHasher {
        match self {
            Self::Sha256 => DigestHasher::Sha256(Sha256::new()),
            Self::Sha512 => DigestHasher::Sha512(Sha512::new()),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(Error::UnsupportedDigestAlgorithm {
                algorithm: other.to_string(),
            }),
        }
    }
}

/// A validated content digest such as `sha256:e3b0c442...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Creates a digest from an algorithm and hex string, validating the hex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDigest`] if the hex has the wrong length or
    /// contains characters other than lowercase hex digits.
    pub fn new(algorithm: DigestAlgorithm, hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len() {
            return Err(Error::InvalidDigest {
                digest: format!("{}:{hex}", algorithm.as_str()),
                reason: format!("expected {} hex characters", algorithm.hex_len()),
            });
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(Error::InvalidDigest {
                digest: format!("{}:{hex}", algorithm.as_str()),
                reason: "hash must be lowercase hexadecimal".to_string(),
            });
        }
        Ok(Self { algorithm, hex })
    }

    /// Computes the SHA-256 digest of `data`.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_core::Digest;
    ///
    /// let digest = Digest::sha256_of(b"");
    /// assert_eq!(
    ///     digest.to_string(),
    ///     "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    /// );
    /// ```
    #[must_use]
    pub fn sha256_of(data: &[u8]) -> Self {
        let mut hasher = DigestAlgorithm::Sha256.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Computes a digest of `data` using the same algorithm as `self`.
    #[must_use]
    pub fn compute_like(&self, data: &[u8]) -> Self {
        let mut hasher = self.algorithm.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Returns the hash algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns the hex-encoded hash without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Returns the first `len` hex characters, for display.
    #[must_use]
    pub fn short(&self, len: usize) -> &str {
        &self.hex[..len.min(self.hex.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| Error::InvalidDigest {
            digest: s.to_string(),
            reason: "expected algorithm:hex".to_string(),
        })?;
        Self::new(algorithm.parse()?, hex)
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Incremental hasher producing a [`Digest`].
#[derive(Clone)]
pub enum DigestHasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// SHA-512 state.
    Sha512(Sha512),
}

impl DigestHasher {
    /// Feeds `data` into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Consumes the hasher and returns the digest.
    #[must_use]
    pub fn finalize(self) -> Digest {
        let (algorithm, hex) = match self {
            Self::Sha256(h) => (DigestAlgorithm::Sha256, hex::encode(h.finalize())),
            Self::Sha512(h) => (DigestAlgorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}

impl fmt::Debug for DigestHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self {
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha512(_) => DigestAlgorithm::Sha512,
        };
        f.debug_struct("DigestHasher")
            .field("algorithm", &algorithm)
            .finish_non_exhaustive()
    }
}

impl std::io::Write for DigestHasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
