//! # imgpull Core
//!
//! Core types for pulling container images into runtime-loadable archives.
//!
//! This crate holds everything that does not touch the network:
//!
//! - [`ImageReference`] - Parsed and normalized `name[:tag][@digest]`
//! - [`Digest`] - Validated content digests and incremental hashing
//! - [`ManifestDocument`] - The five manifest kinds a registry can return
//! - [`ManifestList`] - Platform selection from multi-architecture images
//! - [`FetchedBlob`] - A blob whose content matched its digest
//! - [`ArchiveBuilder`] - Writes the `docker load` archive layout
//! - [`ProgressSink`] - Receiver for pull progress events
//!
//! ## Example
//!
//! ```rust
//! use imgpull_core::{ImageReference, Platform};
//!
//! let reference: ImageReference = "nginx:1.25".parse().unwrap();
//! assert_eq!(reference.repository(), "library/nginx");
//!
//! let platform: Platform = "linux/arm64/v8".parse().unwrap();
//! assert_eq!(platform.architecture, "arm64");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod blob;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod platform;
pub mod progress;
pub mod reference;


// Re-export main types at crate root
pub use archive::{ArchiveBuilder, ArchiveSummary};
pub use blob::FetchedBlob;
pub use digest::{Digest, DigestAlgorithm, DigestHasher};
pub use error::{Error, Result};
pub use manifest::{
    Descriptor, ImageManifest, ManifestDocument, ManifestKind, ManifestList, Schema1Manifest,
};
pub use platform::Platform;
pub use progress::{NoProgress, ProgressEvent, ProgressSink, TracingProgress};
pub use reference::{ImageReference, Reference};
