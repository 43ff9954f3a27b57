//! # imgpull Registry
//!
//! Docker Registry v2 / OCI distribution client that pulls container images
//! and writes them as `docker load` archives, without a container runtime.
//!
//! ## Features
//!
//! - **Manifest resolution**: OCI and Docker manifests, manifest lists and
//!   indexes with platform selection, legacy schema-1 conversion
//! - **Token authentication**: `WWW-Authenticate` challenges, per-repository
//!   token caching and refresh
//! - **Proxy-aware routing**: per-host direct/proxied decisions, no-proxy
//!   lists, direct blob CDN access behind corporate proxies
//! - **Verified downloads**: concurrent, retried, digest-checked blob fetches
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use imgpull_core::Platform;
//! use imgpull_registry::{ImagePuller, ProxyConfig, PullConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PullConfig::new()
//!         .with_platform(Platform::new("linux", "arm64"))
//!         .with_proxy(ProxyConfig::default().with_proxy("http://proxy.corp:3128"));
//!
//!     let puller = ImagePuller::new(config)?;
//!     let reference = "alpine:3.18".parse()?;
//!     puller.pull(&reference, Path::new("alpine_3.18.tar")).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ImagePuller                           │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │ ManifestResolver │  │ LayerFetcher │  │ArchiveBuilder │  │
//! │  └──────────────────┘  └──────────────┘  └───────────────┘  │
//! │            │                  │                              │
//! │            ▼                  ▼                              │
//! │  ┌───────────────────────────────────┐                      │
//! │  │  AuthClient  →  NetworkRouter     │                      │
//! │  └───────────────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//!                          │
//!                ┌─────────┴─────────┐
//!                ▼                   ▼
//!      Registry API (proxied)   Blob CDN (direct)
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod auth;
mod config;
mod error;
mod fetcher;
mod puller;
mod resolver;
mod retry;
mod router;

pub use auth::{AuthClient, AuthScheme, AuthState, Challenge, Credential};
pub use config::{
    parse_proxy_url, ClientProtocol, ProxyAuth, ProxyConfig, PullConfig, RegistryAuth, TlsConfig,
    DEFAULT_CDN_HOSTS,
};
pub use error::{FetchFailure, RegistryError, Result};
pub use fetcher::LayerFetcher;
pub use puller::{ImagePuller, PullSummary};
pub use resolver::{ManifestResolver, ResolvedManifest};
pub use retry::{retry, RetryPolicy};
pub use router::{matches_no_proxy, sanitize_url, NetworkRouter, RouteDecision, RouteReason};
