//! Pull command implementation.
//!
//! Pulls an image from a registry and writes a `docker load` archive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use parking_lot::Mutex;
use tracing::info;
use url::Url;

use imgpull_core::{Digest, ImageReference, Platform, ProgressEvent, ProgressSink};
use imgpull_registry::{
    ClientProtocol, ImagePuller, ProxyAuth, ProxyConfig, PullConfig, RegistryAuth, RetryPolicy,
};

/// Arguments for the pull command.
#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference (e.g. `alpine:3.18`, `ghcr.io/org/app@sha256:...`)
    pub image: String,

    /// Output archive path [default: <name>_<tag>.tar]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Target CPU architecture
    #[arg(long, default_value = "amd64")]
    pub arch: String,

    /// Target operating system
    #[arg(long, default_value = "linux")]
    pub os: String,

    /// Target architecture variant (e.g. `v8`)
    #[arg(long)]
    pub variant: Option<String>,

    /// Proxy for both HTTP and HTTPS requests
    #[arg(short, long)]
    pub proxy: Option<String>,

    /// Proxy for HTTP requests [env: `HTTP_PROXY`]
    #[arg(long)]
    pub http_proxy: Option<String>,

    /// Proxy for HTTPS requests [env: `HTTPS_PROXY`]
    #[arg(long)]
    pub https_proxy: Option<String>,

    /// Comma-separated hosts to reach directly [env: `NO_PROXY`]
    #[arg(long)]
    pub no_proxy: Option<String>,

    /// Proxy credentials as `user:password`
    #[arg(long, env = "IMGPULL_PROXY_AUTH", hide_env_values = true)]
    pub proxy_auth: Option<String>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// Extra PEM root certificate to trust
    #[arg(long, value_name = "FILE")]
    pub ca_cert: Option<PathBuf>,

    /// Bearer token for authentication
    #[arg(short, long, env = "IMGPULL_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Username for registry authentication
    #[arg(short, long, env = "IMGPULL_USERNAME")]
    pub username: Option<String>,

    /// Password for registry authentication
    #[arg(long, env = "IMGPULL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Maximum concurrent blob downloads
    #[arg(long, default_value = "3")]
    pub max_concurrent: usize,

    /// Attempts per request, including the first
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Send blob CDN requests through the proxy too
    #[arg(long)]
    pub no_cdn_bypass: bool,

    /// Talk to the registry over plain HTTP
    #[arg(long)]
    pub plain_http: bool,

    /// Registry API endpoint to use instead of the image's registry (e.g. a mirror)
    #[arg(long, value_name = "URL")]
    pub registry_endpoint: Option<Url>,
}

/// Runs the pull command.
///
/// # Errors
///
/// Returns an error if:
/// - The image reference or configuration is invalid
/// - The image cannot be resolved or downloaded
/// - The archive cannot be written
/// - The pull is interrupted
pub async fn execute(args: PullArgs) -> Result<()> {
    let reference: ImageReference = args
        .image
        .parse()
        .with_context(|| format!("Invalid image reference '{}'", args.image))?;
    let config = build_config(&args, |name| std::env::var(name).ok())?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(reference.default_archive_name()));

    info!(
        reference = %reference,
        platform = %config.platform,
        output = %output.display(),
        proxied = config.proxy.is_enabled(),
        "Pulling image"
    );

    let puller = ImagePuller::new(config)
        .context("Invalid configuration")?
        .with_progress(Arc::new(CliProgress::default()));
    let summary = puller
        .pull_until(&reference, &output, interrupted())
        .await
        .with_context(|| format!("Failed to pull {reference}"))?;

    println!();
    println!("Image pulled successfully!");
    println!("  Image:    {}", summary.reference);
    println!("  Platform: {}", summary.platform);
    println!("  Digest:   {}", summary.manifest_digest);
    println!("  Layers:   {}", summary.layer_ids.len());
    println!("  Size:     {}", format_bytes(summary.total_bytes));
    println!("  Output:   {}", summary.output.display());
    println!();
    println!("Load it with: docker load -i {}", summary.output.display());

    Ok(())
}

/// Completes on Ctrl-C.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Builds the pull configuration from arguments, reading proxy settings
/// from `env` when no flag gives them.
fn build_config(args: &PullArgs, env: impl Fn(&str) -> Option<String>) -> Result<PullConfig> {
    let mut platform = Platform::new(&args.os, &args.arch);
    if let Some(variant) = &args.variant {
        platform = platform.with_variant(variant);
    }

    let timeout = Duration::from_secs(args.timeout);
    let mut config = PullConfig::new()
        .with_platform(platform)
        .with_proxy(proxy_settings(args, env)?)
        .with_auth(determine_auth(args)?)
        .with_retry(RetryPolicy::new(args.retries))
        .with_max_concurrent_downloads(args.max_concurrent)
        .with_connect_timeout(timeout)
        .with_request_timeout(timeout)
        .with_read_timeout(timeout * 2);

    if args.insecure {
        config = config.insecure();
    }
    config.tls.ca_cert.clone_from(&args.ca_cert);
    if args.plain_http {
        config = config.with_protocol(ClientProtocol::Http);
    }
    if let Some(endpoint) = &args.registry_endpoint {
        config = config.with_registry_endpoint(endpoint.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Proxy settings from flags, falling back to the conventional environment
/// variables (upper case first).
fn proxy_settings(args: &PullArgs, env: impl Fn(&str) -> Option<String>) -> Result<ProxyConfig> {
    let from_env = |upper: &str, lower: &str| {
        env(upper)
            .or_else(|| env(lower))
            .filter(|v| !v.trim().is_empty())
    };

    let mut proxy = ProxyConfig::default().with_cdn_bypass(!args.no_cdn_bypass);

    let http = args
        .http_proxy
        .clone()
        .or_else(|| args.proxy.clone())
        .or_else(|| from_env("HTTP_PROXY", "http_proxy"));
    let https = args
        .https_proxy
        .clone()
        .or_else(|| args.proxy.clone())
        .or_else(|| from_env("HTTPS_PROXY", "https_proxy"));
    if let Some(url) = http {
        proxy = proxy.with_http_proxy(url);
    }
    if let Some(url) = https {
        proxy = proxy.with_https_proxy(url);
    }

    if let Some(list) = args.no_proxy.clone().or_else(|| from_env("NO_PROXY", "no_proxy")) {
        proxy = proxy.with_no_proxy_list(&list);
    }

    if let Some(credentials) = &args.proxy_auth {
        proxy = proxy.with_proxy_auth(ProxyAuth::parse(credentials).context("Invalid --proxy-auth")?);
    }

    Ok(proxy)
}

/// Determines the authentication method from CLI arguments.
fn determine_auth(args: &PullArgs) -> Result<RegistryAuth> {
    if let Some(ref token) = args.token {
        return Ok(RegistryAuth::bearer(token.clone()));
    }

    if let (Some(ref username), Some(ref password)) = (&args.username, &args.password) {
        return Ok(RegistryAuth::basic(username.clone(), password.clone()));
    }

    if args.username.is_some() || args.password.is_some() {
        anyhow::bail!("Both --username and --password are required for basic authentication");
    }

    Ok(RegistryAuth::None)
}

/// Renders progress as lines on stderr.
#[derive(Default)]
struct CliProgress {
    sizes: Mutex<HashMap<Digest, u64>>,
}

impl ProgressSink for CliProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ManifestResolved {
                digest,
                platform,
                layers,
            } => {
                eprintln!("Resolved {platform} manifest {} ({layers} layers)", digest.short(12));
            }
            ProgressEvent::BlobStarted { .. } => {}
            ProgressEvent::BlobProgress {
                digest, downloaded, ..
            } => {
                self.sizes.lock().insert(digest.clone(), *downloaded);
            }
            ProgressEvent::BlobRetry {
                digest,
                attempt,
                reason,
            } => {
                eprintln!("Retrying {} (attempt {attempt}): {reason}", digest.short(12));
            }
            ProgressEvent::BlobCompleted {
                digest,
                completed,
                total,
            } => {
                let size = self.sizes.lock().get(digest).copied().unwrap_or_default();
                eprintln!(
                    "[{completed}/{total}] {} {}",
                    digest.short(12),
                    format_bytes(size)
                );
            }
            ProgressEvent::ArchiveWritten { path, layers } => {
                eprintln!("Wrote {} ({layers} layers)", path.display());
            }
        }
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
