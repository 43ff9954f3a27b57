//! Configuration types for pulling images.
//!
//! The CLI (or any other caller) resolves flags and environment into one
//! immutable [`PullConfig`]; nothing below this layer reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use imgpull_core::Platform;
use url::Url;

use crate::error::RegistryError;
use crate::retry::RetryPolicy;

/// Hosts treated as blob CDNs by default.
pub const DEFAULT_CDN_HOSTS: [&str; 3] = ["amazonaws.com", "cloudfront.net", "cloudflare.docker.com"];

/// Configuration for one pull.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Platform to select from multi-architecture images.
    pub platform: Platform,

    /// Proxy routing.
    pub proxy: ProxyConfig,

    /// TLS settings.
    pub tls: TlsConfig,

    /// Registry credentials.
    pub auth: RegistryAuth,

    /// Retry policy for manifests and blobs.
    pub retry: RetryPolicy,

    /// Maximum blobs downloaded at once.
    pub max_concurrent_downloads: usize,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Whole-request timeout for manifest and token requests.
    pub request_timeout: Duration,

    /// Longest wait for response headers or the next body chunk of a blob.
    pub read_timeout: Duration,

    /// Scheme used to reach the registry.
    pub protocol: ClientProtocol,

    /// Registry API endpoint overriding the one derived from the reference.
    pub registry_endpoint: Option<Url>,

    /// User agent string.
    pub user_agent: String,
}

impl PullConfig {
    /// Creates a configuration with defaults: `linux/amd64`, no proxy, TLS
    /// verification on, 3 concurrent downloads.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_registry::PullConfig;
    ///
    /// let config = PullConfig::new();
    /// assert_eq!(config.max_concurrent_downloads, 3);
    /// assert_eq!(config.platform.to_string(), "linux/amd64");
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self {
            platform: Platform::default(),
            proxy: ProxyConfig::default(),
            tls: TlsConfig::default(),
            auth: RegistryAuth::None,
            retry: RetryPolicy::default(),
            max_concurrent_downloads: 3,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            protocol: ClientProtocol::Https,
            registry_endpoint: None,
            user_agent: format!("imgpull/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Sets the target platform.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_core::Platform;
    /// use imgpull_registry::PullConfig;
    ///
    /// let config = PullConfig::new().with_platform(Platform::new("linux", "arm64"));
    /// assert_eq!(config.platform.architecture, "arm64");
    /// ```
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Sets the proxy configuration.
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets the TLS configuration.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Disables TLS certificate verification for every route.
    #[must_use]
    pub const fn insecure(mut self) -> Self {
        self.tls.insecure_skip_verify = true;
        self
    }

    /// Sets the registry credentials.
    #[must_use]
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the download concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent_downloads(mut self, limit: usize) -> Self {
        self.max_concurrent_downloads = limit;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the manifest and token request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the blob read timeout.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the registry scheme.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: ClientProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sends registry API requests to `endpoint` instead of the reference's host.
    #[must_use]
    pub fn with_registry_endpoint(mut self, endpoint: Url) -> Self {
        self.registry_endpoint = Some(endpoint);
        self
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidConfig`] for zero limits or timeouts
    /// and for proxy URLs that do not parse.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |message: &str| {
            Err(RegistryError::InvalidConfig {
                message: message.to_string(),
            })
        };
        if self.max_concurrent_downloads == 0 {
            return invalid("max_concurrent_downloads must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry max_attempts must be at least 1");
        }
        if self.connect_timeout.is_zero()
            || self.request_timeout.is_zero()
            || self.read_timeout.is_zero()
        {
            return invalid("timeouts must be greater than zero");
        }
        for proxy in [&self.proxy.http_proxy, &self.proxy.https_proxy]
            .into_iter()
            .flatten()
        {
            parse_proxy_url(proxy)?;
        }
        Ok(())
    }

    /// Base URL of the registry API for `api_host`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidUrl`] if the host does not form a URL.
    pub fn registry_base(&self, api_host: &str) -> Result<Url, RegistryError> {
        if let Some(endpoint) = &self.registry_endpoint {
            return Ok(endpoint.clone());
        }
        let url = format!("{}://{api_host}/", self.protocol.scheme());
        Url::parse(&url).map_err(|_| RegistryError::InvalidUrl { url })
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a proxy URL, accepting `host:port` without a scheme.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidConfig`] if the value is not a usable
/// `http` or `https` URL with a host.
pub fn parse_proxy_url(value: &str) -> Result<Url, RegistryError> {
    let candidate = if value.contains("://") {
        value.to_string()
    } else {
        format!("http://{value}")
    };
    let invalid = || RegistryError::InvalidConfig {
        message: format!("invalid proxy URL '{}'", crate::router::sanitize_url(value)),
    };
    let url = Url::parse(&candidate).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}

/// Proxy routing configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy for plain-HTTP requests.
    pub http_proxy: Option<String>,

    /// Proxy for HTTPS requests.
    pub https_proxy: Option<String>,

    /// Hosts reached directly; supports `*`, `.suffix` and `*.suffix`.
    pub no_proxy: Vec<String>,

    /// Credentials sent to the proxy.
    pub proxy_auth: Option<ProxyAuth>,

    /// Reach blob CDNs directly even when a proxy is configured.
    pub prefer_direct_for_cdn: bool,

    /// Domain suffixes recognized as blob CDNs.
    pub cdn_hosts: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_proxy: None,
            https_proxy: None,
            no_proxy: Vec::new(),
            proxy_auth: None,
            prefer_direct_for_cdn: true,
            cdn_hosts: DEFAULT_CDN_HOSTS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ProxyConfig {
    /// Uses `url` for both HTTP and HTTPS requests.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_registry::ProxyConfig;
    ///
    /// let proxy = ProxyConfig::default()
    ///     .with_proxy("http://proxy:8080")
    ///     .with_no_proxy_list("localhost, .internal");
    /// assert_eq!(proxy.https_proxy.as_deref(), Some("http://proxy:8080"));
    /// assert_eq!(proxy.no_proxy, vec!["localhost", ".internal"]);
    /// ```
    #[must_use]
    pub fn with_proxy(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.http_proxy = Some(url.clone());
        self.https_proxy = Some(url);
        self
    }

    /// Sets the HTTP proxy.
    #[must_use]
    pub fn with_http_proxy(mut self, url: impl Into<String>) -> Self {
        self.http_proxy = Some(url.into());
        self
    }

    /// Sets the HTTPS proxy.
    #[must_use]
    pub fn with_https_proxy(mut self, url: impl Into<String>) -> Self {
        self.https_proxy = Some(url.into());
        self
    }

    /// Adds no-proxy entries from a comma-separated list.
    #[must_use]
    pub fn with_no_proxy_list(mut self, list: &str) -> Self {
        self.no_proxy.extend(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
        );
        self
    }

    /// Sets proxy credentials.
    #[must_use]
    pub fn with_proxy_auth(mut self, auth: ProxyAuth) -> Self {
        self.proxy_auth = Some(auth);
        self
    }

    /// Enables or disables direct CDN access.
    #[must_use]
    pub const fn with_cdn_bypass(mut self, enabled: bool) -> Self {
        self.prefer_direct_for_cdn = enabled;
        self
    }

    /// Replaces the CDN suffix list.
    #[must_use]
    pub fn with_cdn_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cdn_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// True if any proxy is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.http_proxy.is_some() || self.https_proxy.is_some()
    }
}

/// Username and password for a proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl ProxyAuth {
    /// Creates proxy credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parses `user:password`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidConfig`] if there is no `:` or the
    /// username is empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_registry::ProxyAuth;
    ///
    /// let auth = ProxyAuth::parse("alice:s3:cret").unwrap();
    /// assert_eq!(auth.username, "alice");
    /// assert_eq!(auth.password, "s3:cret");
    /// assert!(ProxyAuth::parse("alice").is_err());
    /// ```
    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        match value.split_once(':') {
            Some((user, pass)) if !user.is_empty() => Ok(Self::new(user, pass)),
            _ => Err(RegistryError::InvalidConfig {
                message: "proxy credentials must be in user:password form".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authentication methods for registry access.
#[derive(Clone)]
pub enum RegistryAuth {
    /// Anonymous; token endpoints are still used when challenged.
    None,

    /// Username and password, sent to token endpoints or as Basic auth.
    Basic {
        /// Username.
        username: String,
        /// Password or access token.
        password: String,
    },

    /// Pre-issued bearer token attached to every request.
    Bearer {
        /// Token value.
        token: String,
    },
}

impl RegistryAuth {
    /// Creates basic authentication.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_registry::RegistryAuth;
    ///
    /// let auth = RegistryAuth::basic("user", "pass");
    /// ```
    #[must_use]
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates bearer token authentication.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Accept any server certificate. Applies to every route.
    pub insecure_skip_verify: bool,

    /// Extra PEM root certificate, e.g. a corporate interception CA.
    pub ca_cert: Option<PathBuf>,
}

/// Scheme for registry API requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientProtocol {
    /// HTTPS.
    #[default]
    Https,
    /// Plain HTTP, for local registries.
    Http,
}

impl ClientProtocol {
    /// URL scheme.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::Https => "https",
            Self::Http => "http",
        }
    }
}
