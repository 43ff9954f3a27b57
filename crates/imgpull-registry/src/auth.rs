//! Registry authentication.
//!
//! Requests start anonymous (or with a supplied static token). When the
//! registry answers 401 with a `WWW-Authenticate` challenge, the client
//! obtains a credential for the challenged realm and retries the request
//! once. A second 401 is terminal.
//!
//! Each repository has its own session:
//!
//! ```text
//! Unauthenticated ──401──▶ Authenticating ──token──▶ Authenticated
//!                                 │                     │      │
//!                                 ▼                  expiry   401
//!                              Rejected ◀──────────────────────┘
//!                                                       ▼
//!                                                    Expired ──▶ Authenticating
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::config::{PullConfig, RegistryAuth};
use crate::error::{RegistryError, Result};
use crate::retry::{retry, RetryPolicy};
use crate::router::{execute, NetworkRouter};

/// Lifetime assumed for tokens that do not state one.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Tokens are refreshed this long before they expire.
const EXPIRY_SKEW: Duration = Duration::from_secs(5);

/// Credential kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// No Authorization header.
    Anonymous,
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// `Authorization: Basic <base64>`.
    Basic,
}

/// A credential scoped to one repository for one pull. Never persisted.
#[derive(Clone)]
pub struct Credential {
    scheme: AuthScheme,
    secret: String,
    expires_at: Option<Instant>,
}

impl Credential {
    /// No credential.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            scheme: AuthScheme::Anonymous,
            secret: String::new(),
            expires_at: None,
        }
    }

    /// Bearer token valid for `ttl`, or indefinitely.
    #[must_use]
    pub fn bearer(token: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            secret: token.into(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl.saturating_sub(EXPIRY_SKEW)),
        }
    }

    /// Basic credentials.
    #[must_use]
    pub fn basic(username: &str, password: &str) -> Self {
        Self {
            scheme: AuthScheme::Basic,
            secret: base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}")),
            expires_at: None,
        }
    }

    /// Credential kind.
    #[must_use]
    pub const fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// When the credential stops being valid, if known.
    #[must_use]
    pub const fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// True once the expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Value for the `Authorization` header.
    #[must_use]
    pub fn authorization(&self) -> Option<String> {
        match self.scheme {
            AuthScheme::Anonymous => None,
            AuthScheme::Bearer => Some(format!("Bearer {}", self.secret)),
            AuthScheme::Basic => Some(format!("Basic {}", self.secret)),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercased scheme, `bearer` or `basic`.
    pub scheme: String,
    params: BTreeMap<String, String>,
}

impl Challenge {
    /// Parses the first challenge in a header value.
    ///
    /// Parameter names are case-insensitive; quoted values may contain
    /// commas and backslash escapes.
    ///
    /// # Examples
    ///
    /// ```
    /// use imgpull_registry::Challenge;
    ///
    /// let c = Challenge::parse(
    ///     r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
    /// ).unwrap();
    /// assert_eq!(c.scheme, "bearer");
    /// assert_eq!(c.realm(), Some("https://auth.docker.io/token"));
    /// assert_eq!(c.scope(), Some("repository:library/alpine:pull"));
    /// ```
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, mut rest) = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest),
            None => (header, ""),
        };
        if scheme.is_empty() {
            return None;
        }

        let mut params = BTreeMap::new();
        loop {
            rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
            if rest.is_empty() {
                break;
            }
            let Some(eq) = rest.find('=') else { break };
            let key = rest[..eq].trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                // Start of a second challenge.
                break;
            }
            rest = rest[eq + 1..].trim_start();

            let value = if let Some(quoted) = rest.strip_prefix('"') {
                let mut value = String::new();
                let mut chars = quoted.char_indices();
                let mut end = quoted.len();
                while let Some((i, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => {
                            end = i + 1;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                rest = &quoted[end.min(quoted.len())..];
                value
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                let value = rest[..end].trim().to_string();
                rest = &rest[end..];
                value
            };
            params.insert(key.to_ascii_lowercase(), value);
        }

        Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            params,
        })
    }

    /// Parameter by case-insensitive name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Token endpoint.
    #[must_use]
    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    /// Service name to pass to the token endpoint.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        self.param("service")
    }

    /// Scope the registry asked for.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.param("scope")
    }
}

/// Where a repository's session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Requests go out anonymous.
    Unauthenticated,
    /// A credential is being obtained.
    Authenticating,
    /// A credential is attached to requests.
    Authenticated,
    /// The credential's lifetime ran out.
    Expired,
    /// The registry or token endpoint refused; terminal.
    Rejected,
}

#[derive(Debug, Clone)]
struct Session {
    state: AuthState,
    credential: Credential,
    generation: u64,
    challenge: Option<Challenge>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Obtains and caches credentials for one registry.
#[derive(Debug)]
pub struct AuthClient {
    router: Arc<NetworkRouter>,
    auth: RegistryAuth,
    registry: String,
    request_timeout: Duration,
    retry: RetryPolicy,
    sessions: Mutex<HashMap<String, Session>>,
    refresh: tokio::sync::Mutex<()>,
}

impl AuthClient {
    /// Creates a client for `registry` using the configured credentials.
    #[must_use]
    pub fn new(router: Arc<NetworkRouter>, config: &PullConfig, registry: impl Into<String>) -> Self {
        Self {
            router,
            auth: config.auth.clone(),
            registry: registry.into(),
            request_timeout: config.request_timeout,
            retry: config.retry.clone(),
            sessions: Mutex::new(HashMap::new()),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Current state of `repository`'s session.
    #[must_use]
    pub fn state(&self, repository: &str) -> AuthState {
        self.sessions
            .lock()
            .get(repository)
            .map_or(AuthState::Unauthenticated, |s| s.state)
    }

    /// `Authorization` value currently attached to `repository`'s requests.
    ///
    /// `None` unless the session is authenticated with a credential that
    /// has not expired.
    #[must_use]
    pub fn authorization(&self, repository: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(repository)
            .filter(|s| s.state == AuthState::Authenticated && !s.credential.is_expired())
            .and_then(|s| s.credential.authorization())
    }

    fn initial_session(&self) -> Session {
        match &self.auth {
            RegistryAuth::Bearer { token } => Session {
                state: AuthState::Authenticated,
                credential: Credential::bearer(token.clone(), None),
                generation: 0,
                challenge: None,
            },
            RegistryAuth::None | RegistryAuth::Basic { .. } => Session {
                state: AuthState::Unauthenticated,
                credential: Credential::anonymous(),
                generation: 0,
                challenge: None,
            },
        }
    }

    fn current(&self, repository: &str) -> Session {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(repository.to_string())
            .or_insert_with(|| self.initial_session());
        if session.state == AuthState::Authenticated && session.credential.is_expired() {
            session.state = AuthState::Expired;
        }
        session.clone()
    }

    fn set_state(&self, repository: &str, state: AuthState) {
        if let Some(session) = self.sessions.lock().get_mut(repository) {
            session.state = state;
        }
    }

    fn auth_error(&self, repository: &str, message: impl Into<String>) -> RegistryError {
        RegistryError::Auth {
            registry: self.registry.clone(),
            repository: repository.to_string(),
            message: message.into(),
        }
    }

    /// Credential to attach to the next request for `repository`, with the
    /// session generation it belongs to. Expired tokens are refreshed first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Auth`] if the session was rejected or a
    /// refresh fails.
    pub async fn authorize(&self, repository: &str) -> Result<(Credential, u64)> {
        let session = self.current(repository);
        match session.state {
            AuthState::Rejected => Err(self.auth_error(repository, "credentials were rejected")),
            AuthState::Expired => {
                tracing::debug!(repository, "token expired, refreshing");
                self.reauthenticate(repository, session.generation, None).await
            }
            _ => Ok((session.credential, session.generation)),
        }
    }

    /// Answers a challenge for `repository`.
    ///
    /// Refreshes are serialized; a caller that saw an older generation than
    /// the current one gets the newer credential without another token
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Auth`] if there is no usable challenge, a
    /// supplied static token was rejected, or the token endpoint refuses.
    pub async fn reauthenticate(
        &self,
        repository: &str,
        seen_generation: u64,
        challenge: Option<&str>,
    ) -> Result<(Credential, u64)> {
        let _refresh = self.refresh.lock().await;

        let session = self.current(repository);
        if session.generation > seen_generation && session.state == AuthState::Authenticated {
            return Ok((session.credential, session.generation));
        }
        if matches!(self.auth, RegistryAuth::Bearer { .. }) {
            self.set_state(repository, AuthState::Rejected);
            return Err(self.auth_error(repository, "the supplied bearer token was rejected"));
        }

        let challenge = challenge
            .and_then(Challenge::parse)
            .or(session.challenge)
            .ok_or_else(|| {
                self.auth_error(repository, "registry requires authentication but sent no usable challenge")
            })?;

        self.set_state(repository, AuthState::Authenticating);
        let obtained = retry(&self.retry, "token", |_| {
            self.obtain_credential(&challenge, repository, &[])
        })
        .await;

        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(repository.to_string())
            .or_insert_with(|| self.initial_session());
        match obtained {
            Ok(credential) => {
                session.state = AuthState::Authenticated;
                session.credential = credential;
                session.generation += 1;
                session.challenge = Some(challenge);
                tracing::debug!(
                    registry = %self.registry,
                    repository,
                    scheme = ?session.credential.scheme(),
                    "obtained registry credential"
                );
                Ok((session.credential.clone(), session.generation))
            }
            Err(e) => {
                session.state = AuthState::Rejected;
                Err(e)
            }
        }
    }

    /// Obtains a credential satisfying `challenge` for `repository`.
    ///
    /// `scopes` overrides the challenge's scope; when both are empty the
    /// client asks for `repository:<repository>:pull`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Auth`] when the challenge cannot be met with
    /// the configured credentials or the token endpoint refuses.
    pub async fn obtain_credential(
        &self,
        challenge: &Challenge,
        repository: &str,
        scopes: &[String],
    ) -> Result<Credential> {
        match challenge.scheme.as_str() {
            "basic" => match &self.auth {
                RegistryAuth::Basic { username, password } => Ok(Credential::basic(username, password)),
                _ => Err(self.auth_error(repository, "registry requires basic credentials")),
            },
            "bearer" => self.request_token(challenge, repository, scopes).await,
            other => Err(self.auth_error(
                repository,
                format!("unsupported authentication scheme '{other}'"),
            )),
        }
    }

    async fn request_token(
        &self,
        challenge: &Challenge,
        repository: &str,
        scopes: &[String],
    ) -> Result<Credential> {
        let realm = challenge
            .realm()
            .ok_or_else(|| self.auth_error(repository, "bearer challenge has no realm"))?;
        let mut url = Url::parse(realm)
            .map_err(|_| self.auth_error(repository, format!("invalid token realm '{realm}'")))?;

        let scopes: Vec<String> = if !scopes.is_empty() {
            scopes.to_vec()
        } else if let Some(scope) = challenge.scope() {
            scope.split(' ').filter(|s| !s.is_empty()).map(ToString::to_string).collect()
        } else {
            vec![format!("repository:{repository}:pull")]
        };
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = challenge.service() {
                query.append_pair("service", service);
            }
            for scope in &scopes {
                query.append_pair("scope", scope);
            }
        }

        let (client, _) = self.router.client_for(&url)?;
        let mut request = client.get(url.clone());
        if let RegistryAuth::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        tracing::debug!(
            realm,
            service = challenge.service().unwrap_or_default(),
            scope = %scopes.join(" "),
            "requesting registry token"
        );
        let response = execute(request, self.request_timeout).await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.auth_error(
                repository,
                format!("token endpoint rejected the request ({})", status.as_u16()),
            ));
        }
        if !status.is_success() {
            if crate::error::is_transient_status(status.as_u16()) {
                return Err(RegistryError::Http {
                    status: status.as_u16(),
                    url: realm.to_string(),
                });
            }
            return Err(self.auth_error(
                repository,
                format!("token endpoint returned {}", status.as_u16()),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.auth_error(repository, format!("invalid token response: {e}")))?;
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .or(body.access_token.filter(|t| !t.is_empty()))
            .ok_or_else(|| self.auth_error(repository, "token response contained no token"))?;
        let ttl = body.expires_in.map_or(DEFAULT_TOKEN_TTL, Duration::from_secs);
        Ok(Credential::bearer(token, Some(ttl)))
    }

    /// Sends a request for `repository`, answering at most one challenge.
    ///
    /// `build` is called with the `Authorization` value to attach, once for
    /// the first attempt and once more after re-authentication.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Auth`] if the request is still unauthorized
    /// after re-authenticating, or the transport error of either attempt.
    pub async fn send<F>(&self, repository: &str, timeout: Duration, build: F) -> Result<reqwest::Response>
    where
        F: Fn(Option<&str>) -> Result<reqwest::RequestBuilder>,
    {
        let (credential, generation) = self.authorize(repository).await?;
        let response = execute(build(credential.authorization().as_deref())?, timeout).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        tracing::debug!(
            registry = %self.registry,
            repository,
            "registry requested authentication"
        );

        let (credential, _) = self
            .reauthenticate(repository, generation, challenge.as_deref())
            .await?;
        let response = execute(build(credential.authorization().as_deref())?, timeout).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.set_state(repository, AuthState::Rejected);
            return Err(self.auth_error(repository, "credential rejected after re-authentication"));
        }
        Ok(response)
    }
}
