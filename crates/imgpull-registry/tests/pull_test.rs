//! End-to-end pulls against an in-process fake registry.
//!
//! The fake serves `/v2/<repo>/manifests/<ref>`, `/v2/<repo>/blobs/<digest>`,
//! a `/token` endpoint and a `/cdn/<digest>` blob mirror reached through
//! `localhost`, so redirects land on a different host than the registry.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

use imgpull_core::manifest::media_type;
use imgpull_core::{Digest, ImageReference, Platform};
use imgpull_registry::{
    ClientProtocol, FetchFailure, ImagePuller, ProxyConfig, PullConfig, RegistryAuth, RegistryError,
    RetryPolicy,
};

// =============================================================================
// Fixtures
// =============================================================================

/// Gzipped tar holding `files`.
fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    gz.write_all(&tar).unwrap();
    gz.finish().unwrap()
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

struct TestImage {
    manifest: Vec<u8>,
    digest: Digest,
    config: Digest,
    layers: Vec<Digest>,
    blobs: Vec<(Digest, Vec<u8>)>,
}

fn test_image(arch: &str, layers: &[Vec<u8>]) -> TestImage {
    let diff_ids: Vec<String> = layers
        .iter()
        .map(|data| Digest::sha256_of(&gunzip(data)).to_string())
        .collect();
    let config = serde_json::to_vec(&json!({
        "architecture": arch,
        "os": "linux",
        "created": "2023-08-07T19:20:20Z",
        "config": {"Cmd": ["/bin/sh"]},
        "rootfs": {"type": "layers", "diff_ids": diff_ids}
    }))
    .unwrap();
    let config_digest = Digest::sha256_of(&config);

    let mut blobs = vec![(config_digest.clone(), config.clone())];
    let mut layer_digests = Vec::new();
    let mut descriptors = Vec::new();
    for data in layers {
        let digest = Digest::sha256_of(data);
        descriptors.push(json!({
            "mediaType": media_type::DOCKER_LAYER_GZIP,
            "digest": digest.to_string(),
            "size": data.len()
        }));
        layer_digests.push(digest.clone());
        blobs.push((digest, data.clone()));
    }

    let manifest = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": media_type::DOCKER_MANIFEST_V2,
        "config": {
            "mediaType": media_type::DOCKER_CONFIG,
            "digest": config_digest.to_string(),
            "size": config.len()
        },
        "layers": descriptors
    }))
    .unwrap();

    TestImage {
        digest: Digest::sha256_of(&manifest),
        manifest,
        config: config_digest,
        layers: layer_digests,
        blobs,
    }
}

fn alpine() -> TestImage {
    test_image(
        "amd64",
        &[layer(&[("etc/alpine-release", b"3.18.4\n"), ("bin/sh", b"#!busybox\n")])],
    )
}

// =============================================================================
// Fake registry
// =============================================================================

#[derive(Default)]
struct FakeRegistry {
    manifests: HashMap<(String, String), (String, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
    token: Option<String>,
    always_unauthorized: bool,
    corrupt: HashSet<String>,
    flaky: HashMap<String, usize>,
    delays: HashMap<String, Duration>,
    redirect_blobs: bool,
    /// Manifest references answered with a same-host 307 to another reference.
    moved: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct Seen {
    path: String,
    authorization: Option<String>,
    accept: Option<String>,
}

struct ServerState {
    fake: FakeRegistry,
    port: u16,
    flaky: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<Seen>>,
    hits: Mutex<HashMap<String, usize>>,
}

type Shared = Arc<ServerState>;

impl ServerState {
    fn record(&self, path: String, headers: &HeaderMap) -> Option<String> {
        let value = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        let authorization = value(header::AUTHORIZATION);
        self.requests.lock().push(Seen {
            path,
            authorization: authorization.clone(),
            accept: value(header::ACCEPT),
        });
        authorization
    }

    fn challenge(&self) -> Response {
        let value = format!(
            r#"Bearer realm="http://127.0.0.1:{}/token",service="fake-registry",scope="repository:library/alpine:pull""#,
            self.port
        );
        (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, value)]).into_response()
    }
}

impl FakeRegistry {
    fn with_manifest(mut self, repository: &str, reference: &str, content_type: &str, body: Vec<u8>) -> Self {
        self.manifests.insert(
            (repository.to_string(), reference.to_string()),
            (content_type.to_string(), body),
        );
        self
    }

    fn with_image(self, repository: &str, tag: &str, image: &TestImage) -> Self {
        let mut fake = self
            .with_manifest(repository, tag, media_type::DOCKER_MANIFEST_V2, image.manifest.clone())
            .with_manifest(
                repository,
                &image.digest.to_string(),
                media_type::DOCKER_MANIFEST_V2,
                image.manifest.clone(),
            );
        for (digest, data) in &image.blobs {
            fake.blobs.insert(digest.to_string(), data.clone());
        }
        fake
    }

    async fn start(self) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(ServerState {
            flaky: Mutex::new(self.flaky.clone()),
            fake: self,
            port,
            requests: Mutex::new(Vec::new()),
            hits: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/token", get(token))
            .route("/v2/*rest", get(registry_api))
            .route("/cdn/:digest", get(cdn))
            .with_state(state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            port,
            state,
            handle,
        }
    }
}

async fn token(State(state): State<Shared>, RawQuery(query): RawQuery, headers: HeaderMap) -> Response {
    state.record(format!("token?{}", query.unwrap_or_default()), &headers);
    match &state.fake.token {
        Some(token) => Json(json!({"token": token, "expires_in": 300})).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn registry_api(State(state): State<Shared>, UrlPath(rest): UrlPath<String>, headers: HeaderMap) -> Response {
    let rest = rest.trim_start_matches('/').to_string();
    let authorization = state.record(rest.clone(), &headers);

    if state.fake.always_unauthorized {
        return state.challenge();
    }
    if let Some(token) = &state.fake.token {
        if authorization.as_deref() != Some(format!("Bearer {token}").as_str()) {
            return state.challenge();
        }
    }

    if let Some((repository, reference)) = rest.split_once("/manifests/") {
        if let Some(target) = state.fake.moved.get(reference) {
            let location = format!("/v2/{repository}/manifests/{target}");
            return (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response();
        }
        return match state
            .fake
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
        {
            Some((content_type, body)) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type.clone()),
                    (
                        header::HeaderName::from_static("docker-content-digest"),
                        Digest::sha256_of(body).to_string(),
                    ),
                ],
                body.clone(),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    if let Some((_, digest)) = rest.split_once("/blobs/") {
        if state.fake.redirect_blobs {
            let location = format!("http://localhost:{}/cdn/{digest}", state.port);
            return (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response();
        }
        return serve_blob(&state, digest).await;
    }

    StatusCode::NOT_FOUND.into_response()
}

async fn cdn(State(state): State<Shared>, UrlPath(digest): UrlPath<String>, headers: HeaderMap) -> Response {
    state.record(format!("cdn/{digest}"), &headers);
    serve_blob(&state, &digest).await
}

async fn serve_blob(state: &ServerState, digest: &str) -> Response {
    *state.hits.lock().entry(digest.to_string()).or_default() += 1;

    let fail = {
        let mut flaky = state.flaky.lock();
        match flaky.get_mut(digest) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    };
    if fail {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Some(delay) = state.fake.delays.get(digest) {
        tokio::time::sleep(*delay).await;
    }

    let Some(data) = state.fake.blobs.get(digest) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut data = data.clone();
    if state.fake.corrupt.contains(digest) {
        data[0] ^= 0xff;
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream".to_string())],
        data,
    )
        .into_response()
}

struct TestServer {
    port: u16,
    state: Shared,
    handle: JoinHandle<()>,
}

impl TestServer {
    fn config(&self) -> PullConfig {
        PullConfig::new()
            .with_registry_endpoint(Url::parse(&format!("http://127.0.0.1:{}/", self.port)).unwrap())
            .with_protocol(ClientProtocol::Http)
            .with_retry(RetryPolicy::new(3).without_backoff())
            .with_request_timeout(Duration::from_secs(10))
            .with_read_timeout(Duration::from_secs(10))
    }

    fn requests(&self) -> Vec<Seen> {
        self.state.requests.lock().clone()
    }

    fn hits(&self, digest: &Digest) -> usize {
        self.state
            .hits
            .lock()
            .get(&digest.to_string())
            .copied()
            .unwrap_or_default()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn archive_entries(path: &Path) -> HashMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(File::open(path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}

fn reference(value: &str) -> ImageReference {
    value.parse().unwrap()
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

// =============================================================================
// Pull Tests
// =============================================================================

#[tokio::test]
async fn test_pull_writes_loadable_archive() {
    let image = alpine();
    let server = FakeRegistry::default()
        .with_image("library/alpine", "3.18", &image)
        .start()
        .await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine_3.18.tar");

    let puller = ImagePuller::new(server.config()).unwrap();
    let summary = puller.pull(&reference("alpine:3.18"), &output).await.unwrap();

    assert_eq!(summary.output, output);
    assert_eq!(summary.manifest_digest, image.digest);
    assert_eq!(summary.layer_ids, vec![image.layers[0].hex().to_string()]);

    let entries = archive_entries(&output);
    let index: serde_json::Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
    let id = &summary.layer_ids[0];
    assert_eq!(index[0]["RepoTags"], json!(["alpine:3.18"]));
    assert_eq!(index[0]["Config"], format!("{}.json", image.config.hex()));
    assert_eq!(index[0]["Layers"], json!([format!("{id}/layer.tar")]));

    let repositories: serde_json::Value = serde_json::from_slice(&entries["repositories"]).unwrap();
    assert_eq!(repositories, json!({"alpine": {"3.18": id}}));

    assert_eq!(entries[&format!("{id}/VERSION")], b"1.0");
    let (_, layer_gz) = &image.blobs[1];
    assert_eq!(entries[&format!("{id}/layer.tar")], gunzip(layer_gz));

    // Only the archive remains; staging was cleaned up.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert_eq!(server.requests()[0].path, "library/alpine/manifests/3.18");
}

#[tokio::test]
async fn test_pull_by_digest_has_no_tags() {
    let image = alpine();
    let server = FakeRegistry::default()
        .with_image("library/alpine", "3.18", &image)
        .start()
        .await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("pinned.tar");

    let puller = ImagePuller::new(server.config()).unwrap();
    puller
        .pull(&reference(&format!("alpine@{}", image.digest)), &output)
        .await
        .unwrap();

    let entries = archive_entries(&output);
    let index: serde_json::Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
    assert_eq!(index[0]["RepoTags"], json!([]));
    let repositories: serde_json::Value = serde_json::from_slice(&entries["repositories"]).unwrap();
    assert_eq!(repositories, json!({}));
}

#[tokio::test]
async fn test_manifest_not_found() {
    let server = FakeRegistry::default().start().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.tar");

    let err = ImagePuller::new(server.config())
        .unwrap()
        .pull(&reference("alpine:9.99"), &output)
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::ManifestNotFound { .. }), "{err}");
    assert!(!output.exists());
}

// =============================================================================
// Authentication Tests
// =============================================================================

#[tokio::test]
async fn test_token_challenge_is_answered() {
    let image = alpine();
    let server = FakeRegistry {
        token: Some("t0ken".to_string()),
        ..FakeRegistry::default()
    }
    .with_image("library/alpine", "3.18", &image)
    .start()
    .await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine.tar");

    ImagePuller::new(server.config())
        .unwrap()
        .pull(&reference("alpine:3.18"), &output)
        .await
        .unwrap();

    let requests = server.requests();
    let token_requests: Vec<_> = requests.iter().filter(|r| r.path.starts_with("token?")).collect();
    assert_eq!(token_requests.len(), 1, "token is cached for the repository");
    assert!(token_requests[0].path.contains("service=fake-registry"));
    assert!(token_requests[0].path.contains("scope=repository%3Alibrary%2Falpine%3Apull"));

    let blob_requests: Vec<_> = requests.iter().filter(|r| r.path.contains("/blobs/")).collect();
    assert!(!blob_requests.is_empty());
    for request in blob_requests {
        assert_eq!(request.authorization.as_deref(), Some("Bearer t0ken"));
    }
}

#[tokio::test]
async fn test_same_host_manifest_redirect_keeps_credentials() {
    let image = alpine();
    let mut fake = FakeRegistry {
        token: Some("t0ken".to_string()),
        ..FakeRegistry::default()
    }
    .with_image("library/alpine", "moved", &image);
    fake.moved.insert("3.18".to_string(), "moved".to_string());
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();

    let summary = ImagePuller::new(server.config())
        .unwrap()
        .pull(&reference("alpine:3.18"), &dir.path().join("alpine.tar"))
        .await
        .unwrap();
    assert_eq!(summary.manifest_digest, image.digest);

    let requests = server.requests();
    let hop = requests
        .iter()
        .find(|r| r.path == "library/alpine/manifests/moved")
        .expect("redirect target was requested");
    assert_eq!(hop.authorization.as_deref(), Some("Bearer t0ken"));
    let accept = hop.accept.as_deref().unwrap_or_default();
    assert!(accept.contains(media_type::DOCKER_MANIFEST_V2), "{accept}");
    assert!(accept.contains(media_type::OCI_INDEX), "{accept}");
}

#[tokio::test]
async fn test_rejected_static_token_is_not_replaced() {
    let image = alpine();
    let server = FakeRegistry {
        token: Some("good".to_string()),
        ..FakeRegistry::default()
    }
    .with_image("library/alpine", "3.18", &image)
    .start()
    .await;
    let dir = tempfile::tempdir().unwrap();

    let err = ImagePuller::new(server.config().with_auth(RegistryAuth::bearer("stale")))
        .unwrap()
        .pull(&reference("alpine:3.18"), &dir.path().join("alpine.tar"))
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::Auth { .. }), "{err}");
    assert!(!server.requests().iter().any(|r| r.path.starts_with("token?")));
}

#[tokio::test]
async fn test_second_unauthorized_is_terminal() {
    let server = FakeRegistry {
        token: Some("t0ken".to_string()),
        always_unauthorized: true,
        ..FakeRegistry::default()
    }
    .start()
    .await;
    let dir = tempfile::tempdir().unwrap();

    let err = ImagePuller::new(server.config())
        .unwrap()
        .pull(&reference("alpine:3.18"), &dir.path().join("alpine.tar"))
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::Auth { .. }), "{err}");
    let manifest_requests = server
        .requests()
        .iter()
        .filter(|r| r.path.contains("/manifests/"))
        .count();
    assert_eq!(manifest_requests, 2);
}

// =============================================================================
// Platform Selection Tests
// =============================================================================

fn multi_arch() -> (FakeRegistry, TestImage, TestImage) {
    let amd64 = test_image("amd64", &[layer(&[("arch", b"amd64")])]);
    let arm64 = test_image("arm64", &[layer(&[("arch", b"arm64")])]);
    let attestation = Digest::sha256_of(b"attestation");

    let index = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": media_type::OCI_INDEX,
        "manifests": [
            {
                "mediaType": media_type::DOCKER_MANIFEST_V2,
                "digest": amd64.digest.to_string(),
                "size": amd64.manifest.len(),
                "platform": {"os": "linux", "architecture": "amd64"}
            },
            {
                "mediaType": media_type::DOCKER_MANIFEST_V2,
                "digest": arm64.digest.to_string(),
                "size": arm64.manifest.len(),
                "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}
            },
            {
                "mediaType": media_type::OCI_MANIFEST,
                "digest": attestation.to_string(),
                "size": 10,
                "platform": {"os": "unknown", "architecture": "unknown"}
            }
        ]
    }))
    .unwrap();

    let fake = FakeRegistry::default()
        .with_image("library/alpine", &amd64.digest.to_string(), &amd64)
        .with_image("library/alpine", &arm64.digest.to_string(), &arm64)
        .with_manifest("library/alpine", "latest", media_type::OCI_INDEX, index);
    (fake, amd64, arm64)
}

#[tokio::test]
async fn test_index_selects_requested_platform() {
    let (fake, amd64, arm64) = multi_arch();
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine.tar");

    let config = server.config().with_platform(Platform::new("linux", "arm64"));
    let summary = ImagePuller::new(config)
        .unwrap()
        .pull(&reference("alpine"), &output)
        .await
        .unwrap();

    assert_eq!(summary.platform, Platform::new("linux", "arm64").with_variant("v8"));
    assert_eq!(summary.manifest_digest, arm64.digest);
    let entries = archive_entries(&output);
    let index: serde_json::Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
    assert_eq!(index[0]["Config"], format!("{}.json", arm64.config.hex()));
    assert_eq!(server.hits(&amd64.layers[0]), 0);
}

#[tokio::test]
async fn test_missing_platform_lists_available() {
    let (fake, _, _) = multi_arch();
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine.tar");

    let config = server.config().with_platform(Platform::new("linux", "s390x"));
    let err = ImagePuller::new(config)
        .unwrap()
        .pull(&reference("alpine"), &output)
        .await
        .unwrap_err();

    match err {
        RegistryError::PlatformNotFound { requested, available } => {
            assert_eq!(requested, Platform::new("linux", "s390x"));
            assert_eq!(
                available,
                vec![
                    Platform::new("linux", "amd64"),
                    Platform::new("linux", "arm64").with_variant("v8"),
                ]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.exists());
}

// =============================================================================
// Download Tests
// =============================================================================

#[tokio::test]
async fn test_corrupted_blob_fails_after_retries() {
    let image = alpine();
    let bad = image.layers[0].clone();
    let mut fake = FakeRegistry::default().with_image("library/alpine", "3.18", &image);
    fake.corrupt.insert(bad.to_string());
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine.tar");

    let err = ImagePuller::new(server.config())
        .unwrap()
        .pull(&reference("alpine:3.18"), &output)
        .await
        .unwrap_err();

    match err {
        RegistryError::BlobFetch { digest, attempts, cause } => {
            assert_eq!(digest, bad);
            assert_eq!(attempts, 3);
            assert!(matches!(cause, FetchFailure::DigestMismatch { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.hits(&bad), 3);
    assert!(dir_is_empty(dir.path()), "no archive and no staged blobs remain");
}

#[tokio::test]
async fn test_transient_server_error_recovers() {
    let image = alpine();
    let flaky = image.layers[0].clone();
    let mut fake = FakeRegistry::default().with_image("library/alpine", "3.18", &image);
    fake.flaky.insert(flaky.to_string(), 2);
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine.tar");

    ImagePuller::new(server.config())
        .unwrap()
        .pull(&reference("alpine:3.18"), &output)
        .await
        .unwrap();

    assert!(output.exists());
    assert_eq!(server.hits(&flaky), 3);
}

#[tokio::test]
async fn test_missing_blob_is_not_retried() {
    let image = alpine();
    let missing = image.layers[0].clone();
    let mut fake = FakeRegistry::default().with_image("library/alpine", "3.18", &image);
    fake.blobs.remove(&missing.to_string());
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();

    let err = ImagePuller::new(server.config())
        .unwrap()
        .pull(&reference("alpine:3.18"), &dir.path().join("alpine.tar"))
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            RegistryError::BlobFetch {
                attempts: 1,
                cause: FetchFailure::Status(404),
                ..
            }
        ),
        "{err}"
    );
}

#[tokio::test]
async fn test_cdn_redirect_goes_direct_without_credentials() {
    let image = alpine();
    let server = FakeRegistry {
        token: Some("t0ken".to_string()),
        redirect_blobs: true,
        ..FakeRegistry::default()
    }
    .with_image("library/alpine", "3.18", &image)
    .start()
    .await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine.tar");

    // Nothing listens on the proxy; only direct routes can succeed.
    let config = server.config().with_proxy(
        ProxyConfig::default()
            .with_proxy("http://127.0.0.1:9")
            .with_no_proxy_list("127.0.0.1")
            .with_cdn_hosts(["localhost"]),
    );
    ImagePuller::new(config)
        .unwrap()
        .pull(&reference("alpine:3.18"), &output)
        .await
        .unwrap();

    let cdn_requests: Vec<_> = server
        .requests()
        .into_iter()
        .filter(|r| r.path.starts_with("cdn/"))
        .collect();
    assert_eq!(cdn_requests.len(), image.blobs.len());
    assert!(cdn_requests.iter().all(|r| r.authorization.is_none()));
}

#[tokio::test]
async fn test_schema1_manifest_is_converted() {
    let base = layer(&[("etc/issue", b"legacy\n")]);
    let top = layer(&[("app/run.sh", b"#!/bin/sh\n")]);
    let base_digest = Digest::sha256_of(&base);
    let top_digest = Digest::sha256_of(&top);
    let v1 = json!({
        "architecture": "amd64",
        "os": "linux",
        "created": "2016-03-01T10:00:00Z",
        "config": {"Cmd": ["/bin/sh"]}
    });
    let manifest = serde_json::to_vec(&json!({
        "schemaVersion": 1,
        "name": "library/legacy",
        "tag": "1.0",
        "architecture": "amd64",
        "fsLayers": [
            {"blobSum": top_digest.to_string()},
            {"blobSum": base_digest.to_string()}
        ],
        "history": [
            {"v1Compatibility": v1.to_string()},
            {"v1Compatibility": "{}"}
        ]
    }))
    .unwrap();

    // Signed manifests are addressed by the digest of the JWS envelope.
    let signed = Digest::sha256_of(b"signed envelope");
    let mut fake = FakeRegistry::default()
        .with_manifest("library/legacy", "1.0", media_type::DOCKER_MANIFEST_V1_SIGNED, manifest.clone())
        .with_manifest(
            "library/legacy",
            &signed.to_string(),
            media_type::DOCKER_MANIFEST_V1_SIGNED,
            manifest,
        );
    fake.blobs.insert(base_digest.to_string(), base.clone());
    fake.blobs.insert(top_digest.to_string(), top.clone());
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("legacy_1.0.tar");
    let puller = ImagePuller::new(server.config()).unwrap();

    let summary = puller.pull(&reference("legacy:1.0"), &output).await.unwrap();

    assert_eq!(summary.layer_ids.len(), 2);
    assert_eq!(summary.layer_ids[0], base_digest.hex());
    let entries = archive_entries(&output);
    let index: serde_json::Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
    assert_eq!(
        index[0]["Layers"],
        json!([
            format!("{}/layer.tar", summary.layer_ids[0]),
            format!("{}/layer.tar", summary.layer_ids[1])
        ])
    );
    assert_eq!(entries[&format!("{}/layer.tar", summary.layer_ids[0])], gunzip(&base));
    assert_eq!(entries[&format!("{}/layer.tar", summary.layer_ids[1])], gunzip(&top));

    let config_name = index[0]["Config"].as_str().unwrap();
    let config_bytes = &entries[config_name];
    assert_eq!(config_name, format!("{}.json", Digest::sha256_of(config_bytes).hex()));
    let config: serde_json::Value = serde_json::from_slice(config_bytes).unwrap();
    assert_eq!(config["architecture"], "amd64");
    assert_eq!(config["config"]["Cmd"], json!(["/bin/sh"]));
    assert_eq!(
        config["rootfs"]["diff_ids"],
        json!([
            Digest::sha256_of(&gunzip(&base)).to_string(),
            Digest::sha256_of(&gunzip(&top)).to_string()
        ])
    );

    let top_json: serde_json::Value =
        serde_json::from_slice(&entries[&format!("{}/json", summary.layer_ids[1])]).unwrap();
    assert_eq!(top_json["created"], "2016-03-01T10:00:00Z");

    // The config is synthesized; only the two layers are downloaded.
    let blob_requests = server
        .requests()
        .iter()
        .filter(|r| r.path.contains("/blobs/"))
        .count();
    assert_eq!(blob_requests, 2);

    let pinned = puller
        .pull(&reference(&format!("legacy@{signed}")), &dir.path().join("pinned.tar"))
        .await
        .unwrap();
    assert_eq!(pinned.manifest_digest, signed);
    assert_eq!(pinned.layer_ids, summary.layer_ids);
}

#[tokio::test]
async fn test_archive_bytes_independent_of_completion_order() {
    let image = test_image(
        "amd64",
        &[
            layer(&[("a", b"first")]),
            layer(&[("b", b"second")]),
            layer(&[("c", b"third")]),
        ],
    );
    let dir = tempfile::tempdir().unwrap();

    let mut outputs = Vec::new();
    for slow in [0, 2] {
        let mut fake = FakeRegistry::default().with_image("library/alpine", "3.18", &image);
        fake.delays
            .insert(image.layers[slow].to_string(), Duration::from_millis(300));
        let server = fake.start().await;
        let output = dir.path().join(format!("run-{slow}.tar"));
        ImagePuller::new(server.config())
            .unwrap()
            .pull(&reference("alpine:3.18"), &output)
            .await
            .unwrap();
        outputs.push(std::fs::read(&output).unwrap());
    }

    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn test_cancel_cleans_up() {
    let image = alpine();
    let mut fake = FakeRegistry::default().with_image("library/alpine", "3.18", &image);
    fake.delays
        .insert(image.layers[0].to_string(), Duration::from_secs(30));
    let server = fake.start().await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("alpine.tar");

    let err = ImagePuller::new(server.config())
        .unwrap()
        .pull_until(
            &reference("alpine:3.18"),
            &output,
            tokio::time::sleep(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RegistryError::Cancelled));
    assert!(dir_is_empty(dir.path()));
}
