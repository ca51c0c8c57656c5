//! HTTP client for the Docker Distribution v2 registry API.
//!
//! One [`RegistryClient`] per (host, credential) pair. The client owns the
//! auth challenge state and a per-scope bearer token cache, retries
//! transient and rate-limit failures with backoff, follows a single
//! redirect with the Authorization header stripped for untrusted hosts,
//! and downgrades TLS only for hosts the security policy allows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ferry_core::config::{MirrorConfig, RegistryCredentials};
use ferry_core::error::{FerryError, Result};
use parking_lot::{Mutex, RwLock};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::Deserialize;

use crate::manifest::{Manifest, MANIFEST_ACCEPT};
use crate::registry::auth::{
    self, basic_header, is_invalid_token, parse_challenge, AuthChallenge, BearerToken,
    TokenResponse,
};
use crate::registry::retry::{retry, RetryPolicy};

/// Shared record of which hosts were downgraded by the insecure-registry
/// probe, seeded from configuration. Hosts in the `secure` set are never
/// downgraded.
#[derive(Debug, Default)]
pub struct RegistrySecurity {
    insecure: RwLock<HashSet<String>>,
    no_verify: RwLock<HashSet<String>>,
    secure: HashSet<String>,
}

impl RegistrySecurity {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            insecure: RwLock::new(config.insecure_registries.clone()),
            no_verify: RwLock::new(config.no_verify_registries.clone()),
            secure: config.secure_registries.clone(),
        }
    }

    pub fn is_insecure(&self, host: &str) -> bool {
        self.insecure.read().contains(host)
    }

    pub fn is_no_verify(&self, host: &str) -> bool {
        self.no_verify.read().contains(host)
    }

    pub fn is_secure(&self, host: &str) -> bool {
        self.secure.contains(host)
    }

    pub fn mark_insecure(&self, host: &str) {
        self.insecure.write().insert(host.to_string());
    }

    pub fn mark_no_verify(&self, host: &str) {
        self.no_verify.write().insert(host.to_string());
    }
}

/// Outcome of a cross-repo mount attempt.
#[derive(Debug)]
pub enum MountOutcome {
    /// 201: the registry linked the blob; no upload needed.
    Mounted,
    /// 202: the registry opened an upload session instead.
    Session(String),
}

/// `tags/list` response body.
#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// One request as replayed by the retry loop.
struct Req {
    method: Method,
    url: String,
    scope: String,
    accept: Option<String>,
    content_type: Option<String>,
    content_range: Option<(u64, u64)>,
    body: Option<Bytes>,
    follow_redirect: bool,
}

impl Req {
    fn new(method: Method, url: String, scope: &str) -> Self {
        Self {
            method,
            url,
            scope: scope.to_string(),
            accept: None,
            content_type: None,
            content_range: None,
            body: None,
            follow_redirect: false,
        }
    }
}

/// HTTP session against one registry host.
pub struct RegistryClient {
    host: String,
    base_url: String,
    client: Client,
    credentials: Option<RegistryCredentials>,
    trusted_hosts: HashSet<String>,
    challenge: Mutex<Option<AuthChallenge>>,
    tokens: Mutex<HashMap<String, BearerToken>>,
    policy: RetryPolicy,
    security: Arc<RegistrySecurity>,
}

impl RegistryClient {
    /// Connect to a registry host: build the HTTP client, probe `/v2/`,
    /// and record the auth challenge. TLS failures downgrade the host
    /// (no-verify, then plain HTTP) unless it is configured secure.
    pub async fn connect(
        host: &str,
        config: &MirrorConfig,
        security: Arc<RegistrySecurity>,
    ) -> Result<Self> {
        let base = config
            .mirrors
            .get(host)
            .cloned()
            .unwrap_or_else(|| format!("https://{}", host));
        Self::connect_to(host, base, config, security).await
    }

    /// Connect using an explicit base URL (mirror prefix support).
    pub async fn connect_to(
        host: &str,
        base_url: String,
        config: &MirrorConfig,
        security: Arc<RegistrySecurity>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut verify = !security.is_no_verify(host);
        let mut base_url = if security.is_insecure(host) {
            base_url.replacen("https://", "http://", 1)
        } else {
            base_url
        };

        let mut client = build_http_client(timeout, verify)?;
        let probe_url = format!("{}/v2/", base_url);

        // At most two downgrade steps: verified https → no-verify https → http.
        let response = loop {
            match client.get(format!("{}/v2/", base_url)).send().await {
                Ok(response) => break response,
                Err(e) if verify && is_certificate_error(&e) && !security.is_secure(host) => {
                    tracing::warn!(host, "Certificate verification failed; retrying without verification");
                    verify = false;
                    security.mark_no_verify(host);
                    client = build_http_client(timeout, verify)?;
                }
                Err(e)
                    if base_url.starts_with("https://")
                        && is_ssl_error(&e)
                        && !security.is_secure(host) =>
                {
                    tracing::warn!(host, "SSL negotiation failed; falling back to plain HTTP");
                    base_url = base_url.replacen("https://", "http://", 1);
                    security.mark_insecure(host);
                }
                Err(e) => {
                    return Err(FerryError::Transient(format!(
                        "Failed to probe {}: {}",
                        probe_url, e
                    )))
                }
            }
        };

        let challenge = match response.status() {
            StatusCode::OK => None,
            StatusCode::UNAUTHORIZED => {
                let header = www_authenticate(&response).ok_or_else(|| {
                    FerryError::Protocol(format!(
                        "401 from {} without Www-Authenticate header",
                        probe_url
                    ))
                })?;
                Some(parse_challenge(&header)?)
            }
            status => {
                return Err(FerryError::Protocol(format!(
                    "Auth probe of {} returned HTTP {}",
                    probe_url, status
                )))
            }
        };

        tracing::debug!(
            host,
            base_url = %base_url,
            challenge = ?challenge,
            "Registry session established"
        );

        Ok(Self {
            host: host.to_string(),
            base_url,
            client,
            credentials: config.credentials_for(host).cloned(),
            trusted_hosts: config.trusted_hosts.clone(),
            challenge: Mutex::new(challenge),
            tokens: Mutex::new(HashMap::new()),
            policy: RetryPolicy::default(),
            security,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL at which a blob lives at this registry.
    pub fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.base_url, repository, digest)
    }

    // --- Manifest operations ---

    /// Fetch a manifest. Returns the parsed manifest and its digest, taken
    /// from `Docker-Content-Digest` when present, computed otherwise.
    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(Manifest, String)> {
        let mut req = Req::new(
            Method::GET,
            format!("{}/v2/{}/manifests/{}", self.base_url, repository, reference),
            &auth::pull_scope(repository),
        );
        req.accept = Some(MANIFEST_ACCEPT.to_string());
        let response = self.dispatch(&req).await?;

        let content_type = header_string(&response, "Content-Type");
        let header_digest = header_string(&response, "Docker-Content-Digest");
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FerryError::Transient(format!("Failed to read manifest body: {}", e)))?;

        let manifest = Manifest::parse(&bytes, content_type.as_deref())?;
        let digest = header_digest.unwrap_or_else(|| crate::digest::sha256_digest(&bytes));
        Ok((manifest, digest))
    }

    /// Resolve a tag or digest reference to the manifest digest via HEAD,
    /// falling back to a full GET when the registry omits the header.
    pub async fn resolve_digest(&self, repository: &str, reference: &str) -> Result<String> {
        let mut req = Req::new(
            Method::HEAD,
            format!("{}/v2/{}/manifests/{}", self.base_url, repository, reference),
            &auth::pull_scope(repository),
        );
        req.accept = Some(MANIFEST_ACCEPT.to_string());
        let response = self.dispatch(&req).await?;
        if let Some(digest) = header_string(&response, "Docker-Content-Digest") {
            return Ok(digest);
        }
        let (_, digest) = self.get_manifest(repository, reference).await?;
        Ok(digest)
    }

    /// Upload a manifest under a tag or digest reference. A 400 response is
    /// fatal: the bytes do not form a manifest the registry accepts.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let mut req = Req::new(
            Method::PUT,
            format!("{}/v2/{}/manifests/{}", self.base_url, repository, reference),
            &auth::push_scope(repository),
        );
        req.content_type = Some(media_type.to_string());
        req.body = Some(Bytes::from(bytes));
        self.dispatch(&req).await?;
        Ok(())
    }

    /// Delete a manifest by digest.
    pub async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<()> {
        let req = Req::new(
            Method::DELETE,
            format!("{}/v2/{}/manifests/{}", self.base_url, repository, digest),
            &auth::push_scope(repository),
        );
        self.dispatch(&req).await?;
        Ok(())
    }

    /// List tags of a repository.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let req = Req::new(
            Method::GET,
            format!("{}/v2/{}/tags/list", self.base_url, repository),
            &auth::pull_scope(repository),
        );
        let response = self.dispatch(&req).await?;
        let list: TagList = response
            .json()
            .await
            .map_err(|e| FerryError::Protocol(format!("Invalid tags/list body: {}", e)))?;
        Ok(list.tags.unwrap_or_default())
    }

    // --- Blob operations ---

    /// Whether the blob is already present (HEAD 200).
    pub async fn blob_exists(&self, repository: &str, digest: &str) -> Result<bool> {
        let req = Req::new(
            Method::HEAD,
            self.blob_url(repository, digest),
            &auth::pull_scope(repository),
        );
        match self.dispatch(&req).await {
            Ok(_) => Ok(true),
            Err(FerryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a blob download. The response body is streamed by the caller;
    /// a single redirect to a CDN is followed with auth stripped when the
    /// target host is untrusted.
    pub async fn get_blob(&self, repository: &str, digest: &str) -> Result<Response> {
        let mut req = Req::new(
            Method::GET,
            self.blob_url(repository, digest),
            &auth::pull_scope(repository),
        );
        req.follow_redirect = true;
        self.dispatch(&req).await
    }

    /// Fetch a small blob (config JSON) fully into memory.
    pub async fn get_blob_bytes(&self, repository: &str, digest: &str) -> Result<Bytes> {
        let response = self.get_blob(repository, digest).await?;
        response
            .bytes()
            .await
            .map_err(|e| FerryError::Transient(format!("Failed to read blob {}: {}", digest, e)))
    }

    /// Probe the blob-upload endpoint. `false` means the destination does
    /// not implement uploads (export-mode filesystem target).
    pub async fn supports_blob_upload(&self, repository: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.base_url, repository);
        let status = self
            .raw_status(Method::HEAD, &url, &auth::push_scope(repository))
            .await?;
        Ok(!is_export_mode_status(status))
    }

    /// Attempt a cross-repo mount; falls back to an upload session when the
    /// registry answers 202 instead of 201.
    pub async fn mount_blob(
        &self,
        repository: &str,
        digest: &str,
        from_repository: &str,
    ) -> Result<MountOutcome> {
        let url = format!(
            "{}/v2/{}/blobs/uploads/?mount={}&from={}",
            self.base_url, repository, digest, from_repository
        );
        let req = Req::new(Method::POST, url, &auth::push_scope(repository));
        let response = self.dispatch(&req).await?;
        match response.status() {
            StatusCode::CREATED => Ok(MountOutcome::Mounted),
            StatusCode::ACCEPTED => {
                let location = self.location_of(&response)?;
                Ok(MountOutcome::Session(location))
            }
            status => Err(FerryError::Protocol(format!(
                "Mount of {} returned HTTP {}",
                digest, status
            ))),
        }
    }

    /// Begin a chunked blob upload session; returns the session location.
    pub async fn start_upload(&self, repository: &str) -> Result<String> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.base_url, repository);
        let req = Req::new(Method::POST, url, &auth::push_scope(repository));
        let response = self.dispatch(&req).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(FerryError::Protocol(format!(
                "Upload start returned HTTP {}",
                response.status()
            )));
        }
        self.location_of(&response)
    }

    /// Upload one chunk; returns the location for the next chunk.
    pub async fn upload_chunk(
        &self,
        repository: &str,
        location: &str,
        start: u64,
        chunk: Bytes,
    ) -> Result<String> {
        let end = start + chunk.len() as u64 - 1;
        let mut req = Req::new(
            Method::PATCH,
            self.absolute(location),
            &auth::push_scope(repository),
        );
        req.content_type = Some("application/octet-stream".to_string());
        req.content_range = Some((start, end));
        req.body = Some(chunk);
        let response = self.dispatch(&req).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(FerryError::Protocol(format!(
                "Chunk upload returned HTTP {}",
                response.status()
            )));
        }
        self.location_of(&response)
    }

    /// Finalize an upload session with the blob digest.
    pub async fn finalize_upload(
        &self,
        repository: &str,
        location: &str,
        digest: &str,
    ) -> Result<()> {
        let url = append_query(&self.absolute(location), "digest", digest);
        let mut req = Req::new(Method::PUT, url, &auth::push_scope(repository));
        req.content_type = Some("application/octet-stream".to_string());
        let response = self.dispatch(&req).await?;
        if response.status() != StatusCode::CREATED && !response.status().is_success() {
            return Err(FerryError::Protocol(format!(
                "Upload finalize returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Abort an upload session; best effort, errors ignored by callers.
    pub async fn cancel_upload(&self, repository: &str, location: &str) -> Result<()> {
        let req = Req::new(
            Method::DELETE,
            self.absolute(location),
            &auth::push_scope(repository),
        );
        self.dispatch(&req).await?;
        Ok(())
    }

    // --- Request machinery ---

    /// Send with retry; transient and rate-limit failures back off.
    async fn dispatch(&self, req: &Req) -> Result<Response> {
        retry(&self.policy, || self.attempt(req)).await
    }

    /// One attempt: apply auth, send, map the status, reauthenticate at
    /// most once on 401, follow at most one redirect when asked to.
    async fn attempt(&self, req: &Req) -> Result<Response> {
        let mut reauthenticated = false;
        loop {
            let response = self.send_once(req).await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if reauthenticated {
                    return Err(self.unauthorized_error());
                }
                let header = www_authenticate(&response);
                self.reauthenticate(&req.scope, header.as_deref())?;
                reauthenticated = true;
                continue;
            }

            if status.is_redirection() && req.follow_redirect {
                let location = self.location_of(&response)?;
                return self.follow_redirect(req, &location).await;
            }

            return match status {
                s if s.is_success() || s.is_redirection() => Ok(response),
                StatusCode::TOO_MANY_REQUESTS => Err(FerryError::RateLimited(format!(
                    "{} {} returned 429",
                    req.method, req.url
                ))),
                StatusCode::NOT_FOUND => {
                    Err(FerryError::NotFound(format!("{} {}", req.method, req.url)))
                }
                StatusCode::BAD_REQUEST => {
                    let body = response.text().await.unwrap_or_default();
                    Err(FerryError::Protocol(format!(
                        "{} {} returned 400: {}",
                        req.method, req.url, body
                    )))
                }
                StatusCode::FORBIDDEN => Err(FerryError::Unauthorized {
                    registry: self.host.clone(),
                    message: format!("{} {} forbidden", req.method, req.url),
                }),
                s if s.is_server_error() => Err(FerryError::Transient(format!(
                    "{} {} returned HTTP {}",
                    req.method, req.url, s
                ))),
                s => Err(FerryError::Protocol(format!(
                    "{} {} returned HTTP {}",
                    req.method, req.url, s
                ))),
            };
        }
    }

    /// Build and send the request exactly once.
    async fn send_once(&self, req: &Req) -> Result<Response> {
        let mut builder = self.client.request(req.method.clone(), &req.url);
        if let Some(auth_header) = self.authorization_for(&req.scope).await? {
            builder = builder.header("Authorization", auth_header);
        }
        if let Some(ref accept) = req.accept {
            builder = builder.header("Accept", accept.as_str());
        }
        if let Some(ref content_type) = req.content_type {
            builder = builder.header("Content-Type", content_type.as_str());
        }
        if let Some((start, end)) = req.content_range {
            builder = builder.header("Content-Range", format!("{}-{}", start, end));
        }
        if let Some(ref body) = req.body {
            builder = builder
                .header("Content-Length", body.len())
                .body(body.clone());
        } else if matches!(req.method, Method::POST | Method::PUT | Method::PATCH) {
            builder = builder.header("Content-Length", 0u64);
        }
        builder.send().await.map_err(|e| {
            FerryError::Transient(format!("{} {} failed: {}", req.method, req.url, e))
        })
    }

    /// Replay a redirected GET/HEAD against the redirect target, stripping
    /// the Authorization header when the target host is untrusted.
    async fn follow_redirect(&self, req: &Req, location: &str) -> Result<Response> {
        let url = self.absolute(location);
        let target_host = url_host(&url);
        let trusted = target_host
            .as_deref()
            .map(|h| h == self.host || self.trusted_hosts.contains(h))
            .unwrap_or(false);

        let mut builder = self.client.request(req.method.clone(), &url);
        if trusted {
            if let Some(auth_header) = self.authorization_for(&req.scope).await? {
                builder = builder.header("Authorization", auth_header);
            }
        } else {
            tracing::debug!(
                url = %url,
                "Following redirect to untrusted host without Authorization"
            );
        }
        let response = builder.send().await.map_err(|e| {
            FerryError::Transient(format!("Redirected {} {} failed: {}", req.method, url, e))
        })?;
        if !response.status().is_success() {
            return Err(FerryError::Transient(format!(
                "Redirect target {} returned HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }

    /// Status of a request without error mapping; used for capability probes.
    async fn raw_status(&self, method: Method, url: &str, scope: &str) -> Result<StatusCode> {
        let req = Req::new(method, url.to_string(), scope);
        let response = self.send_once(&req).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let header = www_authenticate(&response);
            self.reauthenticate(scope, header.as_deref())?;
            let response = self.send_once(&req).await?;
            return Ok(response.status());
        }
        Ok(response.status())
    }

    // --- Auth state ---

    /// The Authorization header for a scope, fetching a bearer token when
    /// the cached one is missing or expired.
    async fn authorization_for(&self, scope: &str) -> Result<Option<String>> {
        let challenge = self.challenge.lock().clone();
        match challenge {
            None => Ok(None),
            Some(AuthChallenge::Basic) => {
                let credentials = self.credentials.as_ref().ok_or_else(|| {
                    FerryError::Unauthorized {
                        registry: self.host.clone(),
                        message: "Registry requires basic auth but no credentials are configured"
                            .to_string(),
                    }
                })?;
                Ok(Some(basic_header(credentials)))
            }
            Some(AuthChallenge::Bearer { realm, service }) => {
                if let Some(token) = self.tokens.lock().get(scope) {
                    if !token.is_expired() {
                        return Ok(Some(token.header_value()));
                    }
                }
                let token = self.fetch_token(&realm, &service, scope).await?;
                let header = token.header_value();
                self.tokens.lock().insert(scope.to_string(), token);
                Ok(Some(header))
            }
        }
    }

    /// Fetch a bearer token from the realm for one scope.
    async fn fetch_token(&self, realm: &str, service: &str, scope: &str) -> Result<BearerToken> {
        let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
        if !service.is_empty() {
            query.push(("service", service));
        }
        let mut builder = self.client.get(realm).query(&query);
        if let Some(ref credentials) = self.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }
        let response = builder.send().await.map_err(|e| {
            FerryError::Transient(format!("Token request to {} failed: {}", realm, e))
        })?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.unauthorized_error());
        }
        if !response.status().is_success() {
            return Err(FerryError::Protocol(format!(
                "Token endpoint {} returned HTTP {}",
                realm,
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await.map_err(|e| {
            FerryError::Protocol(format!("Invalid token response from {}: {}", realm, e))
        })?;
        let token = body.token()?.to_string();
        tracing::trace!(scope, realm, "Obtained bearer token");
        Ok(BearerToken::new(token, body.expires_in))
    }

    /// Handle a mid-request 401: refresh the challenge, and drop the cached
    /// token when the server flagged it invalid.
    fn reauthenticate(&self, scope: &str, header: Option<&str>) -> Result<()> {
        if let Some(header) = header {
            if is_invalid_token(header) {
                self.tokens.lock().remove(scope);
                tracing::debug!(scope, "Server rejected bearer token; will refresh");
            }
            *self.challenge.lock() = Some(parse_challenge(header)?);
        } else {
            // 401 without a challenge: force a token refresh on the old one.
            self.tokens.lock().remove(scope);
        }
        Ok(())
    }

    /// Unauthorized error with a message distinguishing missing credentials
    /// from docker.io's habit of masking missing repositories as 401.
    fn unauthorized_error(&self) -> FerryError {
        let message = if self.credentials.is_none() {
            "Authentication required and no credentials are configured \
             (note: docker.io also answers 401 for repositories that do not exist)"
                .to_string()
        } else {
            "Credentials rejected (note: docker.io also answers 401 for repositories \
             that do not exist)"
                .to_string()
        };
        FerryError::Unauthorized {
            registry: self.host.clone(),
            message,
        }
    }

    // --- Helpers ---

    fn location_of(&self, response: &Response) -> Result<String> {
        header_string(response, "Location")
            .map(|l| self.absolute(&l))
            .ok_or_else(|| {
                FerryError::Protocol("Response missing Location header".to_string())
            })
    }

    /// Resolve a possibly-relative location against the session base URL.
    fn absolute(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else if location.starts_with('/') {
            format!("{}{}", origin_of(&self.base_url), location)
        } else {
            format!("{}/{}", self.base_url, location)
        }
    }
}

fn build_http_client(timeout: Duration, verify: bool) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(!verify)
        .build()
        .map_err(|e| FerryError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Statuses a filesystem export target answers to an upload probe.
fn is_export_mode_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 403 | 404 | 405 | 501)
}

/// reqwest folds TLS errors into connect errors; the error chain text is
/// the only way to tell a certificate failure from a refused connection.
fn is_certificate_error(e: &reqwest::Error) -> bool {
    certificate_error_text(&format!("{:?}", e))
}

fn certificate_error_text(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("certificate") || text.contains("self signed") || text.contains("unknownissuer")
}

/// A genuine TLS-layer failure. A refused or timed-out connection must NOT
/// match: downgrading to plain HTTP because a registry was briefly
/// unreachable would silently strip encryption from every later request.
fn is_ssl_error(e: &reqwest::Error) -> bool {
    ssl_error_text(&format!("{:?}", e))
}

fn ssl_error_text(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("ssl") || text.contains("handshake") || text.contains("tls")
}

fn www_authenticate(response: &Response) -> Option<String> {
    header_string(response, "Www-Authenticate")
}

fn header_string(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Host (with port) of an absolute URL.
fn url_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Scheme plus authority of a base URL, dropping any path prefix.
fn origin_of(base_url: &str) -> String {
    match Url::parse(base_url) {
        Ok(url) => {
            let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
            if let Some(port) = url.port() {
                origin.push_str(&format!(":{}", port));
            }
            origin
        }
        Err(_) => base_url.to_string(),
    }
}

fn append_query(url: &str, key: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, separator, key, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_mode_statuses() {
        for code in [403u16, 404, 405, 501] {
            assert!(is_export_mode_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200u16, 202, 401, 500] {
            assert!(!is_export_mode_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn test_url_host() {
        assert_eq!(
            url_host("https://cdn.example/path/x").as_deref(),
            Some("cdn.example")
        );
        assert_eq!(
            url_host("http://local-reg:8787/v2/").as_deref(),
            Some("local-reg:8787")
        );
        assert_eq!(url_host("not a url"), None);
    }

    #[test]
    fn test_origin_of_strips_mirror_prefix() {
        assert_eq!(
            origin_of("https://mirror.example/docker"),
            "https://mirror.example"
        );
        assert_eq!(
            origin_of("http://local-reg:8787"),
            "http://local-reg:8787"
        );
    }

    #[test]
    fn test_append_query() {
        assert_eq!(
            append_query("https://h/v2/u", "digest", "sha256:a"),
            "https://h/v2/u?digest=sha256:a"
        );
        assert_eq!(
            append_query("https://h/v2/u?x=1", "digest", "sha256:a"),
            "https://h/v2/u?x=1&digest=sha256:a"
        );
    }

    #[test]
    fn test_downgrade_triggers_on_tls_failures_only() {
        assert!(ssl_error_text("error trying to connect: tls handshake eof"));
        assert!(ssl_error_text("SSL routines: wrong version number"));
        // A registry that is briefly down or unreachable is not a TLS
        // failure and must never flip the host to plain HTTP.
        assert!(!ssl_error_text(
            "error trying to connect: tcp connect error: Connection refused (os error 111)"
        ));
        assert!(!ssl_error_text("operation timed out"));

        assert!(certificate_error_text("invalid peer certificate: UnknownIssuer"));
        assert!(certificate_error_text("self signed certificate in chain"));
        assert!(!certificate_error_text("Connection reset by peer (os error 104)"));
    }

    #[test]
    fn test_security_marking() {
        let config = MirrorConfig::default();
        let security = RegistrySecurity::from_config(&config);
        assert!(!security.is_insecure("local-reg:8787"));
        security.mark_insecure("local-reg:8787");
        assert!(security.is_insecure("local-reg:8787"));
        security.mark_no_verify("self-signed.example");
        assert!(security.is_no_verify("self-signed.example"));
    }

    #[test]
    fn test_security_seeded_from_config() {
        let mut config = MirrorConfig::default();
        config.insecure_registries.insert("plain.example".to_string());
        config.secure_registries.insert("locked.example".to_string());
        let security = RegistrySecurity::from_config(&config);
        assert!(security.is_insecure("plain.example"));
        assert!(security.is_secure("locked.example"));
    }

    #[tokio::test]
    #[ignore] // Requires network access.
    async fn test_connect_public_registry() {
        let config = MirrorConfig::default();
        let security = Arc::new(RegistrySecurity::from_config(&config));
        let client = RegistryClient::connect("registry-1.docker.io", &config, security)
            .await
            .unwrap();
        let tags = client.list_tags("library/alpine").await.unwrap();
        assert!(tags.iter().any(|t| t == "latest"));
        let (manifest, digest) = client.get_manifest("library/alpine", "latest").await.unwrap();
        assert!(digest.starts_with("sha256:"));
        assert!(manifest.kind().is_list() || manifest.layers().is_ok());
    }
}
