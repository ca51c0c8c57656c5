//! Registry authentication: `Www-Authenticate` challenges and bearer tokens.
//!
//! A registry answers the `/v2/` probe with either 200 (open) or 401 plus a
//! challenge header. Bearer challenges are resolved against the named realm;
//! tokens are cached per scope and reused until they expire or the server
//! rejects them with `error="invalid_token"`.

use std::time::{Duration, Instant};

use base64::Engine;
use ferry_core::config::RegistryCredentials;
use ferry_core::error::{FerryError, Result};
use serde::Deserialize;

/// Parsed authentication challenge from a 401 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    /// Token-based auth: fetch a token from `realm` for `service`.
    Bearer { realm: String, service: String },
    /// Plain basic auth; requires credentials.
    Basic,
}

/// Parse a `Www-Authenticate` header value.
pub fn parse_challenge(header: &str) -> Result<AuthChallenge> {
    if let Some(params) = header.strip_prefix("Bearer ") {
        let mut realm = None;
        let mut service = None;
        for part in split_params(params) {
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim_matches('"');
                match key.trim() {
                    "realm" => realm = Some(value.to_string()),
                    "service" => service = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        let realm = realm.ok_or_else(|| {
            FerryError::Protocol(format!("Bearer challenge without realm: {}", header))
        })?;
        Ok(AuthChallenge::Bearer {
            realm,
            service: service.unwrap_or_default(),
        })
    } else if header.starts_with("Basic") {
        Ok(AuthChallenge::Basic)
    } else {
        Err(FerryError::Protocol(format!(
            "Unsupported Www-Authenticate challenge: {}",
            header
        )))
    }
}

/// Whether a 401 response's challenge marks the presented token as invalid,
/// demanding a refresh rather than different credentials.
pub fn is_invalid_token(header: &str) -> bool {
    header.contains("error=\"invalid_token\"") || header.contains("error=invalid_token")
}

/// Split challenge parameters on commas, respecting quoted values.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, ch) in s.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < s.len() {
        parts.push(s[start..].trim());
    }
    parts
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub issued_at: Option<String>,
}

impl TokenResponse {
    /// The usable token string, whichever field the server filled.
    pub fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .or(self.access_token.as_deref())
            .ok_or_else(|| {
                FerryError::Protocol("Token response missing token field".to_string())
            })
    }
}

/// A cached bearer token for one scope.
#[derive(Debug, Clone)]
pub struct BearerToken {
    pub token: String,
    acquired_at: Instant,
    expires_in: Option<Duration>,
}

impl BearerToken {
    pub fn new(token: String, expires_in: Option<u64>) -> Self {
        Self {
            token,
            acquired_at: Instant::now(),
            expires_in: expires_in.map(Duration::from_secs),
        }
    }

    /// Whether the token's lifetime has elapsed. Tokens without an
    /// `expires_in` are kept until the server rejects them.
    pub fn is_expired(&self) -> bool {
        match self.expires_in {
            Some(ttl) => self.acquired_at.elapsed() >= ttl,
            None => false,
        }
    }

    /// `Authorization` header value.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// `Authorization: Basic ...` header value for a credential pair.
pub fn basic_header(credentials: &RegistryCredentials) -> String {
    let encoded = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", credentials.username, credentials.password));
    format!("Basic {}", encoded)
}

/// Pull scope for a repository.
pub fn pull_scope(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

/// Pull+push scope for a repository.
pub fn push_scope(repository: &str) -> String {
    format!("repository:{}:pull,push", repository)
}
