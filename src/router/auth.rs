/// Delegated authentication: credential cache, external validator and the
/// per-request auth gate
use crate::api::GatewayApi;
use crate::error::{AuthError, GatewayError, GatewayResult};
use crate::router::headers;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

struct CacheEntry {
    fingerprint: String,
    validated_at: Instant,
}

/// Time-boxed cache of validated credentials, keyed by username
///
/// Entries expire lazily on lookup. Passwords are only kept as digests.
pub struct CredentialCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CredentialCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True if `username` was validated with `password` within the TTL;
    /// a hit refreshes the entry
    pub fn check(&self, username: &str, password: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(username) else {
            return false;
        };

        if entry.validated_at.elapsed() > self.ttl {
            entries.remove(username);
            return false;
        }

        if entry.fingerprint != fingerprint(password) {
            return false;
        }

        entry.validated_at = Instant::now();
        true
    }

    pub fn update(&self, username: &str, password: &str) {
        let mut entries = self.entries.lock();
        entries.insert(
            username.to_string(),
            CacheEntry {
                fingerprint: fingerprint(password),
                validated_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fingerprint(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// External credential check
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// `Ok(false)` means the validator answered and rejected the credential
    async fn validate(&self, username: &str, password: &str) -> Result<bool, AuthError>;
}

#[derive(Debug, Serialize)]
struct ValidationRequest<'a> {
    email: &'a str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidationResponse {
    #[serde(default)]
    ok: bool,
}

/// Validator reached over HTTP: POST `{email, token}`, answer `{ok}`
pub struct HttpCredentialValidator {
    url: String,
    token: String,
    token_header: String,
    client: reqwest::Client,
}

impl HttpCredentialValidator {
    pub fn new(
        url: &str,
        token: &str,
        token_header: &str,
        timeout: Duration,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Validator {
                message: format!("unable to build HTTP client: {}", e),
            })?;

        Ok(Self {
            url: url.to_string(),
            token: token.to_string(),
            token_header: token_header.to_string(),
            client,
        })
    }
}

#[async_trait]
impl CredentialValidator for HttpCredentialValidator {
    async fn validate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        let response = self
            .client
            .post(&self.url)
            .header(self.token_header.as_str(), self.token.as_str())
            .json(&ValidationRequest {
                email: username,
                token: password,
            })
            .send()
            .await
            .map_err(|e| AuthError::Validator {
                message: e.to_string(),
            })?;

        let body: ValidationResponse = response.json().await.map_err(|e| AuthError::Validator {
            message: format!("invalid validator response: {}", e),
        })?;
        Ok(body.ok)
    }
}

/// Cache in front of a validator; failures are never cached
pub struct Authenticator {
    cache: CredentialCache,
    validator: Arc<dyn CredentialValidator>,
}

impl Authenticator {
    pub fn new(validator: Arc<dyn CredentialValidator>, ttl: Duration) -> Self {
        Self {
            cache: CredentialCache::new(ttl),
            validator,
        }
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        if self.cache.check(username, password) {
            debug!(username = %username, "Credential served from cache");
            return Ok(true);
        }

        let ok = self.validator.validate(username, password).await?;
        if ok {
            self.cache.update(username, password);
        }
        Ok(ok)
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }
}

/// Credentials presented by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Came from an `Authorization: Basic` header
    pub basic_auth: bool,
}

fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Credentials from basic auth, or else from the Trino user/password headers
pub fn extract_credentials(headers: &HeaderMap) -> Result<Credentials, AuthError> {
    let principal = headers::get(headers::USER, headers);

    let credentials = match basic_auth(headers) {
        Some((username, password)) => {
            if !principal.is_empty() && principal != username {
                return Err(AuthError::UsernameMismatch {
                    basic: username,
                    principal,
                });
            }
            Credentials {
                username,
                password,
                basic_auth: true,
            }
        }
        None => Credentials {
            username: principal,
            password: headers::get(headers::PASSWORD, headers),
            basic_auth: false,
        },
    };

    if credentials.password.is_empty() {
        return Err(AuthError::PasswordRequired);
    }
    Ok(credentials)
}

/// What the gate decided for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Not subject to authentication
    PassThrough,
    /// Authenticated; `basic_auth` tells the proxy to drop `Authorization`
    Authenticated { username: String, basic_auth: bool },
}

/// Authentication gate in front of routing
///
/// Ports whose policy delegates auth always authenticate. Elsewhere only
/// the configured service accounts are authenticated and every other
/// request passes through.
pub struct AuthGate {
    api: Arc<dyn GatewayApi>,
    authenticator: Option<Authenticator>,
    service_accounts: HashSet<String>,
}

impl AuthGate {
    pub fn new(
        api: Arc<dyn GatewayApi>,
        authenticator: Option<Authenticator>,
        service_accounts: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            api,
            authenticator,
            service_accounts: service_accounts.into_iter().collect(),
        }
    }

    pub async fn check(&self, port: u16, headers: &HeaderMap) -> GatewayResult<AuthOutcome> {
        let delegated = self.api.evaluate_auth_delegation_for_client(port).await?;

        if !delegated {
            let declared = basic_auth(headers)
                .map(|(username, _)| username)
                .unwrap_or_else(|| headers::get(headers::USER, headers));
            if !self.service_accounts.contains(&declared) {
                return Ok(AuthOutcome::PassThrough);
            }
        }

        let credentials = extract_credentials(headers)?;
        let authenticator = self.authenticator.as_ref().ok_or_else(|| AuthError::Validator {
            message: "no credential validator configured".to_string(),
        })?;

        match authenticator
            .authenticate(&credentials.username, &credentials.password)
            .await
        {
            Ok(true) => Ok(AuthOutcome::Authenticated {
                username: credentials.username,
                basic_auth: credentials.basic_auth,
            }),
            Ok(false) => {
                debug!(username = %credentials.username, "User not authenticated");
                Err(GatewayError::Auth(AuthError::Rejected {
                    username: credentials.username,
                }))
            }
            Err(e) => {
                error!(username = %credentials.username, error = %e, "Unable to authenticate user");
                Err(GatewayError::Auth(e))
            }
        }
    }
}
