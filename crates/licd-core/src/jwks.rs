//! JSON Web Key set model and remote fetcher.
//!
//! The signing authority publishes its public keys as a JWK set. The
//! fetcher retrieves it from an ordered list of URIs with conditional
//! revalidation: the entity tag of the last `200 OK` response is replayed
//! as `If-None-Match`, so an unchanged document costs a `304` round trip
//! and no parsing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::seq::SliceRandom;
use reqwest::header;
use reqwest::StatusCode;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::token::LicenseKey;

/// Hard timeout for a single key-set request.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of attempts per update before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between attempts; the n-th retry waits `n` times this.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// A single JSON Web Key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, `OKP` or `EC`.
    #[serde(default)]
    pub kty: String,

    /// Key identifier.
    #[serde(default)]
    pub kid: String,

    /// Intended algorithm, informational.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alg: String,

    /// Intended use, informational.
    #[serde(default, rename = "use", skip_serializing_if = "String::is_empty")]
    pub key_use: String,

    /// Curve name for `OKP` and `EC` keys.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub crv: String,

    /// Public key or x coordinate, base64url.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub x: String,

    /// Public y coordinate for `EC` keys, base64url.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub y: String,
}

/// Key material decode failures.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key type or curve outside the supported set.
    #[error("unsupported key type {kty:?} with curve {crv:?}")]
    Unsupported {
        /// The key type.
        kty: String,
        /// The curve name.
        crv: String,
    },

    /// Coordinates were not decodable or of the wrong size.
    #[error("invalid key material: {0}")]
    InvalidMaterial(String),
}

impl Jwk {
    /// Decodes the key material into a verification key.
    ///
    /// # Errors
    ///
    /// Fails for unsupported key types and malformed coordinates.
    pub fn to_key(&self) -> Result<LicenseKey, KeyError> {
        match (self.kty.as_str(), self.crv.as_str()) {
            ("OKP", "Ed25519") => {
                let x = decode_coordinate(&self.x, 32)?;
                let bytes: [u8; 32] = x
                    .try_into()
                    .map_err(|_| KeyError::InvalidMaterial("bad Ed25519 length".into()))?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map_err(|err| KeyError::InvalidMaterial(err.to_string()))?;
                Ok(LicenseKey::Ed25519(key))
            }
            ("EC", "P-256") => {
                let point = sec1_point(&self.x, &self.y, 32)?;
                p256::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                    .map(LicenseKey::EcdsaP256)
                    .map_err(|err| KeyError::InvalidMaterial(err.to_string()))
            }
            ("EC", "P-384") => {
                let point = sec1_point(&self.x, &self.y, 48)?;
                p384::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                    .map(LicenseKey::EcdsaP384)
                    .map_err(|err| KeyError::InvalidMaterial(err.to_string()))
            }
            ("EC", "P-521") => {
                let point = sec1_point(&self.x, &self.y, 66)?;
                p521::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                    .map(LicenseKey::EcdsaP521)
                    .map_err(|err| KeyError::InvalidMaterial(err.to_string()))
            }
            _ => Err(KeyError::Unsupported {
                kty: self.kty.clone(),
                crv: self.crv.clone(),
            }),
        }
    }
}

fn decode_coordinate(value: &str, size: usize) -> Result<Vec<u8>, KeyError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|err| KeyError::InvalidMaterial(err.to_string()))?;
    if bytes.len() != size {
        return Err(KeyError::InvalidMaterial(format!(
            "coordinate has {} bytes, expected {size}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn sec1_point(x: &str, y: &str, size: usize) -> Result<Vec<u8>, KeyError> {
    let x = decode_coordinate(x, size)?;
    let y = decode_coordinate(y, size)?;
    let mut point = Vec::with_capacity(1 + 2 * size);
    point.push(0x04);
    point.extend_from_slice(&x);
    point.extend_from_slice(&y);
    Ok(point)
}

/// An ordered collection of verification keys identified by `kid`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    /// The keys of the set.
    #[serde(default)]
    pub keys: Vec<Jwk>,
}

impl KeySet {
    /// Returns the first key matching the identifier.
    #[must_use]
    pub fn key(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|key| key.kid == kid)
    }
}

/// Key-set retrieval failures.
#[derive(Debug, Error)]
pub enum JwksError {
    /// The request did not complete.
    #[error("transport failure fetching key set from {uri}")]
    Transport {
        /// The URI the request went to.
        uri: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint answered with an unexpected status.
    #[error("unexpected response status {status} when fetching key set from {uri}")]
    Status {
        /// The response status code.
        status: u16,
        /// The URI the request went to.
        uri: String,
    },

    /// The response body was not a valid key set.
    #[error("failed to parse key set from {uri}")]
    Decode {
        /// The URI the request went to.
        uri: String,
        /// The underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// The fetcher was constructed without any URI.
    #[error("no key set URI configured")]
    NoUris,
}

/// Result of a single [`KeySetFetcher::update`] run.
#[derive(Debug)]
pub struct FetchOutcome {
    /// The freshly decoded key set on a `200 OK`; `None` on `304`.
    pub new_keys: Option<KeySet>,
    /// How many attempts ended offline during this update.
    pub failed_attempts: u32,
    /// Terminal error once the retry budget is exhausted.
    pub error: Option<JwksError>,
}

impl FetchOutcome {
    /// Whether the update ended with a reachable endpoint.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Fetches the signing key set from an ordered list of URIs.
///
/// The first URI is the primary endpoint; the remaining ones are shuffled
/// once at construction to spread load over the backup endpoints.
pub struct KeySetFetcher {
    uris: Vec<Url>,
    user_agent: String,
    client: reqwest::Client,
    max_retries: u32,
    keys: Option<KeySet>,
    etag: Option<String>,
    offline: bool,
}

impl KeySetFetcher {
    /// Creates a fetcher over the given URIs.
    ///
    /// # Errors
    ///
    /// Fails when the URI list is empty.
    pub fn new(
        mut uris: Vec<Url>,
        user_agent: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self, JwksError> {
        if uris.is_empty() {
            return Err(JwksError::NoUris);
        }
        // The primary endpoint stays first; backups are randomized.
        uris[1..].shuffle(&mut rand::thread_rng());
        Ok(Self {
            uris,
            user_agent: user_agent.into(),
            client,
            max_retries: DEFAULT_MAX_RETRIES,
            keys: None,
            etag: None,
            offline: false,
        })
    }

    /// Overrides the per-update retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// The last successfully fetched key set.
    #[must_use]
    pub fn keys(&self) -> Option<&KeySet> {
        self.keys.as_ref()
    }

    /// The entity tag of the last `200 OK` response.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Whether the last attempt failed to reach the endpoint.
    #[must_use]
    pub fn offline(&self) -> bool {
        self.offline
    }

    /// Fetches the key set, retrying across the URI list with backoff.
    ///
    /// Attempt `n` targets URI `(n - 1) mod len` and, on failure, sleeps
    /// `n x 5s` before the next attempt. A `304 Not Modified` keeps the
    /// previous key set and reports success without new keys.
    pub async fn update(&mut self) -> FetchOutcome {
        let mut attempt: u32 = 1;
        let mut failed_attempts: u32 = 0;
        loop {
            let index = ((attempt - 1) as usize) % self.uris.len();
            match self.fetch_once(index).await {
                Ok(new_keys) => {
                    self.offline = false;
                    if let Some(keys) = &new_keys {
                        debug!(keys = keys.keys.len(), "key set loaded successfully");
                    }
                    return FetchOutcome {
                        new_keys,
                        failed_attempts,
                        error: None,
                    };
                }
                Err(err) => {
                    self.offline = true;
                    failed_attempts += 1;
                    if attempt >= self.max_retries {
                        warn!(error = %err, "failed to fetch key set");
                        return FetchOutcome {
                            new_keys: None,
                            failed_attempts,
                            error: Some(err),
                        };
                    }
                    info!(error = %err, "error while fetching key set, will retry");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn fetch_once(&mut self, index: usize) -> Result<Option<KeySet>, JwksError> {
        let uri = self.uris[index].clone();
        let mut request = self.client.get(uri.clone()).timeout(FETCH_TIMEOUT);
        if !self.user_agent.is_empty() {
            request = request.header(header::USER_AGENT, self.user_agent.as_str());
        }
        if let Some(etag) = &self.etag {
            request = request.header(header::IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await.map_err(|source| JwksError::Transport {
            uri: uri.to_string(),
            source,
        })?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(None),
            StatusCode::OK => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let keys: KeySet = response.json().await.map_err(|source| JwksError::Decode {
                    uri: uri.to_string(),
                    source,
                })?;
                self.etag = etag;
                self.keys = Some(keys.clone());
                Ok(Some(keys))
            }
            status => Err(JwksError::Status {
                status: status.as_u16(),
                uri: uri.to_string(),
            }),
        }
    }
}
