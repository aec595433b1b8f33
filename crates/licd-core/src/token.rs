//! Signed license token parsing and verification.
//!
//! License tokens are JSON Web Signatures. The compact three-segment
//! serialization is the common case; the JSON serialization is accepted as
//! well but only when it carries exactly one signature. Only asymmetric
//! signature algorithms are accepted - anything else, including `none` and
//! all HMAC variants, is rejected before any key material is touched.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Verifier as _;
use serde::Deserialize;
use thiserror::Error;

use crate::claims::Claims;

/// Signature algorithms accepted for license tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// Ed25519 (EdDSA).
    EdDsa,
    /// ECDSA over P-256 with SHA-256.
    Es256,
    /// ECDSA over P-384 with SHA-384.
    Es384,
    /// ECDSA over P-521 with SHA-512.
    Es512,
}

impl SignatureAlgorithm {
    /// Resolves a JOSE algorithm name against the whitelist.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "EdDSA" => Some(Self::EdDsa),
            "ES256" => Some(Self::Es256),
            "ES384" => Some(Self::Es384),
            "ES512" => Some(Self::Es512),
            _ => None,
        }
    }

    /// The JOSE name of the algorithm.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EdDsa => "EdDSA",
            Self::Es256 => "ES256",
            Self::Es384 => "ES384",
            Self::Es512 => "ES512",
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Protected header of a license token.
#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    /// Signature algorithm name.
    pub alg: String,

    /// Identifier of the signing key.
    #[serde(default)]
    pub kid: String,

    /// Embedded certificate chain, leaf first, as base64 DER.
    #[serde(default)]
    pub x5c: Vec<String>,
}

/// Token parse and verification failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token is not a structurally valid JWS.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The token carries more than one signature header.
    #[error("token carries {0} signature headers, exactly one required")]
    MultipleHeaders(usize),

    /// The header names an algorithm outside the whitelist.
    #[error("unsupported signature algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The key type does not fit the token's algorithm.
    #[error("key does not match signature algorithm {0}")]
    KeyMismatch(&'static str),

    /// The signature does not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// The payload is not a valid claim set.
    #[error("invalid claims payload")]
    Claims(#[source] serde_json::Error),
}

/// A verification key resolved from the key set or a certificate chain.
#[derive(Clone)]
pub enum LicenseKey {
    /// Ed25519 public key.
    Ed25519(ed25519_dalek::VerifyingKey),
    /// NIST P-256 public key.
    EcdsaP256(p256::ecdsa::VerifyingKey),
    /// NIST P-384 public key.
    EcdsaP384(p384::ecdsa::VerifyingKey),
    /// NIST P-521 public key.
    EcdsaP521(p521::ecdsa::VerifyingKey),
}

impl std::fmt::Debug for LicenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ed25519(_) => f.write_str("LicenseKey::Ed25519(..)"),
            Self::EcdsaP256(_) => f.write_str("LicenseKey::EcdsaP256(..)"),
            Self::EcdsaP384(_) => f.write_str("LicenseKey::EcdsaP384(..)"),
            Self::EcdsaP521(_) => f.write_str("LicenseKey::EcdsaP521(..)"),
        }
    }
}

impl LicenseKey {
    /// Verifies a JWS signature (raw 64-byte Ed25519, fixed-width r‖s for
    /// the ECDSA curves) over the signing input.
    ///
    /// # Errors
    ///
    /// [`TokenError::KeyMismatch`] when the key type does not fit the
    /// algorithm, [`TokenError::BadSignature`] otherwise.
    pub fn verify_jws(
        &self,
        alg: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), TokenError> {
        match (alg, self) {
            (SignatureAlgorithm::EdDsa, Self::Ed25519(key)) => {
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| TokenError::BadSignature)?;
                key.verify_strict(message, &sig)
                    .map_err(|_| TokenError::BadSignature)
            }
            (SignatureAlgorithm::Es256, Self::EcdsaP256(key)) => {
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| TokenError::BadSignature)?;
                key.verify(message, &sig).map_err(|_| TokenError::BadSignature)
            }
            (SignatureAlgorithm::Es384, Self::EcdsaP384(key)) => {
                let sig = p384::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| TokenError::BadSignature)?;
                key.verify(message, &sig).map_err(|_| TokenError::BadSignature)
            }
            (SignatureAlgorithm::Es512, Self::EcdsaP521(key)) => {
                let sig = p521::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| TokenError::BadSignature)?;
                key.verify(message, &sig).map_err(|_| TokenError::BadSignature)
            }
            (alg, _) => Err(TokenError::KeyMismatch(alg.name())),
        }
    }
}

/// JSON serialization of a JWS, flattened or general form.
#[derive(Deserialize)]
struct JsonJws {
    #[serde(default)]
    payload: String,
    #[serde(default)]
    signatures: Vec<JsonJwsSignature>,
    #[serde(default)]
    protected: String,
    #[serde(default)]
    signature: String,
}

#[derive(Deserialize)]
struct JsonJwsSignature {
    #[serde(default)]
    protected: String,
    #[serde(default)]
    signature: String,
}

/// A parsed, not yet verified license token.
#[derive(Debug, Clone)]
pub struct SignedToken {
    header: Header,
    algorithm: SignatureAlgorithm,
    signing_input: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl SignedToken {
    /// Parses a signed token from its textual serialization.
    ///
    /// # Errors
    ///
    /// Fails on structural problems, on more than one signature header and
    /// on algorithms outside the whitelist. No signature is checked here.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.starts_with('{') {
            return Self::parse_json(raw);
        }

        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(TokenError::Malformed(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }
        Self::from_segments(segments[0], segments[1], segments[2])
    }

    fn parse_json(raw: &str) -> Result<Self, TokenError> {
        let jws: JsonJws =
            serde_json::from_str(raw).map_err(|err| TokenError::Malformed(err.to_string()))?;

        if !jws.signatures.is_empty() {
            if jws.signatures.len() != 1 {
                return Err(TokenError::MultipleHeaders(jws.signatures.len()));
            }
            let sig = &jws.signatures[0];
            return Self::from_segments(&sig.protected, &jws.payload, &sig.signature);
        }
        Self::from_segments(&jws.protected, &jws.payload, &jws.signature)
    }

    fn from_segments(protected: &str, payload: &str, signature: &str) -> Result<Self, TokenError> {
        let header_bytes = URL_SAFE_NO_PAD
            .decode(protected)
            .map_err(|_| TokenError::Malformed("header is not base64url".into()))?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|err| TokenError::Malformed(format!("invalid header: {err}")))?;

        let algorithm = SignatureAlgorithm::from_name(&header.alg)
            .ok_or_else(|| TokenError::UnsupportedAlgorithm(header.alg.clone()))?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed("payload is not base64url".into()))?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed("signature is not base64url".into()))?;

        Ok(Self {
            header,
            algorithm,
            signing_input: format!("{protected}.{payload}").into_bytes(),
            payload: payload_bytes,
            signature: signature_bytes,
        })
    }

    /// The protected header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The whitelisted algorithm named by the header.
    #[must_use]
    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Verifies the signature with the given key and decodes the claims.
    ///
    /// # Errors
    ///
    /// Fails when the signature does not verify for the key, or when the
    /// payload is not a valid claim set.
    pub fn claims(&self, key: &LicenseKey) -> Result<Claims, TokenError> {
        key.verify_jws(self.algorithm, &self.signing_input, &self.signature)?;
        serde_json::from_slice(&self.payload).map_err(TokenError::Claims)
    }

    /// Decodes the claims without verifying the signature.
    ///
    /// This exists for developer tooling only; the daemon control plane
    /// never uses it.
    ///
    /// # Errors
    ///
    /// Fails when the payload is not a valid claim set.
    pub fn unsafe_claims_without_verification(&self) -> Result<Claims, TokenError> {
        serde_json::from_slice(&self.payload).map_err(TokenError::Claims)
    }
}
