//! Offline license verification against an embedded certificate pool.
//!
//! When the signing key set is unreachable, license tokens can carry their
//! own certificate chain (`x5c` header, leaf first). The chain is walked
//! issuer by issuer until a certificate signed by one of the configured
//! roots is reached; the verification key is then taken from the leaf.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use const_oid::db::{rfc5912, rfc8410};
use const_oid::ObjectIdentifier;
use ed25519_dalek::Verifier as _;
use thiserror::Error;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use crate::token::LicenseKey;

/// Certificate chain verification failures.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The token carries no certificate chain.
    #[error("empty certificate chain")]
    EmptyChain,

    /// A certificate could not be decoded.
    #[error("certificate decode failed: {0}")]
    Decode(String),

    /// No path from the leaf to a configured root exists.
    #[error("certificate chain does not anchor to a trusted root")]
    Untrusted,

    /// A certificate signature along the path did not verify.
    #[error("certificate signature verification failed")]
    BadSignature,

    /// A certificate along the path is outside its validity window.
    #[error("certificate is outside its validity window")]
    OutsideValidity,

    /// A key or signature algorithm outside the supported set.
    #[error("unsupported certificate algorithm {0}")]
    UnsupportedAlgorithm(String),
}

/// A pool of trusted root certificates for offline verification.
pub struct CertificatePool {
    roots: Vec<Certificate>,
}

impl CertificatePool {
    /// Loads a pool from a PEM bundle.
    ///
    /// # Errors
    ///
    /// Fails when the bundle is not parseable PEM/DER.
    pub fn from_pem(bundle: &[u8]) -> Result<Self, ChainError> {
        let roots = Certificate::load_pem_chain(bundle)
            .map_err(|err| ChainError::Decode(err.to_string()))?;
        Ok(Self { roots })
    }

    /// Creates a pool from already parsed certificates.
    #[must_use]
    pub fn from_certificates(roots: Vec<Certificate>) -> Self {
        Self { roots }
    }

    /// Number of roots in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether the pool holds no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Verifies an embedded certificate chain (leaf first, base64 DER)
    /// against the pool and returns the leaf's verification key.
    ///
    /// Every certificate on the walked path, including the anchoring root,
    /// must cover `at` (Unix seconds) with its validity window.
    ///
    /// # Errors
    ///
    /// Fails when no path to a root exists or any step on it is invalid.
    pub fn verify_chain(&self, x5c: &[String], at: i64) -> Result<LicenseKey, ChainError> {
        let chain = x5c
            .iter()
            .map(|encoded| {
                let der = BASE64_STANDARD
                    .decode(encoded.trim())
                    .map_err(|err| ChainError::Decode(err.to_string()))?;
                Certificate::from_der(&der).map_err(|err| ChainError::Decode(err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let leaf = chain.first().ok_or(ChainError::EmptyChain)?;
        check_validity(leaf, at)?;
        let leaf_key = public_key_of(leaf)?;

        let mut current = leaf;
        // The walk is bounded by the chain length; anything longer loops.
        for _ in 0..=chain.len() {
            if let Some(root) = self.find_issuer(current) {
                verify_signature(current, root)?;
                check_validity(root, at)?;
                return Ok(leaf_key);
            }

            let issuer = chain
                .iter()
                .find(|candidate| {
                    !std::ptr::eq(*candidate, current)
                        && candidate.tbs_certificate.subject == current.tbs_certificate.issuer
                })
                .ok_or(ChainError::Untrusted)?;
            verify_signature(current, issuer)?;
            check_validity(issuer, at)?;
            current = issuer;
        }
        Err(ChainError::Untrusted)
    }

    fn find_issuer(&self, cert: &Certificate) -> Option<&Certificate> {
        self.roots
            .iter()
            .find(|root| root.tbs_certificate.subject == cert.tbs_certificate.issuer)
    }
}

fn check_validity(cert: &Certificate, at: i64) -> Result<(), ChainError> {
    let validity = &cert.tbs_certificate.validity;
    let not_before = unix_seconds(validity.not_before.to_system_time());
    let not_after = unix_seconds(validity.not_after.to_system_time());
    if at < not_before || at > not_after {
        return Err(ChainError::OutsideValidity);
    }
    Ok(())
}

fn unix_seconds(time: std::time::SystemTime) -> i64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
}

/// Extracts the verification key from a certificate's public key info.
fn public_key_of(cert: &Certificate) -> Result<LicenseKey, ChainError> {
    let spki = &cert.tbs_certificate.subject_public_key_info;
    let key_bytes = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| ChainError::Decode("unaligned public key bits".into()))?;

    let algorithm = spki.algorithm.oid;
    if algorithm == rfc8410::ID_ED_25519 {
        let bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| ChainError::Decode("bad Ed25519 key length".into()))?;
        return ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map(LicenseKey::Ed25519)
            .map_err(|err| ChainError::Decode(err.to_string()));
    }
    if algorithm == rfc5912::ID_EC_PUBLIC_KEY {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|params| params.decode_as::<ObjectIdentifier>().ok())
            .ok_or_else(|| ChainError::Decode("missing EC curve parameter".into()))?;
        if curve == rfc5912::SECP_256_R_1 {
            return p256::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                .map(LicenseKey::EcdsaP256)
                .map_err(|err| ChainError::Decode(err.to_string()));
        }
        if curve == rfc5912::SECP_384_R_1 {
            return p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                .map(LicenseKey::EcdsaP384)
                .map_err(|err| ChainError::Decode(err.to_string()));
        }
        if curve == rfc5912::SECP_521_R_1 {
            return p521::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                .map(LicenseKey::EcdsaP521)
                .map_err(|err| ChainError::Decode(err.to_string()));
        }
        return Err(ChainError::UnsupportedAlgorithm(curve.to_string()));
    }
    Err(ChainError::UnsupportedAlgorithm(algorithm.to_string()))
}

/// Verifies that `cert` is signed by `issuer`.
fn verify_signature(cert: &Certificate, issuer: &Certificate) -> Result<(), ChainError> {
    let message = cert
        .tbs_certificate
        .to_der()
        .map_err(|err| ChainError::Decode(err.to_string()))?;
    let signature = cert
        .signature
        .as_bytes()
        .ok_or_else(|| ChainError::Decode("unaligned signature bits".into()))?;
    let issuer_key = public_key_of(issuer)?;

    let algorithm = cert.signature_algorithm.oid;
    match &issuer_key {
        LicenseKey::Ed25519(key) if algorithm == rfc8410::ID_ED_25519 => {
            let sig = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|_| ChainError::BadSignature)?;
            key.verify(&message, &sig).map_err(|_| ChainError::BadSignature)
        }
        LicenseKey::EcdsaP256(key) if algorithm == rfc5912::ECDSA_WITH_SHA_256 => {
            let sig = p256::ecdsa::Signature::from_der(signature)
                .map_err(|_| ChainError::BadSignature)?;
            key.verify(&message, &sig).map_err(|_| ChainError::BadSignature)
        }
        LicenseKey::EcdsaP384(key) if algorithm == rfc5912::ECDSA_WITH_SHA_384 => {
            let sig = p384::ecdsa::Signature::from_der(signature)
                .map_err(|_| ChainError::BadSignature)?;
            key.verify(&message, &sig).map_err(|_| ChainError::BadSignature)
        }
        LicenseKey::EcdsaP521(key) if algorithm == rfc5912::ECDSA_WITH_SHA_512 => {
            let sig = p521::ecdsa::Signature::from_der(signature)
                .map_err(|_| ChainError::BadSignature)?;
            key.verify(&message, &sig).map_err(|_| ChainError::BadSignature)
        }
        _ => Err(ChainError::UnsupportedAlgorithm(algorithm.to_string())),
    }
}
