//! License claims data model.
//!
//! A license token payload carries the registered temporal claims plus the
//! domain claims: a per-file identifier (`uid`), a display name (`dn`), a
//! support identification number (`sin`), and the product container (`k`)
//! mapping product names to their typed claim sets.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Claim key naming the product claims that are treated as exclusive.
pub const EXCLUSIVE_CLAIM: &str = "exclusive";

/// Default leeway in seconds when comparing timestamps in licenses.
pub const DEFAULT_LICENSE_LEEWAY: i64 = 24 * 60 * 60;

/// Audience of a license, either a single value or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// A single audience value.
    One(String),
    /// Multiple audience values.
    Many(Vec<String>),
}

/// License information for an individual product.
///
/// Besides the product license identifier (`lid`), a product carries an
/// open set of claims of unknown, mixed types. The claim values keep their
/// JSON typing so that the aggregation engine can dispatch on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Product license identifier.
    #[serde(default)]
    pub lid: String,

    /// All other claims of this product, by claim name.
    #[serde(flatten)]
    pub claims: BTreeMap<String, Value>,
}

/// Mapping of product names to their license information.
pub type ProductSet = BTreeMap<String, Product>;

/// Container for the product license information of a claim set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductContainer {
    /// Container format version.
    #[serde(default)]
    pub v: i64,

    /// Licensed products by name.
    #[serde(default)]
    pub products: ProductSet,
}

/// Claims carried by a license token.
///
/// Registered claims follow RFC 7519 naming; timestamps are Unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Subject, identifying the license holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,

    /// Expiry time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Not-before time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// Issued-at time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Token identifier, unique per issued license.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// License file identifier, used for whole-license deduplication.
    #[serde(default)]
    pub uid: String,

    /// Display name of the license.
    #[serde(default)]
    pub dn: String,

    /// Support identification number.
    #[serde(default)]
    pub sin: String,

    /// Product license container.
    #[serde(default)]
    pub k: ProductContainer,
}

/// Expected values for claim validation.
#[derive(Debug, Clone, Copy)]
pub struct Expected {
    /// Current time as Unix seconds.
    pub time: i64,
}

impl Expected {
    /// Expected values for validation at the current wall clock time.
    #[must_use]
    pub fn now() -> Self {
        Self {
            time: Utc::now().timestamp(),
        }
    }
}

/// Temporal validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidityError {
    /// The not-before time lies in the future.
    #[error("license is not valid yet")]
    NotYetValid,

    /// The issued-at time lies in the future.
    #[error("license was issued in the future")]
    IssuedInFuture,

    /// The expiry time has passed.
    #[error("license is expired")]
    Expired,
}

impl Claims {
    /// Validates the temporal claims against the expected time.
    ///
    /// Each of `nbf`, `iat` and `exp` is only checked when present. The
    /// leeway is applied in the direction that favours acceptance.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidityError`] describing the first violated window.
    pub fn validate_with_leeway(&self, expected: Expected, leeway: i64) -> Result<(), ValidityError> {
        let now = expected.time;
        if let Some(nbf) = self.nbf {
            if now + leeway < nbf {
                return Err(ValidityError::NotYetValid);
            }
        }
        if let Some(iat) = self.iat {
            if now + leeway < iat {
                return Err(ValidityError::IssuedInFuture);
            }
        }
        if let Some(exp) = self.exp {
            if now - leeway > exp {
                return Err(ValidityError::Expired);
            }
        }
        Ok(())
    }

    /// Returns the subject with surrounding whitespace removed.
    #[must_use]
    pub fn trimmed_subject(&self) -> &str {
        self.sub.as_deref().map_or("", str::trim)
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
        )
        .expect("static email regex")
    })
}

/// Reports whether the value has the shape of an email address.
#[must_use]
pub fn is_valid_email(value: &str) -> bool {
    email_regex().is_match(value)
}

/// Returns the lowercase hex SHA-256 digest of the subject bytes.
#[must_use]
pub fn hash_subject(sub: &str) -> String {
    hex::encode(Sha256::digest(sub.as_bytes()))
}

/// Normalizes a configured subject: trims whitespace and, when the result
/// has the shape of an email address, replaces it with its hashed form so
/// that no personal data leaves the host.
#[must_use]
pub fn mask_subject(sub: &str) -> String {
    let sub = sub.trim();
    if is_valid_email(sub) {
        hash_subject(sub)
    } else {
        sub.to_string()
    }
}
