//! Developer helper that builds unsigned license claims from simple
//! key/value parameters.
//!
//! Parameters are keyed `product.claim[:type]` with type one of `string`,
//! `int`, `bool` or `float`. The special keys `uid` and `product.lid`
//! override the generated identifiers. The result is an unsigned claim
//! set, useful for drafting licenses during development; nothing about it
//! is trusted.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::claims::{Claims, Product, ProductContainer};

/// Claims generation failures.
#[derive(Debug, Error)]
pub enum GenerateError {
    /// A parameter key appeared more than once.
    #[error("multiple values for key {0}")]
    MultipleValues(String),

    /// A key does not follow the `product.claim` form.
    #[error("unsupported format in key {0}")]
    UnsupportedKey(String),

    /// A value did not parse as its annotated type.
    #[error("failed to parse {kind} value for {key}")]
    InvalidValue {
        /// The annotated type.
        kind: &'static str,
        /// The claim key.
        key: String,
    },
}

/// Builds an unsigned claim set from `product.claim[:type]` parameters.
///
/// # Errors
///
/// Fails on duplicate keys, malformed key paths and unparseable typed
/// values.
pub fn generate_claims(params: &[(String, String)]) -> Result<Claims, GenerateError> {
    let mut claims = Claims {
        uid: Uuid::new_v4().to_string(),
        k: ProductContainer::default(),
        ..Claims::default()
    };

    for (index, (key, value)) in params.iter().enumerate() {
        if params[..index].iter().any(|(seen, _)| seen == key) {
            return Err(GenerateError::MultipleValues(key.clone()));
        }

        if key == "uid" {
            claims.uid = value.clone();
            continue;
        }

        let (product_name, claim_path) = key
            .split_once('.')
            .ok_or_else(|| GenerateError::UnsupportedKey(key.clone()))?;

        let product = claims
            .k
            .products
            .entry(product_name.to_string())
            .or_insert_with(|| Product {
                lid: Uuid::new_v4().to_string(),
                claims: Default::default(),
            });

        let (claim_name, kind) = match claim_path.split_once(':') {
            Some((name, kind)) => (name, kind),
            None => (claim_path, "string"),
        };

        match claim_name {
            "lid" => {
                product.lid = value.clone();
            }
            "" => {
                // Ignore, matching the forgiving behaviour of the form
                // based input.
            }
            _ => {
                let typed = parse_typed(claim_name, kind, value)?;
                product.claims.insert(claim_name.to_string(), typed);
            }
        }
    }

    Ok(claims)
}

fn parse_typed(key: &str, kind: &str, value: &str) -> Result<Value, GenerateError> {
    match kind {
        "int" => value
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| GenerateError::InvalidValue {
                kind: "int",
                key: key.to_string(),
            }),
        "bool" => parse_bool(value)
            .map(Value::from)
            .ok_or(GenerateError::InvalidValue {
                kind: "bool",
                key: key.to_string(),
            }),
        "float" => value
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| GenerateError::InvalidValue {
                kind: "float",
                key: key.to_string(),
            }),
        // Unknown annotations fall back to plain strings.
        _ => Ok(Value::from(value)),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
