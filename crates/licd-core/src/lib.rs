//! # licd-core
//!
//! Core library for licd - a local daemon that maintains the set of
//! currently active licenses for a host.
//!
//! This crate provides the building blocks of the trust pipeline:
//!
//! - **Token model**: compact JWS parsing with a strict signature
//!   algorithm whitelist ([`token`])
//! - **Claims model**: license claim sets with temporal validation
//!   ([`claims`])
//! - **Key-set handling**: JWK set model and conditional remote fetching
//!   ([`jwks`])
//! - **Offline trust**: embedded certificate chain verification against a
//!   root pool ([`certpool`])
//! - **Scanning**: directory scanning with per-file validation ([`scanner`])
//! - **Aggregation**: deduplication and type-aware product claim merging
//!   ([`aggregate`])
//! - **Generator**: developer-only unsigned claims stub ([`gen`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod certpool;
pub mod claims;
pub mod gen;
pub mod jwks;
pub mod scanner;
pub mod token;

pub use claims::{Claims, Expected, Product, ProductContainer};
pub use jwks::{KeySet, KeySetFetcher};
pub use scanner::{LicenseScanner, ParsedLicense};
