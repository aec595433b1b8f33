//! License directory scanning and validation.
//!
//! Every file in the licenses directory is a candidate token. Each one runs
//! through the same pipeline: bounded read, parse, key selection, signature
//! verification, temporal validation, subject check. Any failure downgrades
//! to a logged skip - a broken file never stops the scan. Warnings are
//! logged once per identifier; repeat sightings are suppressed through the
//! load history.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::certpool::CertificatePool;
use crate::claims::{Claims, Expected, DEFAULT_LICENSE_LEEWAY};
use crate::jwks::KeySet;
use crate::token::{LicenseKey, SignedToken, TokenError};

/// Upper bound on the size of a license file; larger files are truncated
/// at this limit before parsing.
pub const LICENSE_SIZE_LIMIT: u64 = 1024 * 1024;

/// A successfully validated license.
#[derive(Debug, Clone)]
pub struct ParsedLicense {
    /// Path of the license file.
    pub path: PathBuf,

    /// The raw token text as read from disk, trimmed.
    pub raw: String,

    /// The decoded claim set.
    pub claims: Claims,

    /// Identifier for activation tracking: the `jti` claim when present,
    /// the file path otherwise.
    pub license_id: String,
}

impl ParsedLicense {
    /// The per-file identifier used for whole-license deduplication.
    #[must_use]
    pub fn file_id(&self) -> &str {
        &self.claims.uid
    }

    /// A synthetic entry carrying only a subject, used to prefix the
    /// committed set with a globally configured subject.
    #[must_use]
    pub fn synthetic_subject(sub: &str) -> Self {
        Self {
            path: PathBuf::new(),
            raw: String::new(),
            claims: Claims {
                sub: Some(sub.to_string()),
                ..Claims::default()
            },
            license_id: String::new(),
        }
    }
}

/// Scan failures that abort the whole cycle.
///
/// Per-file problems never surface here; they degrade to logged skips.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The licenses directory could not be read.
    #[error("failed to read license directory {path}")]
    ReadDir {
        /// The directory that failed to read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl ScanError {
    /// Whether the directory simply does not exist. A missing directory
    /// counts as "no licenses installed" rather than a broken cycle.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        let Self::ReadDir { source, .. } = self;
        source.kind() == std::io::ErrorKind::NotFound
    }
}

/// Scans a directory of license files against the current trust inputs.
pub struct LicenseScanner<'a> {
    /// Key set for online verification, when one has been fetched.
    pub keys: Option<&'a KeySet>,

    /// Root pool for offline verification via embedded chains.
    pub cert_pool: Option<&'a CertificatePool>,

    /// Whether the key-set endpoint is considered unreachable.
    pub offline: bool,

    /// Identifiers already seen; used to suppress repeated warnings.
    pub load_history: &'a mut HashSet<String>,
}

impl LicenseScanner<'_> {
    /// Scans the directory and returns all licenses that verified.
    ///
    /// # Errors
    ///
    /// Fails only when the directory itself cannot be read.
    pub fn scan_folder(
        &mut self,
        dir: &Path,
        expected: Expected,
    ) -> Result<Vec<Arc<ParsedLicense>>, ScanError> {
        self.scan(dir, expected, false)
    }

    /// Scans the directory, decoding without verification when no key can
    /// be resolved for a token.
    ///
    /// Unsafe by construction: the result may contain unverified claim
    /// sets. Developer tooling only - the daemon control plane never calls
    /// this.
    ///
    /// # Errors
    ///
    /// Fails only when the directory itself cannot be read.
    pub fn unsafe_scan_folder_without_verification(
        &mut self,
        dir: &Path,
        expected: Expected,
    ) -> Result<Vec<Arc<ParsedLicense>>, ScanError> {
        self.scan(dir, expected, true)
    }

    fn scan(
        &mut self,
        dir: &Path,
        expected: Expected,
        allow_unverified: bool,
    ) -> Result<Vec<Arc<ParsedLicense>>, ScanError> {
        let entries = std::fs::read_dir(dir).map_err(|source| ScanError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|ft| !ft.is_dir()).unwrap_or(false))
            .map(|entry| entry.path())
            .collect();
        paths.sort();

        let mut accepted = Vec::new();
        for path in paths {
            if let Some(license) = self.process_file(&path, expected, allow_unverified) {
                accepted.push(license);
            }
        }
        Ok(accepted)
    }

    fn process_file(
        &mut self,
        path: &Path,
        expected: Expected,
        allow_unverified: bool,
    ) -> Option<Arc<ParsedLicense>> {
        let mut id = path.to_string_lossy().into_owned();
        let mut is_new = !self.load_history.contains(&id);

        let result = self.examine(path, expected, allow_unverified, &mut id, &mut is_new);

        if is_new {
            self.load_history.insert(id);
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    fn examine(
        &mut self,
        path: &Path,
        expected: Expected,
        allow_unverified: bool,
        id: &mut String,
        is_new: &mut bool,
    ) -> Option<Arc<ParsedLicense>> {
        let raw = match read_limited(path) {
            Ok(raw) => raw,
            Err(err) => {
                error!(name = %path.display(), error = %err, "error while reading license file");
                return None;
            }
        };
        let raw = match String::from_utf8(raw) {
            Ok(text) => text.trim().to_string(),
            Err(_) => {
                if *is_new {
                    error!(name = %path.display(), "error while parsing license file");
                }
                return None;
            }
        };

        let token = match SignedToken::parse(&raw) {
            Ok(token) => token,
            Err(TokenError::MultipleHeaders(_)) => {
                if *is_new {
                    warn!(name = %path.display(), "license with multiple headers, ignored");
                }
                return None;
            }
            Err(TokenError::UnsupportedAlgorithm(alg)) => {
                if *is_new {
                    warn!(alg = %alg, name = %path.display(), "license with unknown alg, ignored");
                }
                return None;
            }
            Err(err) => {
                if *is_new {
                    error!(name = %path.display(), error = %err, "error while parsing license file");
                }
                return None;
            }
        };
        let kid = token.header().kid.clone();

        let mut key: Option<LicenseKey> = None;
        if let Some(keys) = self.keys {
            if let Some(jwk) = keys.key(&kid) {
                match jwk.to_key() {
                    Ok(resolved) => key = Some(resolved),
                    Err(err) => {
                        if *is_new {
                            warn!(kid = %kid, name = %path.display(), error = %err, "license key is not usable, skipped");
                        }
                        return None;
                    }
                }
            }
        }

        if key.is_none() {
            if !self.offline && !allow_unverified {
                if *is_new {
                    warn!(kid = %kid, name = %path.display(), "license found but there is no matching online key, skipped");
                }
                return None;
            }
            if let Some(pool) = self.cert_pool {
                match pool.verify_chain(&token.header().x5c, expected.time) {
                    Ok(resolved) => key = Some(resolved),
                    Err(err) => {
                        if *is_new {
                            warn!(kid = %kid, name = %path.display(), error = %err, "license certificate check failed, skipped");
                        }
                        return None;
                    }
                }
            }
            if key.is_none() && !allow_unverified {
                if *is_new {
                    warn!(kid = %kid, name = %path.display(), "license found but there is no matching offline key, skipped");
                }
                return None;
            }
        }

        let claims = match &key {
            Some(key) => token.claims(key),
            None => token.unsafe_claims_without_verification(),
        };
        let claims = match claims {
            Ok(claims) => claims,
            Err(err) => {
                if *is_new {
                    error!(name = %path.display(), error = %err, "error while parsing license file claims");
                }
                return None;
            }
        };

        // The token identifier wins over the path-based fallback.
        if let Some(jti) = claims.jti.as_deref().filter(|jti| !jti.is_empty()) {
            *id = jti.to_string();
            *is_new = !self.load_history.contains(id);
        }

        if let Err(err) = claims.validate_with_leeway(expected, DEFAULT_LICENSE_LEEWAY) {
            if *is_new {
                warn!(name = %path.display(), error = %err, "license is not valid, skipped");
            }
            return None;
        }

        if claims.trimmed_subject().is_empty() {
            if *is_new {
                warn!(kid = %kid, name = %path.display(), "license found but its sub claim is empty, skipped");
            }
            return None;
        }

        if *is_new {
            debug!(name = %path.display(), "license is valid, loaded");
        }
        Some(Arc::new(ParsedLicense {
            path: path.to_path_buf(),
            raw,
            claims,
            license_id: id.clone(),
        }))
    }
}

fn read_limited(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut raw = Vec::new();
    file.take(LICENSE_SIZE_LIMIT).read_to_end(&mut raw)?;
    Ok(raw)
}
