//! Daemon configuration.
//!
//! Configuration is assembled from command line flags, environment
//! variables and two build-time constants that packaging injects: the
//! default key-set URI and the embedded root certificate bundle. Any
//! customization of the trust inputs through the environment clears the
//! `trusted` flag, so consumers can tell a stock build from a tweaked one.

use std::path::PathBuf;

use clap::Args;
use licd_core::certpool::CertificatePool;
use licd_core::claims::mask_subject;
use reqwest::Url;
use thiserror::Error;

/// Default path of the licenses directory.
pub const DEFAULT_LICENSES_PATH: &str = "/etc/licd/licenses";

/// Default path of the API socket.
pub const DEFAULT_LISTEN_PATH: &str = "/run/licd/api.sock";

/// Key-set URI baked in at packaging time. Comma separated; the first
/// entry is the primary endpoint. Empty in development builds.
pub const DEFAULT_KEYSET_URI: &str = "";

/// Root certificate bundle (PEM) baked in at packaging time. Empty in
/// development builds, which leaves the daemon untrusted.
pub const DEFAULT_LICENSE_ROOTS_PEM: &str = "";

/// Environment variable overriding the key-set URI list.
pub const ENV_KEYSET_URI: &str = "LICD_LICENSE_JWKS_URI";

/// Environment variable providing the global subject override.
pub const ENV_GLOBAL_SUB: &str = "LICD_LICENSE_SUB";

/// Command line arguments of `licd serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Path to the folder containing license files
    #[arg(long, default_value = DEFAULT_LICENSES_PATH)]
    pub licenses_path: PathBuf,

    /// Path to the Unix socket for API requests
    #[arg(long, default_value = DEFAULT_LISTEN_PATH)]
    pub listen_path: PathBuf,

    /// Disable TLS certificate and hostname validation
    #[arg(long)]
    pub insecure: bool,

    /// Log level (one of error, warn, info, debug or trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Do not prefix log lines with timestamps
    #[arg(long)]
    pub no_log_timestamp: bool,
}

/// Overrides for the external telemetry collaborator, handed through
/// verbatim. Setting any of them marks the build as customized.
#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    /// Submission endpoint override.
    pub url: Option<String>,
    /// Initial delay override, seconds.
    pub start_delay: Option<u64>,
    /// Delay after errors override, seconds.
    pub error_delay: Option<u64>,
    /// Submission interval override, seconds.
    pub interval: Option<u64>,
    /// Whether the collaborator may skip TLS validation.
    pub insecure: bool,
}

/// Environment overrides captured at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    /// Key-set URI list override.
    pub jwks_uri: Option<String>,
    /// Global subject override.
    pub sub: Option<String>,
    /// Telemetry collaborator overrides.
    pub collector: CollectorConfig,
}

impl EnvOverrides {
    /// Captures the overrides from the process environment.
    #[must_use]
    pub fn capture() -> Self {
        let parse_secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
        };
        Self {
            jwks_uri: std::env::var(ENV_KEYSET_URI).ok().filter(|v| !v.is_empty()),
            sub: std::env::var(ENV_GLOBAL_SUB).ok(),
            collector: CollectorConfig {
                url: std::env::var("LICD_COLLECTOR_URL").ok().filter(|v| !v.is_empty()),
                start_delay: parse_secs("LICD_COLLECTOR_START_DELAY"),
                error_delay: parse_secs("LICD_COLLECTOR_ERROR_DELAY"),
                interval: parse_secs("LICD_COLLECTOR_INTERVAL"),
                insecure: std::env::var("LICD_COLLECTOR_INSECURE").is_ok_and(|v| v == "yes"),
            },
        }
    }
}

/// Configuration failures; fatal during startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configured key-set URI did not parse.
    #[error("failed to parse key set URI {uri}")]
    InvalidUri {
        /// The offending URI.
        uri: String,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// A configured path could not be resolved.
    #[error("invalid path {path}")]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The embedded root certificate bundle did not parse.
    #[error("failed to load license root certificates")]
    BadRoots(#[source] licd_core::certpool::ChainError),
}

/// Resolved daemon configuration.
pub struct Config {
    /// Globally configured subject, already masked; empty when unset.
    pub sub: String,

    /// Absolute path of the licenses directory.
    pub licenses_path: PathBuf,

    /// Absolute path of the API socket.
    pub listen_path: PathBuf,

    /// Whether TLS validation is disabled for outgoing requests.
    pub insecure: bool,

    /// Whether the build runs with its stock trust inputs.
    pub trusted: bool,

    /// Key-set URIs, primary first.
    pub jwks_uris: Vec<Url>,

    /// Root pool for offline verification, when a bundle is embedded.
    pub cert_pool: Option<CertificatePool>,

    /// Overrides for the telemetry collaborator.
    pub collector: CollectorConfig,
}

impl Config {
    /// Builds the configuration from flags and captured environment.
    ///
    /// # Errors
    ///
    /// Fails on unparseable URIs or paths and on a broken embedded root
    /// bundle. These are fatal; the daemon must not start half configured.
    pub fn build(
        args: &ServeArgs,
        env: &EnvOverrides,
        roots_pem: &str,
    ) -> Result<Self, ConfigError> {
        let mut trusted = true;

        let uri_list = match &env.jwks_uri {
            Some(custom) => {
                trusted = false;
                custom.clone()
            }
            None => DEFAULT_KEYSET_URI.to_string(),
        };
        let mut jwks_uris = Vec::new();
        for uri in uri_list.split(',').filter(|part| !part.is_empty()) {
            let parsed = Url::parse(uri).map_err(|source| ConfigError::InvalidUri {
                uri: uri.to_string(),
                source,
            })?;
            jwks_uris.push(parsed);
        }
        if jwks_uris.is_empty() {
            trusted = false;
        }

        let cert_pool = if roots_pem.is_empty() {
            trusted = false;
            None
        } else {
            let pool =
                CertificatePool::from_pem(roots_pem.as_bytes()).map_err(ConfigError::BadRoots)?;
            if pool.is_empty() {
                trusted = false;
                None
            } else {
                Some(pool)
            }
        };

        if env.collector.url.is_some() || env.collector.insecure {
            trusted = false;
        }

        let sub = env.sub.as_deref().map(mask_subject).unwrap_or_default();

        let licenses_path =
            std::path::absolute(&args.licenses_path).map_err(|source| ConfigError::InvalidPath {
                path: args.licenses_path.clone(),
                source,
            })?;
        let listen_path =
            std::path::absolute(&args.listen_path).map_err(|source| ConfigError::InvalidPath {
                path: args.listen_path.clone(),
                source,
            })?;

        Ok(Self {
            sub,
            licenses_path,
            listen_path,
            insecure: args.insecure,
            trusted,
            jwks_uris,
            cert_pool,
            collector: env.collector.clone(),
        })
    }
}
