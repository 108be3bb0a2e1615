//! Declarative configuration for the certcentral engine.
//!
//! The configuration is a single YAML document declaring ACME accounts,
//! challenge plumbing, the desired certificate set, scheduler tuning and the
//! on-disk store. Unknown keys anywhere in the document are a startup
//! failure, so typos cannot silently disable a certificate.
//!
//! # Example
//!
//! ```yaml
//! accounts:
//!   production:
//!     directory: https://acme-v02.api.letsencrypt.org/directory
//!     contact: ["mailto:tls@example.org"]
//!     key_path: /etc/certcentral/accounts/production.pem
//!
//! challenges:
//!   http01:
//!     challenges_dir: /var/lib/certcentral/http_challenges
//!   dns01:
//!     providers:
//!       primary:
//!         driver: cloudflare
//!         credentials: {api_token: "..."}
//!         zones: ["example.org"]
//!
//! certificates:
//!   www:
//!     CN: www.example.org
//!     SAN: [www.example.org, example.org]
//!     key_type: ecdsa-p256
//!     challenge: http-01
//!     account: production
//!
//! store:
//!   base_path: /var/lib/certcentral/certs
//! ```

mod validate;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use certcentral_common::{BackoffPolicy, ChallengeKind, KeyKind};

pub use validate::validate;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CERTCENTRAL_CONFIG";

/// Environment variable overriding `store.base_path`.
pub const STATE_DIR_ENV: &str = "CERTCENTRAL_STATE_DIR";

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// A structurally valid document that declares something impossible.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub accounts: BTreeMap<String, AccountConfig>,

    #[serde(default)]
    pub challenges: ChallengesConfig,

    pub certificates: BTreeMap<String, CertificateConfig>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    pub store: StoreConfig,
}

/// One ACME account: a directory URL, contact list and a private key on disk.
///
/// The key is created on first use if `key_path` does not exist; it is never
/// rotated automatically afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub directory: String,

    #[serde(default)]
    pub contact: Vec<String>,

    pub key_path: PathBuf,
}

/// Challenge plumbing shared by all certificates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChallengesConfig {
    #[serde(default)]
    pub http01: Option<Http01Config>,

    #[serde(default)]
    pub dns01: Option<Dns01Config>,
}

/// http-01: a local well-known directory that edge servers expose (or route
/// back to this host), plus optional vantage URLs for a post-write
/// self-check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Http01Config {
    pub challenges_dir: PathBuf,

    #[serde(default)]
    pub self_check_urls: Vec<String>,
}

/// dns-01: a set of provider bindings keyed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dns01Config {
    pub providers: BTreeMap<String, DnsProviderConfig>,
}

/// A DNS provider binding: which driver, its opaque credentials, and the
/// zones it is authoritative for. A SAN is routed to the provider with the
/// longest matching zone suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsProviderConfig {
    pub driver: DnsDriverKind,

    #[serde(default)]
    pub credentials: BTreeMap<String, String>,

    pub zones: Vec<String>,
}

/// DNS driver implementations the engine ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsDriverKind {
    /// Cloudflare REST v4 API.
    Cloudflare,
    /// Delegates record changes to a configured zone-update command.
    Exec,
}

/// One desired certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    /// Common name; must also appear in the SAN set.
    #[serde(rename = "CN")]
    pub cn: String,

    /// Full SAN set, order-insensitive.
    #[serde(rename = "SAN")]
    pub san: Vec<String>,

    pub key_type: KeyKind,

    pub challenge: ChallengeKind,

    /// Id of the ACME account used for this certificate's orders.
    pub account: String,

    /// Order against the account's staging directory semantics; staging and
    /// production material must live under distinct certificate names.
    #[serde(default)]
    pub staging: bool,
}

impl CertificateConfig {
    /// SAN set with the CN first and the rest sorted, deduplicated.
    ///
    /// This is the canonical identifier order handed to the CSR builder, so
    /// two loads of the same config produce byte-identical CSRs for the
    /// same key.
    pub fn canonical_sans(&self) -> Vec<String> {
        let mut rest: Vec<String> = self
            .san
            .iter()
            .filter(|s| !s.eq_ignore_ascii_case(&self.cn))
            .map(|s| s.to_ascii_lowercase())
            .collect();
        rest.sort();
        rest.dedup();
        let mut out = Vec::with_capacity(rest.len() + 1);
        out.push(self.cn.to_ascii_lowercase());
        out.extend(rest);
        out
    }
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Worker tasks draining the ready queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fraction of a certificate's lifetime after which renewal starts.
    #[serde(default = "default_renewal_ratio")]
    pub renewal_ratio: f64,

    /// Base failure backoff in seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u64,

    /// Failure backoff cap in seconds.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: u64,

    /// Maximum certificates with in-flight ACME orders at once.
    #[serde(default = "default_concurrent_orders")]
    pub concurrent_orders: usize,
}

fn default_workers() -> usize {
    2
}

fn default_renewal_ratio() -> f64 {
    2.0 / 3.0
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_cap() -> u64 {
    3600
}

fn default_concurrent_orders() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            renewal_ratio: default_renewal_ratio(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            concurrent_orders: default_concurrent_orders(),
        }
    }
}

impl SchedulerConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base),
            Duration::from_secs(self.backoff_cap),
        )
    }
}

/// On-disk certificate store location and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub base_path: PathBuf,

    /// Superseded versions retained per certificate.
    #[serde(default = "default_archive_keep")]
    pub archive_keep: usize,
}

fn default_archive_keep() -> usize {
    5
}

impl Config {
    /// Load and validate a configuration file.
    ///
    /// `CERTCENTRAL_STATE_DIR`, when set, overrides `store.base_path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading configuration");
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Ok(state_dir) = std::env::var(STATE_DIR_ENV) {
            info!(state_dir = %state_dir, "store base path overridden from environment");
            config.store.base_path = PathBuf::from(state_dir);
        }

        validate(&config)?;

        info!(
            accounts = config.accounts.len(),
            certificates = config.certificates.len(),
            "configuration loaded"
        );
        Ok(config)
    }
}
