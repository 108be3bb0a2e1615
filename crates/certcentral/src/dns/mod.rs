//! Pluggable DNS drivers for dns-01 challenges.
//!
//! A driver is the capability set `{add_txt, remove_txt, list_ns}` behind
//! the [`DnsDriver`] trait; each implementation is small and self-contained
//! and is chosen by configuration, not runtime reflection. Propagation
//! checking (asking every authoritative nameserver whether the record is
//! visible) is a separate seam in [`propagation`].

mod cloudflare;
mod exec;
pub mod propagation;

pub use cloudflare::CloudflareDriver;
pub use exec::ExecDriver;
pub use propagation::{AuthoritativeLookup, TxtLookup};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use certcentral_config::{DnsDriverKind, DnsProviderConfig};

/// DNS layer failure.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The provider API (or update command) rejected the operation.
    #[error("DNS driver error: {0}")]
    Driver(String),

    /// A resolver lookup failed outright.
    #[error("DNS lookup error: {0}")]
    Lookup(String),

    /// The record never became visible on every authoritative nameserver.
    #[error("TXT record {rrname} not propagated before the deadline")]
    PropagationTimeout { rrname: String },

    /// The driver is missing a credential it needs.
    #[error("DNS driver misconfigured: {0}")]
    Credentials(String),
}

/// One DNS provider the engine can place challenge records with.
#[async_trait]
pub trait DnsDriver: Send + Sync {
    /// Create a TXT record `rrname` with `value` in `zone`.
    ///
    /// Must be idempotent: re-adding an identical record is a no-op or a
    /// harmless duplicate.
    async fn add_txt(&self, zone: &str, rrname: &str, value: &str, ttl: u32)
        -> Result<(), DnsError>;

    /// Remove the TXT record previously added with the same arguments.
    async fn remove_txt(&self, zone: &str, rrname: &str, value: &str) -> Result<(), DnsError>;

    /// Authoritative nameserver hostnames of `zone`.
    async fn list_ns(&self, zone: &str) -> Result<Vec<String>, DnsError>;
}

/// Instantiate the driver a provider binding asks for.
pub fn build_driver(config: &DnsProviderConfig) -> Result<Arc<dyn DnsDriver>, DnsError> {
    match config.driver {
        DnsDriverKind::Cloudflare => Ok(Arc::new(CloudflareDriver::new(&config.credentials)?)),
        DnsDriverKind::Exec => Ok(Arc::new(ExecDriver::new(&config.credentials)?)),
    }
}
