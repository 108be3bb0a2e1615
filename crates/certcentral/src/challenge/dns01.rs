//! dns-01 fulfiller.
//!
//! Computes the `_acme-challenge.<name>` TXT value
//! (base64url(sha256(key-authorization))), routes the record to the
//! provider whose configured zone is the longest suffix of the name, and
//! holds `provision` until every authoritative nameserver of the zone
//! serves the value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dns::{propagation, DnsDriver, TxtLookup};

use super::{ChallengeJob, Fulfiller, FulfillError};

/// TTL for challenge TXT records.
const CHALLENGE_TTL: u32 = 60;

/// Cleanup retries before logging and giving up.
const CLEANUP_ATTEMPTS: u32 = 3;

/// How long to wait for the record to reach every authoritative
/// nameserver.
const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(300);

/// One provider with the zones it owns.
pub struct ZoneBinding {
    pub provider_id: String,
    pub zones: Vec<String>,
    pub driver: Arc<dyn DnsDriver>,
}

pub struct Dns01Fulfiller {
    bindings: Vec<ZoneBinding>,
    lookup: Arc<dyn TxtLookup>,
    propagation_timeout: Duration,
}

impl Dns01Fulfiller {
    pub fn new(bindings: Vec<ZoneBinding>, lookup: Arc<dyn TxtLookup>) -> Self {
        Self {
            bindings,
            lookup,
            propagation_timeout: DEFAULT_PROPAGATION_TIMEOUT,
        }
    }

    pub fn with_propagation_timeout(mut self, timeout: Duration) -> Self {
        self.propagation_timeout = timeout;
        self
    }

    /// Longest-suffix zone match across all provider bindings.
    fn select(&self, name: &str) -> Option<(&ZoneBinding, &str)> {
        let bare = name.trim_start_matches("*.").to_ascii_lowercase();
        let mut best: Option<(&ZoneBinding, &str)> = None;
        for binding in &self.bindings {
            for zone in &binding.zones {
                let zone_lc = zone.to_ascii_lowercase();
                let matches = bare == zone_lc || bare.ends_with(&format!(".{zone_lc}"));
                if matches && best.map_or(true, |(_, z)| zone.len() > z.len()) {
                    best = Some((binding, zone));
                }
            }
        }
        best
    }
}

/// `base64url(sha256(key-authorization))` — the TXT value the CA expects.
pub fn txt_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// `_acme-challenge.<name>` with any wildcard label stripped.
pub fn txt_rrname(identifier: &str) -> String {
    format!("_acme-challenge.{}", identifier.trim_start_matches("*."))
}

#[async_trait]
impl Fulfiller for Dns01Fulfiller {
    async fn provision(&self, job: &ChallengeJob) -> Result<(), FulfillError> {
        let (binding, zone) = self.select(&job.identifier).ok_or_else(|| {
            FulfillError::Provision(format!(
                "no DNS provider zone covers {}",
                job.identifier
            ))
        })?;
        let rrname = txt_rrname(&job.identifier);
        let value = txt_value(&job.key_authorization);

        binding
            .driver
            .add_txt(zone, &rrname, &value, CHALLENGE_TTL)
            .await
            .map_err(|e| FulfillError::Provision(e.to_string()))?;
        info!(
            identifier = %job.identifier,
            provider = %binding.provider_id,
            zone,
            "dns-01 TXT record placed"
        );

        let nameservers = binding
            .driver
            .list_ns(zone)
            .await
            .map_err(|e| FulfillError::Provision(e.to_string()))?;
        if nameservers.is_empty() {
            return Err(FulfillError::Provision(format!(
                "provider {} reports no nameservers for zone {zone}",
                binding.provider_id
            )));
        }

        let deadline = Instant::now() + self.propagation_timeout;
        propagation::wait_for_txt(self.lookup.as_ref(), &nameservers, &rrname, &value, deadline)
            .await
            .map_err(|_| FulfillError::PropagationTimeout {
                identifier: job.identifier.clone(),
            })
    }

    async fn cleanup(&self, job: &ChallengeJob) {
        let Some((binding, zone)) = self.select(&job.identifier) else {
            // Zones were reconfigured underneath the order; nothing we can do.
            warn!(identifier = %job.identifier, "no provider for dns-01 cleanup");
            return;
        };
        let rrname = txt_rrname(&job.identifier);
        let value = txt_value(&job.key_authorization);

        for attempt in 1..=CLEANUP_ATTEMPTS {
            match binding.driver.remove_txt(zone, &rrname, &value).await {
                Ok(()) => {
                    debug!(identifier = %job.identifier, "dns-01 TXT record removed");
                    return;
                }
                Err(err) => {
                    warn!(
                        identifier = %job.identifier,
                        attempt,
                        error = %err,
                        "dns-01 cleanup failed"
                    );
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}
