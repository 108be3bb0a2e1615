//! Challenge fulfillers.
//!
//! Two fulfiller kinds behind one capability: place the proof the CA will
//! look for, and best-effort cleanup afterwards. `provision` is idempotent
//! for the same challenge identity; `cleanup` never blocks or fails an
//! order, its problems are logged and retried in the background by the
//! scheduler.

mod dns01;
mod http01;

pub use dns01::{txt_rrname, txt_value, Dns01Fulfiller, ZoneBinding};
pub use http01::Http01Fulfiller;

use async_trait::async_trait;
use thiserror::Error;

/// Everything a fulfiller needs to know about one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeJob {
    /// The DNS identifier under proof (possibly `*.`-prefixed for dns-01).
    pub identifier: String,
    /// Token issued by the ACME server.
    pub token: String,
    /// `token || '.' || thumbprint(account key)`.
    pub key_authorization: String,
}

/// Challenge placement failure.
#[derive(Debug, Error)]
pub enum FulfillError {
    #[error("challenge provisioning failed: {0}")]
    Provision(String),

    #[error("TXT record for {identifier} not propagated before the deadline")]
    PropagationTimeout { identifier: String },
}

/// The capability the scheduler drives for both challenge kinds.
#[async_trait]
pub trait Fulfiller: Send + Sync {
    /// Place the proof and return only once it is observable (file visible
    /// via self-check, TXT served by every authoritative nameserver).
    async fn provision(&self, job: &ChallengeJob) -> Result<(), FulfillError>;

    /// Remove the proof. Best-effort: retries internally, logs on final
    /// failure, never errors.
    async fn cleanup(&self, job: &ChallengeJob);
}
