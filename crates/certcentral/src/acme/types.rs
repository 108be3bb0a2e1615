//! ACME wire objects.
//!
//! Only the fields the engine consumes are modeled; unknown fields are
//! ignored on deserialization as RFC 8555 requires of clients.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::AcmeError;

/// The directory object resolved from the configured directory URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// An ACME order grouping the authorizations for one issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub authorizations: Vec<String>,
    #[serde(default)]
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
}

/// The identifier an authorization proves control over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuthorizationStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl Authorization {
    /// The challenge of the requested kind, if the server offered one.
    pub fn challenge(&self, kind: &str) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: ChallengeStatus,
}

/// RFC 7807 problem document as ACME servers emit it on 4xx/5xx.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Problem {
    /// Map a problem document (plus any Retry-After the response carried)
    /// onto the engine's error taxonomy.
    pub fn into_error(self, retry_after: Option<Duration>) -> AcmeError {
        let kind = self.kind.as_deref().unwrap_or("");
        let detail = self
            .detail
            .unwrap_or_else(|| kind.rsplit(':').next().unwrap_or("unknown").to_string());

        if kind.ends_with(":badNonce") {
            AcmeError::BadNonce
        } else if kind.ends_with(":rateLimited") {
            AcmeError::RateLimited { retry_after }
        } else if kind.ends_with(":unauthorized") || kind.ends_with(":accountDoesNotExist") {
            AcmeError::Unauthorized(detail)
        } else if kind.ends_with(":serverInternal") || self.status.is_some_and(|s| s >= 500) {
            AcmeError::ServerInternal(detail)
        } else {
            AcmeError::Malformed(detail)
        }
    }
}
