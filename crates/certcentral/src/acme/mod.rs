//! ACME v2 (RFC 8555) client.
//!
//! One [`AcmeClient`] per configured account. Every POST body is a
//! flattened-JSON JWS signed by the account key; the protected header
//! carries `jwk` only on `newAccount` and the account URL as `kid`
//! everywhere else. Resource fetches are POST-as-GET.
//!
//! The scheduler drives the protocol through the [`AcmeApi`] trait so
//! scenario tests can substitute an in-memory authority.

mod client;
mod nonce;
mod types;

pub use client::{AcmeApi, AcmeClient};
pub use nonce::NonceCache;
pub use types::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, Directory, Identifier,
    Order, OrderStatus, Problem,
};

use std::time::Duration;

use thiserror::Error;

use crate::crypto::CryptoError;

/// ACME protocol failure, classified per the propagation policy: `BadNonce`
/// never leaves the client, `RateLimited` carries the server's Retry-After,
/// the rest map onto the scheduler's failure handling.
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The server rejected our anti-replay nonce. Retried once internally;
    /// surfacing means the retry also failed.
    #[error("ACME server rejected the request nonce")]
    BadNonce,

    /// 429 / rateLimited problem; honor `retry_after` before the next
    /// attempt.
    #[error("rate limited by ACME server")]
    RateLimited { retry_after: Option<Duration> },

    #[error("ACME authorization failure: {0}")]
    Unauthorized(String),

    #[error("ACME request malformed: {0}")]
    Malformed(String),

    /// 5xx or an explicit serverInternal problem, after bounded in-call
    /// retries.
    #[error("ACME server internal error: {0}")]
    ServerInternal(String),

    /// A polling operation hit its wall-clock deadline.
    #[error("ACME {operation} did not reach a terminal state in time")]
    Timeout { operation: &'static str },

    #[error("ACME transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A 2xx response whose body or headers are not what RFC 8555 promises.
    #[error("unexpected ACME response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl AcmeError {
    /// Errors that condemn the current attempt but not the record.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AcmeError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
