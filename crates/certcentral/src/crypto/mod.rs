//! Crypto primitives for the certificate engine.
//!
//! Everything the rest of the engine needs from the crypto ecosystem lives
//! behind this module:
//!
//! - [`keys`] - per-certificate private keys (RSA 2048/3072/4096, ECDSA
//!   P-256/P-384), PEM round-trips and SPKI fingerprints
//! - [`csr`] - deterministic PKCS#10 CSRs and the self-signed placeholder
//!   certificate
//! - [`jws`] - ACME account keys and flattened JWS signing (RS256/ES256/
//!   ES384), RFC 7638 thumbprints, key authorizations
//! - [`x509`] - reading serial, validity and SANs out of issued leaves
//!
//! Account keys sign JWS payloads; per-certificate keys never do.

pub mod csr;
pub mod jws;
pub mod keys;
pub mod x509;

pub use csr::{build_csr, self_signed_placeholder};
pub use jws::AccountKey;
pub use keys::CertKey;
pub use x509::LeafInfo;

use thiserror::Error;

/// Crypto layer failure.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Caller asked for something impossible (unknown key kind, empty SAN
    /// list, malformed PEM input).
    #[error("invalid crypto parameters: {0}")]
    Params(String),

    /// The underlying crypto library failed.
    #[error("crypto backend error: {0}")]
    Internal(String),
}

impl From<rcgen::Error> for CryptoError {
    fn from(err: rcgen::Error) -> Self {
        CryptoError::Internal(err.to_string())
    }
}
