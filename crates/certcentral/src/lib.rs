//! Certcentral — centralized ACME certificate lifecycle engine.
//!
//! Certcentral obtains certificates from ACME-compliant authorities on
//! behalf of a fleet of TLS-terminating servers that share no filesystem,
//! and publishes the issued material to an on-disk store an external
//! distribution API reads from. This crate is the backend engine:
//!
//! - [`crypto`] - key generation, CSR construction, JWS signing,
//!   fingerprints, the self-signed placeholder
//! - [`acme`] - the RFC 8555 client and the [`acme::AcmeApi`] seam the
//!   scheduler drives
//! - [`challenge`] - http-01 and dns-01 fulfillers behind one capability
//! - [`dns`] - pluggable DNS drivers and authoritative TXT propagation
//!   checks
//! - [`store`] - the atomically published live/new/archive certificate
//!   layout
//! - [`scheduler`] - the per-certificate state machine, renewal timing,
//!   backoff and worker pool
//! - [`health`] - the health document the distribution API consumes
//! - [`signals`] - SIGHUP reload / SIGTERM shutdown bridging
//!
//! The engine exposes no ABI beyond the filesystem: certificates, their
//! metadata and the health report are all files under the store base path,
//! updated so that readers either see a consistent set or can detect the
//! mismatch and retry.

pub mod acme;
pub mod challenge;
pub mod crypto;
pub mod dns;
pub mod health;
pub mod scheduler;
pub mod signals;
pub mod store;

pub use scheduler::Scheduler;
