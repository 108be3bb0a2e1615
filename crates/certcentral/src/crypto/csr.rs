//! PKCS#10 CSR construction and the self-signed placeholder.
//!
//! SANs are lowercased, deduplicated and lexicographically sorted before
//! they reach the request, so the CertificationRequestInfo is a pure
//! function of (key, SAN set) and two builds of the same certificate spec
//! are comparable byte for byte.

use time::{Duration as TimeDuration, OffsetDateTime};

use super::{CertKey, CryptoError};

/// Validity of the self-signed placeholder, in whole days.
pub const PLACEHOLDER_VALIDITY_DAYS: i64 = 3;

/// Canonical SAN order: lowercase, sorted, deduplicated.
pub fn canonicalize_sans(sans: &[String]) -> Vec<String> {
    let mut out: Vec<String> = sans.iter().map(|s| s.to_ascii_lowercase()).collect();
    out.sort();
    out.dedup();
    out
}

/// Build a DER-encoded PKCS#10 CSR binding `key` to the SAN set.
///
/// # Errors
///
/// `CryptoError::Params` if the SAN list is empty; `CryptoError::Internal`
/// for backend faults.
pub fn build_csr(key: &CertKey, cn: &str, sans: &[String]) -> Result<Vec<u8>, CryptoError> {
    if sans.is_empty() {
        return Err(CryptoError::Params("CSR needs at least one SAN".into()));
    }

    let params = request_params(cn, sans)?;
    let csr = params.serialize_request(key.key_pair())?;
    Ok(csr.der().to_vec())
}

/// PEM form of [`build_csr`], for operators inspecting the state directory.
pub fn build_csr_pem(key: &CertKey, cn: &str, sans: &[String]) -> Result<String, CryptoError> {
    if sans.is_empty() {
        return Err(CryptoError::Params("CSR needs at least one SAN".into()));
    }
    let params = request_params(cn, sans)?;
    let csr = params.serialize_request(key.key_pair())?;
    Ok(csr.pem()?)
}

/// Issue the self-signed placeholder published before ACME first succeeds,
/// so the distribution API always has something to serve for a configured
/// name. Returns the certificate PEM.
pub fn self_signed_placeholder(
    key: &CertKey,
    cn: &str,
    sans: &[String],
) -> Result<String, CryptoError> {
    if sans.is_empty() {
        return Err(CryptoError::Params(
            "placeholder needs at least one SAN".into(),
        ));
    }

    let mut params = request_params(cn, sans)?;
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + TimeDuration::days(PLACEHOLDER_VALIDITY_DAYS);

    let cert = params.self_signed(key.key_pair())?;
    Ok(cert.pem())
}

fn request_params(cn: &str, sans: &[String]) -> Result<rcgen::CertificateParams, CryptoError> {
    let mut params = rcgen::CertificateParams::new(canonicalize_sans(sans))
        .map_err(|e| CryptoError::Params(format!("invalid SAN list: {e}")))?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, cn);
    params.distinguished_name = dn;
    Ok(params)
}
