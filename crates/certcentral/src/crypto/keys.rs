//! Per-certificate private keys.
//!
//! A [`CertKey`] is owned by exactly one certificate record and is rotated
//! on every successful issuance. Keys are held as an [`rcgen::KeyPair`] so
//! the same object signs CSRs and the self-signed placeholder; RSA keys are
//! generated with the `rsa` crate and imported via their PKCS#8 encoding.

use rsa::pkcs8::EncodePrivateKey;
use sha2::{Digest, Sha256};

use certcentral_common::KeyKind;

use super::CryptoError;

/// A freshly generated or reloaded certificate private key.
pub struct CertKey {
    kind: KeyKind,
    key_pair: rcgen::KeyPair,
}

impl CertKey {
    /// Generate a new private key of the requested kind.
    pub fn generate(kind: KeyKind) -> Result<Self, CryptoError> {
        let key_pair = match kind {
            KeyKind::EcdsaP256 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?,
            KeyKind::EcdsaP384 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?,
            KeyKind::Rsa2048 | KeyKind::Rsa3072 | KeyKind::Rsa4096 => {
                let bits = kind
                    .rsa_bits()
                    .ok_or_else(|| CryptoError::Params(format!("{kind} is not an RSA kind")))?;
                let mut rng = rand::thread_rng();
                let key = rsa::RsaPrivateKey::new(&mut rng, bits)
                    .map_err(|e| CryptoError::Internal(format!("RSA generation: {e}")))?;
                let der = key
                    .to_pkcs8_der()
                    .map_err(|e| CryptoError::Internal(format!("RSA PKCS#8 export: {e}")))?;
                rcgen::KeyPair::try_from(der.as_bytes())?
            }
        };
        Ok(Self { kind, key_pair })
    }

    /// Reload a key from its PEM encoding.
    pub fn from_pem(kind: KeyKind, pem: &str) -> Result<Self, CryptoError> {
        let key_pair = rcgen::KeyPair::from_pem(pem)
            .map_err(|e| CryptoError::Params(format!("unparseable private key PEM: {e}")))?;
        Ok(Self { kind, key_pair })
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn key_pair(&self) -> &rcgen::KeyPair {
        &self.key_pair
    }

    /// PKCS#8 PEM encoding. File permissions are the store's concern.
    pub fn to_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// Hex SHA-256 of the SubjectPublicKeyInfo.
    ///
    /// Stable from creation to destruction; published in `meta.json` and
    /// used by store readers to pair a private key with its certificate.
    pub fn fingerprint(&self) -> String {
        fingerprint_spki(&self.key_pair.public_key_der())
    }
}

impl std::fmt::Debug for CertKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("CertKey")
            .field("kind", &self.kind)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Fingerprint of the public half of a private key PEM.
pub fn fingerprint_of_key_pem(pem: &str) -> Result<String, CryptoError> {
    let key_pair = rcgen::KeyPair::from_pem(pem)
        .map_err(|e| CryptoError::Params(format!("unparseable private key PEM: {e}")))?;
    Ok(fingerprint_spki(&key_pair.public_key_der()))
}

/// Hex SHA-256 over SPKI DER bytes.
pub fn fingerprint_spki(spki_der: &[u8]) -> String {
    hex::encode(Sha256::digest(spki_der))
}
