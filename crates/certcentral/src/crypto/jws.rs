//! ACME account keys and JWS signing.
//!
//! Account keys are long-lived, process-wide state: loaded once from the
//! path named in configuration (created there on first need), never mutated
//! afterwards. They sign every ACME POST as a flattened-JSON JWS; the
//! engine accepts RSA (RS256) and ECDSA P-256/P-384 (ES256/ES384) account
//! keys.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING, ECDSA_P384_SHA384_FIXED_SIGNING,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::CryptoError;

/// An ACME account signing key.
pub enum AccountKey {
    Rsa {
        key: rsa::RsaPrivateKey,
    },
    EcdsaP256 {
        key: EcdsaKeyPair,
        pkcs8: Vec<u8>,
    },
    EcdsaP384 {
        key: EcdsaKeyPair,
        pkcs8: Vec<u8>,
    },
}

impl AccountKey {
    /// Generate a fresh ECDSA P-256 account key, the default for new
    /// accounts.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| CryptoError::Internal(format!("account key generation: {e}")))?;
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|e| CryptoError::Internal(format!("account key reload: {e}")))?;
        Ok(AccountKey::EcdsaP256 {
            key,
            pkcs8: pkcs8.as_ref().to_vec(),
        })
    }

    /// Parse an account key PEM (PKCS#8 for ECDSA; PKCS#8 or PKCS#1 for
    /// RSA).
    pub fn from_pem(pem_text: &str) -> Result<Self, CryptoError> {
        let block = pem::parse(pem_text)
            .map_err(|e| CryptoError::Params(format!("unparseable account key PEM: {e}")))?;
        let der = block.contents();
        let rng = SystemRandom::new();

        if let Ok(key) = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &rng) {
            return Ok(AccountKey::EcdsaP256 {
                key,
                pkcs8: der.to_vec(),
            });
        }
        if let Ok(key) = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, der, &rng) {
            return Ok(AccountKey::EcdsaP384 {
                key,
                pkcs8: der.to_vec(),
            });
        }
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(AccountKey::Rsa { key });
        }
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs1_der(der) {
            return Ok(AccountKey::Rsa { key });
        }

        Err(CryptoError::Params(
            "account key is not PKCS#8 ECDSA P-256/P-384 or RSA".into(),
        ))
    }

    /// Load the key at `path`, creating and persisting a new one (mode
    /// 0600) if the file does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let pem_text = std::fs::read_to_string(path)
                .map_err(|e| CryptoError::Internal(format!("read {}: {e}", path.display())))?;
            let key = Self::from_pem(&pem_text)?;
            debug!(path = %path.display(), alg = key.alg(), "loaded account key");
            return Ok(key);
        }

        let key = Self::generate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::Internal(format!("mkdir {}: {e}", parent.display())))?;
        }
        std::fs::write(path, key.to_pem()?)
            .map_err(|e| CryptoError::Internal(format!("write {}: {e}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CryptoError::Internal(format!("chmod {}: {e}", path.display())))?;
        }
        info!(path = %path.display(), "generated new account key");
        Ok(key)
    }

    pub fn to_pem(&self) -> Result<String, CryptoError> {
        match self {
            AccountKey::Rsa { key } => key
                .to_pkcs8_pem(LineEnding::LF)
                .map(|p| p.to_string())
                .map_err(|e| CryptoError::Internal(format!("RSA PKCS#8 export: {e}"))),
            AccountKey::EcdsaP256 { pkcs8, .. } | AccountKey::EcdsaP384 { pkcs8, .. } => {
                Ok(pem::encode(&pem::Pem::new("PRIVATE KEY", pkcs8.clone())))
            }
        }
    }

    /// JWS `alg` header value for this key.
    pub fn alg(&self) -> &'static str {
        match self {
            AccountKey::Rsa { .. } => "RS256",
            AccountKey::EcdsaP256 { .. } => "ES256",
            AccountKey::EcdsaP384 { .. } => "ES384",
        }
    }

    /// Public JWK for the `jwk` protected header field.
    pub fn jwk(&self) -> serde_json::Value {
        match self {
            AccountKey::Rsa { key } => {
                let public = key.to_public_key();
                serde_json::json!({
                    "kty": "RSA",
                    "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
                    "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
                })
            }
            AccountKey::EcdsaP256 { key, .. } => {
                let (x, y) = ec_coordinates(key.public_key().as_ref());
                serde_json::json!({
                    "kty": "EC",
                    "crv": "P-256",
                    "x": URL_SAFE_NO_PAD.encode(x),
                    "y": URL_SAFE_NO_PAD.encode(y),
                })
            }
            AccountKey::EcdsaP384 { key, .. } => {
                let (x, y) = ec_coordinates(key.public_key().as_ref());
                serde_json::json!({
                    "kty": "EC",
                    "crv": "P-384",
                    "x": URL_SAFE_NO_PAD.encode(x),
                    "y": URL_SAFE_NO_PAD.encode(y),
                })
            }
        }
    }

    /// RFC 7638 thumbprint: base64url(SHA-256(canonical JWK JSON)).
    ///
    /// Required members only, lexicographic order, no whitespace.
    pub fn thumbprint(&self) -> String {
        let canonical = match self {
            AccountKey::Rsa { .. } => {
                let jwk = self.jwk();
                format!(
                    r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
                    jwk["e"].as_str().unwrap_or_default(),
                    jwk["n"].as_str().unwrap_or_default(),
                )
            }
            AccountKey::EcdsaP256 { .. } | AccountKey::EcdsaP384 { .. } => {
                let jwk = self.jwk();
                format!(
                    r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
                    jwk["crv"].as_str().unwrap_or_default(),
                    jwk["x"].as_str().unwrap_or_default(),
                    jwk["y"].as_str().unwrap_or_default(),
                )
            }
        };
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// `token || '.' || base64url(thumbprint)` presented at challenge
    /// endpoints.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{token}.{}", self.thumbprint())
    }

    /// Sign raw bytes; the output format matches the JWS `alg` (PKCS#1
    /// v1.5 for RSA, fixed-width r||s for ECDSA).
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            AccountKey::Rsa { key } => {
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                let signature = signing_key
                    .try_sign(data)
                    .map_err(|e| CryptoError::Internal(format!("RS256 signing: {e}")))?;
                Ok(signature.to_vec())
            }
            AccountKey::EcdsaP256 { key, .. } | AccountKey::EcdsaP384 { key, .. } => {
                let rng = SystemRandom::new();
                let signature = key
                    .sign(&rng, data)
                    .map_err(|e| CryptoError::Internal(format!("ECDSA signing: {e}")))?;
                Ok(signature.as_ref().to_vec())
            }
        }
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("alg", &self.alg())
            .field("thumbprint", &self.thumbprint())
            .finish()
    }
}

/// Split an uncompressed EC point (0x04 || x || y) into coordinates.
fn ec_coordinates(point: &[u8]) -> (&[u8], &[u8]) {
    let coord_len = (point.len() - 1) / 2;
    (&point[1..1 + coord_len], &point[1 + coord_len..])
}

/// Build a flattened-JSON JWS for an ACME POST.
///
/// `kid` selects the authenticated form; `None` embeds the public JWK,
/// which RFC 8555 permits only on `newAccount` (and inner keyChange
/// payloads). An empty `payload` produces a POST-as-GET body.
pub fn sign_flattened(
    key: &AccountKey,
    url: &str,
    nonce: &str,
    kid: Option<&str>,
    payload: &str,
) -> Result<String, CryptoError> {
    let header = match kid {
        Some(kid) => serde_json::json!({
            "alg": key.alg(),
            "kid": kid,
            "nonce": nonce,
            "url": url,
        }),
        None => serde_json::json!({
            "alg": key.alg(),
            "jwk": key.jwk(),
            "nonce": nonce,
            "url": url,
        }),
    };
    flattened(key, &header, payload)
}

/// Inner JWS of an RFC 8555 §7.3.5 key-change: signed by the *new* key,
/// no nonce, `jwk` header carrying the new public key.
pub fn sign_key_change_inner(
    new_key: &AccountKey,
    old_key: &AccountKey,
    account_url: &str,
    url: &str,
) -> Result<String, CryptoError> {
    let header = serde_json::json!({
        "alg": new_key.alg(),
        "jwk": new_key.jwk(),
        "url": url,
    });
    let payload = serde_json::json!({
        "account": account_url,
        "oldKey": old_key.jwk(),
    });
    flattened(new_key, &header, &payload.to_string())
}

fn flattened(
    key: &AccountKey,
    header: &serde_json::Value,
    payload: &str,
) -> Result<String, CryptoError> {
    let protected = URL_SAFE_NO_PAD.encode(header.to_string().as_bytes());
    let payload_b64 = if payload.is_empty() {
        String::new()
    } else {
        URL_SAFE_NO_PAD.encode(payload.as_bytes())
    };
    let signing_input = format!("{protected}.{payload_b64}");
    let signature = key.sign(signing_input.as_bytes())?;

    Ok(serde_json::json!({
        "protected": protected,
        "payload": payload_b64,
        "signature": URL_SAFE_NO_PAD.encode(signature),
    })
    .to_string())
}
