//! Key and challenge kind enums shared between configuration and engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when parsing a kind from its configuration spelling.
#[derive(Debug, Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownKind {
    what: &'static str,
    value: String,
}

/// Private key kinds a certificate can be issued for.
///
/// The configuration spelling (`rsa-2048`, `ecdsa-p256`, ...) is the
/// serialized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    #[serde(rename = "rsa-2048")]
    Rsa2048,
    #[serde(rename = "rsa-3072")]
    Rsa3072,
    #[serde(rename = "rsa-4096")]
    Rsa4096,
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
    #[serde(rename = "ecdsa-p384")]
    EcdsaP384,
}

impl KeyKind {
    /// RSA modulus size in bits, if this is an RSA kind.
    pub fn rsa_bits(self) -> Option<usize> {
        match self {
            KeyKind::Rsa2048 => Some(2048),
            KeyKind::Rsa3072 => Some(3072),
            KeyKind::Rsa4096 => Some(4096),
            KeyKind::EcdsaP256 | KeyKind::EcdsaP384 => None,
        }
    }

    pub fn is_ecdsa(self) -> bool {
        matches!(self, KeyKind::EcdsaP256 | KeyKind::EcdsaP384)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyKind::Rsa2048 => "rsa-2048",
            KeyKind::Rsa3072 => "rsa-3072",
            KeyKind::Rsa4096 => "rsa-4096",
            KeyKind::EcdsaP256 => "ecdsa-p256",
            KeyKind::EcdsaP384 => "ecdsa-p384",
        }
    }
}

impl std::str::FromStr for KeyKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rsa-2048" => Ok(KeyKind::Rsa2048),
            "rsa-3072" => Ok(KeyKind::Rsa3072),
            "rsa-4096" => Ok(KeyKind::Rsa4096),
            "ecdsa-p256" => Ok(KeyKind::EcdsaP256),
            "ecdsa-p384" => Ok(KeyKind::EcdsaP384),
            other => Err(UnknownKind {
                what: "key type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ACME challenge kinds the engine can solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeKind {
    /// The challenge type string as it appears on the ACME wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
        }
    }
}

impl std::str::FromStr for ChallengeKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(ChallengeKind::Http01),
            "dns-01" => Ok(ChallengeKind::Dns01),
            other => Err(UnknownKind {
                what: "challenge type",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
