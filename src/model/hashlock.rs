//! Hashlock commitments and the secrets that open them
//!
//! Secrets are 32 bytes; the commitment is their keccak-256 hash, which is
//! what both escrow contracts check on withdrawal.

use crate::error::{SwapError, SwapResult};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// keccak-256 digest
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

fn decode_hex32(value: &str, what: &str) -> SwapResult<[u8; 32]> {
    let stripped = value.trim().trim_start_matches("0x");
    let bytes = hex::decode(stripped)
        .map_err(|e| SwapError::Validation(format!("{} is not valid hex: {}", what, e)))?;
    if bytes.len() != 32 {
        return Err(SwapError::Validation(format!(
            "{} must be 32 bytes, got {}",
            what,
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// keccak-256 commitment to a swap secret
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashlock([u8; 32]);

impl Hashlock {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a `0x`-prefixed (or bare) 64 character hex string
    pub fn from_hex(value: &str) -> SwapResult<Self> {
        decode_hex32(value, "secret hash").map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlock({})", self.to_hex())
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hashlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hashlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hashlock::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Swap secret, zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    inner: [u8; 32],
}

impl Secret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { inner: bytes }
    }

    pub fn from_hex(value: &str) -> SwapResult<Self> {
        decode_hex32(value, "secret").map(Self::new)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.inner
    }

    pub fn hashlock(&self) -> Hashlock {
        Hashlock(keccak256(&self.inner))
    }

    /// True when this secret opens `hashlock`
    pub fn matches(&self, hashlock: &Hashlock) -> bool {
        self.hashlock() == *hashlock
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.inner))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Secret::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_of_zero_secret() {
        let secret = Secret::new([0u8; 32]);
        assert_eq!(
            secret.hashlock().to_hex(),
            "0x290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );
    }

    #[test]
    fn test_secret_matches_only_its_hashlock() {
        let secret = Secret::new([7u8; 32]);
        let other = Secret::new([8u8; 32]);
        let lock = secret.hashlock();
        assert!(secret.matches(&lock));
        assert!(!other.matches(&lock));
    }

    #[test]
    fn test_hex_parsing() {
        let lock = Hashlock::from_hex(
            "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563",
        )
        .unwrap();
        assert_eq!(lock, Secret::new([0u8; 32]).hashlock());

        assert!(matches!(
            Hashlock::from_hex("0x1234"),
            Err(SwapError::Validation(_))
        ));
        assert!(matches!(
            Secret::from_hex("0xzz"),
            Err(SwapError::Validation(_))
        ));
    }

    #[test]
    fn test_secret_debug_hides_value() {
        let secret = Secret::new([0xABu8; 32]);
        let debug_str = format!("{:?}", secret);
        assert!(!debug_str.to_lowercase().contains("ab"));
        assert!(debug_str.contains("***"));
    }

    #[test]
    fn test_secret_serde_as_hex() {
        let secret = Secret::new([1u8; 32]);
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "01".repeat(32)));
        let back: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_bytes(), secret.as_bytes());
    }
}
