//! Core swap types shared by both payment rails

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("expected 64 hex characters: {0}")]
pub struct ParseHexError(String);

fn parse_32(s: &str) -> Result<[u8; 32], ParseHexError> {
    let bytes = hex::decode(s).map_err(|e| ParseHexError(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ParseHexError(format!("got {} bytes", b.len())))
}

macro_rules! hex_newtype {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Build from a database column, which must hold exactly 32 bytes
            pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseHexError> {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| ParseHexError(format!("got {} bytes", bytes.len())))?;
                Ok(Self(arr))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = ParseHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_32(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Commitment hash shared by both legs of a swap
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapHash([u8; 32]);

/// Secret whose SHA-256 is the swap hash
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SwapPreimage([u8; 32]);

hex_newtype!(SwapHash);
hex_newtype!(SwapPreimage);

impl fmt::Debug for SwapHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapHash({})", self)
    }
}

// Never print the secret itself in debug output.
impl fmt::Debug for SwapPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapPreimage(for {})", self.hash())
    }
}

impl SwapPreimage {
    /// Hash this preimage commits to
    pub fn hash(&self) -> SwapHash {
        let digest = Sha256::digest(self.0);
        SwapHash(digest.into())
    }

    /// Check the preimage against a swap hash
    pub fn matches(&self, hash: &SwapHash) -> bool {
        self.hash() == *hash
    }
}

/// Integer amount in the smallest unit of an asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    asset: String,
    unit: String,
    value: u64,
}

impl Amount {
    pub fn new(asset: impl Into<String>, unit: impl Into<String>, value: u64) -> Self {
        Self {
            asset: asset.into(),
            unit: unit.into(),
            value,
        }
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.value, self.unit, self.asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preimage_hash_is_sha256() {
        let preimage = SwapPreimage::from_bytes([0u8; 32]);
        assert_eq!(
            preimage.hash().to_string(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
        assert!(preimage.matches(&preimage.hash()));
        assert!(!preimage.matches(&SwapHash::from_bytes([0u8; 32])));
    }

    #[test]
    fn test_hash_parse_rejects_wrong_length() {
        assert!("abcd".parse::<SwapHash>().is_err());
        assert!("zz".repeat(32).parse::<SwapHash>().is_err());
        let hash: SwapHash = "11".repeat(32).parse().unwrap();
        assert_eq!(hash.as_bytes(), &[0x11; 32]);
    }

    #[test]
    fn test_hash_serializes_as_hex_string() {
        let hash = SwapHash::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: SwapHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_preimage_debug_hides_secret() {
        let preimage = SwapPreimage::from_bytes([0x42; 32]);
        let debug = format!("{:?}", preimage);
        assert!(!debug.contains(&"42".repeat(32)));
    }
}
