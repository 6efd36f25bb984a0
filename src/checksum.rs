//! Content checksums for items, edits and wire payloads.
//!
//! BLAKE3 over canonical JSON. Equal checksums mean equal documents across
//! replicas, whichever commit produced them. Keyed checksums double as
//! session signatures, so those are compared in constant time.

use std::fmt;

use data_encoding::HEXLOWER_PERMISSIVE;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed checksum {0:?}")]
pub struct ChecksumError(String);

impl Checksum {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER_PERMISSIVE.encode(&self.0)
    }

    /// Parse 64 hex digits, either case.
    pub fn from_hex(s: &str) -> Result<Self, ChecksumError> {
        let decoded = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| ChecksumError(s.to_owned()))?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| ChecksumError(s.to_owned()))?;
        Ok(Self(bytes))
    }

    /// Compare a claimed signature without leaking where it diverges.
    pub fn eq_ct(&self, other: &Self) -> bool {
        constant_time_eq::constant_time_eq_n(&self.0, &other.0)
    }

    /// First eight bytes as an integer, for sampling and scoring.
    pub fn prefix_u64(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(head)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({}..)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

pub fn checksum_bytes(content: &[u8]) -> Checksum {
    Checksum(*blake3::hash(content).as_bytes())
}

/// Checksum several byte strings as if concatenated.
pub fn checksum_multi<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Checksum {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Checksum(*hasher.finalize().as_bytes())
}

/// Checksum of a JSON value as it would be written out. Object keys are
/// sorted by `serde_json`'s map, so equal values always agree.
pub fn checksum_json(value: &Value) -> Checksum {
    let mut hasher = blake3::Hasher::new();
    // Writing into a hasher cannot fail.
    let _ = serde_json::to_writer(&mut hasher, value);
    Checksum(*hasher.finalize().as_bytes())
}

/// Keyed checksum (MAC) of `content`.
pub fn keyed_checksum(key: &[u8; 32], content: &[u8]) -> Checksum {
    Checksum(*blake3::keyed_hash(key, content).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hex_accepts_either_case() {
        let sum = checksum_bytes(b"doc");
        assert_eq!(Checksum::from_hex(&sum.to_hex()).unwrap(), sum);
        assert_eq!(Checksum::from_hex(&sum.to_hex().to_uppercase()).unwrap(), sum);
        assert!(Checksum::from_hex("abc").is_err());
        assert!(Checksum::from_hex(&"g".repeat(64)).is_err());
        assert!(Checksum::from_hex(&"ab".repeat(33)).is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let sum = checksum_bytes(b"doc");
        let encoded = serde_json::to_value(sum).unwrap();
        assert_eq!(encoded, json!(sum.to_hex()));
        assert_eq!(serde_json::from_value::<Checksum>(encoded).unwrap(), sum);
    }

    #[test]
    fn test_json_checksum_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":[1,2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":[1,2],"b":1}"#).unwrap();
        assert_eq!(checksum_json(&a), checksum_json(&b));
        assert_ne!(checksum_json(&a), checksum_json(&json!({"a": [2, 1], "b": 1})));
    }

    #[test]
    fn test_checksum_multi_matches_concat() {
        let whole = checksum_bytes(b"HelloWorld");
        let parts = checksum_multi([b"Hello".as_slice(), b"World".as_slice()]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_keyed_checksum_depends_on_key() {
        let a = keyed_checksum(&[0u8; 32], b"commit");
        let b = keyed_checksum(&[1u8; 32], b"commit");
        assert_ne!(a, b);
        assert!(a.eq_ct(&keyed_checksum(&[0u8; 32], b"commit")));
    }

    #[test]
    fn test_known_vector() {
        assert_eq!(
            checksum_bytes(b"").to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }
}
