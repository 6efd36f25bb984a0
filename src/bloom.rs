//! Bloom filter over commit ids.
//!
//! Used both as the ancestors filter embedded in every commit and as the
//! set-reconciliation digest of a sync message. Bit positions come from
//! BLAKE3 double hashing; the seed makes filters built for different sync
//! cycles independent of each other.
//!
//! Wire form: base64 of `[version u8][hashes u8][seed u32][bits u64][count u64][words..]`,
//! all little-endian.

use data_encoding::BASE64;
use std::fmt;
use thiserror::Error;

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + 4 + 8 + 8;
const MIN_BITS: u64 = 64;
const MAX_HASHES: u32 = 24;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BloomDecodeError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("filter truncated: {len} bytes")]
    Truncated { len: usize },
    #[error("unsupported filter version {0}")]
    UnsupportedVersion(u8),
    #[error("filter bit length {bits} does not match {words} words")]
    SizeMismatch { bits: u64, words: usize },
}

#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    seed: u32,
    count: u64,
}

impl BloomFilter {
    /// Filter sized for `expected_items` at false-positive rate `fpr`.
    pub fn new(expected_items: usize, fpr: f64) -> Self {
        Self::with_seed(expected_items, fpr, 0)
    }

    pub fn with_seed(expected_items: usize, fpr: f64, seed: u32) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fpr.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let bits = (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = bits.max(MIN_BITS).div_ceil(64) * 64;
        let hashes = ((num_bits as f64 / n) * ln2).round() as u32;
        Self {
            words: vec![0; (num_bits / 64) as usize],
            num_bits,
            num_hashes: hashes.clamp(1, MAX_HASHES),
            seed,
            count: 0,
        }
    }

    /// Smallest filter, used by root commits with no ancestors.
    pub fn empty() -> Self {
        Self::new(0, 0.01)
    }

    pub fn add(&mut self, value: &str) {
        let (h1, h2) = self.base_hashes(value);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.count += 1;
    }

    pub fn has(&self, value: &str) -> bool {
        let (h1, h2) = self.base_hashes(value);
        (0..self.num_hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    /// Number of `add` calls, including duplicates.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    fn base_hashes(&self, value: &str) -> (u64, u64) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(value.as_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&bytes[..8]);
        b.copy_from_slice(&bytes[8..16]);
        // An odd step never collapses the probe sequence onto one bit.
        (u64::from_le_bytes(a), u64::from_le_bytes(b) | 1)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.words.len() * 8);
        buf.push(FORMAT_VERSION);
        buf.push(self.num_hashes as u8);
        buf.extend_from_slice(&self.seed.to_le_bytes());
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        for word in &self.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomDecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(BloomDecodeError::Truncated { len: bytes.len() });
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(BloomDecodeError::UnsupportedVersion(bytes[0]));
        }
        let num_hashes = u32::from(bytes[1]).clamp(1, MAX_HASHES);
        let seed = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let num_bits = read_u64(&bytes[6..14]);
        let count = read_u64(&bytes[14..22]);
        let body = &bytes[HEADER_LEN..];
        if body.len() % 8 != 0 || num_bits == 0 || num_bits != (body.len() as u64) * 8 {
            return Err(BloomDecodeError::SizeMismatch {
                bits: num_bits,
                words: body.len() / 8,
            });
        }
        let words = body.chunks_exact(8).map(read_u64).collect();
        Ok(Self {
            words,
            num_bits,
            num_hashes,
            seed,
            count,
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Self, BloomDecodeError> {
        let bytes = BASE64
            .decode(s.as_bytes())
            .map_err(|e| BloomDecodeError::Base64(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.num_bits)
            .field("hashes", &self.num_hashes)
            .field("seed", &self.seed)
            .field("count", &self.count)
            .finish()
    }
}

impl serde::Serialize for BloomFilter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for BloomFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}
