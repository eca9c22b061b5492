use std::fmt;
use std::str::FromStr;

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use super::error::CryptoError;

/// Length of a keccak256 digest.
pub const HASH_SIZE: usize = 32;

/// A keccak256 digest. Ordering is big-endian byte order, which makes it
/// usable directly as a 256-bit XOR distance.
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Hash, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0; HASH_SIZE])
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| CryptoError::InvalidLength {
                len: bytes.len(),
                expected: HASH_SIZE,
            })
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// keccak256 of a single buffer.
#[inline]
pub fn keccak256(value: &[u8]) -> Hash {
    Hash(Keccak256::digest(value).into())
}

/// keccak256 of the concatenation of `parts`, without joining them first.
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
    let hasher = parts
        .iter()
        .fold(Keccak256::new(), |hasher, part| hasher.chain_update(part));
    Hash(hasher.finalize().into())
}

impl FromStr for Hash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(SerdeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty_input() {
        let hash = keccak256(&[]);
        assert_eq!(
            hash.to_hex(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak256_concat_matches_single_buffer() {
        let joined = keccak256(b"hello world");
        let parts = keccak256_concat(&[&b"hello"[..], &b" "[..], &b"world"[..]]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = keccak256(b"kestrel");
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(
            Hash::from_slice(&[0u8; 31]),
            Err(CryptoError::InvalidLength { len: 31, expected: 32 })
        );
        assert!("zz".parse::<Hash>().is_err());
    }

    #[test]
    fn test_ordering_is_big_endian() {
        let mut low = [0u8; HASH_SIZE];
        low[HASH_SIZE - 1] = 0xff;
        let mut high = [0u8; HASH_SIZE];
        high[0] = 0x01;
        assert!(Hash::new(low) < Hash::new(high));
    }
}
