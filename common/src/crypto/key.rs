//! secp256k1 key material for node identities.
//!
//! A node is identified by the 64-byte tail of its uncompressed public key
//! (the 65-byte SEC1 encoding without the leading `0x04` tag). Identities are
//! never trusted when self-declared: discovery packets and handshake messages
//! carry recoverable signatures and the identity is recovered from them.

use libsecp256k1::{Message, RecoveryId, SecretKey, Signature as EcdsaSignature};
use rand::rngs::OsRng;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::CryptoError;
use super::hash::{keccak256, Hash};

/// Size of a node identity in bytes.
pub const NODE_ID_SIZE: usize = 64;

/// Size of a secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of an uncompressed SEC1 public key in bytes.
pub const UNCOMPRESSED_PUBLIC_KEY_SIZE: usize = 65;

/// Size of a recoverable signature (r || s || recovery id).
pub const SIGNATURE_SIZE: usize = 65;

/// Leading tag byte of an uncompressed SEC1 point.
const UNCOMPRESSED_TAG: u8 = 0x04;

/// Identity of a node: uncompressed public key without its format byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; NODE_ID_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                len: bytes.len(),
                expected: NODE_ID_SIZE,
            })?;
        Ok(Self(bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Keccak256 of the identity, the 256-bit point used for XOR distances.
    pub fn hash(&self) -> Hash {
        keccak256(&self.0)
    }

    /// Parse the identity back into a curve point.
    pub fn to_public_key(&self) -> Result<PublicKey, CryptoError> {
        let mut full = [0u8; UNCOMPRESSED_PUBLIC_KEY_SIZE];
        full[0] = UNCOMPRESSED_TAG;
        full[1..].copy_from_slice(&self.0);
        PublicKey::from_uncompressed(&full)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full 128 hex chars make logs unreadable
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

impl FromStr for NodeId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let hex = String::deserialize(deserializer)?;
        NodeId::from_hex(&hex).map_err(SerdeError::custom)
    }
}

/// secp256k1 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(libsecp256k1::PublicKey);

impl PublicKey {
    pub fn from_uncompressed(bytes: &[u8; UNCOMPRESSED_PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        libsecp256k1::PublicKey::parse(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; UNCOMPRESSED_PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                len: bytes.len(),
                expected: UNCOMPRESSED_PUBLIC_KEY_SIZE,
            })?;
        Self::from_uncompressed(&bytes)
    }

    /// 65-byte SEC1 encoding, starting with `0x04`.
    pub fn to_uncompressed(&self) -> [u8; UNCOMPRESSED_PUBLIC_KEY_SIZE] {
        self.0.serialize()
    }

    pub fn node_id(&self) -> NodeId {
        let full = self.to_uncompressed();
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&full[1..]);
        NodeId(id)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.node_id()).finish()
    }
}

/// secp256k1 secret key.
#[derive(Clone)]
pub struct PrivateKey(SecretKey);

impl PrivateKey {
    /// Generate a new random secret key from the OS random source.
    pub fn generate() -> Self {
        Self(SecretKey::random(&mut OsRng))
    }

    pub fn from_bytes(bytes: &[u8; SECRET_KEY_SIZE]) -> Result<Self, CryptoError> {
        SecretKey::parse(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidSecretKey)
    }

    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        let bytes: [u8; SECRET_KEY_SIZE] =
            bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidLength {
                len: bytes.len(),
                expected: SECRET_KEY_SIZE,
            })?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(libsecp256k1::PublicKey::from_secret_key(&self.0))
    }

    /// Sign a 32-byte digest, producing `r || s || recovery id`.
    pub fn sign(&self, digest: &[u8; 32]) -> RecoverableSignature {
        let message = Message::parse(digest);
        let (signature, recovery_id) = libsecp256k1::sign(&message, &self.0);

        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[..64].copy_from_slice(&signature.serialize());
        bytes[64] = recovery_id.serialize();
        RecoverableSignature(bytes)
    }

    /// Raw ECDH: x coordinate of `secret * public`.
    pub fn ecdh(&self, public_key: &PublicKey) -> Result<[u8; 32], CryptoError> {
        let mut point = public_key.0;
        point
            .tweak_mul_assign(&self.0)
            .map_err(|_| CryptoError::KeyAgreement)?;

        let full = point.serialize();
        let mut x = [0u8; 32];
        x.copy_from_slice(&full[1..33]);
        Ok(x)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Recoverable ECDSA signature: 64-byte `r || s` followed by the recovery id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature([u8; SIGNATURE_SIZE]);

impl RecoverableSignature {
    pub const fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SIGNATURE_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                len: bytes.len(),
                expected: SIGNATURE_SIZE,
            })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Recover the signer's public key for a 32-byte digest.
    pub fn recover(&self, digest: &[u8; 32]) -> Result<PublicKey, CryptoError> {
        let mut rs = [0u8; 64];
        rs.copy_from_slice(&self.0[..64]);
        let signature =
            EcdsaSignature::parse_standard(&rs).map_err(|_| CryptoError::InvalidSignature)?;
        let recovery_id =
            RecoveryId::parse(self.0[64]).map_err(|_| CryptoError::InvalidSignature)?;
        let message = Message::parse(digest);

        libsecp256k1::recover(&message, &signature, &recovery_id)
            .map(PublicKey)
            .map_err(|_| CryptoError::RecoveryFailed)
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSignature({})", hex::encode(self.0))
    }
}

/// Secret key together with its derived public key and node identity.
#[derive(Clone)]
pub struct KeyPair {
    private_key: PrivateKey,
    public_key: PublicKey,
    node_id: NodeId,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::generate())
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        let node_id = public_key.node_id();
        Self {
            private_key,
            public_key,
            node_id,
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn sign(&self, digest: &[u8; 32]) -> RecoverableSignature {
        self.private_key.sign(digest)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("node_id", &self.node_id)
            .finish()
    }
}
