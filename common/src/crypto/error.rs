use thiserror::Error;

/// Errors from key parsing, signing, recovery and key agreement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid hexadecimal string format
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    /// Byte input has the wrong length for the requested type
    #[error("Invalid length: {len} bytes, expected: {expected} bytes")]
    InvalidLength { len: usize, expected: usize },

    /// Secret key is zero or not below the curve order
    #[error("Invalid secret key")]
    InvalidSecretKey,

    /// Bytes are not an uncompressed point on secp256k1
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Signature or recovery id could not be parsed
    #[error("Invalid signature encoding")]
    InvalidSignature,

    /// Public key recovery from a signature failed
    #[error("Public key recovery failed")]
    RecoveryFailed,

    /// Elliptic-curve Diffie-Hellman failed (point at infinity)
    #[error("ECDH key agreement failed")]
    KeyAgreement,
}
