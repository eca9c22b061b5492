//! Running keccak MAC that authenticates the frame stream.
//!
//! Each direction keeps one keccak state for the whole session. Every header
//! and body updates it, so a frame only verifies in its original position.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use sha3::{Digest, Keccak256};
use subtle::ConstantTimeEq;

/// Size of header and body MACs on the wire.
pub const MAC_SIZE: usize = 16;

pub struct FrameMac {
    hasher: Keccak256,
    cipher: Aes256,
}

impl FrameMac {
    /// Create a state keyed with the session MAC secret.
    pub fn new(mac_secret: &[u8; 32]) -> Self {
        Self {
            hasher: Keccak256::new(),
            cipher: Aes256::new(GenericArray::from_slice(mac_secret)),
        }
    }

    /// Feed raw bytes into the running state.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// First 16 bytes of the current digest. Does not reset the state.
    pub fn digest(&self) -> [u8; MAC_SIZE] {
        let full = self.hasher.clone().finalize();
        let mut out = [0u8; MAC_SIZE];
        out.copy_from_slice(&full[..MAC_SIZE]);
        out
    }

    /// `AES(mac secret, seed) XOR data`, fed back into the state.
    fn update_with_seed(&mut self, seed: &[u8; MAC_SIZE], data: &[u8; MAC_SIZE]) {
        let mut block = GenericArray::clone_from_slice(seed);
        self.cipher.encrypt_block(&mut block);
        for (b, d) in block.iter_mut().zip(data.iter()) {
            *b ^= d;
        }
        self.hasher.update(block);
    }

    /// Advance over a header ciphertext and return its MAC.
    pub fn update_header(&mut self, header_ciphertext: &[u8; MAC_SIZE]) -> [u8; MAC_SIZE] {
        let seed = self.digest();
        self.update_with_seed(&seed, header_ciphertext);
        self.digest()
    }

    /// Advance over a body ciphertext and return its MAC.
    pub fn update_body(&mut self, body_ciphertext: &[u8]) -> [u8; MAC_SIZE] {
        self.update(body_ciphertext);
        let seed = self.digest();
        self.update_with_seed(&seed, &seed);
        self.digest()
    }
}

/// Constant time comparison of a computed and a received MAC.
pub fn mac_matches(expected: &[u8; MAC_SIZE], received: &[u8]) -> bool {
    received.len() == MAC_SIZE && bool::from(expected[..].ct_eq(received))
}
