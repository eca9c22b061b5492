//! Encrypted, authenticated RLPx frames.
//!
//! ```text
//! header: AES(size (3 BE) || rlp([0, 0]) || zero padding)  16 bytes
//!         header MAC                                       16 bytes
//! body:   AES(data || zero padding to 16)
//!         body MAC                                         16 bytes
//! ```
//!
//! Both directions use AES-256-CTR keyed with the session AES secret and a
//! zero IV, each running its own keystream for the lifetime of the session.

use aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};

use super::error::{RlpxError, RlpxResult};
use super::handshake::Secrets;
use super::mac::{mac_matches, FrameMac, MAC_SIZE};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Header ciphertext length.
pub const HEADER_SIZE: usize = 16;

/// Header ciphertext plus its MAC.
pub const HEADER_FRAME_SIZE: usize = HEADER_SIZE + MAC_SIZE;

/// Largest body length a 3-byte size field can carry.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// `rlp([0, 0])`: capability id and context id, both unused.
const HEADER_DATA: [u8; 3] = [0xc2, 0x80, 0x80];

/// Round up to the AES block size.
pub fn padded_size(size: usize) -> usize {
    size.div_ceil(16) * 16
}

/// Bytes on the wire after the header for a frame of `size`.
pub fn body_wire_size(size: usize) -> usize {
    padded_size(size) + MAC_SIZE
}

/// Encrypts outgoing and decrypts incoming frames of one session.
pub struct FrameCodec {
    encryptor: Aes256Ctr,
    decryptor: Aes256Ctr,
    egress_mac: FrameMac,
    ingress_mac: FrameMac,
}

impl FrameCodec {
    pub fn new(secrets: Secrets) -> Self {
        let iv = [0u8; 16];
        let key = GenericArray::from_slice(&secrets.aes_secret);
        Self {
            encryptor: Aes256Ctr::new(key, GenericArray::from_slice(&iv)),
            decryptor: Aes256Ctr::new(key, GenericArray::from_slice(&iv)),
            egress_mac: secrets.egress_mac,
            ingress_mac: secrets.ingress_mac,
        }
    }

    /// Encrypt `data` into a complete frame.
    pub fn write_frame(&mut self, data: &[u8]) -> RlpxResult<Vec<u8>> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(RlpxError::FrameTooLarge(data.len(), MAX_FRAME_SIZE));
        }

        let mut frame = Vec::with_capacity(HEADER_FRAME_SIZE + body_wire_size(data.len()));

        let mut header = [0u8; HEADER_SIZE];
        header[..3].copy_from_slice(&(data.len() as u32).to_be_bytes()[1..]);
        header[3..6].copy_from_slice(&HEADER_DATA);
        self.encryptor.apply_keystream(&mut header);
        let header_mac = self.egress_mac.update_header(&header);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&header_mac);

        let body_start = frame.len();
        frame.extend_from_slice(data);
        frame.resize(body_start + padded_size(data.len()), 0);
        self.encryptor.apply_keystream(&mut frame[body_start..]);
        let body_mac = self.egress_mac.update_body(&frame[body_start..]);
        frame.extend_from_slice(&body_mac);

        Ok(frame)
    }

    /// Authenticate and decrypt a 32-byte header, returning the body length.
    pub fn read_header(&mut self, data: &[u8]) -> RlpxResult<usize> {
        if data.len() != HEADER_FRAME_SIZE {
            return Err(RlpxError::InvalidEnvelope(data.len()));
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&data[..HEADER_SIZE]);
        let expected = self.ingress_mac.update_header(&header);
        if !mac_matches(&expected, &data[HEADER_SIZE..]) {
            return Err(RlpxError::InvalidTag);
        }

        self.decryptor.apply_keystream(&mut header);
        let size = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        Ok(size)
    }

    /// Authenticate and decrypt a body of `body_wire_size(size)` bytes.
    pub fn read_body(&mut self, data: &[u8], size: usize) -> RlpxResult<Vec<u8>> {
        if data.len() != body_wire_size(size) {
            return Err(RlpxError::InvalidEnvelope(data.len()));
        }

        let (ciphertext, mac) = data.split_at(data.len() - MAC_SIZE);
        let expected = self.ingress_mac.update_body(ciphertext);
        if !mac_matches(&expected, mac) {
            return Err(RlpxError::InvalidTag);
        }

        let mut body = ciphertext.to_vec();
        self.decryptor.apply_keystream(&mut body);
        body.truncate(size);
        Ok(body)
    }
}
