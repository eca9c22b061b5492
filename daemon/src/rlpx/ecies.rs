//! ECIES envelope used for the handshake messages.
//!
//! Wire form: `ephemeral public key (65) || iv (16) || AES-128-CTR(data) || tag (32)`
//! where `tag = HMAC-SHA256(mac key, iv || ciphertext || shared data)`.

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use kestrel_common::crypto::{PrivateKey, PublicKey, UNCOMPRESSED_PUBLIC_KEY_SIZE};
use sha2::{Digest, Sha256};

use super::error::{RlpxError, RlpxResult};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

const IV_SIZE: usize = 16;
const TAG_SIZE: usize = 32;
const KEY_SIZE: usize = 32;

/// Bytes added by the envelope around the plaintext.
pub const ECIES_OVERHEAD: usize = UNCOMPRESSED_PUBLIC_KEY_SIZE + IV_SIZE + TAG_SIZE;

/// NIST SP 800-56 concatenation KDF over SHA-256.
pub fn concat_kdf(key_material: &[u8], key_length: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(key_length + 32);
    let mut counter: u32 = 1;
    while output.len() < key_length {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(key_material);
        output.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    output.truncate(key_length);
    output
}

/// Encryption key and MAC key derived from an ECDH secret.
fn derive_keys(shared_secret: &[u8; 32]) -> ([u8; 16], [u8; 32]) {
    let key = concat_kdf(shared_secret, KEY_SIZE);

    let mut encryption_key = [0u8; 16];
    encryption_key.copy_from_slice(&key[..16]);

    let mut mac_key = [0u8; 32];
    mac_key.copy_from_slice(&Sha256::digest(&key[16..KEY_SIZE]));

    (encryption_key, mac_key)
}

fn compute_tag(
    mac_key: &[u8; 32],
    iv_and_ciphertext: &[u8],
    shared_data: &[u8],
) -> RlpxResult<HmacSha256> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| RlpxError::InvalidTag)?;
    mac.update(iv_and_ciphertext);
    mac.update(shared_data);
    Ok(mac)
}

/// Encrypt `data` to `remote`, binding `shared_data` into the tag.
pub fn encrypt(remote: &PublicKey, data: &[u8], shared_data: &[u8]) -> RlpxResult<Vec<u8>> {
    let ephemeral = PrivateKey::generate();
    let shared_secret = ephemeral.ecdh(remote)?;
    let (encryption_key, mac_key) = derive_keys(&shared_secret);

    let iv: [u8; IV_SIZE] = rand::random();

    let mut output = Vec::with_capacity(ECIES_OVERHEAD + data.len());
    output.extend_from_slice(&ephemeral.public_key().to_uncompressed());
    output.extend_from_slice(&iv);

    let start = output.len();
    output.extend_from_slice(data);
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(&encryption_key),
        GenericArray::from_slice(&iv),
    );
    cipher.apply_keystream(&mut output[start..]);

    let tag = compute_tag(
        &mac_key,
        &output[UNCOMPRESSED_PUBLIC_KEY_SIZE..],
        shared_data,
    )?
    .finalize()
    .into_bytes();
    output.extend_from_slice(&tag);
    Ok(output)
}

/// Check the tag and decrypt an envelope addressed to `key`.
///
/// No plaintext is produced unless the tag matches.
pub fn decrypt(key: &PrivateKey, data: &[u8], shared_data: &[u8]) -> RlpxResult<Vec<u8>> {
    if data.len() < ECIES_OVERHEAD {
        return Err(RlpxError::InvalidEnvelope(data.len()));
    }

    let ephemeral = PublicKey::from_slice(&data[..UNCOMPRESSED_PUBLIC_KEY_SIZE])?;
    let shared_secret = key.ecdh(&ephemeral)?;
    let (encryption_key, mac_key) = derive_keys(&shared_secret);

    let tag_start = data.len() - TAG_SIZE;
    let iv_and_ciphertext = &data[UNCOMPRESSED_PUBLIC_KEY_SIZE..tag_start];
    compute_tag(&mac_key, iv_and_ciphertext, shared_data)?
        .verify_slice(&data[tag_start..])
        .map_err(|_| RlpxError::InvalidTag)?;

    let (iv, ciphertext) = iv_and_ciphertext.split_at(IV_SIZE);
    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(&encryption_key),
        GenericArray::from_slice(iv),
    );
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}
