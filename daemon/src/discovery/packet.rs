//! Signed discovery datagrams.
//!
//! Packet format:
//! - hash (32 bytes): keccak256 of everything that follows
//! - signature (65 bytes): recoverable signature over keccak256(type || body)
//! - type (1 byte)
//! - body (RLP)
//!
//! The sender identity is recovered from the signature; packets never carry
//! a self-declared identity that is trusted.

use kestrel_common::crypto::{
    keccak256, keccak256_concat, Hash, NodeId, PrivateKey, RecoverableSignature, HASH_SIZE,
    SIGNATURE_SIZE,
};

use super::error::{DiscoveryError, DiscoveryResult};
use super::messages::Message;

/// Maximum packet size in bytes.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Size of hash, signature and type byte.
pub const HEADER_SIZE: usize = HASH_SIZE + SIGNATURE_SIZE + 1;

/// A verified inbound packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: u8,
    pub body: Vec<u8>,
    /// Leading hash of the wire form, echoed back in PONG.
    pub hash: Hash,
    /// Identity recovered from the signature.
    pub sender: NodeId,
}

impl Packet {
    /// Decode the RLP body into a typed message.
    pub fn message(&self) -> DiscoveryResult<Message> {
        Message::decode(self.packet_type, &self.body)
    }
}

/// Sign and frame a packet. Returns the wire bytes and the packet hash.
pub fn encode_packet(key: &PrivateKey, packet_type: u8, body: &[u8]) -> (Vec<u8>, Hash) {
    let type_byte = [packet_type];
    let sighash = keccak256_concat(&[&type_byte, body]);
    let signature = key.sign(sighash.as_bytes());

    let hash = keccak256_concat(&[signature.as_bytes(), &type_byte, body]);

    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.extend_from_slice(hash.as_bytes());
    data.extend_from_slice(signature.as_bytes());
    data.push(packet_type);
    data.extend_from_slice(body);
    (data, hash)
}

/// Encode a typed message into a signed packet.
pub fn encode_message(key: &PrivateKey, message: &Message) -> (Vec<u8>, Hash) {
    encode_packet(key, message.message_type(), &message.encode_body())
}

/// Verify the hash and recover the sender of a wire packet.
pub fn decode_packet(data: &[u8]) -> DiscoveryResult<Packet> {
    if data.len() < HEADER_SIZE {
        return Err(DiscoveryError::PacketTooSmall(HEADER_SIZE, data.len()));
    }
    if data.len() > MAX_PACKET_SIZE {
        return Err(DiscoveryError::PacketTooLarge(data.len(), MAX_PACKET_SIZE));
    }

    let hash = keccak256(&data[HASH_SIZE..]);
    if hash.as_bytes()[..] != data[..HASH_SIZE] {
        return Err(DiscoveryError::InvalidHash);
    }

    let signature = RecoverableSignature::from_slice(&data[HASH_SIZE..HASH_SIZE + SIGNATURE_SIZE])
        .map_err(|_| DiscoveryError::InvalidSignature)?;
    let type_and_body = &data[HASH_SIZE + SIGNATURE_SIZE..];
    let sighash = keccak256(type_and_body);
    let sender = signature
        .recover(sighash.as_bytes())
        .map_err(|_| DiscoveryError::InvalidSignature)?
        .node_id();

    Ok(Packet {
        packet_type: type_and_body[0],
        body: type_and_body[1..].to_vec(),
        hash,
        sender,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::crypto::KeyPair;
    use proptest::prelude::*;

    #[test]
    fn test_encode_decode() {
        let keypair = KeyPair::generate();
        let (data, hash) = encode_packet(keypair.private_key(), 0x03, b"\xc0");

        let packet = decode_packet(&data).unwrap();
        assert_eq!(packet.packet_type, 0x03);
        assert_eq!(packet.body, b"\xc0");
        assert_eq!(packet.hash, hash);
        assert_eq!(packet.sender, *keypair.node_id());
        assert_eq!(&data[..HASH_SIZE], hash.as_bytes());
    }

    #[test]
    fn test_too_small() {
        assert!(matches!(
            decode_packet(&[0u8; HEADER_SIZE - 1]),
            Err(DiscoveryError::PacketTooSmall(_, _))
        ));
    }

    #[test]
    fn test_too_large() {
        assert!(matches!(
            decode_packet(&vec![0u8; MAX_PACKET_SIZE + 1]),
            Err(DiscoveryError::PacketTooLarge(_, _))
        ));
    }

    #[test]
    fn test_forged_hash_rejected() {
        let keypair = KeyPair::generate();
        let (mut data, _) = encode_packet(keypair.private_key(), 0x01, b"\xc0");
        data[0] ^= 0xff;
        assert!(matches!(
            decode_packet(&data),
            Err(DiscoveryError::InvalidHash)
        ));
    }

    #[test]
    fn test_rehashed_body_changes_sender() {
        // Attacker rewrites the body and fixes up the hash: the recovered
        // identity can no longer be the original signer.
        let keypair = KeyPair::generate();
        let (mut data, _) = encode_packet(keypair.private_key(), 0x01, b"\xc2\x01\x02");
        let last = data.len() - 1;
        data[last] ^= 0x01;
        let hash = keccak256(&data[HASH_SIZE..]);
        data[..HASH_SIZE].copy_from_slice(hash.as_bytes());

        match decode_packet(&data) {
            Ok(packet) => assert_ne!(packet.sender, *keypair.node_id()),
            Err(e) => assert!(matches!(e, DiscoveryError::InvalidSignature)),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn roundtrip_recovers_signer(packet_type in 1u8..=4, body in proptest::collection::vec(any::<u8>(), 0..512)) {
            let keypair = KeyPair::generate();
            let (data, _) = encode_packet(keypair.private_key(), packet_type, &body);
            let packet = decode_packet(&data).unwrap();
            prop_assert_eq!(packet.packet_type, packet_type);
            prop_assert_eq!(packet.body, body);
            prop_assert_eq!(packet.sender, *keypair.node_id());
        }

        #[test]
        fn single_byte_flip_never_passes_as_sender(
            body in proptest::collection::vec(any::<u8>(), 1..128),
            index in any::<prop::sample::Index>(),
        ) {
            let keypair = KeyPair::generate();
            let (mut data, _) = encode_packet(keypair.private_key(), 0x01, &body);
            // Flip inside signature, type or body
            let position = HASH_SIZE + index.index(data.len() - HASH_SIZE);
            data[position] ^= 0x01;

            match decode_packet(&data) {
                Ok(packet) => prop_assert_ne!(packet.sender, *keypair.node_id()),
                Err(e) => prop_assert!(matches!(e, DiscoveryError::InvalidHash | DiscoveryError::InvalidSignature)),
            }
        }
    }
}
