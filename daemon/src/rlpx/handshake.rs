//! EIP-8 auth/ack key exchange.
//!
//! The initiator knows the recipient's static identity up front and sends
//! `auth`, the recipient learns the initiator's identity from it and answers
//! with `ack`. Both messages are `size (u16 BE) || ECIES envelope`, the size
//! prefix doubling as the envelope's shared MAC data.
//!
//! Session secrets, with `eph` the ECDH of both ephemeral keys:
//!
//! ```text
//! shared = keccak(eph || keccak(recipient nonce || initiator nonce))
//! aes    = keccak(eph || shared)
//! mac    = keccak(eph || aes)
//! egress  = keccak state seeded with (mac ^ remote nonce) || message we sent
//! ingress = keccak state seeded with (mac ^ own nonce) || message we received
//! ```

use kestrel_common::crypto::{
    keccak256_concat, KeyPair, NodeId, PrivateKey, PublicKey, RecoverableSignature,
    NODE_ID_SIZE, SIGNATURE_SIZE,
};
use kestrel_common::rlp::{self, Rlp};
use log::trace;
use rand::Rng;

use super::ecies::{self, ECIES_OVERHEAD};
use super::error::{RlpxError, RlpxResult};
use super::mac::FrameMac;

/// Length of the size prefix in front of auth and ack.
pub const SIZE_PREFIX_LENGTH: usize = 2;

/// Handshake version carried in auth and ack.
pub const HANDSHAKE_VERSION: u64 = 4;

pub const NONCE_SIZE: usize = 32;

/// Random padding appended to the plaintext, making the message size
/// unpredictable and distinguishable from the pre-EIP-8 format.
const MIN_PADDING: usize = 100;
const MAX_PADDING: usize = 250;

type Nonce = [u8; NONCE_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Recipient,
}

/// Keys and MAC states of an established session.
pub struct Secrets {
    pub remote_id: NodeId,
    pub aes_secret: [u8; 32],
    pub mac_secret: [u8; 32],
    pub egress_mac: FrameMac,
    pub ingress_mac: FrameMac,
}

/// One side of the key exchange.
pub struct Handshake {
    role: Role,
    keypair: KeyPair,
    ephemeral: PrivateKey,
    nonce: Nonce,
    remote_id: Option<NodeId>,
    remote_ephemeral: Option<PublicKey>,
    remote_nonce: Option<Nonce>,
    // Full wire form, including the size prefix
    auth: Vec<u8>,
    ack: Vec<u8>,
}

/// Declared length of a size-prefixed handshake message, prefix included.
pub fn message_length(buffer: &[u8]) -> Option<usize> {
    let prefix: [u8; SIZE_PREFIX_LENGTH] = buffer.get(..SIZE_PREFIX_LENGTH)?.try_into().ok()?;
    Some(u16::from_be_bytes(prefix) as usize + SIZE_PREFIX_LENGTH)
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Pad, encrypt and size-prefix a handshake body.
fn seal(remote: &PublicKey, mut body: Vec<u8>) -> RlpxResult<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let padding = rng.gen_range(MIN_PADDING..=MAX_PADDING);
    body.extend((0..padding).map(|_| rng.gen::<u8>()));

    let total = body.len() + ECIES_OVERHEAD;
    let size = u16::try_from(total).map_err(|_| RlpxError::FrameTooLarge(total, u16::MAX as usize))?;
    let prefix = size.to_be_bytes();

    let envelope = ecies::encrypt(remote, &body, &prefix)?;
    let mut wire = Vec::with_capacity(SIZE_PREFIX_LENGTH + envelope.len());
    wire.extend_from_slice(&prefix);
    wire.extend_from_slice(&envelope);
    Ok(wire)
}

/// Decrypt a size-prefixed handshake message.
fn open(key: &PrivateKey, wire: &[u8]) -> RlpxResult<Vec<u8>> {
    if wire.len() < SIZE_PREFIX_LENGTH {
        return Err(RlpxError::InvalidEnvelope(wire.len()));
    }
    let (prefix, envelope) = wire.split_at(SIZE_PREFIX_LENGTH);
    ecies::decrypt(key, envelope, prefix)
}

impl Handshake {
    /// Side that dials `remote_id`.
    pub fn initiator(keypair: KeyPair, remote_id: NodeId) -> Self {
        let mut handshake = Self::new(Role::Initiator, keypair);
        handshake.remote_id = Some(remote_id);
        handshake
    }

    /// Side that accepted the connection.
    pub fn recipient(keypair: KeyPair) -> Self {
        Self::new(Role::Recipient, keypair)
    }

    fn new(role: Role, keypair: KeyPair) -> Self {
        Self {
            role,
            keypair,
            ephemeral: PrivateKey::generate(),
            nonce: rand::random(),
            remote_id: None,
            remote_ephemeral: None,
            remote_nonce: None,
            auth: Vec::new(),
            ack: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> &NodeId {
        self.keypair.node_id()
    }

    /// Remote identity: known from the start for the initiator, learned from
    /// auth for the recipient.
    pub fn remote_id(&self) -> Option<&NodeId> {
        self.remote_id.as_ref()
    }

    fn remote_static(&self) -> RlpxResult<PublicKey> {
        let remote_id = self.remote_id.ok_or(RlpxError::HandshakeIncomplete)?;
        Ok(remote_id.to_public_key()?)
    }

    /// Build the auth message: `[sig, initiator id, nonce, version]`.
    pub fn write_auth(&mut self) -> RlpxResult<Vec<u8>> {
        let remote = self.remote_static()?;
        let static_shared = self.keypair.private_key().ecdh(&remote)?;
        let signature = self.ephemeral.sign(&xor(&static_shared, &self.nonce));

        let body = Rlp::list(vec![
            Rlp::bytes(signature.as_bytes()),
            Rlp::bytes(self.keypair.node_id().as_bytes()),
            Rlp::bytes(self.nonce),
            Rlp::uint(HANDSHAKE_VERSION),
        ])
        .encode();

        self.auth = seal(&remote, body)?;
        if log::log_enabled!(log::Level::Trace) {
            trace!("Auth message of {} bytes", self.auth.len());
        }
        Ok(self.auth.clone())
    }

    /// Process a complete auth message, prefix included.
    pub fn read_auth(&mut self, wire: &[u8]) -> RlpxResult<()> {
        let body = open(self.keypair.private_key(), wire)?;
        let (item, _) = rlp::decode_unstrict(&body)?;
        let fields = item.as_list_min(4)?;

        let signature = RecoverableSignature::from_bytes(fields[0].as_array::<SIGNATURE_SIZE>()?);
        let remote_id = NodeId::new(fields[1].as_array::<NODE_ID_SIZE>()?);
        let remote_nonce: Nonce = fields[2].as_array::<NONCE_SIZE>()?;

        let static_shared = self.keypair.private_key().ecdh(&remote_id.to_public_key()?)?;
        let remote_ephemeral = signature
            .recover(&xor(&static_shared, &remote_nonce))
            .map_err(|_| RlpxError::InvalidSignature)?;

        self.remote_id = Some(remote_id);
        self.remote_nonce = Some(remote_nonce);
        self.remote_ephemeral = Some(remote_ephemeral);
        self.auth = wire.to_vec();
        Ok(())
    }

    /// Build the ack message: `[ephemeral id, nonce, version]`.
    pub fn write_ack(&mut self) -> RlpxResult<Vec<u8>> {
        let remote = self.remote_static()?;
        let ephemeral_id = self.ephemeral.public_key().node_id();

        let body = Rlp::list(vec![
            Rlp::bytes(ephemeral_id.as_bytes()),
            Rlp::bytes(self.nonce),
            Rlp::uint(HANDSHAKE_VERSION),
        ])
        .encode();

        self.ack = seal(&remote, body)?;
        Ok(self.ack.clone())
    }

    /// Process a complete ack message, prefix included.
    pub fn read_ack(&mut self, wire: &[u8]) -> RlpxResult<()> {
        let body = open(self.keypair.private_key(), wire)?;
        let (item, _) = rlp::decode_unstrict(&body)?;
        let fields = item.as_list_min(3)?;

        let remote_ephemeral = NodeId::new(fields[0].as_array::<NODE_ID_SIZE>()?).to_public_key()?;
        let remote_nonce: Nonce = fields[1].as_array::<NONCE_SIZE>()?;

        self.remote_ephemeral = Some(remote_ephemeral);
        self.remote_nonce = Some(remote_nonce);
        self.ack = wire.to_vec();
        Ok(())
    }

    /// Derive the session secrets once both messages were exchanged.
    pub fn secrets(&self) -> RlpxResult<Secrets> {
        let (Some(remote_id), Some(remote_ephemeral), Some(remote_nonce)) =
            (self.remote_id, self.remote_ephemeral.as_ref(), self.remote_nonce)
        else {
            return Err(RlpxError::HandshakeIncomplete);
        };
        if self.auth.is_empty() || self.ack.is_empty() {
            return Err(RlpxError::HandshakeIncomplete);
        }

        let ephemeral_shared = self.ephemeral.ecdh(remote_ephemeral)?;
        let (initiator_nonce, recipient_nonce, sent, received) = match self.role {
            Role::Initiator => (&self.nonce, &remote_nonce, &self.auth, &self.ack),
            Role::Recipient => (&remote_nonce, &self.nonce, &self.ack, &self.auth),
        };

        let nonce_hash = keccak256_concat(&[&recipient_nonce[..], &initiator_nonce[..]]);
        let shared_secret = keccak256_concat(&[&ephemeral_shared[..], &nonce_hash.as_bytes()[..]]);
        let aes_secret = keccak256_concat(&[&ephemeral_shared[..], &shared_secret.as_bytes()[..]]).to_bytes();
        let mac_secret = keccak256_concat(&[&ephemeral_shared[..], &aes_secret[..]]).to_bytes();

        let mut egress_mac = FrameMac::new(&mac_secret);
        egress_mac.update(&xor(&mac_secret, &remote_nonce));
        egress_mac.update(sent);

        let mut ingress_mac = FrameMac::new(&mac_secret);
        ingress_mac.update(&xor(&mac_secret, &self.nonce));
        ingress_mac.update(received);

        Ok(Secrets {
            remote_id,
            aes_secret,
            mac_secret,
            egress_mac,
            ingress_mac,
        })
    }
}
