//! RLPx connection state machine, independent of any socket.
//!
//! Bytes read from the peer go into [`Session::receive`], which returns the
//! events they produced. Bytes to write to the peer accumulate in an
//! outbound buffer drained with [`Session::take_outbound`].
//!
//! ```text
//! Auth -> Header -> Body -> Header -> Body -> ... -> Closed
//! ```

use kestrel_common::crypto::{KeyPair, NodeId};
use kestrel_common::rlp::{self, Rlp};
use log::{debug, trace};
use snap::raw::{decompress_len, Decoder, Encoder};

use super::error::{RlpxError, RlpxResult};
use super::frame::{body_wire_size, FrameCodec, HEADER_FRAME_SIZE, MAX_FRAME_SIZE};
use super::handshake::{message_length, Handshake, Role};
use super::message::{
    code, empty_payload, Capability, DisconnectReason, Hello, BASE_PROTOCOL_LENGTH,
    SNAPPY_PROTOCOL_VERSION,
};

/// Disconnect payloads up to this size are never compressed: `[reason]`.
const MAX_RAW_DISCONNECT_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for auth (recipient) or ack (initiator).
    Auth,
    /// Waiting for a 32-byte header.
    Header,
    /// Waiting for a body of `size` plaintext bytes.
    Body { size: usize },
    Closed,
}

/// Something the peer caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer's Hello was accepted.
    Established {
        remote_id: NodeId,
        hello: Hello,
        capabilities: Vec<Capability>,
    },
    /// Subprotocol message, code relative to the subprotocol.
    Message { code: u64, payload: Vec<u8> },
    /// The connection closed. `local` is true when we sent the Disconnect.
    Disconnected {
        reason: DisconnectReason,
        local: bool,
    },
}

pub struct Session {
    state: State,
    handshake: Handshake,
    codec: Option<FrameCodec>,
    local_hello: Hello,
    remote_hello: Option<Hello>,
    required_capability: Option<Capability>,
    /// Both Hello versions support snappy payloads.
    snappy: bool,
    /// Received bytes not consumed yet.
    buffer: Vec<u8>,
    /// Bytes waiting to be written to the peer.
    outbound: Vec<u8>,
    /// Application messages sent before the Hello exchange completed.
    queued: Vec<(u64, Vec<u8>, bool)>,
}

impl Session {
    /// Outbound session. The auth message is ready in the outbound buffer.
    pub fn initiator(
        keypair: KeyPair,
        remote_id: NodeId,
        local_hello: Hello,
        required_capability: Option<Capability>,
    ) -> RlpxResult<Self> {
        if remote_id == *keypair.node_id() {
            return Err(RlpxError::SelfConnection);
        }

        let mut handshake = Handshake::initiator(keypair, remote_id);
        let auth = handshake.write_auth()?;
        let mut session = Self::new(handshake, local_hello, required_capability);
        session.outbound = auth;
        Ok(session)
    }

    /// Inbound session, waiting for auth.
    pub fn recipient(
        keypair: KeyPair,
        local_hello: Hello,
        required_capability: Option<Capability>,
    ) -> Self {
        Self::new(Handshake::recipient(keypair), local_hello, required_capability)
    }

    fn new(handshake: Handshake, local_hello: Hello, required_capability: Option<Capability>) -> Self {
        Self {
            state: State::Auth,
            handshake,
            codec: None,
            local_hello,
            remote_hello: None,
            required_capability,
            snappy: false,
            buffer: Vec::new(),
            outbound: Vec::new(),
            queued: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.handshake.role()
    }

    pub fn local_id(&self) -> &NodeId {
        self.handshake.local_id()
    }

    pub fn remote_id(&self) -> Option<&NodeId> {
        self.handshake.remote_id()
    }

    pub fn remote_hello(&self) -> Option<&Hello> {
        self.remote_hello.as_ref()
    }

    /// Hello exchange completed.
    pub fn is_established(&self) -> bool {
        self.remote_hello.is_some() && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Body length announced by the last header, while waiting for it.
    pub fn pending_body(&self) -> Option<usize> {
        match self.state {
            State::Body { size } => Some(size),
            _ => None,
        }
    }

    /// Unconsumed received bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drain the bytes to write to the peer.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// Feed bytes read from the peer.
    ///
    /// Any error is fatal: the session is closed, and protocol violations
    /// leave a Disconnect in the outbound buffer.
    pub fn receive(&mut self, data: &[u8]) -> RlpxResult<Vec<SessionEvent>> {
        if self.is_closed() {
            return Err(RlpxError::Closed);
        }

        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        while !self.is_closed() && !self.buffer.is_empty() {
            match self.parse(&mut events) {
                Ok(0) => break,
                Ok(_) if self.is_closed() => break,
                Ok(consumed) => {
                    self.buffer.drain(..consumed);
                }
                Err(e) => {
                    if e.is_protocol_breach() && self.codec.is_some() {
                        // Best effort, the connection is closing anyway
                        let _ = self.write_disconnect(DisconnectReason::BreachOfProtocol);
                    }
                    self.close();
                    return Err(e);
                }
            }
        }

        Ok(events)
    }

    /// Send a subprotocol message, `code` relative to the subprotocol.
    ///
    /// The payload is snappy-compressed only when `compress` is set and the
    /// peer's Hello version supports it. Messages sent before the Hello
    /// exchange completed are held back.
    pub fn send(&mut self, code: u64, payload: Vec<u8>, compress: bool) -> RlpxResult<()> {
        if self.is_closed() {
            return Err(RlpxError::Closed);
        }

        if self.remote_hello.is_none() {
            self.queued.push((code, payload, compress));
            return Ok(());
        }

        let code = code
            .checked_add(BASE_PROTOCOL_LENGTH)
            .ok_or(RlpxError::UnknownOpcode(code))?;
        self.write_message(code, &payload, compress && self.snappy)
    }

    /// Send Disconnect and close.
    pub fn disconnect(&mut self, reason: DisconnectReason) -> RlpxResult<()> {
        if self.is_closed() {
            return Err(RlpxError::Closed);
        }

        let result = if self.codec.is_some() {
            self.write_disconnect(reason)
        } else {
            Ok(())
        };
        self.close();
        result
    }

    fn close(&mut self) {
        self.state = State::Closed;
        self.buffer.clear();
        self.queued.clear();
    }

    /// Try to make progress, returning the bytes consumed (0 for "need more").
    fn parse(&mut self, events: &mut Vec<SessionEvent>) -> RlpxResult<usize> {
        match self.state {
            State::Auth => self.parse_handshake(),
            State::Header => {
                if self.buffer.len() < HEADER_FRAME_SIZE {
                    return Ok(0);
                }
                let codec = self.codec.as_mut().ok_or(RlpxError::HandshakeIncomplete)?;
                let size = codec.read_header(&self.buffer[..HEADER_FRAME_SIZE])?;
                self.state = State::Body { size };
                Ok(HEADER_FRAME_SIZE)
            }
            State::Body { size } => {
                let wire_size = body_wire_size(size);
                if self.buffer.len() < wire_size {
                    return Ok(0);
                }
                let codec = self.codec.as_mut().ok_or(RlpxError::HandshakeIncomplete)?;
                let body = codec.read_body(&self.buffer[..wire_size], size)?;
                self.state = State::Header;
                self.handle_body(&body, events)?;
                Ok(wire_size)
            }
            State::Closed => Ok(0),
        }
    }

    fn parse_handshake(&mut self) -> RlpxResult<usize> {
        let Some(length) = message_length(&self.buffer) else {
            return Ok(0);
        };
        if self.buffer.len() < length {
            return Ok(0);
        }

        let message = &self.buffer[..length];
        match self.handshake.role() {
            Role::Initiator => self.handshake.read_ack(message)?,
            Role::Recipient => {
                self.handshake.read_auth(message)?;
                let ack = self.handshake.write_ack()?;
                self.outbound.extend_from_slice(&ack);
            }
        }

        self.codec = Some(FrameCodec::new(self.handshake.secrets()?));
        self.state = State::Header;

        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "RLPx handshake complete with {:?}",
                self.handshake.remote_id()
            );
        }

        // Hello goes out right away, whatever the peer says
        let hello = self.local_hello.encode();
        self.write_message(code::HELLO, &hello, false)?;
        Ok(length)
    }

    fn handle_body(&mut self, body: &[u8], events: &mut Vec<SessionEvent>) -> RlpxResult<()> {
        let (code_item, consumed) = rlp::decode_unstrict(body)?;
        let code = code_item.as_u64()?;
        let raw = &body[consumed..];

        let uncompressed = code == code::HELLO
            || (code == code::DISCONNECT && raw.len() <= MAX_RAW_DISCONNECT_SIZE);
        let payload = if self.snappy && !uncompressed {
            decompress(raw)?
        } else {
            raw.to_vec()
        };

        if log::log_enabled!(log::Level::Trace) {
            trace!("Received message {:#x} ({} bytes)", code, payload.len());
        }

        match code {
            code::HELLO => self.handle_hello(&payload, events),
            code::DISCONNECT => {
                let reason = DisconnectReason::decode(&payload)?;
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Peer {:?} disconnected: {}", self.remote_id(), reason);
                }
                self.close();
                events.push(SessionEvent::Disconnected {
                    reason,
                    local: false,
                });
                Ok(())
            }
            code::PING => self.write_message(code::PONG, &empty_payload(), self.snappy),
            code::PONG => Ok(()),
            code if code < BASE_PROTOCOL_LENGTH => Err(RlpxError::UnknownOpcode(code)),
            code => {
                if self.remote_hello.is_none() {
                    return Err(RlpxError::UnexpectedMessage(code));
                }
                events.push(SessionEvent::Message {
                    code: code - BASE_PROTOCOL_LENGTH,
                    payload,
                });
                Ok(())
            }
        }
    }

    fn handle_hello(&mut self, payload: &[u8], events: &mut Vec<SessionEvent>) -> RlpxResult<()> {
        if self.remote_hello.is_some() {
            return Err(RlpxError::UnexpectedMessage(code::HELLO));
        }

        let hello = Hello::decode(payload)?;
        let remote_id = *self
            .handshake
            .remote_id()
            .ok_or(RlpxError::HandshakeIncomplete)?;

        let refusal = if remote_id == *self.handshake.local_id() {
            Some(DisconnectReason::ConnectedToSelf)
        } else if hello.node_id != remote_id {
            Some(DisconnectReason::UnexpectedIdentity)
        } else if let Some(required) = self
            .required_capability
            .as_ref()
            .filter(|required| !hello.supports(required))
        {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Peer {:?} does not support {}", remote_id, required);
            }
            Some(DisconnectReason::IncompatibleSubprotocol)
        } else {
            None
        };

        if let Some(reason) = refusal {
            self.write_disconnect(reason)?;
            self.close();
            events.push(SessionEvent::Disconnected {
                reason,
                local: true,
            });
            return Ok(());
        }

        // Both sides must speak a version with snappy payloads
        self.snappy = hello.protocol_version.min(self.local_hello.protocol_version)
            >= SNAPPY_PROTOCOL_VERSION;
        let capabilities = self.local_hello.shared_capabilities(&hello);
        events.push(SessionEvent::Established {
            remote_id,
            hello: hello.clone(),
            capabilities,
        });
        self.remote_hello = Some(hello);

        for (code, payload, compress) in std::mem::take(&mut self.queued) {
            self.send(code, payload, compress)?;
        }
        Ok(())
    }

    fn write_disconnect(&mut self, reason: DisconnectReason) -> RlpxResult<()> {
        self.write_message(code::DISCONNECT, &reason.encode(), self.snappy)
    }

    fn write_message(&mut self, code: u64, payload: &[u8], compress: bool) -> RlpxResult<()> {
        let codec = self.codec.as_mut().ok_or(RlpxError::HandshakeIncomplete)?;

        let mut body = Rlp::uint(code).encode();
        if compress {
            body.extend_from_slice(&Encoder::new().compress_vec(payload)?);
        } else {
            body.extend_from_slice(payload);
        }

        let frame = codec.write_frame(&body)?;
        self.outbound.extend_from_slice(&frame);
        Ok(())
    }
}

fn decompress(data: &[u8]) -> RlpxResult<Vec<u8>> {
    let length = decompress_len(data)?;
    if length > MAX_FRAME_SIZE {
        return Err(RlpxError::FrameTooLarge(length, MAX_FRAME_SIZE));
    }
    Ok(Decoder::new().decompress_vec(data)?)
}
