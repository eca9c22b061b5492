//! Recursive length-prefix encoding.
//!
//! RLP values are either byte strings or lists of RLP values. Decoding is
//! strict by default: the whole input must be exactly one canonical item.
//! [`decode_unstrict`] accepts trailing bytes and reports how many bytes the
//! leading item used, which is what length-delimited frame bodies and padded
//! handshake messages need.

use thiserror::Error;

/// Deepest list nesting accepted while decoding.
pub const MAX_DEPTH: usize = 64;

const SHORT_STRING_OFFSET: u8 = 0x80;
const LONG_STRING_OFFSET: u8 = 0xb7;
const SHORT_LIST_OFFSET: u8 = 0xc0;
const LONG_LIST_OFFSET: u8 = 0xf7;

/// Payloads shorter than this use the single-byte length prefix.
const SHORT_PAYLOAD_LIMIT: usize = 56;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RlpError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("{0} trailing bytes after item")]
    TrailingBytes(usize),

    #[error("non canonical encoding")]
    NonCanonical,

    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,

    #[error("expected a byte string, got a list")]
    ExpectedBytes,

    #[error("expected a list, got a byte string")]
    ExpectedList,

    #[error("expected at least {expected} list items, got {len}")]
    ListTooShort { len: usize, expected: usize },

    #[error("integer of {0} bytes does not fit")]
    IntegerOverflow(usize),

    #[error("invalid length {len}, expected {expected}")]
    InvalidLength { len: usize, expected: usize },
}

pub type RlpResult<T> = Result<T, RlpError>;

/// A decoded or to-be-encoded RLP item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rlp {
    Bytes(Vec<u8>),
    List(Vec<Rlp>),
}

impl Rlp {
    pub fn bytes(value: impl AsRef<[u8]>) -> Self {
        Rlp::Bytes(value.as_ref().to_vec())
    }

    /// Big-endian integer with leading zero bytes stripped; zero is empty.
    pub fn uint(value: u64) -> Self {
        Rlp::Bytes(strip_leading_zeros(&value.to_be_bytes()).to_vec())
    }

    pub fn list(items: Vec<Rlp>) -> Self {
        Rlp::List(items)
    }

    pub fn empty_list() -> Self {
        Rlp::List(Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_into(self, &mut out);
        out
    }

    pub fn as_bytes(&self) -> RlpResult<&[u8]> {
        match self {
            Rlp::Bytes(bytes) => Ok(bytes),
            Rlp::List(_) => Err(RlpError::ExpectedBytes),
        }
    }

    pub fn as_list(&self) -> RlpResult<&[Rlp]> {
        match self {
            Rlp::List(items) => Ok(items),
            Rlp::Bytes(_) => Err(RlpError::ExpectedList),
        }
    }

    /// List with at least `expected` items. Extra items are left for
    /// forward-compatible extensions and are not an error.
    pub fn as_list_min(&self, expected: usize) -> RlpResult<&[Rlp]> {
        let items = self.as_list()?;
        if items.len() < expected {
            return Err(RlpError::ListTooShort {
                len: items.len(),
                expected,
            });
        }
        Ok(items)
    }

    /// Fixed-size byte string.
    pub fn as_array<const N: usize>(&self) -> RlpResult<[u8; N]> {
        let bytes = self.as_bytes()?;
        bytes.try_into().map_err(|_| RlpError::InvalidLength {
            len: bytes.len(),
            expected: N,
        })
    }

    pub fn as_u64(&self) -> RlpResult<u64> {
        let bytes = self.as_bytes()?;
        if bytes.len() > 8 {
            return Err(RlpError::IntegerOverflow(bytes.len()));
        }
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    pub fn as_u16(&self) -> RlpResult<u16> {
        let value = self.as_u64()?;
        u16::try_from(value).map_err(|_| RlpError::IntegerOverflow(self.payload_len()))
    }

    pub fn as_u8(&self) -> RlpResult<u8> {
        let value = self.as_u64()?;
        u8::try_from(value).map_err(|_| RlpError::IntegerOverflow(self.payload_len()))
    }

    fn payload_len(&self) -> usize {
        match self {
            Rlp::Bytes(bytes) => bytes.len(),
            Rlp::List(items) => items.len(),
        }
    }
}

impl From<&[u8]> for Rlp {
    fn from(value: &[u8]) -> Self {
        Rlp::bytes(value)
    }
}

impl From<Vec<Rlp>> for Rlp {
    fn from(items: Vec<Rlp>) -> Self {
        Rlp::List(items)
    }
}

pub fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

pub fn encode(item: &Rlp) -> Vec<u8> {
    item.encode()
}

/// Decode exactly one item spanning the whole input.
pub fn decode(data: &[u8]) -> RlpResult<Rlp> {
    let (item, consumed) = decode_item(data, 0)?;
    if consumed != data.len() {
        return Err(RlpError::TrailingBytes(data.len() - consumed));
    }
    Ok(item)
}

/// Decode the leading item and return it with the number of bytes it used.
pub fn decode_unstrict(data: &[u8]) -> RlpResult<(Rlp, usize)> {
    decode_item(data, 0)
}

fn encode_into(item: &Rlp, out: &mut Vec<u8>) {
    match item {
        Rlp::Bytes(bytes) if bytes.len() == 1 && bytes[0] < SHORT_STRING_OFFSET => {
            out.push(bytes[0]);
        }
        Rlp::Bytes(bytes) => {
            encode_length(bytes.len(), SHORT_STRING_OFFSET, out);
            out.extend_from_slice(bytes);
        }
        Rlp::List(items) => {
            let mut payload = Vec::new();
            for item in items {
                encode_into(item, &mut payload);
            }
            encode_length(payload.len(), SHORT_LIST_OFFSET, out);
            out.extend_from_slice(&payload);
        }
    }
}

fn encode_length(len: usize, offset: u8, out: &mut Vec<u8>) {
    if len < SHORT_PAYLOAD_LIMIT {
        out.push(offset + len as u8);
    } else {
        let be = (len as u64).to_be_bytes();
        let len_bytes = strip_leading_zeros(&be);
        out.push(offset + 55 + len_bytes.len() as u8);
        out.extend_from_slice(len_bytes);
    }
}

fn slice(data: &[u8], start: usize, len: usize) -> RlpResult<&[u8]> {
    let end = start.checked_add(len).ok_or(RlpError::UnexpectedEnd)?;
    data.get(start..end).ok_or(RlpError::UnexpectedEnd)
}

fn read_long_length(data: &[u8], len_of_len: usize) -> RlpResult<usize> {
    let bytes = slice(data, 1, len_of_len)?;
    if bytes[0] == 0 {
        return Err(RlpError::NonCanonical);
    }
    if len_of_len > std::mem::size_of::<usize>() {
        return Err(RlpError::IntegerOverflow(len_of_len));
    }

    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if len < SHORT_PAYLOAD_LIMIT {
        return Err(RlpError::NonCanonical);
    }
    Ok(len)
}

fn decode_item(data: &[u8], depth: usize) -> RlpResult<(Rlp, usize)> {
    let prefix = *data.first().ok_or(RlpError::UnexpectedEnd)?;
    match prefix {
        0x00..=0x7f => Ok((Rlp::Bytes(vec![prefix]), 1)),
        0x80..=0xb7 => {
            let len = (prefix - SHORT_STRING_OFFSET) as usize;
            let payload = slice(data, 1, len)?;
            if len == 1 && payload[0] < SHORT_STRING_OFFSET {
                return Err(RlpError::NonCanonical);
            }
            Ok((Rlp::Bytes(payload.to_vec()), 1 + len))
        }
        0xb8..=0xbf => {
            let len_of_len = (prefix - LONG_STRING_OFFSET) as usize;
            let len = read_long_length(data, len_of_len)?;
            let payload = slice(data, 1 + len_of_len, len)?;
            Ok((Rlp::Bytes(payload.to_vec()), 1 + len_of_len + len))
        }
        0xc0..=0xf7 => {
            let len = (prefix - SHORT_LIST_OFFSET) as usize;
            let payload = slice(data, 1, len)?;
            let items = decode_list_payload(payload, depth)?;
            Ok((Rlp::List(items), 1 + len))
        }
        0xf8..=0xff => {
            let len_of_len = (prefix - LONG_LIST_OFFSET) as usize;
            let len = read_long_length(data, len_of_len)?;
            let payload = slice(data, 1 + len_of_len, len)?;
            let items = decode_list_payload(payload, depth)?;
            Ok((Rlp::List(items), 1 + len_of_len + len))
        }
    }
}

fn decode_list_payload(mut payload: &[u8], depth: usize) -> RlpResult<Vec<Rlp>> {
    if depth >= MAX_DEPTH {
        return Err(RlpError::TooDeep);
    }

    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, consumed) = decode_item(payload, depth + 1)?;
        items.push(item);
        payload = &payload[consumed..];
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_known_vectors() {
        assert_eq!(Rlp::bytes(b"dog").encode(), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(
            Rlp::list(vec![Rlp::bytes(b"cat"), Rlp::bytes(b"dog")]).encode(),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
        assert_eq!(Rlp::bytes(b"").encode(), vec![0x80]);
        assert_eq!(Rlp::empty_list().encode(), vec![0xc0]);
        assert_eq!(Rlp::uint(0).encode(), vec![0x80]);
        assert_eq!(Rlp::uint(15).encode(), vec![0x0f]);
        assert_eq!(Rlp::uint(1024).encode(), vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn test_long_string_prefix() {
        let value = vec![b'a'; 56];
        let encoded = Rlp::bytes(&value).encode();
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(decode(&encoded).unwrap(), Rlp::Bytes(value));
    }

    #[test]
    fn test_long_list_prefix() {
        let items: Vec<Rlp> = (0..30).map(|_| Rlp::bytes(b"ab")).collect();
        let encoded = Rlp::list(items.clone()).encode();
        assert_eq!(&encoded[..2], &[0xf8, 90]);
        assert_eq!(decode(&encoded).unwrap(), Rlp::List(items));
    }

    #[test]
    fn test_decode_nested() {
        let value = Rlp::list(vec![
            Rlp::uint(4),
            Rlp::list(vec![Rlp::bytes([127u8, 0, 0, 1]), Rlp::uint(30303)]),
            Rlp::empty_list(),
        ]);
        assert_eq!(decode(&value.encode()).unwrap(), value);
    }

    #[test]
    fn test_strict_rejects_trailing() {
        let mut encoded = Rlp::bytes(b"dog").encode();
        encoded.extend_from_slice(&[1, 2, 3]);

        assert_eq!(decode(&encoded).unwrap_err(), RlpError::TrailingBytes(3));
        let (item, consumed) = decode_unstrict(&encoded).unwrap();
        assert_eq!(item, Rlp::bytes(b"dog"));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_rejects_non_canonical() {
        // single byte below 0x80 must encode as itself
        assert_eq!(decode(&[0x81, 0x05]).unwrap_err(), RlpError::NonCanonical);
        // long form for a short payload
        let mut long = vec![0xb8, 3];
        long.extend_from_slice(b"dog");
        assert_eq!(decode(&long).unwrap_err(), RlpError::NonCanonical);
        // length with a leading zero
        assert_eq!(decode(&[0xb9, 0x00, 0x40]).unwrap_err(), RlpError::NonCanonical);
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(decode(&[]).unwrap_err(), RlpError::UnexpectedEnd);
        assert_eq!(decode(&[0x83, b'd']).unwrap_err(), RlpError::UnexpectedEnd);
        assert_eq!(decode(&[0xc2, 0x83]).unwrap_err(), RlpError::UnexpectedEnd);
    }

    #[test]
    fn test_depth_limit() {
        let mut value = Rlp::empty_list();
        for _ in 0..MAX_DEPTH + 1 {
            value = Rlp::list(vec![value]);
        }
        assert_eq!(decode(&value.encode()).unwrap_err(), RlpError::TooDeep);
    }

    #[test]
    fn test_accessors() {
        let value = Rlp::list(vec![Rlp::uint(70000), Rlp::bytes([1u8; 4])]);
        let items = value.as_list_min(2).unwrap();
        assert_eq!(items[0].as_u64().unwrap(), 70000);
        assert!(matches!(items[0].as_u16(), Err(RlpError::IntegerOverflow(_))));
        assert_eq!(items[1].as_array::<4>().unwrap(), [1u8; 4]);
        assert!(items[1].as_array::<3>().is_err());
        assert_eq!(
            value.as_list_min(3).unwrap_err(),
            RlpError::ListTooShort {
                len: 2,
                expected: 3
            }
        );
        assert_eq!(items[0].as_list().unwrap_err(), RlpError::ExpectedList);
        assert_eq!(value.as_bytes().unwrap_err(), RlpError::ExpectedBytes);
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&data);
            let _ = decode_unstrict(&data);
        }

        #[test]
        fn uint_survives_encoding(value in any::<u64>()) {
            let decoded = decode(&Rlp::uint(value).encode()).unwrap();
            prop_assert_eq!(decoded.as_u64().unwrap(), value);
        }
    }
}
