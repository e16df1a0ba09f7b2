//! Wire encoding for handshake and traffic packets.
//!
//! Variable-width integers use LEB128 (7 bits per byte, low group first);
//! signed values are zigzag-mapped first. Keys, handles, and nonces are raw
//! fixed-width fields. All messages are self-delimiting and round-trip
//! bit-exact.

use weft_crypto::{BOX_KEY_SIZE, BOX_NONCE_SIZE, BoxNonce, BoxPublicKey, HANDLE_SIZE, Handle};

use crate::error::WireError;

/// Spare capacity reserved when coords are replaced, sized for the flow-key
/// suffix (1 zero byte + 8-byte big-endian key) plus change.
pub const COORDS_SLACK: usize = 11;

/// Type tag of an encrypted traffic packet
pub const PACKET_TYPE_TRAFFIC: u64 = 0;

/// Type tag of a protocol (handshake) packet
pub const PACKET_TYPE_PROTOCOL: u64 = 1;

/// Read the leading type tag of an encoded packet without consuming it.
///
/// # Errors
///
/// Returns a [`WireError`] if the tag varint is malformed.
pub fn packet_type(buf: &[u8]) -> Result<u64, WireError> {
    get_varint_u64(buf).map(|(tag, _)| tag)
}

/// Append a LEB128-encoded u64.
pub fn put_varint_u64(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a LEB128-encoded u64, returning the value and bytes consumed.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] if the input ends mid-varint and
/// [`WireError::VarintOverflow`] if the encoding exceeds 64 bits.
pub fn get_varint_u64(buf: &[u8]) -> Result<(u64, usize), WireError> {
    let mut v: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 9 && byte > 0x01 {
            return Err(WireError::VarintOverflow);
        }
        v |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((v, i + 1));
        }
    }
    Err(WireError::Truncated)
}

/// Append a zigzag + LEB128 encoded i64.
pub fn put_varint_i64(buf: &mut Vec<u8>, v: i64) {
    let zz = ((v << 1) ^ (v >> 63)) as u64;
    put_varint_u64(buf, zz);
}

/// Decode a zigzag + LEB128 encoded i64.
///
/// # Errors
///
/// Same as [`get_varint_u64`].
pub fn get_varint_i64(buf: &[u8]) -> Result<(i64, usize), WireError> {
    let (zz, n) = get_varint_u64(buf)?;
    Ok((((zz >> 1) as i64) ^ -((zz & 1) as i64), n))
}

fn take(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), WireError> {
    if buf.len() < n {
        return Err(WireError::Truncated);
    }
    Ok(buf.split_at(n))
}

fn take_key(buf: &[u8]) -> Result<(BoxPublicKey, &[u8]), WireError> {
    let (head, rest) = take(buf, BOX_KEY_SIZE)?;
    let mut bytes = [0u8; BOX_KEY_SIZE];
    bytes.copy_from_slice(head);
    Ok((BoxPublicKey::from_bytes(bytes), rest))
}

fn take_handle(buf: &[u8]) -> Result<(Handle, &[u8]), WireError> {
    let (head, rest) = take(buf, HANDLE_SIZE)?;
    let mut bytes = [0u8; HANDLE_SIZE];
    bytes.copy_from_slice(head);
    Ok((Handle::from_bytes(bytes), rest))
}

fn take_nonce(buf: &[u8]) -> Result<(BoxNonce, &[u8]), WireError> {
    let (head, rest) = take(buf, BOX_NONCE_SIZE)?;
    let mut bytes = [0u8; BOX_NONCE_SIZE];
    bytes.copy_from_slice(head);
    Ok((BoxNonce::from_bytes(bytes), rest))
}

fn take_prefixed(buf: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    let (len, n) = get_varint_u64(buf)?;
    let len = usize::try_from(len).map_err(|_| WireError::ValueOutOfRange)?;
    take(&buf[n..], len)
}

fn put_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_varint_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Session ping/pong body, sealed under the protocol shared key before it
/// goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPing {
    /// Sender's permanent public key
    pub send_perm_pub: BoxPublicKey,
    /// Sender's handle for this session
    pub handle: Handle,
    /// Sender's ephemeral session public key
    pub send_ses_pub: BoxPublicKey,
    /// Sender's coords in the routing topology
    pub coords: Vec<u8>,
    /// Unix-second timestamp; the only requirement is that it increases
    pub tstamp: i64,
    /// Whether this is a response to a ping
    pub is_pong: bool,
    /// Sender's interface MTU (0 = unspecified)
    pub mtu: u16,
}

impl SessionPing {
    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            BOX_KEY_SIZE * 2 + HANDLE_SIZE + self.coords.len() + 16,
        );
        buf.extend_from_slice(self.send_perm_pub.as_bytes());
        buf.extend_from_slice(self.handle.as_bytes());
        buf.extend_from_slice(self.send_ses_pub.as_bytes());
        put_varint_i64(&mut buf, self.tstamp);
        put_prefixed(&mut buf, &self.coords);
        buf.push(u8::from(self.is_pong));
        put_varint_u64(&mut buf, u64::from(self.mtu));
        buf
    }

    /// Decode from wire bytes. The whole input must be consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated, overlong, or trailing input.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (send_perm_pub, buf) = take_key(buf)?;
        let (handle, buf) = take_handle(buf)?;
        let (send_ses_pub, buf) = take_key(buf)?;
        let (tstamp, n) = get_varint_i64(buf)?;
        let (coords, buf) = take_prefixed(&buf[n..])?;
        let (flag, buf) = take(buf, 1)?;
        let (mtu, n) = get_varint_u64(buf)?;
        let mtu = u16::try_from(mtu).map_err(|_| WireError::ValueOutOfRange)?;
        if buf.len() != n {
            return Err(WireError::Trailing);
        }
        Ok(Self {
            send_perm_pub,
            handle,
            send_ses_pub,
            coords: coords.to_vec(),
            tstamp,
            is_pong: flag[0] != 0,
            mtu,
        })
    }
}

/// Encrypted traffic packet: plaintext header plus sealed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficPacket {
    /// Destination coords, possibly carrying a flow-key suffix
    pub coords: Vec<u8>,
    /// Receiver's handle for the session
    pub handle: Handle,
    /// Nonce the payload was sealed under
    pub nonce: BoxNonce,
    /// Sealed payload
    pub payload: Vec<u8>,
}

impl TrafficPacket {
    /// Encode to wire bytes, starting with [`PACKET_TYPE_TRAFFIC`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.coords.len() + HANDLE_SIZE + BOX_NONCE_SIZE + self.payload.len() + 5,
        );
        put_varint_u64(&mut buf, PACKET_TYPE_TRAFFIC);
        put_prefixed(&mut buf, &self.coords);
        buf.extend_from_slice(self.handle.as_bytes());
        buf.extend_from_slice(self.nonce.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from wire bytes. The payload is the remainder of the input.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated input or a foreign type tag.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (tag, n) = get_varint_u64(buf)?;
        if tag != PACKET_TYPE_TRAFFIC {
            return Err(WireError::ValueOutOfRange);
        }
        let (coords, buf) = take_prefixed(&buf[n..])?;
        let (handle, buf) = take_handle(buf)?;
        let (nonce, buf) = take_nonce(buf)?;
        Ok(Self {
            coords: coords.to_vec(),
            handle,
            nonce,
            payload: buf.to_vec(),
        })
    }
}

/// Protocol (non-traffic) packet carrying a sealed handshake body, addressed
/// by permanent keys so a node without an established session can open it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolPacket {
    /// Destination coords
    pub coords: Vec<u8>,
    /// Destination permanent public key
    pub to_key: BoxPublicKey,
    /// Source permanent public key
    pub from_key: BoxPublicKey,
    /// Random nonce the body was sealed under
    pub nonce: BoxNonce,
    /// Sealed body
    pub payload: Vec<u8>,
}

impl ProtocolPacket {
    /// Encode to wire bytes, starting with [`PACKET_TYPE_PROTOCOL`].
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.coords.len() + BOX_KEY_SIZE * 2 + BOX_NONCE_SIZE + self.payload.len() + 5,
        );
        put_varint_u64(&mut buf, PACKET_TYPE_PROTOCOL);
        put_prefixed(&mut buf, &self.coords);
        buf.extend_from_slice(self.to_key.as_bytes());
        buf.extend_from_slice(self.from_key.as_bytes());
        buf.extend_from_slice(self.nonce.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from wire bytes. The payload is the remainder of the input.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated input or a foreign type tag.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (tag, n) = get_varint_u64(buf)?;
        if tag != PACKET_TYPE_PROTOCOL {
            return Err(WireError::ValueOutOfRange);
        }
        let (coords, buf) = take_prefixed(&buf[n..])?;
        let (to_key, buf) = take_key(buf)?;
        let (from_key, buf) = take_key(buf)?;
        let (nonce, buf) = take_nonce(buf)?;
        Ok(Self {
            coords: coords.to_vec(),
            to_key,
            from_key,
            nonce,
            payload: buf.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> BoxPublicKey {
        BoxPublicKey::from_bytes([seed; 32])
    }

    #[test]
    fn test_varint_u64_roundtrip() {
        let mut buf = Vec::new();
        for v in [0u64, 1, 127, 128, 300, u64::from(u16::MAX), u64::MAX] {
            buf.clear();
            put_varint_u64(&mut buf, v);
            let (decoded, n) = get_varint_u64(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn test_varint_i64_roundtrip() {
        let mut buf = Vec::new();
        for v in [0i64, -1, 1, i64::MIN, i64::MAX, 1_700_000_000] {
            buf.clear();
            put_varint_i64(&mut buf, v);
            let (decoded, n) = get_varint_i64(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        assert_eq!(get_varint_u64(&[0x80]), Err(WireError::Truncated));
        assert_eq!(get_varint_u64(&[]), Err(WireError::Truncated));
    }

    #[test]
    fn test_varint_overflow() {
        let overlong = [0xff; 11];
        assert_eq!(get_varint_u64(&overlong), Err(WireError::VarintOverflow));
    }

    fn sample_ping() -> SessionPing {
        SessionPing {
            send_perm_pub: key(0xaa),
            handle: Handle::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
            send_ses_pub: key(0xbb),
            coords: vec![1, 2, 3],
            tstamp: 1_700_000_000,
            is_pong: false,
            mtu: 1280,
        }
    }

    #[test]
    fn test_ping_roundtrip() {
        let ping = sample_ping();
        assert_eq!(SessionPing::decode(&ping.encode()).unwrap(), ping);

        let pong = SessionPing {
            is_pong: true,
            coords: Vec::new(),
            mtu: 0,
            ..ping
        };
        assert_eq!(SessionPing::decode(&pong.encode()).unwrap(), pong);
    }

    #[test]
    fn test_ping_rejects_trailing_bytes() {
        let mut bytes = sample_ping().encode();
        bytes.push(0);
        assert_eq!(SessionPing::decode(&bytes), Err(WireError::Trailing));
    }

    #[test]
    fn test_ping_rejects_truncation() {
        let bytes = sample_ping().encode();
        for cut in 0..bytes.len() {
            assert!(SessionPing::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_traffic_roundtrip() {
        let packet = TrafficPacket {
            coords: vec![9, 8, 7, 0, 0, 0, 0, 0, 0, 0, 0, 42],
            handle: Handle::from_bytes([8; 8]),
            nonce: BoxNonce::from_bytes([3; 24]),
            payload: vec![0xde, 0xad],
        };
        assert_eq!(TrafficPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_traffic_empty_payload() {
        let packet = TrafficPacket {
            coords: Vec::new(),
            handle: Handle::from_bytes([0; 8]),
            nonce: BoxNonce::default(),
            payload: Vec::new(),
        };
        assert_eq!(TrafficPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_protocol_roundtrip() {
        let packet = ProtocolPacket {
            coords: vec![1],
            to_key: key(0x01),
            from_key: key(0x02),
            nonce: BoxNonce::from_bytes([7; 24]),
            payload: vec![0; 64],
        };
        assert_eq!(ProtocolPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_bogus_length_prefix() {
        // Claims a 1 GiB coords field with 2 bytes of input behind it.
        let mut buf = Vec::new();
        put_varint_u64(&mut buf, PACKET_TYPE_TRAFFIC);
        put_varint_u64(&mut buf, 1 << 30);
        buf.extend_from_slice(&[0, 0]);
        assert!(TrafficPacket::decode(&buf).is_err());
    }

    #[test]
    fn test_packet_type_discriminates() {
        let traffic = TrafficPacket {
            coords: vec![1],
            handle: Handle::from_bytes([0; 8]),
            nonce: BoxNonce::default(),
            payload: vec![],
        };
        let protocol = ProtocolPacket {
            coords: vec![1],
            to_key: key(1),
            from_key: key(2),
            nonce: BoxNonce::default(),
            payload: vec![],
        };
        assert_eq!(packet_type(&traffic.encode()).unwrap(), PACKET_TYPE_TRAFFIC);
        assert_eq!(
            packet_type(&protocol.encode()).unwrap(),
            PACKET_TYPE_PROTOCOL
        );
        // Decoding under the wrong type fails.
        assert!(ProtocolPacket::decode(&traffic.encode()).is_err());
        assert!(TrafficPacket::decode(&protocol.encode()).is_err());
    }
}
