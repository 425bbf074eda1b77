//! Binary packet codec for the mesh wire format.
//!
//! Fixed header, big-endian throughout:
//! version(1) + type(1) + ttl(1) + timestamp_ms(8) + flags(1) + payload_len(2)
//! followed by sender(8), recipient(8, iff flagged) and the payload.

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::COMPRESSION_THRESHOLD;
use crate::protocol::padding;

/// Protocol version emitted and accepted.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header plus sender id; the minimum size of any packet.
pub const HEADER_LEN: usize = 22;

/// Header, sender and the optional recipient; used when sizing fragments.
pub const FULL_PACKET_OVERHEAD: usize = HEADER_LEN + 8;

/// Wire flag bits. Bits 2-7 are reserved: zero on emit, ignored on receive.
pub mod flags {
    pub const HAS_RECIPIENT: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Structural or length validation failed on decode.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Compressed payload did not inflate to its declared length.
    #[error("decompression mismatch: expected {expected} bytes, got {actual}")]
    DecompressionMismatch { expected: usize, actual: usize },

    /// Encode rejected a field the caller supplied.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Packet type discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Announce = 1,
    Message = 2,
    Leave = 3,
    Fragment = 4,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Announce),
            2 => Some(PacketType::Message),
            3 => Some(PacketType::Leave),
            4 => Some(PacketType::Fragment),
            _ => None,
        }
    }
}

/// A decoded mesh packet.
///
/// The flags byte is not stored: bit 0 follows from `recipient_id` being
/// present and bit 1 is a transport detail applied and removed by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_id: [u8; 8],
    pub recipient_id: Option<[u8; 8]>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a broadcast packet stamped with the current wall-clock time.
    pub fn new(packet_type: PacketType, ttl: u8, sender_id: [u8; 8], payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl,
            timestamp_ms: now_millis(),
            sender_id,
            recipient_id: None,
            payload,
        }
    }

    /// Canonical deduplication identifier: `<sender hex>-<timestamp>-<type>`.
    pub fn dedup_id(&self) -> String {
        format!(
            "{}-{}-{}",
            hex::encode(self.sender_id),
            self.timestamp_ms,
            self.packet_type as u8
        )
    }

    /// Copy with the TTL decremented, or `None` once the TTL is spent.
    pub fn decayed(&self) -> Option<Self> {
        if self.ttl > 1 {
            let mut relay = self.clone();
            relay.ttl -= 1;
            Some(relay)
        } else {
            None
        }
    }

    /// Encode to wire bytes.
    ///
    /// With `pad` the payload is first extended to a standard block size;
    /// no emit path in the engine enables this today, but the capability is
    /// part of the wire format and stays caller-controlled.
    pub fn encode(&self, pad: bool) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = if pad {
            padding::pad(&self.payload)
        } else {
            self.payload.clone()
        };
        if payload.len() > u16::MAX as usize {
            return Err(ProtocolError::InvalidField("payload exceeds 65535 bytes"));
        }

        let mut flag_bits = 0u8;
        if self.recipient_id.is_some() {
            flag_bits |= flags::HAS_RECIPIENT;
        }

        if payload.len() >= COMPRESSION_THRESHOLD {
            if let Some(compressed) = try_compress(&payload) {
                let mut framed = Vec::with_capacity(4 + compressed.len());
                framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                framed.extend_from_slice(&compressed);
                payload = framed;
                flag_bits |= flags::COMPRESSED;
            }
        }

        if payload.len() > u16::MAX as usize {
            return Err(ProtocolError::InvalidField("payload exceeds 65535 bytes"));
        }

        let mut buffer = Vec::with_capacity(FULL_PACKET_OVERHEAD + payload.len());
        buffer.push(self.version);
        buffer.push(self.packet_type as u8);
        buffer.push(self.ttl);
        buffer.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buffer.push(flag_bits);
        buffer.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buffer.extend_from_slice(&self.sender_id);
        if let Some(recipient) = self.recipient_id {
            buffer.extend_from_slice(&recipient);
        }
        buffer.extend_from_slice(&payload);

        Ok(buffer)
    }

    /// Decode wire bytes. Padding, if any, is not stripped here.
    pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed("shorter than fixed header"));
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Malformed("unsupported version"));
        }
        let packet_type = PacketType::from_u8(data[1])
            .ok_or(ProtocolError::Malformed("unknown packet type"))?;
        let ttl = data[2];
        let timestamp_ms = u64::from_be_bytes([
            data[3], data[4], data[5], data[6], data[7], data[8], data[9], data[10],
        ]);
        let flag_bits = data[11];
        let payload_len = u16::from_be_bytes([data[12], data[13]]) as usize;

        let mut offset = 14;
        let mut sender_id = [0u8; 8];
        sender_id.copy_from_slice(&data[offset..offset + 8]);
        offset += 8;

        let recipient_id = if flag_bits & flags::HAS_RECIPIENT != 0 {
            if data.len() < offset + 8 {
                return Err(ProtocolError::Malformed("missing recipient id"));
            }
            let mut recipient = [0u8; 8];
            recipient.copy_from_slice(&data[offset..offset + 8]);
            offset += 8;
            Some(recipient)
        } else {
            None
        };

        if data.len() < offset + payload_len {
            return Err(ProtocolError::Malformed("payload truncated"));
        }
        let raw_payload = &data[offset..offset + payload_len];

        let payload = if flag_bits & flags::COMPRESSED != 0 {
            decompress(raw_payload)?
        } else {
            raw_payload.to_vec()
        };

        Ok(Packet {
            version,
            packet_type,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id,
            payload,
        })
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Deflate with zlib framing; `Some` only when strictly smaller than the input.
fn try_compress(payload: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).ok()?;
    let compressed = encoder.finish().ok()?;
    if compressed.len() < payload.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Inverse of the compressed framing: 4-byte big-endian original length,
/// then the zlib stream, which must inflate to exactly that length.
fn decompress(framed: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if framed.len() < 4 {
        return Err(ProtocolError::Malformed("compressed payload too short"));
    }
    let expected = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    // Payloads never exceed the 16-bit length field, whatever the prefix claims.
    if expected > u16::MAX as usize {
        return Err(ProtocolError::Malformed("declared length out of range"));
    }
    let mut decoder = ZlibDecoder::new(&framed[4..]);
    let mut payload = Vec::with_capacity(expected);
    decoder
        .read_to_end(&mut payload)
        .map_err(|_| ProtocolError::Malformed("zlib stream corrupt"))?;
    if payload.len() != expected {
        return Err(ProtocolError::DecompressionMismatch {
            expected,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: Vec<u8>) -> Packet {
        Packet {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Message,
            ttl: 8,
            timestamp_ms: 1_700_000_000_000,
            sender_id: [1, 2, 3, 4, 5, 6, 7, 8],
            recipient_id: None,
            payload,
        }
    }

    #[test]
    fn encode_message_layout() {
        let packet = message(b"hello".to_vec());
        let encoded = packet.encode(false).unwrap();

        assert_eq!(encoded.len(), HEADER_LEN + 5);
        assert_eq!(encoded[0], 1); // version
        assert_eq!(encoded[1], 2); // type Message
        assert_eq!(encoded[2], 8); // ttl
        assert_eq!(encoded[11], 0x00); // flags
        assert_eq!(u16::from_be_bytes([encoded[12], encoded[13]]), 5);
        assert_eq!(&encoded[14..22], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&encoded[22..], b"hello");
    }

    #[test]
    fn roundtrip_without_recipient() {
        let packet = message(b"hello".to_vec());
        let decoded = Packet::decode(&packet.encode(false).unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrip_with_recipient() {
        let mut packet = message(b"direct".to_vec());
        packet.recipient_id = Some([9; 8]);
        let encoded = packet.encode(false).unwrap();
        assert_eq!(encoded[11], flags::HAS_RECIPIENT);
        assert_eq!(encoded.len(), FULL_PACKET_OVERHEAD + 6);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn compression_kicks_in_above_threshold() {
        let packet = message(vec![b'A'; 300]);
        let encoded = packet.encode(false).unwrap();

        assert_ne!(encoded[11] & flags::COMPRESSED, 0);
        // Wire payload starts with the big-endian original length.
        assert_eq!(&encoded[22..26], &300u32.to_be_bytes());
        assert!(encoded.len() < HEADER_LEN + 300);

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.payload, vec![b'A'; 300]);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn incompressible_payload_stays_verbatim() {
        let payload: Vec<u8> = (0..COMPRESSION_THRESHOLD)
            .map(|_| rand::random::<u8>())
            .collect();
        let packet = message(payload.clone());
        let encoded = packet.encode(false).unwrap();
        if encoded[11] & flags::COMPRESSED == 0 {
            assert_eq!(&encoded[22..], &payload[..]);
        }
        assert_eq!(Packet::decode(&encoded).unwrap().payload, payload);
    }

    #[test]
    fn small_payload_never_compressed() {
        let packet = message(vec![b'A'; COMPRESSION_THRESHOLD - 1]);
        let encoded = packet.encode(false).unwrap();
        assert_eq!(encoded[11] & flags::COMPRESSED, 0);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(matches!(
            Packet::decode(&[0u8; HEADER_LEN - 1]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let packet = message(b"hello".to_vec());
        let encoded = packet.encode(false).unwrap();
        assert!(matches!(
            Packet::decode(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut encoded = message(b"x".to_vec()).encode(false).unwrap();
        encoded[1] = 9;
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_length_prefix_lie() {
        let packet = message(vec![b'A'; 300]);
        let mut encoded = packet.encode(false).unwrap();
        // Corrupt the embedded original-length prefix.
        encoded[25] = encoded[25].wrapping_add(1);
        assert!(matches!(
            Packet::decode(&encoded),
            Err(ProtocolError::DecompressionMismatch { .. })
        ));
    }

    #[test]
    fn reserved_flag_bits_ignored() {
        let packet = message(b"hi".to_vec());
        let mut encoded = packet.encode(false).unwrap();
        encoded[11] |= 0xF0;
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn dedup_id_format() {
        let packet = message(b"x".to_vec());
        assert_eq!(packet.dedup_id(), "0102030405060708-1700000000000-2");
    }

    #[test]
    fn ttl_decay() {
        let packet = message(b"x".to_vec());
        assert_eq!(packet.decayed().unwrap().ttl, 7);

        let mut spent = message(b"x".to_vec());
        spent.ttl = 1;
        assert!(spent.decayed().is_none());
    }
}
