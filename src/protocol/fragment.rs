//! Fragment sub-format: splitting oversize packets into type-Fragment
//! packets and the codec for their payloads.
//!
//! Fragment payload layout, big-endian:
//! fragment_id(8) + index(2) + total(2) + original_type(1) + chunk.

use std::time::Duration;

use crate::protocol::packet::{Packet, PacketType, ProtocolError, FULL_PACKET_OVERHEAD};

/// Fragment payload bytes before the chunk.
pub const FRAGMENT_HEADER_LEN: usize = 13;

/// Chunks never shrink below this, whatever the link advertises.
pub const MIN_CHUNK_SIZE: usize = 32;

/// One piece of a split packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPayload {
    pub fragment_id: [u8; 8],
    pub index: u16,
    pub total: u16,
    pub original_type: u8,
    pub chunk: Vec<u8>,
}

impl FragmentPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.chunk.len());
        out.extend_from_slice(&self.fragment_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.original_type);
        out.extend_from_slice(&self.chunk);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() <= FRAGMENT_HEADER_LEN {
            return Err(ProtocolError::Malformed("fragment payload too short"));
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&data[..8]);
        let index = u16::from_be_bytes([data[8], data[9]]);
        let total = u16::from_be_bytes([data[10], data[11]]);
        let original_type = data[12];
        if total < 2 || index >= total {
            return Err(ProtocolError::Malformed("fragment index out of range"));
        }
        if original_type == PacketType::Fragment as u8 {
            return Err(ProtocolError::Malformed("nested fragment"));
        }
        Ok(Self {
            fragment_id,
            index,
            total,
            original_type,
            chunk: data[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }

    /// Key for the fragment-arrival deduplicator.
    pub fn arrival_key(&self, sender_id: &[u8; 8]) -> String {
        format!(
            "{}:{}:{}",
            hex::encode(sender_id),
            hex::encode(self.fragment_id),
            self.index
        )
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.fragment_id)
    }
}

/// Chunk size available under `effective_write_len` once the fragment
/// sub-header and a full packet header are accounted for.
pub fn chunk_size_for(effective_write_len: usize) -> usize {
    effective_write_len
        .saturating_sub(FRAGMENT_HEADER_LEN + FULL_PACKET_OVERHEAD)
        .max(MIN_CHUNK_SIZE)
}

/// Spacing between consecutive fragment writes.
pub fn pacing_delay(total: usize) -> Duration {
    if total <= 10 {
        Duration::from_millis(20)
    } else {
        Duration::from_millis(30)
    }
}

/// Split an encoded packet into fragment packets sharing the original's
/// sender, recipient, timestamp and ttl. The caller supplies the encoded
/// bytes so the chunks partition exactly what would have gone on the wire.
pub fn split_packet(original: &Packet, encoded: &[u8], effective_write_len: usize) -> Vec<Packet> {
    let chunk_size = chunk_size_for(effective_write_len);
    let total = encoded.len().div_ceil(chunk_size);
    let fragment_id: [u8; 8] = rand::random();

    encoded
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let payload = FragmentPayload {
                fragment_id,
                index: index as u16,
                total: total as u16,
                original_type: original.packet_type as u8,
                chunk: chunk.to_vec(),
            };
            Packet {
                version: original.version,
                packet_type: PacketType::Fragment,
                ttl: original.ttl,
                timestamp_ms: original.timestamp_ms,
                sender_id: original.sender_id,
                recipient_id: original.recipient_id,
                payload: payload.encode(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::PROTOCOL_VERSION;

    // Random fill keeps zlib from shrinking the payload, so the encoded
    // length is exactly header + payload.
    fn big_message(len: usize) -> Packet {
        Packet {
            version: PROTOCOL_VERSION,
            packet_type: PacketType::Message,
            ttl: 8,
            timestamp_ms: 1_700_000_000_000,
            sender_id: [0xaa; 8],
            recipient_id: None,
            payload: (0..len).map(|_| rand::random::<u8>()).collect(),
        }
    }

    #[test]
    fn payload_roundtrip() {
        let frag = FragmentPayload {
            fragment_id: [1; 8],
            index: 3,
            total: 9,
            original_type: PacketType::Message as u8,
            chunk: vec![5; 40],
        };
        assert_eq!(FragmentPayload::decode(&frag.encode()).unwrap(), frag);
    }

    #[test]
    fn decode_rejects_bad_counts() {
        let mut frag = FragmentPayload {
            fragment_id: [1; 8],
            index: 0,
            total: 2,
            original_type: PacketType::Message as u8,
            chunk: vec![1],
        };
        frag.index = 2;
        assert!(FragmentPayload::decode(&frag.encode()).is_err());

        frag.index = 0;
        frag.total = 1;
        assert!(FragmentPayload::decode(&frag.encode()).is_err());

        frag.total = 2;
        frag.original_type = PacketType::Fragment as u8;
        assert!(FragmentPayload::decode(&frag.encode()).is_err());
    }

    #[test]
    fn chunk_sizing() {
        assert_eq!(chunk_size_for(150), 107);
        // Tiny write lengths clamp at the floor.
        assert_eq!(chunk_size_for(40), MIN_CHUNK_SIZE);
    }

    #[test]
    fn nine_fragments_for_900_bytes() {
        let packet = big_message(900 - 22);
        let encoded = packet.encode(false).unwrap();
        assert_eq!(encoded.len(), 900);

        let fragments = split_packet(&packet, &encoded, 150);
        assert_eq!(fragments.len(), 9);

        let first = FragmentPayload::decode(&fragments[0].payload).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.total, 9);
        assert_eq!(first.original_type, PacketType::Message as u8);
        assert_eq!(first.chunk.len(), 107);
        assert_eq!(first.chunk, encoded[..107]);
    }

    #[test]
    fn chunks_reassemble_to_original_bytes() {
        let packet = big_message(700);
        let encoded = packet.encode(false).unwrap();
        let fragments = split_packet(&packet, &encoded, 150);

        let mut rebuilt = Vec::new();
        for fragment in &fragments {
            assert_eq!(fragment.packet_type, PacketType::Fragment);
            assert_eq!(fragment.ttl, packet.ttl);
            assert_eq!(fragment.timestamp_ms, packet.timestamp_ms);
            let payload = FragmentPayload::decode(&fragment.payload).unwrap();
            rebuilt.extend_from_slice(&payload.chunk);
        }
        assert_eq!(rebuilt, encoded);
        assert_eq!(Packet::decode(&rebuilt).unwrap(), packet);
    }

    #[test]
    fn fragments_share_one_id() {
        let packet = big_message(600);
        let encoded = packet.encode(false).unwrap();
        let fragments = split_packet(&packet, &encoded, 150);
        let ids: Vec<[u8; 8]> = fragments
            .iter()
            .map(|f| FragmentPayload::decode(&f.payload).unwrap().fragment_id)
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn pacing_steps_up_for_long_trains() {
        assert_eq!(pacing_delay(10), Duration::from_millis(20));
        assert_eq!(pacing_delay(11), Duration::from_millis(30));
    }
}
