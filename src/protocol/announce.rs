//! Announce payload: two TLVs carrying the sender's nickname and peer id.

use thiserror::Error;

const TLV_NICKNAME: u8 = 0x01;
const TLV_PEER_ID: u8 = 0x02;

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("announce value exceeds 255 bytes")]
    ValueTooLong,
    #[error("announce TLV truncated")]
    Truncated,
    #[error("announce missing required TLV {0:#04x}")]
    MissingTlv(u8),
    #[error("announce value is not valid utf-8")]
    BadUtf8,
}

/// Decoded announce contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub nickname: String,
    pub peer_id: String,
}

impl AnnouncePayload {
    pub fn new(nickname: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            peer_id: peer_id.into(),
        }
    }

    /// Encode as `(0x01, len, nickname)(0x02, len, peer_id)`.
    pub fn encode(&self) -> Result<Vec<u8>, AnnounceError> {
        let nickname = self.nickname.as_bytes();
        let peer_id = self.peer_id.as_bytes();
        if nickname.len() > 255 || peer_id.len() > 255 {
            return Err(AnnounceError::ValueTooLong);
        }

        let mut out = Vec::with_capacity(4 + nickname.len() + peer_id.len());
        out.push(TLV_NICKNAME);
        out.push(nickname.len() as u8);
        out.extend_from_slice(nickname);
        out.push(TLV_PEER_ID);
        out.push(peer_id.len() as u8);
        out.extend_from_slice(peer_id);
        Ok(out)
    }

    /// Linear TLV scan. Unknown types are skipped; both required TLVs must
    /// be present and no length may run past the end of the buffer.
    pub fn decode(data: &[u8]) -> Result<Self, AnnounceError> {
        let mut nickname = None;
        let mut peer_id = None;

        let mut offset = 0;
        while offset + 2 <= data.len() {
            let tlv_type = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2;
            if offset + len > data.len() {
                return Err(AnnounceError::Truncated);
            }
            let value = &data[offset..offset + len];
            offset += len;

            match tlv_type {
                TLV_NICKNAME => {
                    nickname = Some(
                        String::from_utf8(value.to_vec()).map_err(|_| AnnounceError::BadUtf8)?,
                    )
                }
                TLV_PEER_ID => {
                    peer_id = Some(
                        String::from_utf8(value.to_vec()).map_err(|_| AnnounceError::BadUtf8)?,
                    )
                }
                _ => {} // unknown TLV, skip
            }
        }

        Ok(Self {
            nickname: nickname.ok_or(AnnounceError::MissingTlv(TLV_NICKNAME))?,
            peer_id: peer_id.ok_or(AnnounceError::MissingTlv(TLV_PEER_ID))?,
        })
    }
}
