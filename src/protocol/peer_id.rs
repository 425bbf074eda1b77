//! Peer identifiers: 16 lowercase hex characters naming 8 bytes of identity.

use sha2::{Digest, Sha256};

/// Length of a peer id in hex characters.
pub const PEER_ID_LEN: usize = 16;

/// Derive a fresh local peer id from device entropy.
pub fn generate() -> String {
    let entropy: [u8; 32] = rand::random();
    hex::encode(&entropy[..PEER_ID_LEN / 2])
}

/// Exactly 16 hex characters.
pub fn is_valid(peer_id: &str) -> bool {
    peer_id.len() == PEER_ID_LEN && peer_id.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hex form of a raw 8-byte sender id.
pub fn from_bytes(bytes: &[u8; 8]) -> String {
    hex::encode(bytes)
}

/// Parse the hex form back into raw bytes.
pub fn to_bytes(peer_id: &str) -> Option<[u8; 8]> {
    if !is_valid(peer_id) {
        return None;
    }
    hex::decode(peer_id).ok()?.try_into().ok()
}

/// Deterministic stand-in peer id for a device we have only discovered,
/// used by the connection tie-break before the remote has announced.
/// Both sides derive the same candidate from the same advertisement.
pub fn candidate_for_device(device_uuid: &str) -> String {
    let digest = Sha256::digest(device_uuid.as_bytes());
    hex::encode(&digest[..PEER_ID_LEN / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        let id = generate();
        assert!(is_valid(&id));
        assert_ne!(generate(), id);
    }

    #[test]
    fn validity_rules() {
        assert!(is_valid("0123456789abcdef"));
        assert!(is_valid("FFFFFFFFFFFFFFFF"));
        assert!(!is_valid("0123456789abcde")); // 15 chars
        assert!(!is_valid("0123456789abcdefg")); // 17 chars
        assert!(!is_valid("0123456789abcdeg")); // non-hex
    }

    #[test]
    fn bytes_roundtrip() {
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8];
        let id = from_bytes(&bytes);
        assert_eq!(id, "0102030405060708");
        assert_eq!(to_bytes(&id), Some(bytes));
        assert_eq!(to_bytes("nope"), None);
    }

    #[test]
    fn candidate_is_deterministic_and_valid() {
        let a = candidate_for_device("hci0/dev_AA_BB");
        let b = candidate_for_device("hci0/dev_AA_BB");
        assert_eq!(a, b);
        assert!(is_valid(&a));
        assert_ne!(candidate_for_device("hci0/dev_CC_DD"), a);
    }
}
