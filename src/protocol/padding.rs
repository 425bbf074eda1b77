//! PKCS#7-style block padding used to obscure payload lengths.
//!
//! Padding is opt-in at encode time and never enabled by the engine's own
//! emit paths; the primitives stay public so callers can round-trip padded
//! payloads from peers that do use them.

/// Target block sizes, smallest first.
const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Pad `data` up to the smallest standard block that holds it.
///
/// Inputs already past the largest block, exact block-sized inputs, and
/// inputs whose pad length would not fit the single pad byte are returned
/// unchanged.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let target = match BLOCK_SIZES.iter().find(|&&block| data.len() <= block) {
        Some(&block) => block,
        None => return data.to_vec(),
    };
    let pad_len = target - data.len();
    if pad_len == 0 || pad_len > 255 {
        return data.to_vec();
    }

    let mut padded = Vec::with_capacity(target);
    padded.extend_from_slice(data);
    padded.resize(target, pad_len as u8);
    padded
}

/// Strip block padding when, and only when, the trailing bytes form a valid
/// pad: the last byte is a plausible pad length and every trailing byte
/// equals it. Anything else is returned untouched.
pub fn unpad(data: &[u8]) -> &[u8] {
    if data.is_empty() {
        return data;
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len >= data.len() {
        return data;
    }
    let body = data.len() - pad_len;
    if data[body..].iter().all(|&b| b == pad_len as u8) {
        &data[..body]
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_smallest_block() {
        assert_eq!(pad(&[7u8; 10]).len(), 256);
        assert_eq!(pad(&[7u8; 256]).len(), 256); // exact fit, unchanged
        assert_eq!(pad(&[7u8; 300]).len(), 512);
        assert_eq!(pad(&[7u8; 1900]).len(), 2048);
    }

    #[test]
    fn oversize_input_unchanged() {
        assert_eq!(pad(&[7u8; 4000]).len(), 4000);
    }

    #[test]
    fn inexpressible_pad_length_passes_through() {
        // 1024 - 600 > 255 cannot be written into the single pad byte.
        assert_eq!(pad(&[7u8; 600]).len(), 600);
    }

    #[test]
    fn pad_byte_is_pad_length() {
        let padded = pad(&[1u8; 200]);
        assert_eq!(padded[255], 56);
        assert!(padded[200..].iter().all(|&b| b == 56));
    }

    #[test]
    fn unpad_inverts_pad() {
        for len in [1usize, 10, 200, 255, 300, 511, 1000, 2047] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(unpad(&pad(&data)), &data[..], "len {}", len);
        }
    }

    #[test]
    fn unpad_leaves_unpadded_data_alone() {
        let data = b"hello";
        assert_eq!(unpad(data), b"hello");
        assert_eq!(unpad(&[]), &[] as &[u8]);
        // Trailing byte claims more padding than the buffer holds.
        assert_eq!(unpad(&[1, 2, 255]), &[1, 2, 255]);
    }

    #[test]
    fn unpad_requires_uniform_tail() {
        // Last byte says 3, but the tail is not three 3s.
        assert_eq!(unpad(&[9, 9, 1, 2, 3]), &[9, 9, 1, 2, 3]);
    }
}
