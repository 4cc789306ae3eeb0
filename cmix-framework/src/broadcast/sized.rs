//! Variable-length payloads inside fixed-size symmetric broadcasts: a `u16` length prefix,
//! the payload, and random padding to the exact size

use rand::{CryptoRng, RngCore};

use super::BroadcastError;

/// Length of the size prefix
pub const SIZE_PREFIX_LEN: usize = 2;

/// Largest payload that fits in an outer payload of `outer` bytes
#[inline]
pub const fn max_sized_payload(outer: usize) -> usize {
    let max = outer.saturating_sub(SIZE_PREFIX_LEN);
    if max > u16::MAX as usize {
        u16::MAX as usize
    } else {
        max
    }
}

/// Frame `payload` into exactly `outer` bytes
pub fn encode_sized<R: RngCore + CryptoRng>(
    payload: &[u8],
    outer: usize,
    rng: &mut R,
) -> Result<Vec<u8>, BroadcastError> {
    let max = max_sized_payload(outer);
    if payload.len() > max {
        return Err(BroadcastError::BadSize {
            len: payload.len(),
            max,
        });
    }

    let mut sized = Vec::with_capacity(outer);
    sized.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    sized.extend_from_slice(payload);
    let filled = sized.len();
    sized.resize(outer, 0);
    rng.fill_bytes(&mut sized[filled..]);
    Ok(sized)
}

/// Extract the payload from bytes produced by [encode_sized]
pub fn decode_sized(sized: &[u8]) -> Result<&[u8], BroadcastError> {
    if sized.len() < SIZE_PREFIX_LEN {
        return Err(BroadcastError::Format(
            "sized payload is missing its size prefix".to_owned(),
        ));
    }

    let len = u16::from_le_bytes([sized[0], sized[1]]) as usize;
    sized[SIZE_PREFIX_LEN..].get(..len).ok_or_else(|| {
        BroadcastError::Format(format!(
            "sized payload claims {} bytes but only {} remain",
            len,
            sized.len() - SIZE_PREFIX_LEN
        ))
    })
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn test_sized() {
        let sized = encode_sized(b"hello", 64, &mut OsRng).unwrap();
        assert_eq!(sized.len(), 64);
        assert_eq!(decode_sized(&sized).unwrap(), b"hello");

        let empty = encode_sized(b"", 2, &mut OsRng).unwrap();
        assert_eq!(decode_sized(&empty).unwrap(), b"");

        assert!(encode_sized(&[0u8; 63], 64, &mut OsRng).is_err());
        assert!(decode_sized(&[10, 0, 1]).is_err());
    }
}
