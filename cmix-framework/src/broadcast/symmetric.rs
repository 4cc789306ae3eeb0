//! Symmetric broadcasts: every member holding the channel secret can both send and read.
//!
//! Cell layout: `keyFP = fingerprint(kS, nonce)`, `mac = MAC(kS, contents)`,
//! `contents = nonce ‖ AEAD(kS, nonce, payload, aad = receptionID)`

use rand::{CryptoRng, RngCore};

use super::{BroadcastError, Method};
use crate::model::{
    cell::{CellParts, MixCell, Service},
    channel::Channel,
    crypto::{SymmetricKey, NONCE_LEN, TAG_LEN},
};

/// Exact payload length that fills a cell with `contents_len` bytes of contents
#[inline]
pub const fn max_payload(contents_len: usize) -> usize {
    contents_len.saturating_sub(NONCE_LEN + TAG_LEN)
}

/// Encrypt a payload of exactly [max_payload] bytes into a cell for `channel`
pub(crate) fn encrypt<R: RngCore + CryptoRng>(
    channel: &Channel,
    payload: &[u8],
    contents_len: usize,
    rng: &mut R,
) -> Result<CellParts, BroadcastError> {
    let expected = max_payload(contents_len);
    if payload.len() != expected || expected == 0 {
        return Err(BroadcastError::BadSize {
            len: payload.len(),
            max: expected,
        });
    }

    let key = channel.symmetric_key()?;
    let nonce = SymmetricKey::nonce(rng);
    let ciphertext = key.encrypt(&nonce, payload, channel.reception_id().as_bytes())?;

    let mut contents = Vec::with_capacity(contents_len);
    contents.extend_from_slice(&nonce);
    contents.extend_from_slice(&ciphertext);

    Ok(CellParts {
        key_fp: key.fingerprint(&nonce),
        mac: key.mac(&contents),
        contents,
        service: Service::new(
            channel.reception_id().as_bytes().to_vec(),
            Method::Symmetric.tag(),
        ),
    })
}

/// Authenticate and decrypt a symmetric broadcast cell
pub(crate) fn decrypt(channel: &Channel, cell: &MixCell) -> Result<Vec<u8>, BroadcastError> {
    if cell.contents.len() < NONCE_LEN + TAG_LEN {
        return Err(BroadcastError::Format(format!(
            "symmetric cell contents of {} bytes cannot hold a nonce and tag",
            cell.contents.len()
        )));
    }

    let key = channel.symmetric_key()?;
    key.verify_mac(&cell.contents, &cell.mac)?;

    let (nonce, ciphertext) = cell.contents.split_at(NONCE_LEN);
    if key.fingerprint(nonce) != cell.key_fp {
        return Err(BroadcastError::Format(
            "key fingerprint does not match channel".to_owned(),
        ));
    }

    let mut nonce_buf = [0u8; NONCE_LEN];
    nonce_buf.copy_from_slice(nonce);
    Ok(key.decrypt(&nonce_buf, ciphertext, channel.reception_id().as_bytes())?)
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::model::cell::{contents_len, DEFAULT_CELL_SIZE};

    fn channel() -> Channel {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Channel::from_parts("chan", "d", [1u8; 32], [2u8; 32], secret).unwrap()
    }

    fn cell(parts: CellParts) -> MixCell {
        parts.into_cell().0
    }

    #[test]
    fn test_roundtrip() {
        let channel = channel();
        let len = contents_len(DEFAULT_CELL_SIZE);
        let mut payload = vec![0u8; max_payload(len)];
        OsRng.fill_bytes(&mut payload);

        let parts = encrypt(&channel, &payload, len, &mut OsRng).unwrap();
        assert_eq!(parts.contents.len(), len);
        assert_eq!(parts.service.tag, Method::Symmetric.tag());
        assert_eq!(decrypt(&channel, &cell(parts)).unwrap(), payload);
    }

    #[test]
    fn test_bad_size() {
        let channel = channel();
        let len = contents_len(DEFAULT_CELL_SIZE);
        for size in [0, 1, max_payload(len) - 1, max_payload(len) + 1] {
            assert!(matches!(
                encrypt(&channel, &vec![0u8; size], len, &mut OsRng),
                Err(BroadcastError::BadSize { .. })
            ));
        }
    }

    #[test]
    fn test_any_flipped_bit_fails_mac() {
        let channel = channel();
        let len = contents_len(1024);
        let payload = vec![9u8; max_payload(len)];
        let original = cell(encrypt(&channel, &payload, len, &mut OsRng).unwrap());

        for byte in [0, NONCE_LEN - 1, NONCE_LEN, len / 2, len - 1] {
            for bit in 0..8 {
                let mut tampered = original.clone();
                tampered.contents[byte] ^= 1 << bit;
                assert!(matches!(
                    decrypt(&channel, &tampered),
                    Err(BroadcastError::Crypto(_))
                ));
            }
        }
    }

    #[test]
    fn test_other_channel_rejects() {
        let (a, b) = (channel(), channel());
        let len = contents_len(1024);
        let parts = encrypt(&a, &vec![1u8; max_payload(len)], len, &mut OsRng).unwrap();
        assert!(decrypt(&b, &cell(parts)).is_err());
    }
}
