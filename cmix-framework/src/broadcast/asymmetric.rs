//! Multicast RSA broadcasts: only the holder of the channel owner's private key can produce a
//! cell, every member holding the public key can read it.
//!
//! The payload is framed in a single RSA block `0x00 ‖ check ‖ len ‖ payload ‖ pad` which is
//! raised to the private exponent. The block fills the first `keySize` bytes of the contents and
//! the rest of the cell is random padding. `check` is a truncated digest binding the block to the
//! channel; the key fingerprint is derived from it so that a block produced with any other key
//! fails fingerprint matching.

use rand::{CryptoRng, RngCore};
use rsa::{
    traits::{PrivateKeyParts, PublicKeyParts},
    BigUint, RsaPrivateKey, RsaPublicKey,
};
use subtle::ConstantTimeEq;

use super::{BroadcastError, Method};
use crate::model::{
    cell::{CellParts, Fingerprint, Mac, MixCell, Service},
    channel::Channel,
    crypto::{hmac_sha256, sha256, CryptoError},
};

/// Length of the channel-binding check value inside the RSA block
const CHECK_LEN: usize = 16;
/// Leading zero byte, check value, and payload length
pub const BLOCK_OVERHEAD: usize = 1 + CHECK_LEN + 2;

const CHECK_DOMAIN: &[u8] = b"xxAsymmetricBroadcastCheck";
const FINGERPRINT_DOMAIN: &[u8] = b"xxAsymmetricBroadcastFingerprint";

/// Largest payload that fits in a single RSA block under `key`.
///
/// This is `key.size() - 19` ([BLOCK_OVERHEAD]): besides the two length bytes the block carries a
/// leading zero byte and the channel check value, so the limit is 17 bytes below `key.size() - 2`
#[inline]
pub fn max_payload(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(BLOCK_OVERHEAD)
}

fn check_value(channel: &Channel, tail: &[u8]) -> [u8; CHECK_LEN] {
    let digest = sha256(&[CHECK_DOMAIN, channel.reception_id().as_bytes(), tail]);
    let mut check = [0u8; CHECK_LEN];
    check.copy_from_slice(&digest[..CHECK_LEN]);
    check
}

fn fingerprint(channel: &Channel, check: &[u8]) -> Fingerprint {
    Fingerprint::from_digest(&sha256(&[
        FINGERPRINT_DOMAIN,
        channel.reception_id().as_bytes(),
        check,
    ]))
}

fn mac(channel: &Channel, block: &[u8]) -> Mac {
    Mac::from_digest(&hmac_sha256(channel.rsa_pub_key_hash(), block))
}

/// Big-endian encoding of `value` left padded with zeros to exactly `len` bytes
fn to_fixed_be(value: &BigUint, len: usize) -> Result<Vec<u8>, BroadcastError> {
    let bytes = value.to_bytes_be();
    if bytes.len() > len {
        return Err(BroadcastError::Format(format!(
            "RSA value of {} bytes exceeds modulus size {}",
            bytes.len(),
            len
        )));
    }

    let mut fixed = vec![0u8; len - bytes.len()];
    fixed.extend_from_slice(&bytes);
    Ok(fixed)
}

/// Produce a cell readable by every holder of the channel's public key
pub(crate) fn encrypt<R: RngCore + CryptoRng>(
    channel: &Channel,
    private: &RsaPrivateKey,
    payload: &[u8],
    contents_len: usize,
    rng: &mut R,
) -> Result<CellParts, BroadcastError> {
    let public = channel.rsa_pub_key()?;
    if private.to_public_key() != *public {
        return Err(CryptoError::KeyMismatch.into());
    }

    let key_size = public.size();
    let max = max_payload(public);
    if payload.len() > max {
        return Err(BroadcastError::BadSize {
            len: payload.len(),
            max,
        });
    }
    if contents_len < key_size {
        return Err(BroadcastError::BadSize {
            len: key_size,
            max: contents_len,
        });
    }

    let mut block = vec![0u8; key_size];
    let body = 1 + CHECK_LEN;
    block[body..body + 2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    block[BLOCK_OVERHEAD..BLOCK_OVERHEAD + payload.len()].copy_from_slice(payload);
    rng.fill_bytes(&mut block[BLOCK_OVERHEAD + payload.len()..]);

    let check = check_value(channel, &block[body..]);
    block[1..body].copy_from_slice(&check);

    // The zero leading byte keeps the block below the modulus
    let m = BigUint::from_bytes_be(&block);
    let c = m.modpow(private.d(), private.n());
    let ciphertext = to_fixed_be(&c, key_size)?;

    let mut contents = Vec::with_capacity(contents_len);
    contents.extend_from_slice(&ciphertext);
    contents.resize(contents_len, 0);
    rng.fill_bytes(&mut contents[key_size..]);

    Ok(CellParts {
        key_fp: fingerprint(channel, &check),
        mac: mac(channel, &ciphertext),
        contents,
        service: Service::new(
            channel.reception_id().as_bytes().to_vec(),
            Method::Asymmetric.tag(),
        ),
    })
}

/// Recover the payload of an asymmetric broadcast cell using the channel's public key
pub(crate) fn decrypt(channel: &Channel, cell: &MixCell) -> Result<Vec<u8>, BroadcastError> {
    let public = channel.rsa_pub_key()?;
    let key_size = public.size();
    if cell.contents.len() < key_size {
        return Err(BroadcastError::Format(format!(
            "asymmetric cell contents of {} bytes cannot hold a {} byte RSA block",
            cell.contents.len(),
            key_size
        )));
    }

    let ciphertext = &cell.contents[..key_size];
    let expected_mac = mac(channel, ciphertext);
    if !bool::from(expected_mac.0.ct_eq(&cell.mac.0)) {
        return Err(CryptoError::Mac.into());
    }

    let c = BigUint::from_bytes_be(ciphertext);
    if &c >= public.n() {
        return Err(BroadcastError::Format(
            "RSA ciphertext is not below the modulus".to_owned(),
        ));
    }

    let block = to_fixed_be(&c.modpow(public.e(), public.n()), key_size)?;
    let body = 1 + CHECK_LEN;
    if fingerprint(channel, &block[1..body]) != cell.key_fp {
        return Err(BroadcastError::Format(
            "key fingerprint does not match channel".to_owned(),
        ));
    }

    if block[0] != 0 || check_value(channel, &block[body..])[..] != block[1..body] {
        return Err(BroadcastError::Crypto(CryptoError::Mac));
    }

    let len = u16::from_be_bytes([block[body], block[body + 1]]) as usize;
    if len > max_payload(public) {
        return Err(BroadcastError::Format(format!(
            "asymmetric payload length {} exceeds block capacity",
            len
        )));
    }

    Ok(block[BLOCK_OVERHEAD..BLOCK_OVERHEAD + len].to_vec())
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::model::cell::{contents_len, DEFAULT_CELL_SIZE};

    fn cell(parts: CellParts) -> MixCell {
        parts.into_cell().0
    }

    #[test]
    fn test_roundtrip_and_padding() {
        let (channel, private) = Channel::new("chan", "d", 1024, &mut OsRng).unwrap();
        let len = contents_len(DEFAULT_CELL_SIZE);
        let max = max_payload(channel.rsa_pub_key().unwrap());
        assert_eq!(max, 128 - 19);

        for size in [0, 1, 9, max] {
            let payload = vec![0x5au8; size];
            let mut received = cell(encrypt(&channel, &private, &payload, len, &mut OsRng).unwrap());
            assert_eq!(received.contents.len(), len);
            assert_eq!(decrypt(&channel, &received).unwrap(), payload);

            // Bytes past the RSA block are padding only
            for byte in &mut received.contents[128..] {
                *byte = !*byte;
            }
            assert_eq!(decrypt(&channel, &received).unwrap(), payload);
        }
    }

    #[test]
    fn test_too_long() {
        let (channel, private) = Channel::new("chan", "d", 1024, &mut OsRng).unwrap();
        let max = max_payload(channel.rsa_pub_key().unwrap());
        assert!(matches!(
            encrypt(&channel, &private, &vec![0u8; max + 1], 2000, &mut OsRng),
            Err(BroadcastError::BadSize { .. })
        ));
    }

    #[test]
    fn test_forged_key_rejected() {
        let (channel, _) = Channel::new("chan", "d", 1024, &mut OsRng).unwrap();
        let forger = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        assert!(matches!(
            encrypt(&channel, &forger, b"x", 2000, &mut OsRng),
            Err(BroadcastError::Crypto(CryptoError::KeyMismatch))
        ));

        // A forger that bypasses the key check produces a cell whose fingerprint never matches
        let forged_channel = Channel::with_public_key(
            channel.name(),
            channel.description(),
            *channel.salt(),
            [0u8; 32],
            forger.to_public_key(),
        )
        .unwrap();
        let mut parts = encrypt(&forged_channel, &forger, b"x", 2000, &mut OsRng).unwrap();
        parts.mac = mac(&channel, &parts.contents[..128]);
        assert!(matches!(
            decrypt(&channel, &cell(parts)),
            Err(BroadcastError::Format(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let (channel, private) = Channel::new("chan", "d", 1024, &mut OsRng).unwrap();
        let mut received = cell(encrypt(&channel, &private, b"hi", 2000, &mut OsRng).unwrap());
        received.contents[5] ^= 0x10;
        assert!(matches!(
            decrypt(&channel, &received),
            Err(BroadcastError::Crypto(_))
        ));
    }
}
