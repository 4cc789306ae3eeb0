//! Symmetric primitives shared by broadcast channels and the collective store: key derivation,
//! authenticated encryption, and the fingerprint and MAC tags carried by mix cells

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use digest::Digest;
use hkdf::Hkdf;
use hmac::{Hmac, Mac as _};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::cell::{Fingerprint, Mac};

/// Length of an SHA256 hash in bytes
pub const SHA256_HASH_LEN: usize = 32;

/// Length of symmetric keys in bytes
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Length of the random nonce prepended to XChaCha20-Poly1305 ciphertexts
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag appended to every ciphertext
pub const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Authenticated decryption failed")]
    Aead,
    #[error("Message authentication code did not match")]
    Mac,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("RSA: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("Private key does not belong to this channel")]
    KeyMismatch,
}

/// Compute the SHA256 digest of each slice concatenated in order
pub fn sha256(parts: &[&[u8]]) -> [u8; SHA256_HASH_LEN] {
    let mut hash = Sha256::new();
    for part in parts {
        hash.update(part);
    }
    hash.finalize().into()
}

/// HKDF-SHA256 extract-and-expand into a fixed size output
pub fn hkdf<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N], CryptoError> {
    let mut okm = [0u8; N];
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// A 256 bit key used for XChaCha20-Poly1305 encryption and HMAC-SHA256 authentication
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub const fn new(key: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self(key)
    }

    /// Derive a key from secret input keying material using HKDF-SHA256
    pub fn derive(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<Self, CryptoError> {
        hkdf(salt, ikm, info).map(Self)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }

    /// Generate a random nonce suitable for [SymmetricKey::encrypt]
    pub fn nonce<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt the given plaintext, producing a ciphertext that is [TAG_LEN] bytes longer
    pub fn encrypt(
        &self,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
            .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::Aead)
    }

    /// Decrypt and authenticate a ciphertext produced by [SymmetricKey::encrypt]
    pub fn decrypt(
        &self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::Aead)
    }

    /// Compute the HMAC-SHA256 tag of `data` under this key, with the top bit cleared so that it
    /// fits in a mix cell's MAC field
    pub fn mac(&self, data: &[u8]) -> Mac {
        Mac::from_digest(&hmac_sha256(&self.0, data))
    }

    /// Check a tag produced by [SymmetricKey::mac] in constant time
    pub fn verify_mac(&self, data: &[u8], mac: &Mac) -> Result<(), CryptoError> {
        match bool::from(self.mac(data).0.ct_eq(&mac.0)) {
            true => Ok(()),
            false => Err(CryptoError::Mac),
        }
    }

    /// Derive the key fingerprint identifying a message encrypted with this key and nonce
    pub fn fingerprint(&self, nonce: &[u8]) -> Fingerprint {
        Fingerprint::from_digest(&sha256(&[&self.0, nonce]))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; SHA256_HASH_LEN] {
    // HMAC accepts keys of any length
    let mut mac = match <Hmac<Sha256> as hmac::Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!(),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}
