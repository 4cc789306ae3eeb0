//! Encryption of patches for the remote store, and the paths they are stored under

use bytes::BufMut;
use rand::{CryptoRng, RngCore};

use super::CollectiveError;
use crate::model::{
    crypto::{hkdf, CryptoError, SymmetricKey, NONCE_LEN},
    id::{DeviceId, DEVICE_ID_LEN},
};

/// Leading tag of every remote patch file
pub const FILE_TAG: &[u8] = b"XXDKTXLOGHDR";
pub const FILE_VERSION: u16 = 1;
/// Length of the plaintext header that starts every remote patch file
pub const FILE_HEADER_LEN: usize = FILE_TAG.len() + DEVICE_ID_LEN + 2;
/// Name of the file each device writes its patch to
pub const STATE_FILE: &str = "state.xx";

const KEY_ID_LEN: usize = 8;

/// Secret shared by all devices that synchronize the same collective store
#[derive(Clone)]
pub struct SyncSecret([u8; 32]);

impl SyncSecret {
    pub const fn new(secret: [u8; 32]) -> Self {
        Self(secret)
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self(secret)
    }

    /// Stretch a password into a secret with argon2. `salt` must be at least 8 bytes and the
    /// same on every device
    pub fn from_password(password: &[u8], salt: &[u8]) -> Result<Self, CryptoError> {
        let mut secret = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(password, salt, &mut secret)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self(secret))
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Key that patches written by `device` are encrypted under
    pub fn device_key(&self, device: DeviceId) -> Result<SymmetricKey, CryptoError> {
        SymmetricKey::derive(&device.0, &self.0, b"collective-device-key")
    }

    /// Public identifier of this secret, used to separate stores sharing a base path
    pub fn key_id(&self) -> Result<String, CryptoError> {
        let id = hkdf::<KEY_ID_LEN>(&[], &self.0, b"collective-key-id")?;
        Ok(id.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

impl std::fmt::Debug for SyncSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SyncSecret(..)")
    }
}

/// Path of the patch file written by `device`
pub fn remote_path(base: &str, device: DeviceId, key_id: &str) -> String {
    let base = base.trim_end_matches('/');
    match base.is_empty() {
        true => format!("{}/{}/{}", device.to_hex(), key_id, STATE_FILE),
        false => format!("{}/{}/{}/{}", base, device.to_hex(), key_id, STATE_FILE),
    }
}

fn header(device: DeviceId) -> Vec<u8> {
    let mut header = Vec::with_capacity(FILE_HEADER_LEN);
    header.put_slice(FILE_TAG);
    header.put_slice(&device.0);
    header.put_u16(FILE_VERSION);
    header
}

/// Encrypt a serialized patch written by `device` into a remote file
pub fn seal_patch<R: RngCore + CryptoRng>(
    secret: &SyncSecret,
    device: DeviceId,
    patch: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, CryptoError> {
    let header = header(device);
    let nonce = SymmetricKey::nonce(rng);
    let ciphertext = secret.device_key(device)?.encrypt(&nonce, patch, &header)?;

    let mut file = Vec::with_capacity(header.len() + NONCE_LEN + ciphertext.len());
    file.put_slice(&header);
    file.put_slice(&nonce);
    file.put_slice(&ciphertext);
    Ok(file)
}

/// Check the header of a remote file claimed to be written by `device` and decrypt its
/// serialized patch
pub fn open_patch(secret: &SyncSecret, device: DeviceId, file: &[u8]) -> Result<Vec<u8>, CollectiveError> {
    if file.len() < FILE_HEADER_LEN + NONCE_LEN {
        return Err(CollectiveError::Format("Truncated patch file".to_owned()));
    }

    let (header, rest) = file.split_at(FILE_HEADER_LEN);
    if &header[..FILE_TAG.len()] != FILE_TAG {
        return Err(CollectiveError::Format("Missing patch file tag".to_owned()));
    }
    if header[FILE_TAG.len()..FILE_TAG.len() + DEVICE_ID_LEN] != device.0 {
        return Err(CollectiveError::Format(format!(
            "Patch file at the path of {} names another device",
            device
        )));
    }

    let version = u16::from_be_bytes([header[FILE_HEADER_LEN - 2], header[FILE_HEADER_LEN - 1]]);
    if version != FILE_VERSION {
        return Err(CollectiveError::Format(format!(
            "Unsupported patch file version {}",
            version
        )));
    }

    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let mut nonce_array = [0u8; NONCE_LEN];
    nonce_array.copy_from_slice(nonce);

    Ok(secret
        .device_key(device)?
        .decrypt(&nonce_array, ciphertext, header)?)
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn test_seal_open() {
        let secret = SyncSecret::generate(&mut OsRng);
        let device = DeviceId::generate(&mut OsRng);

        let file = seal_patch(&secret, device, b"patch bytes", &mut OsRng).unwrap();
        assert_eq!(&file[..FILE_TAG.len()], FILE_TAG);
        assert_eq!(&file[FILE_TAG.len()..FILE_TAG.len() + 16], &device.0);
        assert_eq!(&file[FILE_HEADER_LEN - 2..FILE_HEADER_LEN], &[0, 1]);
        assert_eq!(open_patch(&secret, device, &file).unwrap(), b"patch bytes");

        // Another secret cannot read it
        let other = SyncSecret::generate(&mut OsRng);
        assert!(matches!(
            open_patch(&other, device, &file),
            Err(CollectiveError::Crypto(CryptoError::Aead))
        ));

        // Nor does it pass as another device's file
        let imposter = DeviceId::generate(&mut OsRng);
        assert!(matches!(
            open_patch(&secret, imposter, &file),
            Err(CollectiveError::Format(_))
        ));

        let mut tampered = file.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;
        assert!(open_patch(&secret, device, &tampered).is_err());
        assert!(open_patch(&secret, device, &file[..FILE_HEADER_LEN]).is_err());
    }

    #[test]
    fn test_key_id_and_paths() {
        let secret = SyncSecret::new([3; 32]);
        let id = secret.key_id().unwrap();
        assert_eq!(id.len(), 16);
        assert_eq!(id, SyncSecret::new([3; 32]).key_id().unwrap());
        assert_ne!(id, SyncSecret::new([4; 32]).key_id().unwrap());

        let device = DeviceId([0xab; 16]);
        let hex = "ab".repeat(16);
        assert_eq!(
            remote_path("sync/", device, &id),
            format!("sync/{}/{}/state.xx", hex, id)
        );
        assert_eq!(remote_path("", device, &id), format!("{}/{}/state.xx", hex, id));
    }

    #[test]
    fn test_password_secret() {
        let a = SyncSecret::from_password(b"hunter2", b"collective salt").unwrap();
        let b = SyncSecret::from_password(b"hunter2", b"collective salt").unwrap();
        let c = SyncSecret::from_password(b"hunter3", b"collective salt").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert!(SyncSecret::from_password(b"pw", b"short").is_err());
    }
}
