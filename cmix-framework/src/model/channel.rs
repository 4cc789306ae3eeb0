//! Broadcast channel identities: everything a member needs to derive the channel's reception ID
//! and keys, in a form that can be marshalled or shared as text

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cmix_wireformat::{FromBytes, FromBytesError, ToBytes, ToBytesError};
use rand::{CryptoRng, RngCore};
use rsa::{traits::PublicKeyParts, RsaPrivateKey, RsaPublicKey};

use super::{
    crypto::{hkdf, sha256, CryptoError, SymmetricKey, SHA256_HASH_LEN},
    id::{ReceptionId, ID_LEN, USER_ID_TYPE},
};

/// Maximum length of a channel name in bytes
pub const MAX_NAME_LEN: usize = 32;
/// Maximum length of a channel description in bytes
pub const MAX_DESCRIPTION_LEN: usize = 144;
/// Length of a channel's random salt
pub const SALT_LEN: usize = 32;
/// Length of a channel's shared secret
pub const SECRET_LEN: usize = 32;

const RECEPTION_ID_DOMAIN: &[u8] = b"xxChannelReceptionId";
const PUBLIC_KEY_HASH_DOMAIN: &[u8] = b"xxChannelRsaPubKeyHash";
const SYMMETRIC_KEY_INFO: &[u8] = b"bcast-sym";

const PRETTY_PREFIX: &str = "<XXChannel-v1:";
const PRETTY_SUFFIX: &str = ">";
const MARSHAL_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel name is {0} bytes, maximum is {MAX_NAME_LEN}")]
    NameTooLong(usize),
    #[error("Channel description is {0} bytes, maximum is {MAX_DESCRIPTION_LEN}")]
    DescriptionTooLong(usize),
    #[error("Derived reception ID does not match the recorded one")]
    ReceptionIdMismatch,
    #[error("RSA public key does not hash to the channel's public key hash")]
    PublicKeyMismatch,
    #[error("Channel has no RSA public key for asymmetric broadcasts")]
    NoPublicKey,
    #[error("Malformed channel share string: {0}")]
    PrettyPrint(String),
    #[error("Unsupported channel record version {0}")]
    Version(u8),
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Failed to encode channel: {0}")]
    Encode(#[from] ToBytesError),
    #[error("Failed to decode channel: {0}")]
    Decode(#[from] FromBytesError),
}

/// A broadcast channel as known by its members.
/// The reception ID is a deterministic function of every other field except the RSA key, which
/// is bound through its hash
#[derive(Clone)]
pub struct Channel {
    reception_id: ReceptionId,
    name: String,
    description: String,
    salt: [u8; SALT_LEN],
    rsa_pub_key_hash: [u8; SHA256_HASH_LEN],
    rsa_pub_key: Option<RsaPublicKey>,
    secret: [u8; SECRET_LEN],
}

/// Encoded form of a [Channel]
#[derive(ToBytes, FromBytes)]
struct ChannelRecord {
    version: u8,
    reception_id: ReceptionId,
    name: String,
    description: String,
    salt: [u8; SALT_LEN],
    rsa_pub_key_hash: [u8; SHA256_HASH_LEN],
    secret: [u8; SECRET_LEN],
    rsa_pub_key: Option<RsaPublicKey>,
}

impl Channel {
    /// Create a brand new channel with a fresh salt, secret, and owner keypair of `key_bits`
    /// bits. The private key is only returned here, it is never stored in the channel
    pub fn new<R: RngCore + CryptoRng>(
        name: impl Into<String>,
        description: impl Into<String>,
        key_bits: usize,
        rng: &mut R,
    ) -> Result<(Self, RsaPrivateKey), ChannelError> {
        let (name, description) = (name.into(), description.into());
        check_lengths(&name, &description)?;

        let mut salt = [0u8; SALT_LEN];
        let mut secret = [0u8; SECRET_LEN];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut secret);

        let private = RsaPrivateKey::new(rng, key_bits).map_err(CryptoError::from)?;
        let channel = Self::with_public_key(
            name,
            description,
            salt,
            secret,
            private.to_public_key(),
        )?;

        log::debug!(
            "Created channel {} '{}' with {} bit owner key",
            channel.reception_id.short(),
            channel.name,
            key_bits
        );

        Ok((channel, private))
    }

    /// Rebuild a channel from shared parameters including the owner's RSA public key
    pub fn with_public_key(
        name: impl Into<String>,
        description: impl Into<String>,
        salt: [u8; SALT_LEN],
        secret: [u8; SECRET_LEN],
        rsa_pub_key: RsaPublicKey,
    ) -> Result<Self, ChannelError> {
        let rsa_pub_key_hash = hash_public_key(&salt, &rsa_pub_key);
        let mut channel = Self::from_parts(name, description, salt, rsa_pub_key_hash, secret)?;
        channel.rsa_pub_key = Some(rsa_pub_key);
        Ok(channel)
    }

    /// Rebuild a channel from shared parameters when only the hash of the owner's key is known.
    /// Such a channel can send and receive symmetric broadcasts only
    pub fn from_parts(
        name: impl Into<String>,
        description: impl Into<String>,
        salt: [u8; SALT_LEN],
        rsa_pub_key_hash: [u8; SHA256_HASH_LEN],
        secret: [u8; SECRET_LEN],
    ) -> Result<Self, ChannelError> {
        let (name, description) = (name.into(), description.into());
        check_lengths(&name, &description)?;

        let reception_id =
            derive_reception_id(&name, &description, &salt, &rsa_pub_key_hash, &secret)?;

        Ok(Self {
            reception_id,
            name,
            description,
            salt,
            rsa_pub_key_hash,
            rsa_pub_key: None,
            secret,
        })
    }

    #[inline]
    pub const fn reception_id(&self) -> &ReceptionId {
        &self.reception_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    pub const fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    #[inline]
    pub const fn rsa_pub_key_hash(&self) -> &[u8; SHA256_HASH_LEN] {
        &self.rsa_pub_key_hash
    }

    /// Get the owner's public key, failing if this channel was built without one
    pub fn rsa_pub_key(&self) -> Result<&RsaPublicKey, ChannelError> {
        self.rsa_pub_key.as_ref().ok_or(ChannelError::NoPublicKey)
    }

    /// Derive the key used for symmetric broadcasts on this channel
    pub fn symmetric_key(&self) -> Result<SymmetricKey, ChannelError> {
        Ok(SymmetricKey::new(hkdf(
            &self.salt,
            &self.secret,
            SYMMETRIC_KEY_INFO,
        )?))
    }

    /// Recompute the reception ID and public key hash from this channel's fields and check them
    /// against the recorded values
    pub fn verify(&self) -> Result<(), ChannelError> {
        if let Some(ref key) = self.rsa_pub_key {
            if hash_public_key(&self.salt, key) != self.rsa_pub_key_hash {
                return Err(ChannelError::PublicKeyMismatch);
            }
        }

        let derived = derive_reception_id(
            &self.name,
            &self.description,
            &self.salt,
            &self.rsa_pub_key_hash,
            &self.secret,
        )?;

        match derived == self.reception_id {
            true => Ok(()),
            false => Err(ChannelError::ReceptionIdMismatch),
        }
    }

    /// Encode every channel parameter so that [Channel::unmarshal] can recreate it
    pub fn marshal(&self) -> Result<Vec<u8>, ChannelError> {
        let record = ChannelRecord {
            version: MARSHAL_VERSION,
            reception_id: self.reception_id,
            name: self.name.clone(),
            description: self.description.clone(),
            salt: self.salt,
            rsa_pub_key_hash: self.rsa_pub_key_hash,
            secret: self.secret,
            rsa_pub_key: self.rsa_pub_key.clone(),
        };

        Ok(record.encode_to_vec()?)
    }

    /// Decode a channel produced by [Channel::marshal], verifying the recorded reception ID
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, ChannelError> {
        let record = ChannelRecord::decode_from_slice(bytes)?;
        if record.version != MARSHAL_VERSION {
            return Err(ChannelError::Version(record.version));
        }

        check_lengths(&record.name, &record.description)?;
        let channel = Self {
            reception_id: record.reception_id,
            name: record.name,
            description: record.description,
            salt: record.salt,
            rsa_pub_key_hash: record.rsa_pub_key_hash,
            rsa_pub_key: record.rsa_pub_key,
            secret: record.secret,
        };

        channel.verify()?;
        Ok(channel)
    }

    /// Render the channel as a single-line share string. Name and description are URL-safe
    /// base64 so that they may contain the separators
    pub fn pretty_print(&self) -> Result<String, ChannelError> {
        let key = match self.rsa_pub_key {
            Some(ref key) => URL_SAFE_NO_PAD.encode(key.encode_to_vec()?),
            None => String::new(),
        };

        Ok(format!(
            "{}{},description:{},secrets:{},{},{},{}{}",
            PRETTY_PREFIX,
            URL_SAFE_NO_PAD.encode(&self.name),
            URL_SAFE_NO_PAD.encode(&self.description),
            URL_SAFE_NO_PAD.encode(self.salt),
            URL_SAFE_NO_PAD.encode(self.rsa_pub_key_hash),
            URL_SAFE_NO_PAD.encode(self.secret),
            key,
            PRETTY_SUFFIX,
        ))
    }

    /// Parse a share string produced by [Channel::pretty_print]
    pub fn from_pretty_print(share: &str) -> Result<Self, ChannelError> {
        let body = share
            .trim()
            .strip_prefix(PRETTY_PREFIX)
            .and_then(|s| s.strip_suffix(PRETTY_SUFFIX))
            .ok_or_else(|| ChannelError::PrettyPrint("missing channel delimiters".to_owned()))?;

        let fields = body.split(',').collect::<Vec<_>>();
        let [name, description, salt, key_hash, secret, key] = fields[..] else {
            return Err(ChannelError::PrettyPrint(format!(
                "expected 6 fields, found {}",
                fields.len()
            )));
        };

        let description = description
            .strip_prefix("description:")
            .ok_or_else(|| ChannelError::PrettyPrint("missing description".to_owned()))?;
        let salt = salt
            .strip_prefix("secrets:")
            .ok_or_else(|| ChannelError::PrettyPrint("missing secrets".to_owned()))?;

        let name = decode_text(name)?;
        let description = decode_text(description)?;
        let salt = decode_array::<SALT_LEN>(salt)?;
        let key_hash = decode_array::<SHA256_HASH_LEN>(key_hash)?;
        let secret = decode_array::<SECRET_LEN>(secret)?;

        let mut channel = Self::from_parts(name, description, salt, key_hash, secret)?;
        if !key.is_empty() {
            let der = decode_b64(key)?;
            channel.rsa_pub_key = Some(RsaPublicKey::decode_from_slice(&der)?);
            channel.verify()?;
        }

        Ok(channel)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("reception_id", &self.reception_id)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("asymmetric", &self.rsa_pub_key.is_some())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.reception_id == other.reception_id && self.rsa_pub_key == other.rsa_pub_key
    }
}

/// Derive a channel's reception ID from its public parameters and shared secret
pub fn derive_reception_id(
    name: &str,
    description: &str,
    salt: &[u8; SALT_LEN],
    rsa_pub_key_hash: &[u8; SHA256_HASH_LEN],
    secret: &[u8; SECRET_LEN],
) -> Result<ReceptionId, ChannelError> {
    // Length-prefix the variable fields so that moving bytes between them changes the ID
    let mut info = Vec::with_capacity(
        RECEPTION_ID_DOMAIN.len() + 4 + name.len() + description.len() + SHA256_HASH_LEN,
    );
    info.extend_from_slice(RECEPTION_ID_DOMAIN);
    info.extend_from_slice(&(name.len() as u16).to_le_bytes());
    info.extend_from_slice(name.as_bytes());
    info.extend_from_slice(&(description.len() as u16).to_le_bytes());
    info.extend_from_slice(description.as_bytes());
    info.extend_from_slice(rsa_pub_key_hash);

    let body: [u8; ID_LEN - 1] = hkdf(salt, secret, &info)?;
    Ok(ReceptionId::new(body, USER_ID_TYPE))
}

/// Hash of an RSA public key, keyed with the channel salt
pub fn hash_public_key(salt: &[u8; SALT_LEN], key: &RsaPublicKey) -> [u8; SHA256_HASH_LEN] {
    sha256(&[
        PUBLIC_KEY_HASH_DOMAIN,
        salt,
        &key.n().to_bytes_be(),
        &key.e().to_bytes_be(),
    ])
}

fn check_lengths(name: &str, description: &str) -> Result<(), ChannelError> {
    if name.len() > MAX_NAME_LEN {
        return Err(ChannelError::NameTooLong(name.len()));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(ChannelError::DescriptionTooLong(description.len()));
    }
    Ok(())
}

fn decode_b64(field: &str) -> Result<Vec<u8>, ChannelError> {
    URL_SAFE_NO_PAD
        .decode(field)
        .map_err(|e| ChannelError::PrettyPrint(format!("invalid base64: {}", e)))
}

fn decode_text(field: &str) -> Result<String, ChannelError> {
    String::from_utf8(decode_b64(field)?)
        .map_err(|e| ChannelError::PrettyPrint(format!("invalid UTF-8: {}", e)))
}

fn decode_array<const N: usize>(field: &str) -> Result<[u8; N], ChannelError> {
    decode_b64(field)?.try_into().map_err(|v: Vec<u8>| {
        ChannelError::PrettyPrint(format!("expected {} bytes, found {}", N, v.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn params() -> ([u8; 32], [u8; 32], [u8; 32]) {
        let mut salt = [0u8; 32];
        let mut hash = [0u8; 32];
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut hash);
        OsRng.fill_bytes(&mut secret);
        (salt, hash, secret)
    }

    #[test]
    fn test_reception_id_deterministic() {
        let (salt, hash, secret) = params();
        let a = Channel::from_parts("chan", "d", salt, hash, secret).unwrap();
        let b = Channel::from_parts("chan", "d", salt, hash, secret).unwrap();
        assert_eq!(a.reception_id(), b.reception_id());
        assert_eq!(a.reception_id().id_type(), USER_ID_TYPE);
    }

    #[test]
    fn test_every_field_changes_id() {
        let (salt, hash, secret) = params();
        let base = *Channel::from_parts("chan", "d", salt, hash, secret)
            .unwrap()
            .reception_id();

        let mut flipped = salt;
        flipped[0] ^= 1;
        let variants = [
            Channel::from_parts("chan2", "d", salt, hash, secret),
            Channel::from_parts("chan", "d2", salt, hash, secret),
            Channel::from_parts("cha", "nd", salt, hash, secret),
            Channel::from_parts("chan", "d", flipped, hash, secret),
            Channel::from_parts("chan", "d", salt, flipped, secret),
            Channel::from_parts("chan", "d", salt, hash, flipped),
        ];

        for variant in variants {
            assert_ne!(*variant.unwrap().reception_id(), base);
        }
    }

    #[test]
    fn test_length_limits() {
        let (salt, hash, secret) = params();
        assert!(matches!(
            Channel::from_parts("x".repeat(33), "", salt, hash, secret),
            Err(ChannelError::NameTooLong(33))
        ));
        assert!(matches!(
            Channel::from_parts("", "x".repeat(145), salt, hash, secret),
            Err(ChannelError::DescriptionTooLong(145))
        ));
        assert!(Channel::from_parts("x".repeat(32), "x".repeat(144), salt, hash, secret).is_ok());
    }

    #[test]
    fn test_marshal_and_pretty_print() {
        let (channel, _) = Channel::new("chan, with commas", "a: b", 1024, &mut OsRng).unwrap();

        let unmarshalled = Channel::unmarshal(&channel.marshal().unwrap()).unwrap();
        assert_eq!(unmarshalled, channel);
        assert_eq!(unmarshalled.name(), "chan, with commas");

        let share = channel.pretty_print().unwrap();
        assert!(share.starts_with(PRETTY_PREFIX));
        let parsed = Channel::from_pretty_print(&share).unwrap();
        assert_eq!(parsed, channel);
        assert_eq!(parsed.description(), "a: b");
        assert!(parsed.rsa_pub_key().is_ok());
    }

    #[test]
    fn test_unmarshal_rejects_tampering() {
        let (salt, hash, secret) = params();
        let channel = Channel::from_parts("chan", "d", salt, hash, secret).unwrap();
        let mut bytes = channel.marshal().unwrap();
        // The last byte is the absent public key tag, the secret sits right before it
        let idx = bytes.len() - 2;
        bytes[idx] ^= 0xff;
        assert!(matches!(
            Channel::unmarshal(&bytes),
            Err(ChannelError::ReceptionIdMismatch)
        ));
    }

    #[test]
    fn test_symmetric_only_channel() {
        let (salt, hash, secret) = params();
        let channel = Channel::from_parts("chan", "d", salt, hash, secret).unwrap();
        assert!(matches!(channel.rsa_pub_key(), Err(ChannelError::NoPublicKey)));
        let share = channel.pretty_print().unwrap();
        assert!(Channel::from_pretty_print(&share).unwrap().rsa_pub_key().is_err());
    }
}
