//! Identifiers used to address recipients, rounds, and synchronizing devices

use std::fmt;

use cmix_wireformat::{FromBytes, ToBytes};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length in bytes of a [ReceptionId], including the trailing type byte
pub const ID_LEN: usize = 33;

/// Type byte appended to reception identities derived for users and channels
pub const USER_ID_TYPE: u8 = 0x03;

/// Length in bytes of a [DeviceId]
pub const DEVICE_ID_LEN: usize = 16;

/// Network address that messages are delivered to - 32 bytes of identity followed by a single
/// type byte
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ToBytes, FromBytes)]
pub struct ReceptionId(pub [u8; ID_LEN]);

impl ReceptionId {
    /// Build a reception ID from 32 bytes of identity and a type byte
    pub fn new(body: [u8; ID_LEN - 1], ty: u8) -> Self {
        let mut id = [0u8; ID_LEN];
        id[..ID_LEN - 1].copy_from_slice(&body);
        id[ID_LEN - 1] = ty;
        Self(id)
    }

    /// Generate a random user reception ID
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut body = [0u8; ID_LEN - 1];
        rng.fill_bytes(&mut body);
        Self::new(body, USER_ID_TYPE)
    }

    /// Get the type byte of this ID
    #[inline]
    pub const fn id_type(&self) -> u8 {
        self.0[ID_LEN - 1]
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Get a short display string for this ID suitable for logging
    pub fn short(&self) -> impl fmt::Display + '_ {
        struct Short<'a>(&'a [u8]);
        impl fmt::Display for Short<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        Short(&self.0[..4])
    }
}

impl fmt::LowerHex for ReceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ReceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReceptionId({}…)", self.short())
    }
}

impl fmt::Display for ReceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

/// Short-lived routing identity a message was sent to, derived by the mix network from a
/// [ReceptionId]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, ToBytes, FromBytes)]
pub struct EphemeralId(pub i64);

/// Identifier of a mix network round
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, ToBytes, FromBytes)]
pub struct RoundId(pub u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round {}", self.0)
    }
}

/// Randomly generated identity of a single device that shares a collective store.
/// Ordered lexicographically by its bytes, which decides timestamp ties between devices
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ToBytes, FromBytes)]
pub struct DeviceId(pub [u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Generate a new random device ID
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut id = [0u8; DEVICE_ID_LEN];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    /// Lowercase hexadecimal rendering, used as a path component in remote storage
    pub fn to_hex(&self) -> String {
        format!("{:x}", self)
    }

    /// Parse a device ID from the output of [DeviceId::to_hex]
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != DEVICE_ID_LEN * 2 || !hex.is_ascii() {
            return None;
        }

        let mut id = [0u8; DEVICE_ID_LEN];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Self(id))
    }
}

impl fmt::LowerHex for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({:x})", self)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid device ID '{}'", hex)))
    }
}
