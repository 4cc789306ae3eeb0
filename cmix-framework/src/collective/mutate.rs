use bitflags::bitflags;
use cmix_wireformat::{FromBytes, ToBytes};

use crate::model::id::DeviceId;

bitflags! {
    /// Flag byte written with every element of a serialized patch
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MutateFlags: u8 {
        const DELETION = 0x01;
    }
}

/// A single timestamped change to a key: either a new value or a deletion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutate {
    /// Wall clock time the change was made at, in nanoseconds since the unix epoch
    pub timestamp_ns: i64,
    /// New value of the key, `None` for a deletion
    pub value: Option<Vec<u8>>,
}

impl Mutate {
    pub fn write(timestamp_ns: i64, value: Vec<u8>) -> Self {
        Self {
            timestamp_ns,
            value: Some(value),
        }
    }

    pub const fn delete(timestamp_ns: i64) -> Self {
        Self {
            timestamp_ns,
            value: None,
        }
    }

    #[inline]
    pub const fn is_deletion(&self) -> bool {
        self.value.is_none()
    }

    pub fn flags(&self) -> MutateFlags {
        match self.is_deletion() {
            true => MutateFlags::DELETION,
            false => MutateFlags::empty(),
        }
    }
}

/// Provenance of the value currently stored under a synced key, persisted beside it so that
/// every device orders concurrent changes the same way
#[derive(Clone, Copy, Debug, PartialEq, Eq, ToBytes, FromBytes)]
pub struct Version {
    pub timestamp_ns: i64,
    /// Device that originally made the change
    pub device: DeviceId,
    pub deletion: bool,
}

impl Version {
    pub fn of(mutate: &Mutate, device: DeviceId) -> Self {
        Self {
            timestamp_ns: mutate.timestamp_ns,
            device,
            deletion: mutate.is_deletion(),
        }
    }

    /// Last-writer-wins: a later timestamp wins, a tie goes to the lexicographically smaller
    /// device, and a change identical in both replaces the current one
    pub fn supersedes(&self, current: Option<&Version>) -> bool {
        match current {
            None => true,
            Some(current) => {
                self.timestamp_ns > current.timestamp_ns
                    || (self.timestamp_ns == current.timestamp_ns && self.device <= current.device)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(ts: i64, dev: u8) -> Version {
        Version {
            timestamp_ns: ts,
            device: DeviceId([dev; 16]),
            deletion: false,
        }
    }

    #[test]
    fn test_flags() {
        assert_eq!(Mutate::delete(1).flags(), MutateFlags::DELETION);
        assert!(Mutate::write(1, vec![]).flags().is_empty());
        assert!(!Mutate::write(1, vec![]).is_deletion());
    }

    #[test]
    fn test_supersedes() {
        assert!(version(1, 9).supersedes(None));
        assert!(version(2, 9).supersedes(Some(&version(1, 1))));
        assert!(!version(1, 1).supersedes(Some(&version(2, 9))));

        // Ties go to the smaller device, regardless of arrival order
        assert!(version(5, 1).supersedes(Some(&version(5, 2))));
        assert!(!version(5, 2).supersedes(Some(&version(5, 1))));
        assert!(version(5, 3).supersedes(Some(&version(5, 3))));
    }

    #[test]
    fn test_version_record() {
        let v = Version {
            timestamp_ns: -42,
            device: DeviceId([7; 16]),
            deletion: true,
        };
        let bytes = v.encode_to_vec().unwrap();
        assert_eq!(bytes.len(), 8 + 16 + 1);
        assert_eq!(Version::decode_from_slice(&bytes).unwrap(), v);
    }
}
