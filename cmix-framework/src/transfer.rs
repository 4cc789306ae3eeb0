//! Bookkeeping of the key fingerprints that tag the parts of a file transfer

use std::collections::HashMap;

use cmix_wireformat::{FromBytes, ToBytes};
use hibitset::{BitSet, BitSetLike};

use crate::model::{
    cell::Fingerprint,
    crypto::{hmac_sha256, SymmetricKey},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("Fingerprint does not belong to this transfer")]
    UnknownFingerprint,
    #[error("Fingerprint {0} was already used")]
    AlreadyUsed(u16),
    #[error("All {0} fingerprints have been used")]
    Exhausted(u16),
}

/// Persisted form of a [FingerprintVector]
#[derive(Clone, Debug, PartialEq, Eq, ToBytes, FromBytes)]
pub struct FingerprintRecord {
    pub key: [u8; 32],
    pub num_fps: u16,
    pub used: Vec<u16>,
}

/// The sequence of fingerprints derived from a transfer key. Each one tags exactly one cell,
/// so every fingerprint may be used at most once
pub struct FingerprintVector {
    key: SymmetricKey,
    fps: Vec<Fingerprint>,
    lookup: HashMap<Fingerprint, u16>,
    used: BitSet,
}

/// Derive the fingerprint of part `index` of a transfer
pub fn transfer_fingerprint(key: &SymmetricKey, index: u16) -> Fingerprint {
    let mut data = b"transferKeyFingerprint".to_vec();
    data.extend_from_slice(&index.to_be_bytes());
    Fingerprint::from_digest(&hmac_sha256(key.as_bytes(), &data))
}

impl FingerprintVector {
    pub fn new(key: SymmetricKey, num_fps: u16) -> Self {
        let fps = (0..num_fps)
            .map(|i| transfer_fingerprint(&key, i))
            .collect::<Vec<_>>();
        let lookup = fps
            .iter()
            .enumerate()
            .map(|(i, fp)| (*fp, i as u16))
            .collect();

        Self {
            key,
            fps,
            lookup,
            used: BitSet::new(),
        }
    }

    #[inline]
    pub const fn key(&self) -> &SymmetricKey {
        &self.key
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.fps.len() as u16
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fps.is_empty()
    }

    pub fn fingerprint(&self, index: u16) -> Option<Fingerprint> {
        self.fps.get(index as usize).copied()
    }

    pub fn is_used(&self, index: u16) -> bool {
        self.used.contains(index as u32)
    }

    pub fn used_count(&self) -> usize {
        (&self.used).iter().count()
    }

    /// Take the first fingerprint not used yet, for tagging an outgoing part
    pub fn next_unused(&mut self) -> Result<(u16, Fingerprint), TransferError> {
        let index = (0..self.len())
            .find(|&i| !self.is_used(i))
            .ok_or(TransferError::Exhausted(self.len()))?;
        self.used.add(index as u32);
        Ok((index, self.fps[index as usize]))
    }

    /// Resolve the fingerprint of a received part to its index, marking it as used
    pub fn use_fingerprint(&mut self, fp: &Fingerprint) -> Result<u16, TransferError> {
        let index = *self
            .lookup
            .get(fp)
            .ok_or(TransferError::UnknownFingerprint)?;
        match self.used.add(index as u32) {
            true => Err(TransferError::AlreadyUsed(index)),
            false => Ok(index),
        }
    }

    pub fn record(&self) -> FingerprintRecord {
        FingerprintRecord {
            key: *self.key.as_bytes(),
            num_fps: self.len(),
            used: (&self.used).iter().map(|i| i as u16).collect(),
        }
    }

    pub fn from_record(record: FingerprintRecord) -> Self {
        let mut vector = Self::new(SymmetricKey::new(record.key), record.num_fps);
        for index in record.used.into_iter().filter(|&i| i < record.num_fps) {
            vector.used.add(index as u32);
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(n: u16) -> FingerprintVector {
        FingerprintVector::new(SymmetricKey::new([8; 32]), n)
    }

    #[test]
    fn test_each_fingerprint_used_once() {
        let mut sender = vector(3);
        let mut receiver = vector(3);

        for expected in 0..3 {
            let (index, fp) = sender.next_unused().unwrap();
            assert_eq!(index, expected);
            assert_eq!(receiver.use_fingerprint(&fp), Ok(index));
            assert_eq!(receiver.use_fingerprint(&fp), Err(TransferError::AlreadyUsed(index)));
        }

        assert_eq!(sender.next_unused(), Err(TransferError::Exhausted(3)));
        assert_eq!(receiver.used_count(), 3);
    }

    #[test]
    fn test_foreign_fingerprint() {
        let mut ours = vector(4);
        let theirs = FingerprintVector::new(SymmetricKey::new([9; 32]), 4);
        assert_eq!(
            ours.use_fingerprint(&theirs.fingerprint(0).unwrap()),
            Err(TransferError::UnknownFingerprint)
        );
        assert_eq!(ours.fingerprint(4), None);
        assert_ne!(ours.fingerprint(0), ours.fingerprint(1));
    }

    #[test]
    fn test_record_restores_usage() {
        let mut original = vector(10);
        original.use_fingerprint(&original.fingerprint(7).unwrap()).unwrap();
        original.next_unused().unwrap();

        let bytes = original.record().encode_to_vec().unwrap();
        let mut restored =
            FingerprintVector::from_record(FingerprintRecord::decode_from_slice(&bytes).unwrap());
        assert!(restored.is_used(0));
        assert!(restored.is_used(7));
        assert_eq!(restored.next_unused().unwrap().0, 1);
    }
}
