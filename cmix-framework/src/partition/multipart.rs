//! Reassembly of messages whose parts may arrive in any order

use std::{collections::HashMap, time::Duration};

use hibitset::{BitSet, BitSetLike};
use tokio::time::Instant;

use super::{
    part::{FirstPart, Part},
    MessageType, PartitionError,
};
use crate::model::id::ReceptionId;

/// Header fields carried only by the first part
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FirstHeader {
    message_type: MessageType,
    num_parts: u8,
    timestamp_ms: i64,
}

#[derive(Debug)]
struct PendingMessage {
    first: Option<FirstHeader>,
    parts: HashMap<u8, Vec<u8>>,
    received: BitSet,
    created: Instant,
}

/// A message whose every part has arrived
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Reassembled {
    pub message_type: MessageType,
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
}

impl PendingMessage {
    fn new() -> Self {
        Self {
            first: None,
            parts: HashMap::new(),
            received: BitSet::new(),
            created: Instant::now(),
        }
    }

    fn received_count(&self) -> usize {
        (&self.received).iter().count()
    }

    fn is_complete(&self) -> bool {
        match self.first {
            Some(first) => self.received_count() == first.num_parts as usize,
            None => false,
        }
    }

    fn assemble(mut self) -> Option<Reassembled> {
        let first = self.first?;
        let mut payload = Vec::new();
        for index in 0..first.num_parts {
            payload.extend_from_slice(&self.parts.remove(&index)?);
        }

        Some(Reassembled {
            message_type: first.message_type,
            timestamp_ms: first.timestamp_ms,
            payload,
        })
    }
}

/// Expired messages are swept this many times per maximum age, so none outlives
/// `max_age * (1 + 1 / SWEEPS_PER_AGE)` while parts keep arriving
const SWEEPS_PER_AGE: u32 = 4;

#[derive(Debug)]
pub(crate) struct MultipartStore {
    pending: HashMap<(ReceptionId, u64), PendingMessage>,
    max_age: Duration,
    last_sweep: Instant,
}

impl MultipartStore {
    pub fn new(max_age: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_age,
            last_sweep: Instant::now(),
        }
    }

    /// Number of messages with at least one part outstanding
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Store a part, returning the whole message if it was the last one missing.
    /// Re-delivery of an identical part is ignored, a differing part with the same index is
    /// rejected and the first one kept
    pub fn add(
        &mut self,
        sender: ReceptionId,
        full_id: u64,
        part: Part,
    ) -> Result<Option<Reassembled>, PartitionError> {
        if self.last_sweep.elapsed() >= self.max_age / SWEEPS_PER_AGE {
            self.cleanup_expired();
        }

        let key = (sender, full_id);
        let pending = self.pending.entry(key).or_insert_with(PendingMessage::new);
        let index = part.index();

        let (header, payload) = match part {
            Part::First(FirstPart {
                message_type,
                num_parts,
                timestamp_ms,
                payload,
                ..
            }) => (
                Some(FirstHeader {
                    message_type,
                    num_parts,
                    timestamp_ms,
                }),
                payload,
            ),
            Part::Subsequent(sub) => (None, sub.payload),
        };

        if pending.received.contains(index as u32) {
            let same_payload = pending.parts.get(&index) == Some(&payload);
            let same_header = header.is_none() || header == pending.first;
            return match same_payload && same_header {
                true => {
                    log::trace!("Ignoring duplicate part {} of message {}", index, full_id);
                    Ok(None)
                }
                false => Err(PartitionError::Conflict {
                    message_id: full_id,
                    index,
                }),
            };
        }

        let num_parts = header.or(pending.first).map(|h| h.num_parts);
        if let Some(num_parts) = num_parts {
            let out_of_range = match header {
                // Parts that arrived before the first must all fit its declared count
                Some(_) => (&pending.received).iter().any(|i| i >= num_parts as u32),
                None => index >= num_parts,
            };

            if out_of_range {
                self.pending.remove(&key);
                return Err(PartitionError::Format(format!(
                    "message {} has parts beyond its declared count of {}",
                    full_id, num_parts
                )));
            }
        }

        if header.is_some() {
            pending.first = header;
        }
        pending.received.add(index as u32);
        pending.parts.insert(index, payload);

        if !pending.is_complete() {
            return Ok(None);
        }

        match self.pending.remove(&key).and_then(PendingMessage::assemble) {
            Some(message) => Ok(Some(message)),
            None => Err(PartitionError::Format(format!(
                "message {} could not be assembled",
                full_id
            ))),
        }
    }

    /// Drop partially received messages older than the configured age, returning how many
    pub fn cleanup_expired(&mut self) -> usize {
        self.last_sweep = Instant::now();
        let before = self.pending.len();
        let max_age = self.max_age;
        self.pending
            .retain(|_, pending| pending.created.elapsed() <= max_age);

        let removed = before - self.pending.len();
        if removed > 0 {
            log::debug!("Dropped {} expired partial messages", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::partition::part::SubsequentPart;

    fn first(num_parts: u8, payload: &[u8]) -> Part {
        Part::First(FirstPart {
            message_id: 1,
            message_type: MessageType::XxMessage,
            num_parts,
            timestamp_ms: 42,
            payload: payload.to_vec(),
        })
    }

    fn sub(index: u8, payload: &[u8]) -> Part {
        Part::Subsequent(SubsequentPart {
            message_id: 1,
            index,
            payload: payload.to_vec(),
        })
    }

    #[test]
    fn test_out_of_order() {
        let mut store = MultipartStore::new(Duration::from_secs(60));
        let sender = ReceptionId::generate(&mut OsRng);

        assert_eq!(store.add(sender, 1, sub(2, b"c")).unwrap(), None);
        assert_eq!(store.add(sender, 1, first(3, b"a")).unwrap(), None);
        assert_eq!(store.pending(), 1);

        let message = store.add(sender, 1, sub(1, b"b")).unwrap().unwrap();
        assert_eq!(message.payload, b"abc");
        assert_eq!(message.timestamp_ms, 42);
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_duplicates() {
        let mut store = MultipartStore::new(Duration::from_secs(60));
        let sender = ReceptionId::generate(&mut OsRng);

        store.add(sender, 1, first(2, b"a")).unwrap();
        assert_eq!(store.add(sender, 1, first(2, b"a")).unwrap(), None);
        assert!(matches!(
            store.add(sender, 1, first(2, b"z")),
            Err(PartitionError::Conflict { index: 0, .. })
        ));
        assert!(matches!(
            store.add(sender, 1, sub(2, b"x")),
            Err(PartitionError::Format(_))
        ));
    }

    #[test]
    fn test_early_part_beyond_count() {
        let mut store = MultipartStore::new(Duration::from_secs(60));
        let sender = ReceptionId::generate(&mut OsRng);

        store.add(sender, 1, sub(5, b"x")).unwrap();
        assert!(store.add(sender, 1, first(2, b"a")).is_err());
        assert_eq!(store.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let mut store = MultipartStore::new(Duration::from_secs(60));
        let sender = ReceptionId::generate(&mut OsRng);

        store.add(sender, 1, first(2, b"a")).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        store.add(sender, 2, first(2, b"a")).unwrap();
        assert_eq!(store.cleanup_expired(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.pending(), 1);
    }
}
