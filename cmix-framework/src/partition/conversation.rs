//! Per-partner message ID state.
//!
//! Outgoing IDs come from a 64 bit counter: the low 32 bits are the `messageID` written in part
//! headers and the high 32 bits count how often it wrapped. Incoming truncated IDs are expanded
//! to 64 bits relative to the highest ID seen so far, then checked against a sliding window of
//! completed messages to detect replays.

use cmix_wireformat::{FromBytes, ToBytes};
use hibitset::{BitSet, BitSetLike};

/// Number of most recent incoming message IDs tracked for replay detection
pub const RECEIVE_WINDOW: u64 = 1024;

const HALF_RANGE: u64 = 1 << 31;
const FULL_RANGE: u64 = 1 << 32;

#[derive(Debug, Default)]
pub(crate) struct Conversation {
    next_send: u64,
    highest_received: Option<u64>,
    /// Completed incoming messages, indexed by full ID modulo [RECEIVE_WINDOW]
    completed: BitSet,
}

/// Persisted form of a [Conversation]
#[derive(Clone, Debug, PartialEq, Eq, ToBytes, FromBytes)]
pub(crate) struct ConversationRecord {
    pub next_send: u64,
    pub highest_received: Option<u64>,
    pub completed: Vec<u32>,
}

#[inline]
const fn slot(full_id: u64) -> u32 {
    (full_id % RECEIVE_WINDOW) as u32
}

impl Conversation {
    /// Take the next outgoing ID, returning the full 64 bit ID and the truncated header ID
    pub fn next_send_id(&mut self) -> (u64, u32) {
        let full = self.next_send;
        self.next_send = self.next_send.wrapping_add(1);
        (full, full as u32)
    }

    /// Expand a truncated incoming ID to the full ID nearest the highest one received
    pub fn reconstruct(&self, truncated: u32) -> u64 {
        let Some(highest) = self.highest_received else {
            return truncated as u64;
        };

        let candidate = (highest & !(FULL_RANGE - 1)) | truncated as u64;
        if candidate.saturating_add(HALF_RANGE) < highest {
            candidate.saturating_add(FULL_RANGE)
        } else if candidate > highest.saturating_add(HALF_RANGE) && candidate >= FULL_RANGE {
            candidate - FULL_RANGE
        } else {
            candidate
        }
    }

    /// Whether the message has already been completed, or is too old to tell
    pub fn is_replay(&self, full_id: u64) -> bool {
        match self.highest_received {
            Some(highest) if full_id.saturating_add(RECEIVE_WINDOW) <= highest => true,
            Some(_) => self.completed.contains(slot(full_id)),
            None => false,
        }
    }

    /// Record that a part of `full_id` arrived, sliding the replay window forward if needed
    pub fn mark_seen(&mut self, full_id: u64) {
        let highest = match self.highest_received {
            Some(highest) if full_id <= highest => return,
            Some(highest) => highest,
            None => {
                self.highest_received = Some(full_id);
                return;
            }
        };

        // Slots between the old and new highest IDs now refer to new messages
        let start = highest.max(full_id.saturating_sub(RECEIVE_WINDOW)) + 1;
        for id in start..=full_id {
            self.completed.remove(slot(id));
        }
        self.highest_received = Some(full_id);
    }

    pub fn mark_completed(&mut self, full_id: u64) {
        self.completed.add(slot(full_id));
    }

    pub fn record(&self) -> ConversationRecord {
        ConversationRecord {
            next_send: self.next_send,
            highest_received: self.highest_received,
            completed: (&self.completed).iter().collect(),
        }
    }

    pub fn from_record(record: ConversationRecord) -> Self {
        let mut completed = BitSet::new();
        for slot in record.completed {
            completed.add(slot);
        }

        Self {
            next_send: record.next_send,
            highest_received: record.highest_received,
            completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_ids_increase_and_wrap() {
        let mut conv = Conversation::default();
        assert_eq!(conv.next_send_id(), (0, 0));
        assert_eq!(conv.next_send_id(), (1, 1));

        conv.next_send = u32::MAX as u64;
        assert_eq!(conv.next_send_id(), (u32::MAX as u64, u32::MAX));
        assert_eq!(conv.next_send_id(), (FULL_RANGE, 0));
    }

    #[test]
    fn test_reconstruct_across_wrap() {
        let mut conv = Conversation::default();
        conv.mark_seen(u32::MAX as u64 - 1);
        assert_eq!(conv.reconstruct(u32::MAX), u32::MAX as u64);
        assert_eq!(conv.reconstruct(2), FULL_RANGE + 2);

        conv.mark_seen(FULL_RANGE + 2);
        assert_eq!(conv.reconstruct(u32::MAX - 3), u32::MAX as u64 - 3);
        assert_eq!(conv.reconstruct(5), FULL_RANGE + 5);
    }

    #[test]
    fn test_replay_window() {
        let mut conv = Conversation::default();
        conv.mark_seen(10);
        conv.mark_completed(10);
        assert!(conv.is_replay(10));
        assert!(!conv.is_replay(11));

        conv.mark_seen(10 + RECEIVE_WINDOW);
        // Slot reuse cleared the old completion, but the ID is now outside the window
        assert!(conv.is_replay(10));
        assert!(!conv.is_replay(10 + RECEIVE_WINDOW));
        assert!(!conv.is_replay(11));
    }

    #[test]
    fn test_record_roundtrip() {
        let mut conv = Conversation::default();
        conv.next_send_id();
        conv.mark_seen(3);
        conv.mark_completed(3);

        let restored = Conversation::from_record(conv.record());
        assert_eq!(restored.next_send, 1);
        assert!(restored.is_replay(3));
        assert_eq!(restored.reconstruct(4), 4);
    }
}
