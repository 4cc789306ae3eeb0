//! Splitting application payloads across fixed-size parts and reassembling them on receipt.
//!
//! Every part is exactly [PartitionConfig::part_size] bytes. The first part of a message
//! carries the message type, part count, and timestamp; later parts only carry their index. Each
//! partner has its own [conversation](conversation) that numbers outgoing messages and detects
//! replayed incoming ones.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use cmix_wireformat::{FromBytes, FromBytesError, ToBytes, ToBytesError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    kv::{Kv, KvError},
    model::{
        cell::{contents_len, DEFAULT_CELL_SIZE},
        id::ReceptionId,
    },
};

mod conversation;
mod message_type;
mod multipart;
pub mod part;
mod switchboard;

use conversation::{Conversation, ConversationRecord};
pub use message_type::MessageType;
use multipart::MultipartStore;
use part::{FirstPart, Part, SubsequentPart, FIRST_HEADER_LEN, SUBSEQUENT_HEADER_LEN};
pub use switchboard::{MessageListener, Switchboard, SwitchboardId};

/// Maximum number of parts in one message
pub const MAX_PARTS: usize = 255;

/// Key conversation state is saved under
const CONVERSATIONS_KEY: &str = "partition⦙conversations";

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("Payload of {len} bytes exceeds the maximum of {max}")]
    PayloadTooLong { len: usize, max: usize },
    #[error("Part size of {0} bytes cannot hold a part")]
    PartSize(usize),
    #[error("Malformed part: {0}")]
    Format(String),
    #[error("Unsupported part version {0}")]
    Version(u8),
    #[error("Message {message_id} was already received")]
    Duplicate { message_id: u64 },
    #[error("Part {index} of message {message_id} conflicts with one already received")]
    Conflict { message_id: u64, index: u8 },
    #[error("Failed to decode: {0}")]
    Decode(#[from] FromBytesError),
    #[error("Failed to encode: {0}")]
    Encode(#[from] ToBytesError),
    #[error("Storage: {0}")]
    Kv(#[from] KvError),
}

/// Configuration options for a [Partitioner]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Size of every part, usually the usable payload size of the transport
    pub part_size: usize,
    /// Time after which a partially received message is dropped by
    /// [Partitioner::cleanup_expired]
    pub max_pending_age: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            part_size: contents_len(DEFAULT_CELL_SIZE),
            max_pending_age: Duration::from_secs(15 * 60),
        }
    }
}

/// Output of [Partitioner::partition]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionedMessage {
    /// Encoded parts in order, each exactly the configured part size
    pub parts: Vec<Vec<u8>>,
    /// Conversation-unique 64 bit ID: wrap count in the high half, `message_id` in the low
    pub full_id: u64,
    /// ID written in the part headers
    pub message_id: u32,
}

/// A message whose parts have all been received
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledMessage {
    pub sender: ReceptionId,
    pub message_type: MessageType,
    pub full_id: u64,
    pub message_id: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
}

pub struct Partitioner {
    cfg: PartitionConfig,
    conversations: DashMap<ReceptionId, Conversation>,
    multipart: Mutex<MultipartStore>,
}

impl Partitioner {
    pub fn new(cfg: PartitionConfig) -> Self {
        let multipart = Mutex::new(MultipartStore::new(cfg.max_pending_age));
        Self {
            cfg,
            conversations: DashMap::new(),
            multipart,
        }
    }

    #[inline]
    pub const fn config(&self) -> &PartitionConfig {
        &self.cfg
    }

    /// Payload capacity of the first part
    pub fn first_capacity(&self) -> usize {
        self.cfg.part_size.saturating_sub(FIRST_HEADER_LEN)
    }

    /// Payload capacity of every later part
    pub fn subsequent_capacity(&self) -> usize {
        self.cfg.part_size.saturating_sub(SUBSEQUENT_HEADER_LEN)
    }

    /// Largest payload that can be partitioned
    pub fn max_payload(&self) -> usize {
        self.first_capacity() + (MAX_PARTS - 1) * self.subsequent_capacity()
    }

    /// Number of parts a payload of `len` bytes is split into
    pub fn num_parts(&self, len: usize) -> Result<usize, PartitionError> {
        if self.cfg.part_size <= FIRST_HEADER_LEN {
            return Err(PartitionError::PartSize(self.cfg.part_size));
        }

        let c2 = self.subsequent_capacity();
        let parts = (len + FIRST_HEADER_LEN - SUBSEQUENT_HEADER_LEN + c2 - 1) / c2;
        match parts > MAX_PARTS {
            true => Err(PartitionError::PayloadTooLong {
                len,
                max: self.max_payload(),
            }),
            false => Ok(parts.max(1)),
        }
    }

    /// Split a payload for `recipient`, consuming the next message ID of that conversation
    pub fn partition(
        &self,
        recipient: &ReceptionId,
        message_type: MessageType,
        timestamp_ms: i64,
        payload: &[u8],
    ) -> Result<PartitionedMessage, PartitionError> {
        let num_parts = self.num_parts(payload.len())?;
        let (full_id, message_id) = self
            .conversations
            .entry(*recipient)
            .or_default()
            .next_send_id();

        let first_len = payload.len().min(self.first_capacity());
        let (head, tail) = payload.split_at(first_len);

        let mut parts = Vec::with_capacity(num_parts);
        parts.push(
            Part::First(FirstPart {
                message_id,
                message_type,
                num_parts: num_parts as u8,
                timestamp_ms,
                payload: head.to_vec(),
            })
            .encode(self.cfg.part_size)?,
        );

        for (i, chunk) in tail.chunks(self.subsequent_capacity()).enumerate() {
            parts.push(
                Part::Subsequent(SubsequentPart {
                    message_id,
                    index: (i + 1) as u8,
                    payload: chunk.to_vec(),
                })
                .encode(self.cfg.part_size)?,
            );
        }

        log::trace!(
            "Partitioned {} byte {} message {} for {} into {} parts",
            payload.len(),
            message_type,
            full_id,
            recipient.short(),
            parts.len()
        );

        Ok(PartitionedMessage {
            parts,
            full_id,
            message_id,
        })
    }

    /// Accept one received part from `sender`, returning the message once it is complete
    pub fn handle_partition(
        &self,
        sender: &ReceptionId,
        bytes: &[u8],
    ) -> Result<Option<AssembledMessage>, PartitionError> {
        let part = Part::decode(bytes)?;
        let message_id = part.message_id();

        let full_id = {
            let mut conversation = self.conversations.entry(*sender).or_default();
            let full_id = conversation.reconstruct(message_id);
            if conversation.is_replay(full_id) {
                return Err(PartitionError::Duplicate {
                    message_id: full_id,
                });
            }
            conversation.mark_seen(full_id);
            full_id
        };

        let Some(reassembled) = self.multipart.lock().add(*sender, full_id, part)? else {
            return Ok(None);
        };

        if let Some(mut conversation) = self.conversations.get_mut(sender) {
            conversation.mark_completed(full_id);
        }

        let timestamp = Utc
            .timestamp_millis_opt(reassembled.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(Some(AssembledMessage {
            sender: *sender,
            message_type: reassembled.message_type,
            full_id,
            message_id,
            timestamp,
            payload: reassembled.payload,
        }))
    }

    /// Drop partially received messages older than [PartitionConfig::max_pending_age]. Receiving
    /// parts also sweeps them periodically
    pub fn cleanup_expired(&self) -> usize {
        self.multipart.lock().cleanup_expired()
    }

    /// Persist the message ID state of every conversation
    pub async fn save(&self, kv: &dyn Kv) -> Result<(), PartitionError> {
        let records = self
            .conversations
            .iter()
            .map(|entry| (*entry.key(), entry.value().record()))
            .collect::<BTreeMap<_, _>>();

        kv.set(CONVERSATIONS_KEY, &records.encode_to_vec()?).await?;
        Ok(())
    }

    /// Load conversation state saved by [Partitioner::save], replacing any in memory.
    /// Returns the number of conversations restored
    pub async fn restore(&self, kv: &dyn Kv) -> Result<usize, PartitionError> {
        let Some(bytes) = kv.get_optional(CONVERSATIONS_KEY).await? else {
            return Ok(0);
        };

        let records = BTreeMap::<ReceptionId, ConversationRecord>::decode_from_slice(&bytes)?;
        let count = records.len();
        self.conversations.clear();
        for (id, record) in records {
            self.conversations
                .insert(id, Conversation::from_record(record));
        }

        Ok(count)
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(PartitionConfig::default())
    }
}
