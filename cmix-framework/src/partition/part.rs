//! Byte layout of message parts.
//!
//! First part: `messageID u32 ‖ partIndex u8 (=0) ‖ messageType u32 ‖ numParts u8 ‖
//! timestampMillis i64 ‖ payloadLen u16 ‖ version u8 ‖ payload`.
//!
//! Subsequent parts: `messageID u32 ‖ partIndex u8 ‖ payloadLen u16 ‖ version u8 ‖ payload`.
//!
//! Integers are little-endian. Parts are zero padded to the part size; `payloadLen` counts only
//! the bytes of this part.
//!
//! Both headers open with `messageID ‖ partIndex`, so the part index sits at
//! [PART_INDEX_OFFSET] and selects the header layout before anything else is parsed. The
//! first-part fields are the same set as the message type, ID, index, count, timestamp, and
//! length record, laid out in this order rather than with the type leading.

use bytes::BufMut;
use cmix_wireformat::FromBytes;

use super::{MessageType, PartitionError};

/// Header length of the first part of a message
pub const FIRST_HEADER_LEN: usize = 21;
/// Header length of every part after the first
pub const SUBSEQUENT_HEADER_LEN: usize = 8;
/// Offset of the part index, identical in both headers
pub const PART_INDEX_OFFSET: usize = 4;
/// Version byte written in every part header
pub const PART_VERSION: u8 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirstPart {
    pub message_id: u32,
    pub message_type: MessageType,
    pub num_parts: u8,
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsequentPart {
    pub message_id: u32,
    /// Position of this part, always at least 1
    pub index: u8,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Part {
    First(FirstPart),
    Subsequent(SubsequentPart),
}

impl Part {
    pub const fn message_id(&self) -> u32 {
        match self {
            Self::First(first) => first.message_id,
            Self::Subsequent(sub) => sub.message_id,
        }
    }

    pub const fn index(&self) -> u8 {
        match self {
            Self::First(_) => 0,
            Self::Subsequent(sub) => sub.index,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::First(first) => &first.payload,
            Self::Subsequent(sub) => &sub.payload,
        }
    }

    const fn header_len(&self) -> usize {
        match self {
            Self::First(_) => FIRST_HEADER_LEN,
            Self::Subsequent(_) => SUBSEQUENT_HEADER_LEN,
        }
    }

    /// Encode this part, padded with zeros to exactly `part_size` bytes
    pub fn encode(&self, part_size: usize) -> Result<Vec<u8>, PartitionError> {
        let payload = self.payload();
        let len = self.header_len() + payload.len();
        if len > part_size || payload.len() > u16::MAX as usize {
            return Err(PartitionError::PartSize(part_size));
        }

        let mut buf = Vec::with_capacity(part_size);
        buf.put_u32_le(self.message_id());
        buf.put_u8(self.index());
        match self {
            Self::First(first) => {
                buf.put_u32_le(first.message_type.into());
                buf.put_u8(first.num_parts);
                buf.put_i64_le(first.timestamp_ms);
            }
            Self::Subsequent(_) => (),
        }
        buf.put_u16_le(payload.len() as u16);
        buf.put_u8(PART_VERSION);
        buf.put_slice(payload);
        buf.resize(part_size, 0);

        Ok(buf)
    }

    /// Decode a part, using the index byte to pick the header layout
    pub fn decode(bytes: &[u8]) -> Result<Self, PartitionError> {
        let index = *bytes
            .get(PART_INDEX_OFFSET)
            .ok_or_else(|| PartitionError::Format("part too short for header".to_owned()))?;

        untrusted::Input::from(bytes).read_all(
            PartitionError::Format("trailing bytes after part".to_owned()),
            |reader| {
                let message_id = u32::decode(reader)?;
                let _ = u8::decode(reader)?;

                let first = match index {
                    0 => Some((
                        MessageType::from(u32::decode(reader)?),
                        u8::decode(reader)?,
                        i64::decode(reader)?,
                    )),
                    _ => None,
                };

                let len = u16::decode(reader)? as usize;
                let version = u8::decode(reader)?;
                if version != PART_VERSION {
                    return Err(PartitionError::Version(version));
                }

                let payload = reader
                    .read_bytes(len)
                    .map_err(|_| {
                        PartitionError::Format(format!("part claims {} payload bytes", len))
                    })?
                    .as_slice_less_safe()
                    .to_vec();

                // Zero padding up to the part size
                reader.skip_to_end();

                Ok(match first {
                    Some((message_type, num_parts, timestamp_ms)) => {
                        if num_parts == 0 {
                            return Err(PartitionError::Format(
                                "first part declares zero parts".to_owned(),
                            ));
                        }
                        Self::First(FirstPart {
                            message_id,
                            message_type,
                            num_parts,
                            timestamp_ms,
                            payload,
                        })
                    }
                    None => Self::Subsequent(SubsequentPart {
                        message_id,
                        index,
                        payload,
                    }),
                })
            },
        )
    }
}
