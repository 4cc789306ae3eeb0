use chrono::{Duration, TimeZone, Utc};

use crate::{ByteWriter, FromBytes, FromBytesError, ToBytes, ToBytesError};

/// Format:
/// UNIX timestamp in milliseconds - 8 bytes
impl ToBytes for chrono::DateTime<Utc> {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        self.timestamp_millis().encode(buf)
    }

    fn size_hint(&self) -> usize {
        8
    }
}

impl FromBytes<'_> for chrono::DateTime<Utc> {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        let ts = i64::decode(reader)?;
        Utc.timestamp_millis_opt(ts).single().ok_or_else(|| {
            FromBytesError::Parsing("Failed to read UTC timestamp: out of range".to_owned())
        })
    }
}

/// Format:
/// Milliseconds count - 8 bytes
impl ToBytes for Duration {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        self.num_milliseconds().encode(buf)
    }

    fn size_hint(&self) -> usize {
        8
    }
}
impl FromBytes<'_> for Duration {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        i64::decode(reader).map(Self::milliseconds)
    }
}
