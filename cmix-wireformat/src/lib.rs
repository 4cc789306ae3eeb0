//! # cMix wire format
//!
//! Traits describing how rust types are written to and read from the byte buffers that travel
//! through the mix network, local key-value storage, and the remote blob store.
//!
//! Multi-byte integers are little endian. Variable-length values (strings, byte strings,
//! sequences) are prefixed with a `u32` length or element count. Fixed-size byte arrays are
//! written raw.

extern crate self as cmix_wireformat;

use std::collections::BTreeMap;

use bytes::BufMut;

pub use derives::{FromBytes, ToBytes};
pub use untrusted;

#[cfg(feature = "rsa")]
mod keys;
#[cfg(feature = "chrono")]
mod time;

/// Type used to prefix the length of all variable-length values
pub type LenType = u32;

/// Any buffer that encoded bytes can be appended to
pub trait ByteWriter: BufMut {}

impl<T: BufMut> ByteWriter for T {}

/// Trait to be implemented by all types that can be written to a byte buffer
pub trait ToBytes {
    /// Write the encoded representation of this value to the given buffer
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError>;

    /// Provide a hint for the encoded size of this value in bytes, used to preallocate buffers
    fn size_hint(&self) -> usize {
        0
    }

    /// Shortcut to encode this value to a freshly allocated buffer
    fn encode_to_vec(&self) -> Result<Vec<u8>, ToBytesError> {
        let mut buf = Vec::with_capacity(self.size_hint());
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// Trait implemented by all types that may be parsed from a byte buffer, possibly borrowing from
/// the buffer for lifetime `'a`
pub trait FromBytes<'a>: Sized {
    /// Consume bytes from the given reader to produce an instance of `Self`
    fn decode(reader: &mut untrusted::Reader<'a>) -> Result<Self, FromBytesError>;

    /// Decode an instance of `Self` from a slice, failing if any bytes remain after decoding
    fn decode_from_slice(slice: &'a [u8]) -> Result<Self, FromBytesError> {
        untrusted::Input::from(slice).read_all(FromBytesError::ExtraBytes, |rdr| Self::decode(rdr))
    }

    /// Decode an instance of `Self`, also returning the exact bytes that were consumed to produce
    /// it
    fn partial_decode(
        reader: &mut untrusted::Reader<'a>,
    ) -> Result<(untrusted::Input<'a>, Self), FromBytesError> {
        reader.read_partial(|rdr| Self::decode(rdr))
    }
}

/// Any error that may occur when encoding a value
#[derive(Debug, thiserror::Error)]
pub enum ToBytesError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Length {len} exceeds the maximum encodable length {max}")]
    TooLong { len: usize, max: usize },
}

/// Any error that may occur when decoding a value from a byte buffer
#[derive(Debug, thiserror::Error)]
pub enum FromBytesError {
    #[error("Unexpected end of input")]
    EndOfInput,
    #[error("Extra bytes remaining after decoded value")]
    ExtraBytes,
    #[error("{0}")]
    Parsing(String),
}

impl From<untrusted::EndOfInput> for FromBytesError {
    fn from(_: untrusted::EndOfInput) -> Self {
        Self::EndOfInput
    }
}

/// Write a length prefix, rejecting values that do not fit in [LenType]
pub fn encode_len<W: ByteWriter>(len: usize, buf: &mut W) -> Result<(), ToBytesError> {
    let len = LenType::try_from(len).map_err(|_| ToBytesError::TooLong {
        len,
        max: LenType::MAX as usize,
    })?;
    buf.put_u32_le(len);
    Ok(())
}

/// Read a length prefix written by [encode_len]
pub fn decode_len(reader: &mut untrusted::Reader<'_>) -> Result<usize, FromBytesError> {
    LenType::decode(reader).map(|len| len as usize)
}

macro_rules! int_impl {
    ($($ty:ty => $put:ident),* $(,)?) => {
        $(
            impl ToBytes for $ty {
                fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
                    buf.$put(*self);
                    Ok(())
                }

                fn size_hint(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }

            impl FromBytes<'_> for $ty {
                fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
                    let bytes = reader.read_bytes(std::mem::size_of::<$ty>())?;
                    let array = bytes
                        .as_slice_less_safe()
                        .try_into()
                        .map_err(|_| FromBytesError::EndOfInput)?;
                    Ok(<$ty>::from_le_bytes(array))
                }
            }
        )*
    };
}

int_impl! {
    u16 => put_u16_le,
    u32 => put_u32_le,
    u64 => put_u64_le,
    i16 => put_i16_le,
    i32 => put_i32_le,
    i64 => put_i64_le,
}

impl ToBytes for u8 {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        buf.put_u8(*self);
        Ok(())
    }

    fn size_hint(&self) -> usize {
        1
    }
}
impl FromBytes<'_> for u8 {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        reader.read_byte().map_err(Into::into)
    }
}

/// Format: a single byte, `0` or `1`
impl ToBytes for bool {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        (*self as u8).encode(buf)
    }

    fn size_hint(&self) -> usize {
        1
    }
}
impl FromBytes<'_> for bool {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        match u8::decode(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FromBytesError::Parsing(format!(
                "Invalid boolean byte {:X}",
                other
            ))),
        }
    }
}

impl ToBytes for () {
    fn encode<W: ByteWriter>(&self, _: &mut W) -> Result<(), ToBytesError> {
        Ok(())
    }
}
impl FromBytes<'_> for () {
    fn decode(_: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        Ok(())
    }
}

/// Format: the raw bytes of the array, no length prefix
impl<const N: usize> ToBytes for [u8; N] {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        buf.put_slice(self);
        Ok(())
    }

    fn size_hint(&self) -> usize {
        N
    }
}
impl<const N: usize> FromBytes<'_> for [u8; N] {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        let bytes = reader.read_bytes(N)?;
        bytes
            .as_slice_less_safe()
            .try_into()
            .map_err(|_| FromBytesError::EndOfInput)
    }
}

/// Format: `u32` element count followed by each element
impl<T: ToBytes> ToBytes for [T] {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        encode_len(self.len(), buf)?;
        for elem in self {
            elem.encode(buf)?;
        }

        Ok(())
    }

    fn size_hint(&self) -> usize {
        std::mem::size_of::<LenType>() + self.iter().map(ToBytes::size_hint).sum::<usize>()
    }
}

impl<T: ToBytes> ToBytes for Vec<T> {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        self.as_slice().encode(buf)
    }

    fn size_hint(&self) -> usize {
        self.as_slice().size_hint()
    }
}
impl<'a, T: FromBytes<'a>> FromBytes<'a> for Vec<T> {
    fn decode(reader: &mut untrusted::Reader<'a>) -> Result<Self, FromBytesError> {
        let len = decode_len(reader)?;
        // Each element occupies at least one byte for all types used on the wire, so refuse to
        // preallocate more than could possibly remain
        let mut vec = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            vec.push(T::decode(reader)?);
        }

        Ok(vec)
    }
}

/// Format: same as `[u8]`, borrowing the bytes from the reader
impl<'a> FromBytes<'a> for &'a [u8] {
    fn decode(reader: &mut untrusted::Reader<'a>) -> Result<Self, FromBytesError> {
        let len = decode_len(reader)?;
        Ok(reader.read_bytes(len)?.as_slice_less_safe())
    }
}

/// Format: same as `[u8]`, contents must be valid UTF-8
impl ToBytes for str {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        self.as_bytes().encode(buf)
    }

    fn size_hint(&self) -> usize {
        std::mem::size_of::<LenType>() + self.len()
    }
}
impl ToBytes for String {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        self.as_str().encode(buf)
    }

    fn size_hint(&self) -> usize {
        self.as_str().size_hint()
    }
}
impl<'a> FromBytes<'a> for &'a str {
    fn decode(reader: &mut untrusted::Reader<'a>) -> Result<Self, FromBytesError> {
        let bytes = <&[u8]>::decode(reader)?;
        std::str::from_utf8(bytes)
            .map_err(|e| FromBytesError::Parsing(format!("Invalid UTF-8 string: {}", e)))
    }
}
impl FromBytes<'_> for String {
    fn decode(reader: &mut untrusted::Reader<'_>) -> Result<Self, FromBytesError> {
        <&str>::decode(reader).map(ToOwned::to_owned)
    }
}

/// Format: `0` for `None`, `1` followed by the encoded value for `Some`
impl<T: ToBytes> ToBytes for Option<T> {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        match self {
            Some(v) => {
                buf.put_u8(1);
                v.encode(buf)
            }
            None => {
                buf.put_u8(0);
                Ok(())
            }
        }
    }

    fn size_hint(&self) -> usize {
        1 + self.as_ref().map(ToBytes::size_hint).unwrap_or(0)
    }
}
impl<'a, T: FromBytes<'a>> FromBytes<'a> for Option<T> {
    fn decode(reader: &mut untrusted::Reader<'a>) -> Result<Self, FromBytesError> {
        match bool::decode(reader)? {
            true => T::decode(reader).map(Some),
            false => Ok(None),
        }
    }
}

impl<A: ToBytes, B: ToBytes> ToBytes for (A, B) {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        self.0.encode(buf)?;
        self.1.encode(buf)
    }

    fn size_hint(&self) -> usize {
        self.0.size_hint() + self.1.size_hint()
    }
}
impl<'a, A: FromBytes<'a>, B: FromBytes<'a>> FromBytes<'a> for (A, B) {
    fn decode(reader: &mut untrusted::Reader<'a>) -> Result<Self, FromBytesError> {
        Ok((A::decode(reader)?, B::decode(reader)?))
    }
}

/// Format: same as a `Vec` of key-value tuples, in key order
impl<K: ToBytes, V: ToBytes> ToBytes for BTreeMap<K, V> {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        encode_len(self.len(), buf)?;
        for (k, v) in self {
            k.encode(buf)?;
            v.encode(buf)?;
        }

        Ok(())
    }

    fn size_hint(&self) -> usize {
        std::mem::size_of::<LenType>()
            + self
                .iter()
                .map(|(k, v)| k.size_hint() + v.size_hint())
                .sum::<usize>()
    }
}
impl<'a, K: FromBytes<'a> + Ord, V: FromBytes<'a>> FromBytes<'a> for BTreeMap<K, V> {
    fn decode(reader: &mut untrusted::Reader<'a>) -> Result<Self, FromBytesError> {
        let len = decode_len(reader)?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let k = K::decode(reader)?;
            let v = V::decode(reader)?;
            map.insert(k, v);
        }

        Ok(map)
    }
}

impl<T: ToBytes + ?Sized> ToBytes for &T {
    fn encode<W: ByteWriter>(&self, buf: &mut W) -> Result<(), ToBytesError> {
        (**self).encode(buf)
    }

    fn size_hint(&self) -> usize {
        (**self).size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, ToBytes, FromBytes)]
    struct Record {
        id: u32,
        name: String,
        tags: Vec<u16>,
        blob: Option<Vec<u8>>,
        fixed: [u8; 4],
    }

    #[repr(u8)]
    #[derive(Debug, PartialEq, Eq, ToBytes, FromBytes)]
    enum Shape {
        Empty = 0,
        Square(u32) = 3,
        Rect { w: u16, h: u16 } = 7,
    }

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(0x0102u16.encode_to_vec().unwrap(), vec![0x02, 0x01]);
        assert_eq!((-2i64).encode_to_vec().unwrap(), vec![0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn derived_struct_roundtrip() {
        let rec = Record {
            id: 77,
            name: "channel".to_owned(),
            tags: vec![1, 2, 3],
            blob: Some(vec![9; 10]),
            fixed: *b"abcd",
        };

        let bytes = rec.encode_to_vec().unwrap();
        assert_eq!(bytes.len(), rec.size_hint());
        assert_eq!(Record::decode_from_slice(&bytes).unwrap(), rec);
    }

    #[test]
    fn derived_enum_uses_discriminant_tags() {
        let bytes = Shape::Square(5).encode_to_vec().unwrap();
        assert_eq!(bytes[0], 3);
        assert_eq!(Shape::decode_from_slice(&bytes).unwrap(), Shape::Square(5));

        let rect = Shape::Rect { w: 2, h: 9 };
        assert_eq!(Shape::decode_from_slice(&rect.encode_to_vec().unwrap()).unwrap(), rect);
        assert_eq!(Shape::decode_from_slice(&[0]).unwrap(), Shape::Empty);
        assert!(Shape::decode_from_slice(&[1]).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = 5u32.encode_to_vec().unwrap();
        bytes.push(0);
        assert!(matches!(u32::decode_from_slice(&bytes), Err(FromBytesError::ExtraBytes)));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = "hello".encode_to_vec().unwrap();
        assert!(matches!(
            String::decode_from_slice(&bytes[..bytes.len() - 1]),
            Err(FromBytesError::EndOfInput)
        ));
    }

    #[test]
    fn partial_decode_returns_consumed_bytes() {
        let mut bytes = 9u16.encode_to_vec().unwrap();
        bytes.extend_from_slice(b"rest");
        let input = untrusted::Input::from(&bytes[..]);
        let (read, value) = input
            .read_all(FromBytesError::ExtraBytes, |rdr| {
                let out = u16::partial_decode(rdr)?;
                rdr.read_bytes_to_end();
                Ok(out)
            })
            .unwrap();
        assert_eq!(value, 9);
        assert_eq!(read.as_slice_less_safe(), &[9, 0]);
    }

    #[test]
    fn map_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), 1u64);
        map.insert("b".to_owned(), 2u64);
        let bytes = map.encode_to_vec().unwrap();
        assert_eq!(BTreeMap::<String, u64>::decode_from_slice(&bytes).unwrap(), map);
    }
}
