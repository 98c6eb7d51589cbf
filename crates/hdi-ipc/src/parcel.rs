//! Parcel wire format.
//!
//! Little-endian, no padding:
//!
//! | value              | encoding                          |
//! |--------------------|-----------------------------------|
//! | `bool`             | `u32`, 0 or 1                     |
//! | `i32` `u32` `u16`  | 4 bytes (`u16` widened)           |
//! | `i64` `u64`        | 8 bytes                           |
//! | string             | `u32` byte length, UTF-8 bytes    |
//! | array              | `u32` element count, elements     |
//! | object reference   | `u32` tag, `u64` object id        |
//!
//! A request starts with the interface token (a string), followed by the
//! fields of the transaction code.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::object::ObjectId;

/// Tag of a live object reference.
pub const OBJECT_TAG: u32 = 0x7362_2a85;
/// Tag of a null object reference.
pub const NULL_OBJECT_TAG: u32 = 0;

/// Bounds applied while decoding, so a hostile length prefix cannot force a
/// large allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParcelLimits {
    /// Maximum string length in bytes.
    pub max_string_len: usize,
    /// Maximum element count of an array.
    pub max_array_len: usize,
}

impl Default for ParcelLimits {
    fn default() -> Self {
        Self {
            max_string_len: 64 * 1024,
            max_array_len: 64 * 1024,
        }
    }
}

/// An outgoing parcel.
#[derive(Debug, Clone, Default)]
pub struct Parcel {
    buf: BytesMut,
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Reader over the bytes written so far, with default limits.
    pub fn into_reader(self) -> ParcelReader {
        ParcelReader::new(self.freeze())
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u32_le(v as u32);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_len(s.len());
        self.buf.put_slice(s.as_bytes());
    }

    pub fn write_interface_token(&mut self, descriptor: &str) {
        self.write_string(descriptor);
    }

    pub fn write_array<T: Encode>(&mut self, items: &[T]) {
        self.write_len(items.len());
        for item in items {
            item.encode(self);
        }
    }

    /// Write an object reference; `None` is the null reference.
    pub fn write_object(&mut self, id: Option<ObjectId>) {
        match id {
            Some(id) => {
                self.buf.put_u32_le(OBJECT_TAG);
                self.buf.put_u64_le(id.as_u64());
            }
            None => {
                self.buf.put_u32_le(NULL_OBJECT_TAG);
                self.buf.put_u64_le(0);
            }
        }
    }

    /// Append bytes verbatim, without a length prefix.
    pub fn append_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }

    fn write_len(&mut self, len: usize) {
        // Lengths above u32::MAX cannot be represented; such values are
        // rejected by any peer's limits anyway.
        self.buf.put_u32_le(u32::try_from(len).unwrap_or(u32::MAX));
    }
}

/// An incoming parcel.
///
/// Every read either consumes a complete value or leaves the cursor where it
/// was.
#[derive(Debug, Clone)]
pub struct ParcelReader {
    buf: Bytes,
    limits: ParcelLimits,
}

impl ParcelReader {
    pub fn new(buf: Bytes) -> Self {
        Self::with_limits(buf, ParcelLimits::default())
    }

    pub fn with_limits(buf: Bytes, limits: ParcelLimits) -> Self {
        Self { buf, limits }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn limits(&self) -> ParcelLimits {
        self.limits
    }

    fn ensure(&self, needed: usize) -> Result<(), ParcelError> {
        if self.buf.remaining() < needed {
            return Err(ParcelError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32, ParcelError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, ParcelError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, ParcelError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, ParcelError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, ParcelError> {
        self.atomically(|r| match r.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ParcelError::InvalidBool(other)),
        })
    }

    pub fn read_string(&mut self) -> Result<String, ParcelError> {
        self.atomically(|r| {
            let len = r.read_u32()? as usize;
            if len > r.limits.max_string_len {
                return Err(ParcelError::LengthOverflow {
                    len,
                    max: r.limits.max_string_len,
                });
            }
            r.ensure(len)?;
            let bytes = r.buf.split_to(len);
            match std::str::from_utf8(&bytes) {
                Ok(s) => Ok(s.to_owned()),
                Err(_) => Err(ParcelError::InvalidUtf8),
            }
        })
    }

    /// Read the interface token. An unreadable token yields `None`, which
    /// never matches a descriptor.
    pub fn read_interface_token(&mut self) -> Option<String> {
        self.read_string().ok()
    }

    pub fn read_array<T: Decode>(&mut self) -> Result<Vec<T>, ParcelError> {
        self.atomically(|r| {
            let count = r.read_u32()? as usize;
            if count > r.limits.max_array_len {
                return Err(ParcelError::LengthOverflow {
                    len: count,
                    max: r.limits.max_array_len,
                });
            }
            // Every element takes at least four bytes.
            r.ensure(count.saturating_mul(4))?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(T::decode(r)?);
            }
            Ok(items)
        })
    }

    /// Read an object reference; the null reference is `None`.
    pub fn read_object(&mut self) -> Result<Option<ObjectId>, ParcelError> {
        self.atomically(|r| {
            let tag = r.read_u32()?;
            let id = r.read_u64()?;
            match tag {
                OBJECT_TAG => Ok(Some(ObjectId::from_u64(id))),
                NULL_OBJECT_TAG => Ok(None),
                other => Err(ParcelError::InvalidObjectTag(other)),
            }
        })
    }

    /// Decode a whole `T` or nothing.
    pub fn read<T: Decode>(&mut self) -> Result<T, ParcelError> {
        self.atomically(T::decode)
    }

    fn atomically<T>(
        &mut self,
        f: impl FnOnce(&mut ParcelReader) -> Result<T, ParcelError>,
    ) -> Result<T, ParcelError> {
        let mut scratch = self.clone();
        let value = f(&mut scratch)?;
        *self = scratch;
        Ok(value)
    }
}

/// A value with a parcel encoding.
pub trait Encode {
    fn encode(&self, parcel: &mut Parcel);
}

/// A value that can be read back from a parcel.
pub trait Decode: Sized {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError>;
}

macro_rules! primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Encode for $ty {
            fn encode(&self, parcel: &mut Parcel) {
                parcel.$write(*self);
            }
        }

        impl Decode for $ty {
            fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
                reader.$read()
            }
        }
    };
}

primitive!(bool, write_bool, read_bool);
primitive!(i32, write_i32, read_i32);
primitive!(u32, write_u32, read_u32);
primitive!(i64, write_i64, read_i64);
primitive!(u64, write_u64, read_u64);

impl Encode for u16 {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_u32(u32::from(*self));
    }
}

impl Decode for u16 {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        reader.atomically(|r| {
            let raw = r.read_u32()?;
            u16::try_from(raw).map_err(|_| ParcelError::OutOfRange(u64::from(raw)))
        })
    }
}

impl Encode for str {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_string(self);
    }
}

impl Encode for String {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_string(self);
    }
}

impl Decode for String {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        reader.read_string()
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_array(self);
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_array(self);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        reader.read_array()
    }
}

impl Encode for Option<ObjectId> {
    fn encode(&self, parcel: &mut Parcel) {
        parcel.write_object(*self);
    }
}

impl Decode for Option<ObjectId> {
    fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
        reader.read_object()
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, parcel: &mut Parcel) {
        (**self).encode(parcel);
    }
}

/// A transaction with no fields.
impl Encode for () {
    fn encode(&self, _: &mut Parcel) {}
}

impl Decode for () {
    fn decode(_: &mut ParcelReader) -> Result<Self, ParcelError> {
        Ok(())
    }
}

macro_rules! tuple {
    ($($name:ident),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(&self, parcel: &mut Parcel) {
                let ($($name,)+) = self;
                $($name.encode(parcel);)+
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(reader: &mut ParcelReader) -> Result<Self, ParcelError> {
                Ok(($($name::decode(reader)?,)+))
            }
        }
    };
}

tuple!(A);
tuple!(A, B);
tuple!(A, B, C);
tuple!(A, B, C, D);
tuple!(A, B, C, D, E);

/// Why a parcel could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParcelError {
    /// Fewer bytes remain than the next value needs.
    Truncated { needed: usize, remaining: usize },
    /// A length or count prefix exceeds the configured limit.
    LengthOverflow { len: usize, max: usize },
    InvalidUtf8,
    /// A bool that is neither 0 nor 1.
    InvalidBool(u32),
    InvalidObjectTag(u32),
    /// An integer that does not fit the field it decodes into.
    OutOfRange(u64),
}

impl fmt::Display for ParcelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParcelError::Truncated { needed, remaining } => write!(
                f,
                "parcel truncated: need {} bytes, {} remain",
                needed, remaining
            ),
            ParcelError::LengthOverflow { len, max } => {
                write!(f, "length {} exceeds limit {}", len, max)
            }
            ParcelError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            ParcelError::InvalidBool(v) => write!(f, "invalid bool value {}", v),
            ParcelError::InvalidObjectTag(t) => write!(f, "invalid object tag {:#x}", t),
            ParcelError::OutOfRange(v) => write!(f, "value {} out of range", v),
        }
    }
}

impl std::error::Error for ParcelError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian_and_prefixed() {
        let mut p = Parcel::new();
        p.write_bool(true);
        p.write_string("ab");
        p.write_array(&[7i64]);
        assert_eq!(
            p.as_bytes(),
            &[
                1, 0, 0, 0, // bool
                2, 0, 0, 0, b'a', b'b', // string
                1, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, // [i64]
            ]
        );
    }

    #[test]
    fn failed_read_does_not_move_the_cursor() {
        let mut p = Parcel::new();
        p.write_u32(10); // claims a 10-byte string
        p.write_u32(0xdead);
        let mut r = p.into_reader();

        assert!(matches!(
            r.read_string(),
            Err(ParcelError::Truncated { needed: 10, remaining: 4 })
        ));
        assert_eq!(r.remaining(), 8);
        assert_eq!(r.read_u32(), Ok(10));
    }

    #[test]
    fn tuples_decode_all_or_nothing() {
        let mut p = Parcel::new();
        p.write_string("name");
        p.write_i32(3);
        let bytes = p.freeze();

        let mut r = ParcelReader::new(bytes.clone());
        assert_eq!(r.read::<(String, i32)>(), Ok(("name".to_owned(), 3)));

        let mut r = ParcelReader::new(bytes.slice(..bytes.len() - 1));
        assert!(r.read::<(String, i32)>().is_err());
        assert_eq!(r.remaining(), bytes.len() - 1);
    }

    #[test]
    fn limits_reject_huge_prefixes_before_allocating() {
        let limits = ParcelLimits {
            max_string_len: 8,
            max_array_len: 2,
        };

        let mut p = Parcel::new();
        p.write_string("longer than eight");
        let mut r = ParcelReader::with_limits(p.freeze(), limits);
        assert_eq!(
            r.read_string(),
            Err(ParcelError::LengthOverflow { len: 17, max: 8 })
        );

        // Within the count limit, but far more elements than bytes.
        let mut p = Parcel::new();
        p.write_u32(1000);
        let mut r = ParcelReader::new(p.freeze());
        assert!(matches!(
            r.read_array::<i64>(),
            Err(ParcelError::Truncated { .. })
        ));

        let mut p = Parcel::new();
        p.write_array(&[1u32, 2, 3]);
        let mut r = ParcelReader::with_limits(p.freeze(), limits);
        assert_eq!(
            r.read_array::<u32>(),
            Err(ParcelError::LengthOverflow { len: 3, max: 2 })
        );
    }

    #[test]
    fn rejects_bad_bools_utf8_and_tags() {
        let mut p = Parcel::new();
        p.write_u32(2);
        assert_eq!(p.into_reader().read_bool(), Err(ParcelError::InvalidBool(2)));

        let mut p = Parcel::new();
        p.write_u32(2);
        p.write_u32(0xfffe);
        let mut r = p.into_reader();
        assert_eq!(r.read_string(), Err(ParcelError::InvalidUtf8));

        let mut p = Parcel::new();
        p.write_u32(0x1234);
        p.write_u64(9);
        assert_eq!(
            p.into_reader().read_object(),
            Err(ParcelError::InvalidObjectTag(0x1234))
        );

        let mut p = Parcel::new();
        p.write_u32(70_000);
        assert_eq!(
            p.into_reader().read::<u16>(),
            Err(ParcelError::OutOfRange(70_000))
        );
    }

    #[test]
    fn object_references() {
        let mut p = Parcel::new();
        p.write_object(Some(ObjectId::from_u64(42)));
        p.write_object(None);
        let mut r = p.into_reader();
        assert_eq!(r.read_object(), Ok(Some(ObjectId::from_u64(42))));
        assert_eq!(r.read_object(), Ok(None));
        assert_eq!(r.remaining(), 0);
    }
}
