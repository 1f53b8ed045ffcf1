//! # Field Codec
//!
//! Per-kind encoders for the primitive values a marshalled body may carry.
//!
//! Integers and floats are fixed-width big-endian. Strings and key material are
//! raw bytes; their length travels in the record header written by the
//! marshaller, never inside the value itself.
//!
//! ```text
//! kind    id  width
//! bool     0  1
//! i16      1  2
//! i32      2  4
//! i64      3  8
//! f32      4  4
//! f64      5  8
//! string   6  n (UTF-8)
//! key      7  n (provider encoded)
//! event    8  4 + n ([i32 event type][marshalled event body])
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::DecodeError;
use crate::protocol::registry::ApplicationEvent;
use crate::utils::crypto::PublicKey;

/// Type id written in place of a field whose value has no codec.
pub const DROPPED_FIELD: i32 = -1;

/// Wire type ids for every supported field kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FieldKind {
    Bool = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    F32 = 4,
    F64 = 5,
    Str = 6,
    Key = 7,
    Event = 8,
}

impl FieldKind {
    /// Type id as written on the wire
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Resolve a wire type id. `None` for ids without a codec entry.
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(FieldKind::Bool),
            1 => Some(FieldKind::I16),
            2 => Some(FieldKind::I32),
            3 => Some(FieldKind::I64),
            4 => Some(FieldKind::F32),
            5 => Some(FieldKind::F64),
            6 => Some(FieldKind::Str),
            7 => Some(FieldKind::Key),
            8 => Some(FieldKind::Event),
            _ => None,
        }
    }

    /// Byte width for fixed-width kinds
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            FieldKind::Bool => Some(1),
            FieldKind::I16 => Some(2),
            FieldKind::I32 | FieldKind::F32 => Some(4),
            FieldKind::I64 | FieldKind::F64 => Some(8),
            FieldKind::Str | FieldKind::Key | FieldKind::Event => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::I16 => "i16",
            FieldKind::I32 => "i32",
            FieldKind::I64 => "i64",
            FieldKind::F32 => "f32",
            FieldKind::F64 => "f64",
            FieldKind::Str => "string",
            FieldKind::Key => "key",
            FieldKind::Event => "event",
        }
    }
}

/// A value that can sit in a declared field slot of a marshalled type.
///
/// `encode` returns `false` when the value cannot be represented, in which case
/// the marshaller writes a dropped record and the receiver falls back to
/// [`WireField::dropped`].
pub trait WireField: Sized {
    const KIND: FieldKind;

    fn encode(&self, out: &mut BytesMut) -> bool;

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;

    /// Value used when the sender dropped this field
    fn dropped() -> Self;
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], DecodeError> {
    if bytes.len() < N {
        return Err(DecodeError::Truncated {
            needed: N,
            available: bytes.len(),
        });
    }
    bytes
        .try_into()
        .map_err(|_| DecodeError::InvalidLength(bytes.len() as i32))
}

macro_rules! numeric_field {
    ($($ty:ty => $kind:ident, $put:ident;)*) => {
        $(
            impl WireField for $ty {
                const KIND: FieldKind = FieldKind::$kind;

                fn encode(&self, out: &mut BytesMut) -> bool {
                    out.$put(*self);
                    true
                }

                fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
                    Ok(<$ty>::from_be_bytes(fixed(bytes)?))
                }

                fn dropped() -> Self {
                    <$ty>::default()
                }
            }
        )*
    };
}

numeric_field! {
    i16 => I16, put_i16;
    i32 => I32, put_i32;
    i64 => I64, put_i64;
    f32 => F32, put_f32;
    f64 => F64, put_f64;
}

impl WireField for bool {
    const KIND: FieldKind = FieldKind::Bool;

    fn encode(&self, out: &mut BytesMut) -> bool {
        out.put_u8(u8::from(*self));
        true
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let [byte] = fixed::<1>(bytes)?;
        Ok(byte != 0)
    }

    fn dropped() -> Self {
        false
    }
}

impl WireField for String {
    const KIND: FieldKind = FieldKind::Str;

    fn encode(&self, out: &mut BytesMut) -> bool {
        out.put_slice(self.as_bytes());
        true
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn dropped() -> Self {
        String::new()
    }
}

/// Key material is optional in every message that carries it; an absent key is
/// written as a dropped record.
impl WireField for Option<PublicKey> {
    const KIND: FieldKind = FieldKind::Key;

    fn encode(&self, out: &mut BytesMut) -> bool {
        match self {
            Some(key) => {
                out.put_slice(key.as_bytes());
                true
            }
            None => false,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Some(PublicKey::from_bytes(bytes.to_vec())))
    }

    fn dropped() -> Self {
        None
    }
}

/// Encode a nested application event: `[i32 event type][marshalled body]`.
pub fn encode_event<E: ApplicationEvent>(event: &E, out: &mut BytesMut) {
    out.put_i32(event.event_type());
    event.marshal_body(out);
}

/// Decode a nested application event through the event set's registry.
pub fn decode_event<E: ApplicationEvent>(bytes: &[u8]) -> Result<E, DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4,
            available: bytes.len(),
        });
    }
    let (tag, body) = bytes.split_at(4);
    E::unmarshal_body(i32::from_be_bytes(fixed(tag)?), body)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encoded<T: WireField>(value: &T) -> Vec<u8> {
        let mut buf = BytesMut::new();
        assert!(value.encode(&mut buf));
        buf.to_vec()
    }

    #[test]
    fn test_integers_are_big_endian() {
        assert_eq!(encoded(&0x0102_i16), vec![0x01, 0x02]);
        assert_eq!(encoded(&0x0102_0304_i32), vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(encoded(&-1_i64), vec![0xFF; 8]);
        assert_eq!(i32::decode(&[0x00, 0x00, 0x01, 0x00]).unwrap(), 256);
    }

    #[test]
    fn test_floats_use_ieee754() {
        assert_eq!(encoded(&1.5_f32), 1.5_f32.to_be_bytes().to_vec());
        assert_eq!(f64::decode(&encoded(&-0.25_f64)).unwrap(), -0.25);
    }

    #[test]
    fn test_bool_encoding() {
        assert_eq!(encoded(&true), vec![1]);
        assert_eq!(encoded(&false), vec![0]);
        assert!(bool::decode(&[7]).unwrap());
    }

    #[test]
    fn test_short_fixed_width_is_truncated() {
        assert_eq!(
            i64::decode(&[0, 1, 2]),
            Err(DecodeError::Truncated {
                needed: 8,
                available: 3
            })
        );
    }

    #[test]
    fn test_long_fixed_width_is_rejected() {
        assert_eq!(i16::decode(&[0, 1, 2]), Err(DecodeError::InvalidLength(3)));
    }

    #[test]
    fn test_string_is_raw_utf8() {
        assert_eq!(encoded(&"héllo".to_string()), "héllo".as_bytes().to_vec());
        assert_eq!(String::decode(&[0xFF, 0xFE]), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_missing_key_is_dropped() {
        let mut buf = BytesMut::new();
        assert!(!None::<PublicKey>.encode(&mut buf));
        assert!(buf.is_empty());
        assert_eq!(<Option<PublicKey>>::dropped(), None);
    }

    #[test]
    fn test_kind_ids_roundtrip() {
        for id in 0..=8 {
            let kind = FieldKind::from_id(id).unwrap();
            assert_eq!(kind.id(), id);
        }
        assert_eq!(FieldKind::from_id(DROPPED_FIELD), None);
        assert_eq!(FieldKind::from_id(42), None);
    }
}
