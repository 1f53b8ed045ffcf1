//! # Object Marshaller
//!
//! Generic conversion between a type's declared fields and a self-describing
//! byte layout:
//!
//! ```text
//! [i32 fieldCount] { [i32 fieldTypeId] [i32 byteLen] [byteLen bytes] } * fieldCount
//! ```
//!
//! Records follow the declaration order of the type, so that order is part of the
//! wire format. Types declare their fields with [`wire_struct!`](crate::wire_struct),
//! which pins the order at the definition site instead of relying on any runtime
//! enumeration.
//!
//! A record with type id `-1` marks a value the sender could not encode. The
//! receiver skips its bytes and leaves the slot at the field's dropped value.

use bytes::{BufMut, BytesMut};

use crate::codec::field::{decode_event, encode_event, FieldKind, WireField, DROPPED_FIELD};
use crate::error::DecodeError;
use crate::protocol::registry::ApplicationEvent;

/// A type with an explicit, ordered list of serializable fields.
pub trait Marshal: Sized {
    /// Number of declared fields; must match the records written by `write_fields`
    const FIELD_COUNT: usize;

    fn write_fields(&self, w: &mut FieldWriter<'_>);

    fn read_fields(r: &mut FieldReader<'_>) -> Result<Self, DecodeError>;
}

/// Appends field records to an output buffer.
pub struct FieldWriter<'a> {
    out: &'a mut BytesMut,
    scratch: BytesMut,
    written: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(out: &'a mut BytesMut) -> Self {
        Self {
            out,
            scratch: BytesMut::with_capacity(64),
            written: 0,
        }
    }

    /// Write the next declared field
    pub fn field<F: WireField>(&mut self, value: &F) {
        self.scratch.clear();
        if value.encode(&mut self.scratch) {
            self.record(F::KIND.id());
        } else {
            self.dropped();
        }
    }

    /// Write a nested application event field
    pub fn event<E: ApplicationEvent>(&mut self, event: &E) {
        self.scratch.clear();
        encode_event(event, &mut self.scratch);
        self.record(FieldKind::Event.id());
    }

    /// Write a dropped record for a value without a codec
    pub fn dropped(&mut self) {
        self.out.put_i32(DROPPED_FIELD);
        self.out.put_i32(0);
        self.written += 1;
    }

    fn record(&mut self, type_id: i32) {
        self.out.put_i32(type_id);
        self.out.put_i32(self.scratch.len() as i32);
        self.out.put_slice(&self.scratch);
        self.written += 1;
    }
}

/// Reads field records back in declaration order.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    index: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, index: 0 }
    }

    /// Read the next declared field
    pub fn field<F: WireField>(&mut self) -> Result<F, DecodeError> {
        match self.record()? {
            None => Ok(F::dropped()),
            Some((index, kind, bytes)) => {
                if kind != F::KIND {
                    return Err(DecodeError::FieldTypeMismatch {
                        index,
                        expected: F::KIND.id(),
                        found: kind.id(),
                    });
                }
                F::decode(bytes)
            }
        }
    }

    /// Read a nested application event field
    pub fn event<E: ApplicationEvent>(&mut self) -> Result<E, DecodeError> {
        match self.record()? {
            None => Err(DecodeError::MissingEvent),
            Some((_, FieldKind::Event, bytes)) => decode_event(bytes),
            Some((index, kind, _)) => Err(DecodeError::FieldTypeMismatch {
                index,
                expected: FieldKind::Event.id(),
                found: kind.id(),
            }),
        }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn record(&mut self) -> Result<Option<(usize, FieldKind, &'a [u8])>, DecodeError> {
        let type_id = read_i32(&mut self.buf)?;
        let len = read_i32(&mut self.buf)?;
        if len < 0 {
            return Err(DecodeError::InvalidLength(len));
        }
        let len = len as usize;
        if self.buf.len() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                available: self.buf.len(),
            });
        }

        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        let index = self.index;
        self.index += 1;

        if type_id == DROPPED_FIELD {
            return Ok(None);
        }
        let kind = FieldKind::from_id(type_id).ok_or(DecodeError::UnknownType(type_id))?;
        Ok(Some((index, kind, bytes)))
    }
}

pub(crate) fn read_i32(buf: &mut &[u8]) -> Result<i32, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4,
            available: buf.len(),
        });
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Ok(i32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

/// Marshal `value` onto the end of `out`.
pub fn marshal_into<T: Marshal>(value: &T, out: &mut BytesMut) {
    out.put_i32(T::FIELD_COUNT as i32);
    let mut writer = FieldWriter::new(out);
    value.write_fields(&mut writer);
    debug_assert_eq!(writer.written, T::FIELD_COUNT);
}

/// Marshal `value` into a fresh buffer.
pub fn marshal<T: Marshal>(value: &T) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(4 + T::FIELD_COUNT * 12);
    marshal_into(value, &mut out);
    out.to_vec()
}

/// Rebuild a `T` from its marshalled form.
///
/// # Errors
/// `FieldCountMismatch` when the record count disagrees with `T`'s declaration,
/// `UnknownType` for a record type id without a codec, `Truncated` when the
/// buffer ends early.
pub fn unmarshal<T: Marshal>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut buf = bytes;
    let count = read_i32(&mut buf)?;
    if count < 0 || count as usize != T::FIELD_COUNT {
        return Err(DecodeError::FieldCountMismatch {
            expected: T::FIELD_COUNT,
            found: count,
        });
    }
    let mut reader = FieldReader::new(buf);
    T::read_fields(&mut reader)
}

/// Declare a struct together with its ordered wire fields.
///
/// ```rust
/// use datagram_protocol::wire_struct;
/// use datagram_protocol::codec::{marshal, unmarshal};
///
/// wire_struct! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Move {
///         pub x: f32,
///         pub y: f32,
///         pub piece: String,
///     }
/// }
///
/// let mv = Move { x: 1.0, y: 2.0, piece: "rook".into() };
/// assert_eq!(unmarshal::<Move>(&marshal(&mv)).unwrap(), mv);
/// ```
#[macro_export]
macro_rules! wire_struct {
    (@count) => { 0usize };
    (@count $head:ident $($tail:ident)*) => { 1usize + $crate::wire_struct!(@count $($tail)*) };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$fmeta:meta])* $fvis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $(#[$fmeta])* $fvis $field: $ty, )*
        }

        impl $crate::codec::Marshal for $name {
            const FIELD_COUNT: usize = $crate::wire_struct!(@count $($field)*);

            #[allow(unused_variables)]
            fn write_fields(&self, w: &mut $crate::codec::FieldWriter<'_>) {
                $( w.field::<$ty>(&self.$field); )*
            }

            #[allow(unused_variables)]
            fn read_fields(
                r: &mut $crate::codec::FieldReader<'_>,
            ) -> ::std::result::Result<Self, $crate::error::DecodeError> {
                Ok(Self {
                    $( $field: r.field::<$ty>()?, )*
                })
            }
        }
    };
}
