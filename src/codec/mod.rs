//! # Wire Codec
//!
//! Field-level encoding and the generic marshaller built on top of it.
//!
//! ## Components
//! - **Field**: per-kind big-endian / raw-byte encoders and their wire type ids
//! - **Marshal**: ordered field records, `wire_struct!` declarations
//!
//! ## Wire Format
//! ```text
//! [fieldCount(4)] { [fieldTypeId(4)] [byteLen(4)] [bytes(byteLen)] } * fieldCount
//! ```

pub mod field;
pub mod marshal;

pub use field::{FieldKind, WireField, DROPPED_FIELD};
pub use marshal::{marshal, marshal_into, unmarshal, FieldReader, FieldWriter, Marshal};
