//! Schema aware views over raw tuple buffers.
//!
//! A layout pairs a schema with a physical arrangement and is bound to one
//! buffer for access. Row layouts keep whole tuples adjacent, column
//! layouts keep whole fields adjacent; both expose the same record level
//! interface plus typed per-field accessors.

mod column;
mod row;

pub use column::{BoundColumnLayout, ColumnLayout, FieldSlice, FieldSliceMut};
pub use row::{BoundRowLayout, RowLayout};

use crate::buffer::TupleBuffer;
use crate::error::BufferError;
use crate::schema::DataType;

mod sealed {
    pub trait Sealed {}
}

/// Scalar types that can live in a schema field. Values are stored little
/// endian and unaligned.
pub trait FieldValue: sealed::Sealed + Copy + Send + 'static {
    const DATA_TYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_field_value {
    ($($ty:ty => $dt:expr,)*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl FieldValue for $ty {
                const DATA_TYPE: DataType = $dt;

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..size_of::<$ty>()]);
                    <$ty>::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes[..size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_field_value! {
    i8 => DataType::Int8,
    i16 => DataType::Int16,
    i32 => DataType::Int32,
    i64 => DataType::Int64,
    u8 => DataType::UInt8,
    u16 => DataType::UInt16,
    u32 => DataType::UInt32,
    u64 => DataType::UInt64,
    f32 => DataType::Float32,
    f64 => DataType::Float64,
}

impl sealed::Sealed for bool {}

impl FieldValue for bool {
    const DATA_TYPE: DataType = DataType::Bool;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    #[inline]
    fn write_le(self, bytes: &mut [u8]) {
        bytes[0] = self as u8;
    }
}

/// Dynamically typed field value, used by the record level interface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
}

impl RecordValue {
    pub fn data_type(&self) -> DataType {
        match self {
            RecordValue::Int8(_) => DataType::Int8,
            RecordValue::Int16(_) => DataType::Int16,
            RecordValue::Int32(_) => DataType::Int32,
            RecordValue::Int64(_) => DataType::Int64,
            RecordValue::UInt8(_) => DataType::UInt8,
            RecordValue::UInt16(_) => DataType::UInt16,
            RecordValue::UInt32(_) => DataType::UInt32,
            RecordValue::UInt64(_) => DataType::UInt64,
            RecordValue::Float32(_) => DataType::Float32,
            RecordValue::Float64(_) => DataType::Float64,
            RecordValue::Bool(_) => DataType::Bool,
        }
    }

    pub(crate) fn write_le(&self, bytes: &mut [u8]) {
        match *self {
            RecordValue::Int8(v) => v.write_le(bytes),
            RecordValue::Int16(v) => v.write_le(bytes),
            RecordValue::Int32(v) => v.write_le(bytes),
            RecordValue::Int64(v) => v.write_le(bytes),
            RecordValue::UInt8(v) => v.write_le(bytes),
            RecordValue::UInt16(v) => v.write_le(bytes),
            RecordValue::UInt32(v) => v.write_le(bytes),
            RecordValue::UInt64(v) => v.write_le(bytes),
            RecordValue::Float32(v) => v.write_le(bytes),
            RecordValue::Float64(v) => v.write_le(bytes),
            RecordValue::Bool(v) => v.write_le(bytes),
        }
    }

    pub(crate) fn read_le(data_type: DataType, bytes: &[u8]) -> RecordValue {
        match data_type {
            DataType::Int8 => RecordValue::Int8(i8::read_le(bytes)),
            DataType::Int16 => RecordValue::Int16(i16::read_le(bytes)),
            DataType::Int32 => RecordValue::Int32(i32::read_le(bytes)),
            DataType::Int64 => RecordValue::Int64(i64::read_le(bytes)),
            DataType::UInt8 => RecordValue::UInt8(u8::read_le(bytes)),
            DataType::UInt16 => RecordValue::UInt16(u16::read_le(bytes)),
            DataType::UInt32 => RecordValue::UInt32(u32::read_le(bytes)),
            DataType::UInt64 => RecordValue::UInt64(u64::read_le(bytes)),
            DataType::Float32 => RecordValue::Float32(f32::read_le(bytes)),
            DataType::Float64 => RecordValue::Float64(f64::read_le(bytes)),
            DataType::Bool => RecordValue::Bool(bool::read_le(bytes)),
        }
    }
}

macro_rules! impl_record_value_from {
    ($($ty:ty => $variant:ident,)*) => {
        $(
            impl From<$ty> for RecordValue {
                fn from(value: $ty) -> Self {
                    RecordValue::$variant(value)
                }
            }
        )*
    };
}

impl_record_value_from! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    bool => Bool,
}

/// Uniform record level interface over a layout bound to one buffer. The
/// scheduler and generic stages treat row and column layouts through this
/// trait; hot paths use the typed accessors of the concrete types.
pub trait BoundLayout {
    /// Tuples the bound buffer can hold.
    fn capacity(&self) -> usize;

    /// Tuples currently published into the buffer.
    fn tuple_count(&self) -> usize;

    /// Append one record; fails with [`BufferError::BufferFull`] at
    /// capacity, leaving the count unchanged.
    fn push_record(&mut self, values: &[RecordValue]) -> Result<(), BufferError>;

    /// Read one record; fails with [`BufferError::IndexOutOfBounds`] past
    /// the tuple count.
    fn read_record(&self, row: usize) -> Result<Vec<RecordValue>, BufferError>;

    fn buffer(&self) -> &TupleBuffer;
}
