//! Column oriented layout: field `i` of tuple `k` lives at
//! `column_base[i] + k * field_size[i]`, with the column bases derived from
//! the capacity of the bound buffer.

use core::marker::PhantomData;

use crate::buffer::TupleBuffer;
use crate::error::BufferError;
use crate::schema::Schema;

use super::{BoundLayout, FieldValue, RecordValue};

/// Column major arrangement of a schema. Carries no capacity; the column
/// bases depend on the buffer size and are recomputed on bind.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    schema: Schema,
    row_stride: usize,
}

impl ColumnLayout {
    pub fn new(schema: Schema) -> Self {
        ColumnLayout {
            row_stride: schema.size_in_bytes(),
            schema,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Couple the layout with one buffer, computing capacity and column
    /// bases from the buffer size.
    pub fn bind(&self, buffer: TupleBuffer) -> Result<BoundColumnLayout, BufferError> {
        let capacity = buffer.buffer_size() / self.row_stride;
        if capacity == 0 {
            return Err(BufferError::SchemaSizeMismatch {
                schema_bytes: self.row_stride,
                buffer_bytes: buffer.buffer_size(),
            });
        }
        let mut base = 0;
        let column_offsets = self
            .schema
            .fields()
            .iter()
            .map(|field| {
                let o = base;
                base += field.data_type().size_in_bytes() * capacity;
                o
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(BoundColumnLayout {
            layout: self.clone(),
            buffer,
            capacity,
            column_offsets,
        })
    }
}

/// A column layout coupled to one buffer.
pub struct BoundColumnLayout {
    layout: ColumnLayout,
    buffer: TupleBuffer,
    capacity: usize,
    column_offsets: Box<[usize]>,
}

impl BoundColumnLayout {
    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn into_buffer(self) -> TupleBuffer {
        self.buffer
    }

    fn check_field<T: FieldValue>(&self, field: usize) -> Result<(), BufferError> {
        let fields = self.layout.schema.fields();
        let Some(actual) = fields.get(field).map(|f| f.data_type()) else {
            return Err(BufferError::IndexOutOfBounds {
                index: field,
                count: fields.len(),
            });
        };
        if actual != T::DATA_TYPE {
            return Err(BufferError::FieldTypeMismatch {
                field,
                actual,
                requested: T::DATA_TYPE,
            });
        }
        Ok(())
    }

    #[inline]
    fn field_range(&self, row: usize, field: usize) -> core::ops::Range<usize> {
        let size = self.layout.schema.fields()[field].data_type().size_in_bytes();
        let start = self.column_offsets[field] + row * size;
        start..start + size
    }

    /// Typed read of one field, checked against the schema and the tuple
    /// count.
    pub fn read<T: FieldValue>(&self, row: usize, field: usize) -> Result<T, BufferError> {
        self.check_field::<T>(field)?;
        let count = self.tuple_count();
        if row >= count {
            return Err(BufferError::IndexOutOfBounds { index: row, count });
        }
        Ok(T::read_le(&self.buffer.as_slice()[self.field_range(row, field)]))
    }

    /// Typed write of one field at any row below capacity.
    pub fn write<T: FieldValue>(&mut self, row: usize, field: usize, value: T) -> Result<(), BufferError> {
        self.check_field::<T>(field)?;
        if row >= self.capacity {
            return Err(BufferError::IndexOutOfBounds {
                index: row,
                count: self.capacity,
            });
        }
        let range = self.field_range(row, field);
        value.write_le(&mut self.buffer.as_mut_slice()[range]);
        Ok(())
    }

    /// Read-only typed view of one whole column, indexable by tuple index
    /// up to the tuple count.
    pub fn field_slice<T: FieldValue>(&self, field: usize) -> Result<FieldSlice<'_, T>, BufferError> {
        self.check_field::<T>(field)?;
        let len = self.tuple_count();
        let base = self.column_offsets[field];
        let size = T::DATA_TYPE.size_in_bytes();
        Ok(FieldSlice {
            bytes: &self.buffer.as_slice()[base..base + size * self.capacity],
            len,
            _value: PhantomData,
        })
    }

    /// Mutable typed view of one whole column, indexable up to capacity.
    pub fn field_slice_mut<T: FieldValue>(
        &mut self,
        field: usize,
    ) -> Result<FieldSliceMut<'_, T>, BufferError> {
        self.check_field::<T>(field)?;
        let base = self.column_offsets[field];
        let size = T::DATA_TYPE.size_in_bytes();
        let capacity = self.capacity;
        Ok(FieldSliceMut {
            bytes: &mut self.buffer.as_mut_slice()[base..base + size * capacity],
            len: capacity,
            _value: PhantomData,
        })
    }
}

impl BoundLayout for BoundColumnLayout {
    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn tuple_count(&self) -> usize {
        self.buffer.number_of_tuples() as usize
    }

    fn push_record(&mut self, values: &[RecordValue]) -> Result<(), BufferError> {
        let fields = self.layout.schema.fields();
        if values.len() != fields.len() {
            return Err(BufferError::RecordMismatch("field count differs from schema"));
        }
        let row = self.tuple_count();
        if row >= self.capacity {
            return Err(BufferError::BufferFull {
                capacity: self.capacity,
            });
        }
        for (field, value) in values.iter().enumerate() {
            if value.data_type() != fields[field].data_type() {
                return Err(BufferError::FieldTypeMismatch {
                    field,
                    actual: fields[field].data_type(),
                    requested: value.data_type(),
                });
            }
        }
        for (field, value) in values.iter().enumerate() {
            let range = self.field_range(row, field);
            value.write_le(&mut self.buffer.as_mut_slice()[range]);
        }
        self.buffer.set_number_of_tuples(row as u64 + 1);
        Ok(())
    }

    fn read_record(&self, row: usize) -> Result<Vec<RecordValue>, BufferError> {
        let count = self.tuple_count();
        if row >= count {
            return Err(BufferError::IndexOutOfBounds { index: row, count });
        }
        Ok(self
            .layout
            .schema
            .fields()
            .iter()
            .enumerate()
            .map(|(field, f)| {
                RecordValue::read_le(f.data_type(), &self.buffer.as_slice()[self.field_range(row, field)])
            })
            .collect())
    }

    fn buffer(&self) -> &TupleBuffer {
        &self.buffer
    }
}

/// Typed read view over one column.
pub struct FieldSlice<'a, T: FieldValue> {
    bytes: &'a [u8],
    len: usize,
    _value: PhantomData<T>,
}

impl<T: FieldValue> FieldSlice<'_, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// # Panics
    /// When `index` is at or past the tuple count.
    #[inline]
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len, "tuple index {index} out of bounds");
        let size = T::DATA_TYPE.size_in_bytes();
        T::read_le(&self.bytes[index * size..])
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(|i| self.get(i))
    }
}

/// Typed write view over one column.
pub struct FieldSliceMut<'a, T: FieldValue> {
    bytes: &'a mut [u8],
    len: usize,
    _value: PhantomData<T>,
}

impl<T: FieldValue> FieldSliceMut<'_, T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// # Panics
    /// When `index` is at or past capacity.
    #[inline]
    pub fn set(&mut self, index: usize, value: T) {
        assert!(index < self.len, "tuple index {index} out of bounds");
        let size = T::DATA_TYPE.size_in_bytes();
        value.write_le(&mut self.bytes[index * size..]);
    }

    #[inline]
    pub fn get(&self, index: usize) -> T {
        assert!(index < self.len, "tuple index {index} out of bounds");
        let size = T::DATA_TYPE.size_in_bytes();
        T::read_le(&self.bytes[index * size..])
    }
}
