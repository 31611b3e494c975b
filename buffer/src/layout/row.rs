//! Row oriented layout: field `i` of tuple `k` lives at
//! `k * row_stride + field_offset[i]`.

use std::sync::Arc;

use crate::buffer::TupleBuffer;
use crate::error::BufferError;
use crate::schema::Schema;

use super::{BoundLayout, FieldValue, RecordValue};

/// Offset table for row major access, derived once from a schema and
/// reusable across buffers.
#[derive(Debug, Clone)]
pub struct RowLayout {
    schema: Schema,
    field_offsets: Arc<[usize]>,
    row_stride: usize,
}

impl RowLayout {
    pub fn new(schema: Schema) -> Self {
        let mut offset = 0;
        let field_offsets = schema
            .fields()
            .iter()
            .map(|field| {
                let o = offset;
                offset += field.data_type().size_in_bytes();
                o
            })
            .collect::<Vec<_>>()
            .into();
        RowLayout {
            row_stride: schema.size_in_bytes(),
            schema,
            field_offsets,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    #[inline]
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    #[inline]
    pub fn field_offset(&self, field: usize) -> usize {
        self.field_offsets[field]
    }

    /// Couple the layout with one buffer. Fails with
    /// [`BufferError::SchemaSizeMismatch`] when not even a single row fits.
    pub fn bind(&self, buffer: TupleBuffer) -> Result<BoundRowLayout, BufferError> {
        let capacity = buffer.buffer_size() / self.row_stride;
        if capacity == 0 {
            return Err(BufferError::SchemaSizeMismatch {
                schema_bytes: self.row_stride,
                buffer_bytes: buffer.buffer_size(),
            });
        }
        Ok(BoundRowLayout {
            layout: self.clone(),
            buffer,
            capacity,
        })
    }
}

/// A row layout coupled to one buffer.
pub struct BoundRowLayout {
    layout: RowLayout,
    buffer: TupleBuffer,
    capacity: usize,
}

impl BoundRowLayout {
    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    /// Hand the buffer back, typically for emission.
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
        let start = row * self.layout.row_stride + self.layout.field_offsets[field];
        let size = self.layout.schema.fields()[field].data_type().size_in_bytes();
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

    /// Typed write of one field at any row below capacity. Does not change
    /// the tuple count; producers publish it when the buffer is complete.
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

    /// Dynamically typed read of one field.
    pub fn read_value(&self, row: usize, field: usize) -> Result<RecordValue, BufferError> {
        let count = self.tuple_count();
        if row >= count {
            return Err(BufferError::IndexOutOfBounds { index: row, count });
        }
        let fields = self.layout.schema.fields();
        let Some(data_type) = fields.get(field).map(|f| f.data_type()) else {
            return Err(BufferError::IndexOutOfBounds {
                index: field,
                count: fields.len(),
            });
        };
        Ok(RecordValue::read_le(
            data_type,
            &self.buffer.as_slice()[self.field_range(row, field)],
        ))
    }

    /// Dynamically typed write of one field at any row below capacity.
    pub fn write_value(
        &mut self,
        row: usize,
        field: usize,
        value: RecordValue,
    ) -> Result<(), BufferError> {
        if row >= self.capacity {
            return Err(BufferError::IndexOutOfBounds {
                index: row,
                count: self.capacity,
            });
        }
        let fields = self.layout.schema.fields();
        let Some(data_type) = fields.get(field).map(|f| f.data_type()) else {
            return Err(BufferError::IndexOutOfBounds {
                index: field,
                count: fields.len(),
            });
        };
        if value.data_type() != data_type {
            return Err(BufferError::FieldTypeMismatch {
                field,
                actual: data_type,
                requested: value.data_type(),
            });
        }
        let range = self.field_range(row, field);
        value.write_le(&mut self.buffer.as_mut_slice()[range]);
        Ok(())
    }

    /// Append one row copied verbatim from another bound layout over the
    /// same schema. The fast path of filtering stages.
    pub fn append_row_from(
        &mut self,
        src: &BoundRowLayout,
        src_row: usize,
    ) -> Result<(), BufferError> {
        if self.layout.schema != src.layout.schema {
            return Err(BufferError::RecordMismatch("source schema differs"));
        }
        let src_count = src.tuple_count();
        if src_row >= src_count {
            return Err(BufferError::IndexOutOfBounds {
                index: src_row,
                count: src_count,
            });
        }
        let row = self.tuple_count();
        if row >= self.capacity {
            return Err(BufferError::BufferFull {
                capacity: self.capacity,
            });
        }
        let stride = self.layout.row_stride;
        self.buffer.as_mut_slice()[row * stride..(row + 1) * stride]
            .copy_from_slice(&src.buffer.as_slice()[src_row * stride..(src_row + 1) * stride]);
        self.buffer.set_number_of_tuples(row as u64 + 1);
        Ok(())
    }

    /// Unchecked typed read for hot paths.
    ///
    /// # Safety
    /// `row` must be below the tuple count and the schema field at `field`
    /// must be of type `T`.
    pub unsafe fn read_unchecked<T: FieldValue>(&self, row: usize, field: usize) -> T {
        debug_assert!(row < self.tuple_count());
        let range = self.field_range(row, field);
        // SAFETY: range is in bounds per the caller contract.
        T::read_le(unsafe { self.buffer.as_slice().get_unchecked(range) })
    }

    /// Unchecked typed write for hot paths.
    ///
    /// # Safety
    /// `row` must be below capacity and the schema field at `field` must be
    /// of type `T`.
    pub unsafe fn write_unchecked<T: FieldValue>(&mut self, row: usize, field: usize, value: T) {
        debug_assert!(row < self.capacity);
        let range = self.field_range(row, field);
        // SAFETY: range is in bounds per the caller contract.
        value.write_le(unsafe { self.buffer.as_mut_slice().get_unchecked_mut(range) });
    }
}

impl BoundLayout for BoundRowLayout {
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

#[cfg(test)]
mod test {
    use crate::manager::BufferManager;
    use crate::schema::DataType;

    use super::*;

    fn test_schema() -> Schema {
        Schema::builder()
            .field("id", DataType::Int64)
            .field("flag", DataType::Bool)
            .field("value", DataType::Float64)
            .build()
    }

    #[test]
    fn push_and_read_roundtrip() {
        let manager = BufferManager::new(256, 1);
        let layout = RowLayout::new(test_schema());
        let mut bound = layout.bind(manager.get_buffer_blocking()).unwrap();

        for i in 0..5i64 {
            bound
                .push_record(&[i.into(), (i % 2 == 0).into(), (i as f64 * 0.5).into()])
                .unwrap();
        }
        assert_eq!(bound.tuple_count(), 5);
        for i in 0..5i64 {
            let record = bound.read_record(i as usize).unwrap();
            assert_eq!(record[0], RecordValue::Int64(i));
            assert_eq!(record[1], RecordValue::Bool(i % 2 == 0));
            assert_eq!(record[2], RecordValue::Float64(i as f64 * 0.5));
        }
    }

    #[test]
    fn typed_field_access() {
        let manager = BufferManager::new(256, 1);
        let layout = RowLayout::new(test_schema());
        let mut bound = layout.bind(manager.get_buffer_blocking()).unwrap();
        bound.write(0, 0, 41i64).unwrap();
        bound.write(0, 2, 2.5f64).unwrap();
        bound.buffer().set_number_of_tuples(1);

        assert_eq!(bound.read::<i64>(0, 0).unwrap(), 41);
        assert_eq!(bound.read::<f64>(0, 2).unwrap(), 2.5);
        assert!(matches!(
            bound.read::<i32>(0, 0),
            Err(BufferError::FieldTypeMismatch { .. })
        ));
    }

    #[test]
    fn full_buffer_rejects_push_and_keeps_count() {
        let manager = BufferManager::new(64, 1);
        let schema = Schema::builder().field("v", DataType::UInt64).build();
        let layout = RowLayout::new(schema);
        let mut bound = layout.bind(manager.get_buffer_blocking()).unwrap();
        for i in 0..bound.capacity() as u64 {
            bound.push_record(&[i.into()]).unwrap();
        }
        let err = bound.push_record(&[99u64.into()]).unwrap_err();
        assert!(matches!(err, BufferError::BufferFull { .. }));
        assert_eq!(bound.tuple_count(), bound.capacity());
    }

    #[test]
    fn read_past_count_is_out_of_bounds() {
        let manager = BufferManager::new(256, 1);
        let layout = RowLayout::new(test_schema());
        let mut bound = layout.bind(manager.get_buffer_blocking()).unwrap();
        bound.push_record(&[1i64.into(), true.into(), 0.0f64.into()]).unwrap();
        assert!(matches!(
            bound.read_record(1),
            Err(BufferError::IndexOutOfBounds { index: 1, count: 1 })
        ));
        assert!(matches!(
            bound.read::<i64>(3, 0),
            Err(BufferError::IndexOutOfBounds { index: 3, count: 1 })
        ));
    }

    #[test]
    fn bind_rejects_oversized_schema() {
        let manager = BufferManager::new(64, 1);
        let mut builder = Schema::builder();
        for i in 0..9 {
            builder = builder.field(format!("f{i}"), DataType::UInt64);
        }
        let layout = RowLayout::new(builder.build());
        assert!(matches!(
            layout.bind(manager.get_buffer_blocking()),
            Err(BufferError::SchemaSizeMismatch { .. })
        ));
    }
}
