use crate::memory::{BufferProvider, ChildIndex, TupleBuffer};

use super::{DataType, LayoutError, MemoryLayout, Value};

const TEXT_LENGTH_PREFIX: usize = std::mem::size_of::<u32>();

/// Typed view of a [`TupleBuffer`] through a [`MemoryLayout`].
///
/// Reads are bounded by the buffer's `number_of_tuples`; writes by the
/// layout's capacity. Variable-sized text lives in child buffers.
pub struct RecordBuffer<'a> {
    buffer: &'a TupleBuffer,
    layout: &'a dyn MemoryLayout,
}

impl<'a> RecordBuffer<'a> {
    /// Creates a view.
    #[must_use]
    pub fn new(buffer: &'a TupleBuffer, layout: &'a dyn MemoryLayout) -> Self {
        debug_assert!(
            buffer.capacity() >= layout.buffer_size(),
            "buffer smaller than layout"
        );
        Self { buffer, layout }
    }

    /// The underlying buffer.
    #[must_use]
    pub fn buffer(&self) -> &TupleBuffer {
        self.buffer
    }

    /// Records currently stored.
    #[must_use]
    pub fn number_of_records(&self) -> usize {
        usize::try_from(self.buffer.number_of_tuples()).unwrap_or(usize::MAX)
    }

    /// True once the buffer holds `capacity` records.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.number_of_records() >= self.layout.capacity()
    }

    fn check_field(&self, field: usize) -> Result<DataType, LayoutError> {
        self.layout
            .schema()
            .field(field)
            .map(|f| f.data_type)
            .ok_or(LayoutError::FieldOutOfBounds {
                field,
                width: self.layout.schema().len(),
            })
    }

    /// Reads one field of a stored record.
    ///
    /// # Errors
    ///
    /// Out-of-bounds record or field, or a malformed text child.
    pub fn read_value(&self, record: usize, field: usize) -> Result<Value, LayoutError> {
        let data_type = self.check_field(field)?;
        let limit = self.number_of_records();
        if record >= limit {
            return Err(LayoutError::RecordOutOfBounds { record, limit });
        }
        let offset = self.layout.field_offset(record, field);
        read_raw(self.buffer, offset, data_type)
    }

    /// Reads all fields of a stored record.
    ///
    /// # Errors
    ///
    /// Same as [`read_value`](Self::read_value).
    pub fn read_record(&self, record: usize) -> Result<Vec<Value>, LayoutError> {
        (0..self.layout.schema().len())
            .map(|field| self.read_value(record, field))
            .collect()
    }

    /// Writes one field. Numeric values are cast to the field type when
    /// representable.
    ///
    /// # Errors
    ///
    /// Out-of-bounds position, type mismatch, or child allocation failure.
    pub fn write_value(
        &self,
        record: usize,
        field: usize,
        value: &Value,
        provider: &dyn BufferProvider,
    ) -> Result<(), LayoutError> {
        let data_type = self.check_field(field)?;
        let limit = self.layout.capacity();
        if record >= limit {
            return Err(LayoutError::RecordOutOfBounds { record, limit });
        }
        let offset = self.layout.field_offset(record, field);
        if let Value::Text(text) = value {
            if data_type != DataType::Text {
                return Err(LayoutError::TypeMismatch {
                    field,
                    expected: data_type,
                    actual: DataType::Text,
                });
            }
            return write_text_at(self.buffer, offset, text, provider);
        }
        let cast = value
            .cast_to(data_type)
            .ok_or(LayoutError::TypeMismatch {
                field,
                expected: data_type,
                actual: value.data_type(),
            })?;
        write_raw(self.buffer, offset, &cast);
        Ok(())
    }

    /// Appends a record and bumps `number_of_tuples`.
    ///
    /// # Errors
    ///
    /// [`LayoutError::BufferFull`], [`LayoutError::ArityMismatch`] or any
    /// [`write_value`](Self::write_value) error. Nothing is counted on error.
    pub fn push_record(
        &self,
        values: &[Value],
        provider: &dyn BufferProvider,
    ) -> Result<usize, LayoutError> {
        let width = self.layout.schema().len();
        if values.len() != width {
            return Err(LayoutError::ArityMismatch {
                expected: width,
                actual: values.len(),
            });
        }
        if self.is_full() {
            return Err(LayoutError::BufferFull {
                capacity: self.layout.capacity(),
            });
        }
        let record = self.number_of_records();
        for (field, value) in values.iter().enumerate() {
            self.write_value(record, field, value, provider)?;
        }
        self.buffer.set_number_of_tuples(record as u64 + 1);
        Ok(record)
    }

    /// Reads a text field.
    ///
    /// # Errors
    ///
    /// Type mismatch, out of bounds, or malformed child.
    pub fn read_text(&self, record: usize, field: usize) -> Result<String, LayoutError> {
        match self.read_value(record, field)? {
            Value::Text(text) => Ok(text),
            other => Err(LayoutError::TypeMismatch {
                field,
                expected: DataType::Text,
                actual: other.data_type(),
            }),
        }
    }

    /// Writes a text field through a child buffer.
    ///
    /// # Errors
    ///
    /// Same as [`write_value`](Self::write_value).
    pub fn write_text(
        &self,
        record: usize,
        field: usize,
        text: &str,
        provider: &dyn BufferProvider,
    ) -> Result<(), LayoutError> {
        self.write_value(record, field, &Value::Text(text.to_string()), provider)
    }
}

/// Reads a value at a raw offset. Used by the trusted access paths.
///
/// # Errors
///
/// Only text fields can fail (missing or malformed child buffer).
pub fn read_raw(
    buffer: &TupleBuffer,
    offset: usize,
    data_type: DataType,
) -> Result<Value, LayoutError> {
    Ok(match data_type {
        DataType::Bool => Value::Bool(buffer.read_at(offset)),
        DataType::Int8 => Value::Int8(buffer.read_at(offset)),
        DataType::Int16 => Value::Int16(buffer.read_at(offset)),
        DataType::Int32 => Value::Int32(buffer.read_at(offset)),
        DataType::Int64 => Value::Int64(buffer.read_at(offset)),
        DataType::UInt8 => Value::UInt8(buffer.read_at(offset)),
        DataType::UInt16 => Value::UInt16(buffer.read_at(offset)),
        DataType::UInt32 => Value::UInt32(buffer.read_at(offset)),
        DataType::UInt64 => Value::UInt64(buffer.read_at(offset)),
        DataType::Float32 => Value::Float32(buffer.read_at(offset)),
        DataType::Float64 => Value::Float64(buffer.read_at(offset)),
        DataType::Char => Value::Char(buffer.read_at(offset)),
        DataType::Text => Value::Text(read_text_at(buffer, offset)?),
    })
}

/// Writes a fixed-width value at a raw offset. Text is ignored here; it needs
/// a provider for its child buffer.
pub fn write_raw(buffer: &TupleBuffer, offset: usize, value: &Value) {
    match *value {
        Value::Bool(v) => buffer.write_at(offset, v),
        Value::Int8(v) => buffer.write_at(offset, v),
        Value::Int16(v) => buffer.write_at(offset, v),
        Value::Int32(v) => buffer.write_at(offset, v),
        Value::Int64(v) => buffer.write_at(offset, v),
        Value::UInt8(v) => buffer.write_at(offset, v),
        Value::UInt16(v) => buffer.write_at(offset, v),
        Value::UInt32(v) => buffer.write_at(offset, v),
        Value::UInt64(v) => buffer.write_at(offset, v),
        Value::Float32(v) => buffer.write_at(offset, v),
        Value::Float64(v) => buffer.write_at(offset, v),
        Value::Char(v) => buffer.write_at(offset, v),
        Value::Text(_) => debug_assert!(false, "text written through write_raw"),
    }
}

fn read_text_at(buffer: &TupleBuffer, offset: usize) -> Result<String, LayoutError> {
    let index = ChildIndex(buffer.read_at::<u32>(offset));
    let child = buffer
        .load_child_buffer(index)
        .ok_or(LayoutError::InvalidText("missing child buffer"))?;
    let length = child.read_at::<u32>(0) as usize;
    if TEXT_LENGTH_PREFIX + length > child.capacity() {
        return Err(LayoutError::InvalidText("length exceeds child buffer"));
    }
    let bytes = child.as_slice()[TEXT_LENGTH_PREFIX..TEXT_LENGTH_PREFIX + length].to_vec();
    String::from_utf8(bytes).map_err(|_| LayoutError::InvalidText("not valid UTF-8"))
}

fn write_text_at(
    buffer: &TupleBuffer,
    offset: usize,
    text: &str,
    provider: &dyn BufferProvider,
) -> Result<(), LayoutError> {
    let required = TEXT_LENGTH_PREFIX + text.len();
    let length = u32::try_from(text.len()).map_err(|_| LayoutError::InvalidText("text too long"))?;
    let child = if required <= provider.buffer_size() {
        provider.get_buffer_blocking()
    } else {
        provider.get_unpooled_buffer(required)?
    };
    child.write_at::<u32>(0, length);
    child.as_mut_slice()[TEXT_LENGTH_PREFIX..required].copy_from_slice(text.as_bytes());
    let index = buffer.store_child_buffer(child);
    buffer.write_at::<u32>(offset, index.0);
    Ok(())
}
