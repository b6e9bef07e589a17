use super::{validate, LayoutError, MemoryLayout, Schema};

/// Row-major layout: `offset = record * tuple_size + field_offset[field]`.
#[derive(Debug, Clone)]
pub struct RowLayout {
    schema: Schema,
    buffer_size: usize,
    tuple_size: usize,
    capacity: usize,
    field_offsets: Vec<usize>,
}

impl RowLayout {
    /// Builds a row layout.
    ///
    /// # Errors
    ///
    /// [`LayoutError::EmptySchema`] or [`LayoutError::TupleTooLarge`].
    pub fn new(schema: Schema, buffer_size: usize) -> Result<Self, LayoutError> {
        let tuple_size = validate(&schema, buffer_size)?;
        let field_offsets = schema
            .fields()
            .iter()
            .scan(0usize, |offset, field| {
                let current = *offset;
                *offset += field.data_type.size();
                Some(current)
            })
            .collect();
        Ok(Self {
            capacity: buffer_size / tuple_size,
            schema,
            buffer_size,
            tuple_size,
            field_offsets,
        })
    }

    /// Offset of `field` inside a record.
    #[must_use]
    pub fn field_offset_in_record(&self, field: usize) -> usize {
        self.field_offsets[field]
    }
}

impl MemoryLayout for RowLayout {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn field_offset(&self, record: usize, field: usize) -> usize {
        debug_assert!(record < self.capacity, "record {record} >= capacity");
        debug_assert!(field < self.field_offsets.len(), "field {field} out of range");
        record * self.tuple_size + self.field_offsets[field]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DataType;

    fn schema() -> Schema {
        Schema::default()
            .with_field("a", DataType::UInt64)
            .with_field("b", DataType::Int16)
            .with_field("c", DataType::Float64)
    }

    #[test]
    fn test_row_offsets() {
        let layout = RowLayout::new(schema(), 180).unwrap();
        assert_eq!(layout.tuple_size(), 18);
        assert_eq!(layout.capacity(), 10);
        assert_eq!(layout.field_offset(0, 0), 0);
        assert_eq!(layout.field_offset(0, 1), 8);
        assert_eq!(layout.field_offset(0, 2), 10);
        assert_eq!(layout.field_offset(3, 2), 3 * 18 + 10);
    }

    #[test]
    fn test_row_rejects_oversized_tuple() {
        assert!(matches!(
            RowLayout::new(schema(), 10),
            Err(LayoutError::TupleTooLarge { .. })
        ));
        assert!(matches!(
            RowLayout::new(Schema::default(), 10),
            Err(LayoutError::EmptySchema)
        ));
    }
}
