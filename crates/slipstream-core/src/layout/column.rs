use super::{validate, LayoutError, MemoryLayout, Schema};

/// Column-major layout: `offset = column_offset[field] + record * field_size[field]`.
///
/// Each field owns a contiguous region sized for `capacity` values.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    schema: Schema,
    buffer_size: usize,
    tuple_size: usize,
    capacity: usize,
    column_offsets: Vec<usize>,
    field_sizes: Vec<usize>,
}

impl ColumnLayout {
    /// Builds a column layout.
    ///
    /// # Errors
    ///
    /// [`LayoutError::EmptySchema`] or [`LayoutError::TupleTooLarge`].
    pub fn new(schema: Schema, buffer_size: usize) -> Result<Self, LayoutError> {
        let tuple_size = validate(&schema, buffer_size)?;
        let capacity = buffer_size / tuple_size;
        let field_sizes: Vec<usize> = schema.fields().iter().map(|f| f.data_type.size()).collect();
        let column_offsets = field_sizes
            .iter()
            .scan(0usize, |offset, size| {
                let current = *offset;
                *offset += size * capacity;
                Some(current)
            })
            .collect();
        Ok(Self {
            schema,
            buffer_size,
            tuple_size,
            capacity,
            column_offsets,
            field_sizes,
        })
    }

    /// Start of the region holding `field`.
    #[must_use]
    pub fn column_offset(&self, field: usize) -> usize {
        self.column_offsets[field]
    }
}

impl MemoryLayout for ColumnLayout {
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
        debug_assert!(field < self.field_sizes.len(), "field {field} out of range");
        self.column_offsets[field] + record * self.field_sizes[field]
    }

    fn field_size(&self, field: usize) -> usize {
        self.field_sizes[field]
    }
}
