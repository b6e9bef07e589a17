//! # Memory Layouts
//!
//! Maps `(record, field)` positions to byte offsets inside a [`TupleBuffer`].
//!
//! - [`RowLayout`]: records stored contiguously, fields interleaved
//! - [`ColumnLayout`]: one contiguous region per field
//! - [`RecordBuffer`]: checked, typed view over a buffer through a layout
//!
//! A layout is computed once from a [`Schema`] and a buffer size, then shared
//! behind an `Arc`. It is the single source of truth for offsets: operators,
//! sources and sinks never compute offsets themselves.
//!
//! [`TupleBuffer`]: crate::memory::TupleBuffer

mod column;
mod record;
mod row;
mod value;

use std::fmt;
use std::sync::Arc;

pub use column::ColumnLayout;
pub use record::{read_raw, write_raw, RecordBuffer};
pub use row::RowLayout;
pub use value::{DataType, KeyBytes, Value};

use crate::memory::BufferError;

/// Errors raised when building layouts or accessing records.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    /// Schema has no fields.
    #[error("schema has no fields")]
    EmptySchema,

    /// A single tuple does not fit into one buffer.
    #[error("tuple of {tuple_size} bytes does not fit a {buffer_size}-byte buffer")]
    TupleTooLarge {
        /// Size of one tuple.
        tuple_size: usize,
        /// Buffer size.
        buffer_size: usize,
    },

    /// Record index past the buffer's record count or capacity.
    #[error("record {record} out of bounds (limit {limit})")]
    RecordOutOfBounds {
        /// Requested record.
        record: usize,
        /// Exclusive upper bound.
        limit: usize,
    },

    /// Field index past the schema width.
    #[error("field {field} out of bounds (schema has {width} fields)")]
    FieldOutOfBounds {
        /// Requested field.
        field: usize,
        /// Number of fields.
        width: usize,
    },

    /// No field with this name.
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// Value type does not match the field type.
    #[error("field {field} expects {expected}, got {actual}")]
    TypeMismatch {
        /// Field index.
        field: usize,
        /// Schema type.
        expected: DataType,
        /// Supplied type.
        actual: DataType,
    },

    /// Number of values does not match the schema width.
    #[error("record has {actual} values, schema has {expected} fields")]
    ArityMismatch {
        /// Schema width.
        expected: usize,
        /// Supplied values.
        actual: usize,
    },

    /// Buffer is full.
    #[error("buffer full: capacity is {capacity} records")]
    BufferFull {
        /// Records per buffer.
        capacity: usize,
    },

    /// Text child buffer is missing or malformed.
    #[error("invalid text field: {0}")]
    InvalidText(&'static str),

    /// Allocation of a child buffer failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Field {
    /// Column name.
    pub name: String,
    /// Physical type.
    pub data_type: DataType,
}

impl Field {
    /// Creates a field.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered list of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Creates a schema from fields.
    #[must_use]
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Appends a field (builder style).
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.fields.push(Field::new(name, data_type));
        self
    }

    /// All fields in order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field at `index`.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Index of the field called `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Like [`index_of`](Self::index_of), but errors on unknown names.
    ///
    /// # Errors
    ///
    /// [`LayoutError::UnknownField`] if no field has that name.
    pub fn require(&self, name: &str) -> Result<usize, LayoutError> {
        self.index_of(name)
            .ok_or_else(|| LayoutError::UnknownField(name.to_string()))
    }

    /// Sum of the inline sizes of all fields.
    #[must_use]
    pub fn tuple_size(&self) -> usize {
        self.fields.iter().map(|f| f.data_type.size()).sum()
    }

    /// Fields of `self` followed by fields of `other`.
    #[must_use]
    pub fn concat(&self, other: &Schema) -> Schema {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        Schema { fields }
    }

    /// True if any field is variable-sized.
    #[must_use]
    pub fn has_text(&self) -> bool {
        self.fields.iter().any(|f| f.data_type == DataType::Text)
    }
}

/// Maps record/field positions to byte offsets.
///
/// Implementations precompute everything at construction; offset methods do
/// no validation beyond `debug_assert!`.
pub trait MemoryLayout: Send + Sync + fmt::Debug {
    /// The schema this layout was built for.
    fn schema(&self) -> &Schema;

    /// Bytes per record.
    fn tuple_size(&self) -> usize;

    /// Bytes per buffer.
    fn buffer_size(&self) -> usize;

    /// Records per buffer.
    fn capacity(&self) -> usize;

    /// Byte offset of `field` in `record`.
    fn field_offset(&self, record: usize, field: usize) -> usize;

    /// Inline size of `field`.
    fn field_size(&self, field: usize) -> usize {
        self.schema().fields()[field].data_type.size()
    }
}

/// Shared handle to a layout.
pub type LayoutRef = Arc<dyn MemoryLayout>;

fn validate(schema: &Schema, buffer_size: usize) -> Result<usize, LayoutError> {
    if schema.is_empty() {
        return Err(LayoutError::EmptySchema);
    }
    let tuple_size = schema.tuple_size();
    if tuple_size > buffer_size {
        return Err(LayoutError::TupleTooLarge {
            tuple_size,
            buffer_size,
        });
    }
    Ok(tuple_size)
}
