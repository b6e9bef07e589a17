//! Append-only record storage over a list of tuple buffer pages.

use crate::layout::{LayoutError, LayoutRef, RecordBuffer, Value};
use crate::memory::{BufferProvider, TupleBuffer};
use crate::state::{self, StateError};

/// Records appended into fixed-size pages laid out by a [`MemoryLayout`].
///
/// Pages are unpooled so that long-lived window state never holds on to
/// buffers the sources need for backpressure. Merging two vectors moves
/// their pages without copying records.
///
/// [`MemoryLayout`]: crate::layout::MemoryLayout
#[derive(Debug)]
pub struct PagedVector {
    layout: LayoutRef,
    pages: Vec<TupleBuffer>,
    len: usize,
}

impl PagedVector {
    /// Creates an empty vector.
    #[must_use]
    pub fn new(layout: LayoutRef) -> Self {
        Self {
            layout,
            pages: Vec::new(),
            len: 0,
        }
    }

    /// Record layout of every page.
    #[must_use]
    pub fn layout(&self) -> &LayoutRef {
        &self.layout
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no record was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages.
    #[must_use]
    pub fn number_of_pages(&self) -> usize {
        self.pages.len()
    }

    /// Appends a record, allocating a page when the last one is full.
    ///
    /// # Errors
    ///
    /// Allocation failures and records that do not match the layout.
    pub fn append(&mut self, record: &[Value], provider: &dyn BufferProvider) -> Result<(), LayoutError> {
        let needs_page = match self.pages.last() {
            Some(page) => RecordBuffer::new(page, self.layout.as_ref()).is_full(),
            None => true,
        };
        if needs_page {
            let page = provider.get_unpooled_buffer(self.layout.buffer_size())?;
            self.pages.push(page);
        }
        if let Some(page) = self.pages.last() {
            RecordBuffer::new(page, self.layout.as_ref()).push_record(record, provider)?;
            self.len += 1;
        }
        Ok(())
    }

    /// Moves all pages of `other` to the end of `self`.
    pub fn append_all(&mut self, other: PagedVector) {
        self.len += other.len;
        self.pages.extend(other.pages);
    }

    /// Reads record `index`.
    ///
    /// # Errors
    ///
    /// [`LayoutError::RecordOutOfBounds`] past the end.
    pub fn read(&self, index: usize) -> Result<Vec<Value>, LayoutError> {
        let mut remaining = index;
        for page in &self.pages {
            let view = RecordBuffer::new(page, self.layout.as_ref());
            let records = view.number_of_records();
            if remaining < records {
                return view.read_record(remaining);
            }
            remaining -= records;
        }
        Err(LayoutError::RecordOutOfBounds {
            record: index,
            limit: self.len,
        })
    }

    /// Iterates over all records in append order.
    pub fn iter(&self) -> impl Iterator<Item = Result<Vec<Value>, LayoutError>> + '_ {
        self.pages.iter().flat_map(move |page| {
            let view = RecordBuffer::new(page, self.layout.as_ref());
            (0..view.number_of_records()).map(move |i| view.read_record(i))
        })
    }

    /// Reads every record.
    ///
    /// # Errors
    ///
    /// Malformed pages.
    pub fn to_records(&self) -> Result<Vec<Vec<Value>>, LayoutError> {
        self.iter().collect()
    }

    /// Writes all records into a buffer chain.
    ///
    /// # Errors
    ///
    /// Unreadable pages or allocation failures.
    pub fn serialize(&self, provider: &dyn BufferProvider) -> Result<TupleBuffer, StateError> {
        let records = self
            .to_records()
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        state::encode_to_buffer(&records, provider)
    }

    /// Rebuilds a vector written by [`serialize`](Self::serialize).
    ///
    /// # Errors
    ///
    /// Decoding errors and records that do not fit `layout`.
    pub fn deserialize(
        buffer: &TupleBuffer,
        layout: LayoutRef,
        provider: &dyn BufferProvider,
    ) -> Result<Self, StateError> {
        let records: Vec<Vec<Value>> = state::decode_from_buffer(buffer)?;
        let mut vector = Self::new(layout);
        for record in &records {
            vector
                .append(record, provider)
                .map_err(|e| StateError::Mismatch(e.to_string()))?;
        }
        Ok(vector)
    }
}
