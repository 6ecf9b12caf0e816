//! Row-based table with a fixed row width and deferred mutation buffers.
//!
//! Coordinate tables (row width = spatial dimension) and element
//! connectivity tables (row width = nodes per element) are both instances of
//! [`Table`]. Structural changes go through a [`TableBuffer`]: removals and
//! appends are queued against the *current* row indices and applied together
//! on [`TableBuffer::flush`]. There is no rollback; a flushed buffer is the
//! new truth.

/// Fixed-row-width, densely stored table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table<T> {
    width: usize,
    data: Vec<T>,
}

impl<T: Clone> Table<T> {
    /// Empty table whose rows are `width` entries wide.
    pub fn new(width: usize) -> Self {
        Self {
            width,
            data: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        if self.width == 0 { 0 } else { self.data.len() / self.width }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.width..(i + 1) * self.width]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [T] {
        &mut self.data[i * self.width..(i + 1) * self.width]
    }

    /// Append a row immediately (no buffer involved).
    pub fn push_row(&mut self, row: &[T]) {
        debug_assert_eq!(row.len(), self.width);
        self.data.extend_from_slice(row);
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks_exact(self.width.max(1))
    }

    /// Open a deferred mutation buffer over this table.
    pub fn buffer(&mut self) -> TableBuffer<'_, T> {
        let rows = self.len();
        TableBuffer {
            table: self,
            removed: vec![false; rows],
            added: Vec::new(),
        }
    }
}

/// Deferred add/remove buffer for a [`Table`]; apply-on-flush, no rollback.
pub struct TableBuffer<'a, T> {
    table: &'a mut Table<T>,
    removed: Vec<bool>,
    added: Vec<T>,
}

impl<'a, T: Clone> TableBuffer<'a, T> {
    /// Queue removal of row `i` (an index valid *before* any flush).
    pub fn rm_row(&mut self, i: usize) {
        self.removed[i] = true;
    }

    /// Queue a new row for appending.
    pub fn add_row(&mut self, row: &[T]) {
        debug_assert_eq!(row.len(), self.table.width);
        self.added.extend_from_slice(row);
    }

    /// Apply queued removals (preserving row order), then queued appends.
    pub fn flush(self) {
        let width = self.table.width.max(1);
        if self.removed.iter().any(|&r| r) {
            let mut kept = Vec::with_capacity(self.table.data.len());
            for (i, row) in self.table.data.chunks_exact(width).enumerate() {
                if !self.removed[i] {
                    kept.extend_from_slice(row);
                }
            }
            self.table.data = kept;
        }
        self.table.data.extend(self.added);
    }
}
