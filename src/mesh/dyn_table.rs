//! Variable-row-width table (one row per node, listing the global ids of the
//! elements referencing that node).
//!
//! Mirrors [`Table`](super::table::Table) but each row has its own length.
//! Mutations go through the same deferred-buffer discipline.

/// Densely stored table whose rows have individual lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct DynTable<T> {
    offsets: Vec<usize>,
    data: Vec<T>,
}

// the offsets vector always starts with a leading 0, so the derived
// Default (empty offsets) would be an invalid state
impl<T> Default for DynTable<T> {
    fn default() -> Self {
        Self {
            offsets: vec![0],
            data: Vec::new(),
        }
    }
}

impl<T: Clone> DynTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, i: usize) -> &[T] {
        &self.data[self.offsets[i]..self.offsets[i + 1]]
    }

    pub fn row_len(&self, i: usize) -> usize {
        self.offsets[i + 1] - self.offsets[i]
    }

    pub fn push_row(&mut self, row: &[T]) {
        self.data.extend_from_slice(row);
        self.offsets.push(self.data.len());
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        (0..self.len()).map(|i| self.row(i))
    }

    pub fn buffer(&mut self) -> DynTableBuffer<'_, T> {
        let rows = self.len();
        DynTableBuffer {
            table: self,
            removed: vec![false; rows],
            added: Vec::new(),
        }
    }
}

/// Deferred add/remove buffer for a [`DynTable`].
pub struct DynTableBuffer<'a, T> {
    table: &'a mut DynTable<T>,
    removed: Vec<bool>,
    added: Vec<Vec<T>>,
}

impl<'a, T: Clone> DynTableBuffer<'a, T> {
    pub fn rm_row(&mut self, i: usize) {
        self.removed[i] = true;
    }

    pub fn add_row(&mut self, row: &[T]) {
        self.added.push(row.to_vec());
    }

    pub fn flush(self) {
        if self.removed.iter().any(|&r| r) {
            let mut rebuilt = DynTable::new();
            for i in 0..self.table.len() {
                if !self.removed[i] {
                    rebuilt.push_row(self.table.row(i));
                }
            }
            *self.table = rebuilt;
        }
        for row in self.added {
            self.table.push_row(&row);
        }
    }
}
