//! Live queue registry with smallest-free index allocation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::core::lock;

/// Hands out the smallest index not currently in use.
#[derive(Debug, Default)]
pub struct IndexAllocator {
    free: BTreeSet<usize>,
    next: usize,
}

impl IndexAllocator {
    /// Create an allocator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the smallest free index.
    pub fn alloc(&mut self) -> usize {
        match self.free.pop_first() {
            Some(idx) => idx,
            None => {
                self.next += 1;
                self.next - 1
            }
        }
    }

    /// Return an index; freeing one that is not allocated is ignored.
    pub fn free(&mut self, idx: usize) {
        if idx >= self.next {
            return;
        }
        if idx + 1 == self.next {
            self.next -= 1;
            while self.free.remove(&(self.next.wrapping_sub(1))) {
                self.next -= 1;
            }
        } else {
            self.free.insert(idx);
        }
    }

    /// Number of indices handed out.
    pub fn in_use(&self) -> usize {
        self.next - self.free.len()
    }
}

#[derive(Debug)]
struct TableInner<T> {
    indices: IndexAllocator,
    entries: BTreeMap<usize, Arc<T>>,
}

/// Indexed set of live entries, one index per entry.
#[derive(Debug)]
pub(crate) struct QueueTable<T> {
    inner: Mutex<TableInner<T>>,
}

impl<T> QueueTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                indices: IndexAllocator::new(),
                entries: BTreeMap::new(),
            }),
        }
    }

    /// Allocate an index and register the entry built for it.
    pub(crate) fn insert_with(&self, build: impl FnOnce(usize) -> Arc<T>) -> Arc<T> {
        let mut inner = lock(&self.inner);
        let idx = inner.indices.alloc();
        let entry = build(idx);
        inner.entries.insert(idx, Arc::clone(&entry));
        entry
    }

    /// Unregister an entry and free its index.
    pub(crate) fn remove(&self, idx: usize) -> Option<Arc<T>> {
        let mut inner = lock(&self.inner);
        let entry = inner.entries.remove(&idx)?;
        inner.indices.free(idx);
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        lock(&self.inner).entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_free_index() {
        let mut ids = IndexAllocator::new();
        assert_eq!((ids.alloc(), ids.alloc(), ids.alloc()), (0, 1, 2));
        ids.free(1);
        ids.free(0);
        assert_eq!(ids.alloc(), 0);
        assert_eq!(ids.alloc(), 1);
        assert_eq!(ids.alloc(), 3);
        assert_eq!(ids.in_use(), 4);
    }

    #[test]
    fn test_freeing_tail_shrinks() {
        let mut ids = IndexAllocator::new();
        for _ in 0..4 {
            ids.alloc();
        }
        ids.free(2);
        ids.free(3);
        assert_eq!(ids.in_use(), 2);
        assert_eq!(ids.alloc(), 2);
        ids.free(7);
        assert_eq!(ids.in_use(), 3);
    }

    #[test]
    fn test_table_reuses_index() {
        let table: QueueTable<usize> = QueueTable::new();
        let a = table.insert_with(Arc::new);
        let b = table.insert_with(Arc::new);
        assert_eq!((*a, *b), (0, 1));
        assert!(table.remove(0).is_some());
        assert!(table.remove(0).is_none());
        let c = table.insert_with(Arc::new);
        assert_eq!(*c, 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.snapshot().len(), 2);
    }
}
