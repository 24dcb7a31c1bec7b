//! Bounded most-recent-first ledger

use std::collections::VecDeque;
use std::sync::Arc;

/// Fixed-capacity history, newest entry first.
///
/// Renderers get an immutable [`snapshot`](Self::snapshot); the ledger itself
/// is only mutated through [`append`](Self::append).
#[derive(Debug, Clone)]
pub struct BoundedLedger<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> BoundedLedger<T> {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend `item`, evicting the oldest entry when full
    pub fn append(&mut self, item: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(item);
    }

    pub fn snapshot(&self) -> Arc<[T]> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
