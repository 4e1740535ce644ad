//! Free list: reserved indices waiting for their next occupant.
//!
//! Each entry is a raw key whose generation has already been advanced to
//! the one the next value at that index must carry, so handing one out is
//! a pop with no arithmetic.

use crate::key::RawKey;
use std::collections::VecDeque;

/// Which freed index the next insertion reuses.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ReuseOrder {
    /// Most recently freed index first. Keeps churn inside the pages that
    /// are already backed.
    #[default]
    Lifo,
    /// Least recently freed index first. Spreads generation wear across the
    /// index space, delaying overflow retirement under heavy churn.
    Fifo,
}

#[derive(Debug)]
pub(crate) struct FreeList<R> {
    entries: VecDeque<R>,
    order: ReuseOrder,
}

impl<R: RawKey> FreeList<R> {
    pub(crate) fn new(order: ReuseOrder) -> Self {
        Self {
            entries: VecDeque::new(),
            order,
        }
    }

    pub(crate) fn order(&self) -> ReuseOrder {
        self.order
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry the next `pop` returns.
    #[inline]
    pub(crate) fn peek(&self) -> Option<R> {
        self.entries.front().copied()
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<R> {
        self.entries.pop_front()
    }

    /// Return a freed index, positioned according to the reuse order.
    #[inline]
    pub(crate) fn push(&mut self, raw: R) {
        match self.order {
            ReuseOrder::Lifo => self.entries.push_front(raw),
            ReuseOrder::Fifo => self.entries.push_back(raw),
        }
    }

    /// Append a freshly reserved, contiguous index range at generation 1.
    /// Lower indices are handed out first.
    pub(crate) fn seed(&mut self, indices: core::ops::Range<u64>) {
        self.entries.reserve((indices.end - indices.start) as usize);
        self.entries.extend(indices.map(|index| R::encode(1, index)));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = R> + '_ {
        self.entries.iter().copied()
    }
}
