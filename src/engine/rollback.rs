use std::collections::VecDeque;

use crate::model::Operation;

/// Last-in-first-out history of invertible operations.
///
/// Knows nothing about slots or requests; it only stores records and hands
/// back the most recent ones. With a retention limit the oldest records are
/// evicted first, so `rollback(k)` past the retained depth returns fewer.
#[derive(Debug, Clone, Default)]
pub struct RollbackLog {
    history: VecDeque<Operation>,
    limit: Option<usize>,
}

impl RollbackLog {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            history: VecDeque::new(),
            limit,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Append a record. Returns how many old records were evicted to make room.
    pub fn log(&mut self, op: Operation) -> usize {
        self.history.push_back(op);
        let mut evicted = 0;
        if let Some(limit) = self.limit {
            while self.history.len() > limit {
                self.history.pop_front();
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove and return up to `k` records, most recent first.
    pub fn rollback(&mut self, k: usize) -> Vec<Operation> {
        let n = k.min(self.history.len());
        let mut popped = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(op) = self.history.pop_back() {
                popped.push(op);
            }
        }
        popped
    }

    /// Most recent first, without removing anything.
    pub fn iter_recent(&self) -> impl Iterator<Item = &Operation> {
        self.history.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
