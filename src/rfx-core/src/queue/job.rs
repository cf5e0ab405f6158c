// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::sync::lock;

/// Plain FIFO for commands emitted by a running experiment.
#[derive(Debug)]
pub struct JobQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn put(&self, item: T) {
        lock(&self.items).push_back(item);
    }

    /// Append several entries without another producer interleaving.
    pub fn put_all(&self, items: impl IntoIterator<Item = T>) {
        lock(&self.items).extend(items);
    }

    pub fn try_get(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Vec<T> {
        lock(&self.items).drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_without_dedup() {
        let queue = JobQueue::new();
        queue.put("measure");
        queue.put("measure");
        queue.put_all(["dilute", "measure"]);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.try_get(), Some("measure"));
        assert_eq!(queue.clear(), vec!["measure", "dilute", "measure"]);
        assert!(queue.is_empty());
    }
}
