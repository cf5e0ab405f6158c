// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use super::QueueError;
use crate::sync::lock;

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<(T, Option<String>)>,
    lookup: HashSet<String>,
}

impl<T> Inner<T> {
    fn claim(&mut self, item_type: Option<&str>) -> Result<Option<String>, QueueError> {
        match item_type {
            Some(t) if self.lookup.contains(t) => Err(QueueError::TypeAlreadyInQueue(t.to_string())),
            Some(t) => {
                self.lookup.insert(t.to_string());
                Ok(Some(t.to_string()))
            }
            None => Ok(None),
        }
    }

    fn pop(&mut self) -> Option<T> {
        let (item, item_type) = self.items.pop_front()?;
        if let Some(t) = item_type {
            self.lookup.remove(&t);
        }
        Some(item)
    }
}

/// FIFO queue rejecting a second entry of a type that is still queued.
#[derive(Debug)]
pub struct TypedQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for TypedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TypedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                lookup: HashSet::new(),
            }),
        }
    }

    pub fn put(&self, item: T, item_type: Option<&str>) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        let item_type = inner.claim(item_type)?;
        inner.items.push_back((item, item_type));
        Ok(())
    }

    /// Insert at the head of the queue.
    pub fn prepend(&self, item: T, item_type: Option<&str>) -> Result<(), QueueError> {
        let mut inner = lock(&self.inner);
        let item_type = inner.claim(item_type)?;
        inner.items.push_front((item, item_type));
        Ok(())
    }

    /// Pop the head, releasing its type for reuse.
    pub fn try_get(&self) -> Option<T> {
        lock(&self.inner).pop()
    }

    pub fn contains_type(&self, item_type: &str) -> bool {
        lock(&self.inner).lookup.contains(item_type)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of types currently reserved.
    pub fn type_count(&self) -> usize {
        lock(&self.inner).lookup.len()
    }

    /// Drop every entry, returning them in queue order.
    pub fn clear(&self) -> Vec<T> {
        let mut inner = lock(&self.inner);
        inner.lookup.clear();
        inner.items.drain(..).map(|(item, _)| item).collect()
    }
}
