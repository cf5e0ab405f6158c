// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::QueueError;
use crate::sync::lock;

/// Which sub-queue of a [`SendQueue`] an entry goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendTarget {
    #[default]
    Send,
    Resend,
}

#[derive(Debug)]
struct Inner<T> {
    send: VecDeque<(T, Option<String>)>,
    resend: VecDeque<(T, Option<String>)>,
    lookup: HashSet<String>,
    resend_active: bool,
}

impl<T> Inner<T> {
    fn queue_mut(&mut self, target: SendTarget) -> &mut VecDeque<(T, Option<String>)> {
        match target {
            SendTarget::Send => &mut self.send,
            SendTarget::Resend => &mut self.resend,
        }
    }

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
        let entry = if self.resend_active {
            self.resend.pop_front()
        } else {
            self.resend.pop_front().or_else(|| self.send.pop_front())
        };
        let (item, item_type) = entry?;
        if let Some(t) = item_type {
            self.lookup.remove(&t);
        }
        Some(item)
    }

    fn len(&self) -> usize {
        if self.resend_active {
            self.resend.len()
        } else {
            self.resend.len() + self.send.len()
        }
    }
}

/// Immediate-dispatch queue.
///
/// While resending is active only the resend sub-queue is visible;
/// otherwise resend entries still go out before fresh ones.
#[derive(Debug)]
pub struct SendQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Default for SendQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SendQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                send: VecDeque::new(),
                resend: VecDeque::new(),
                lookup: HashSet::new(),
                resend_active: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn put(&self, item: T, item_type: Option<&str>, target: SendTarget) -> Result<(), QueueError> {
        {
            let mut inner = lock(&self.inner);
            let item_type = inner.claim(item_type)?;
            inner.queue_mut(target).push_back((item, item_type));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn prepend(
        &self,
        item: T,
        item_type: Option<&str>,
        target: SendTarget,
    ) -> Result<(), QueueError> {
        {
            let mut inner = lock(&self.inner);
            let item_type = inner.claim(item_type)?;
            inner.queue_mut(target).push_front((item, item_type));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Enqueue a batch as one unit: either every entry goes in or none.
    pub fn put_batch(
        &self,
        items: Vec<(T, Option<String>)>,
        target: SendTarget,
    ) -> Result<(), QueueError> {
        {
            let mut inner = lock(&self.inner);
            let mut seen = HashSet::new();
            for (_, item_type) in &items {
                if let Some(t) = item_type {
                    if inner.lookup.contains(t) || !seen.insert(t.clone()) {
                        return Err(QueueError::TypeAlreadyInQueue(t.clone()));
                    }
                }
            }
            inner.lookup.extend(seen);
            inner.queue_mut(target).extend(items);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn try_get(&self) -> Option<T> {
        lock(&self.inner).pop()
    }

    /// Wait for the next deliverable entry.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    pub fn set_resend_active(&self, active: bool) {
        lock(&self.inner).resend_active = active;
        self.notify.notify_waiters();
    }

    pub fn resend_active(&self) -> bool {
        lock(&self.inner).resend_active
    }

    /// Deliverable entries, honoring the resend mode.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_count(&self) -> usize {
        lock(&self.inner).lookup.len()
    }

    pub fn clear(&self) -> Vec<T> {
        let mut inner = lock(&self.inner);
        inner.lookup.clear();
        let mut items: Vec<T> = inner.resend.drain(..).map(|(item, _)| item).collect();
        items.extend(inner.send.drain(..).map(|(item, _)| item));
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_resend_drained_first() {
        let queue = SendQueue::new();
        queue.put("fresh-1", None, SendTarget::Send).unwrap();
        queue.put("retry", None, SendTarget::Resend).unwrap();
        queue.put("fresh-2", None, SendTarget::Send).unwrap();
        assert_eq!(queue.try_get(), Some("retry"));
        assert_eq!(queue.try_get(), Some("fresh-1"));
        assert_eq!(queue.try_get(), Some("fresh-2"));
    }

    #[test]
    fn test_resend_active_hides_send_queue() {
        let queue = SendQueue::new();
        queue.put(1, None, SendTarget::Send).unwrap();
        queue.set_resend_active(true);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.try_get(), None);
        queue.put(2, None, SendTarget::Resend).unwrap();
        assert_eq!(queue.try_get(), Some(2));
        queue.set_resend_active(false);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_get(), Some(1));
    }

    #[test]
    fn test_type_shared_between_sub_queues() {
        let queue = SendQueue::new();
        queue.put(1, Some("valve"), SendTarget::Send).unwrap();
        assert!(queue.put(2, Some("valve"), SendTarget::Resend).is_err());
        assert_eq!(queue.try_get(), Some(1));
        queue.put(3, Some("valve"), SendTarget::Resend).unwrap();
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let queue = SendQueue::new();
        queue.put(0, Some("b"), SendTarget::Send).unwrap();
        let batch = vec![(1, Some("a".to_string())), (2, Some("b".to_string()))];
        assert!(queue.put_batch(batch, SendTarget::Send).is_err());
        assert_eq!(queue.len(), 1);
        let batch = vec![(1, None), (2, None), (3, Some("c".to_string()))];
        queue.put_batch(batch, SendTarget::Send).unwrap();
        assert_eq!(queue.clear(), vec![0, 1, 2, 3]);
        assert_eq!(queue.type_count(), 0);
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue = Arc::new(SendQueue::new());
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { tokio::time::timeout(Duration::from_secs(2), queue.get()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(7, None, SendTarget::Send).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), 7);
    }
}
