// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Bounded counting signal gating command dispatch.
//!
//! The gate models an acknowledgement window: each dispatched command
//! lowers the counter and its completion raises it again. With the
//! default window of one, a dispatch loop never has more than one
//! command on the bus at a time.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

use crate::sync::lock;

#[derive(Debug)]
struct Counter {
    value: i64,
    min: Option<i64>,
    max: Option<i64>,
}

impl Counter {
    fn clamp(&self, value: i64) -> i64 {
        let value = match self.max {
            Some(max) if value > max => max,
            _ => value,
        };
        match self.min {
            Some(min) if value < min => min,
            _ => value,
        }
    }
}

/// Counting event that is "set" while its counter is above zero.
#[derive(Debug)]
pub struct FlowGate {
    name: String,
    counter: Mutex<Counter>,
    notify: Notify,
}

impl FlowGate {
    /// Gate with the default `[0, 1]` window.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_bounds(name, Some(0), Some(1))
    }

    /// Gate with explicit bounds. `None` leaves that side unbounded.
    pub fn with_bounds(name: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        Self {
            name: name.into(),
            counter: Mutex::new(Counter {
                value: 0,
                min,
                max,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counter(&self) -> i64 {
        lock(&self.counter).value
    }

    pub fn is_set(&self) -> bool {
        self.counter() > 0
    }

    /// Increment the counter and wake waiters.
    pub fn set(&self) {
        self.apply(|value| value.saturating_add(1));
    }

    /// Decrement the counter.
    pub fn clear(&self) {
        self.apply(|value| value.saturating_sub(1));
    }

    /// Force the counter back to zero.
    pub fn reset(&self) {
        self.apply(|_| 0);
    }

    fn apply(&self, op: impl FnOnce(i64) -> i64) {
        let value = {
            let mut counter = lock(&self.counter);
            let next = counter.clamp(op(counter.value));
            counter.value = next;
            next
        };
        trace!("{} counter is now {}", self.name, value);
        if value > 0 {
            self.notify.notify_waiters();
        }
    }

    /// Wait until the counter is above zero.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Wait with a deadline. Returns `false` when the deadline passed first.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_saturates_at_max() {
        let gate = FlowGate::new("clear_to_send");
        for _ in 0..5 {
            gate.set();
        }
        assert_eq!(gate.counter(), 1);
        assert!(gate.is_set());
    }

    #[test]
    fn test_clear_never_below_min() {
        let gate = FlowGate::new("clear_to_send");
        gate.clear();
        gate.clear();
        assert_eq!(gate.counter(), 0);
        gate.set();
        gate.clear();
        gate.clear();
        assert_eq!(gate.counter(), 0);
        assert!(!gate.is_set());
    }

    #[test]
    fn test_unbounded_max_counts_up() {
        let gate = FlowGate::with_bounds("hold", Some(0), None);
        gate.set();
        gate.set();
        gate.set();
        assert_eq!(gate.counter(), 3);
        gate.clear();
        assert_eq!(gate.counter(), 2);
        gate.reset();
        assert_eq!(gate.counter(), 0);
    }

    #[test]
    fn test_wider_window() {
        let gate = FlowGate::with_bounds("window", Some(0), Some(3));
        for _ in 0..10 {
            gate.set();
        }
        assert_eq!(gate.counter(), 3);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_set() {
        let gate = FlowGate::new("clear_to_send");
        gate.set();
        assert!(gate.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_when_clear() {
        let gate = FlowGate::new("clear_to_send");
        assert!(!gate.wait_timeout(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_set_wakes_waiter() {
        let gate = Arc::new(FlowGate::new("clear_to_send"));
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_timeout(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.set();
        assert!(waiter.await.unwrap());
    }
}
