// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Cooperative cancellation built on a `watch` generation counter.
//!
//! A [`CancelWatch`] only observes cancellations issued after it was
//! taken, so one signal can be fired repeatedly over the lifetime of a
//! machine without ever being reset.

use tokio::sync::watch;

#[derive(Debug)]
pub struct CancelSignal {
    tx: watch::Sender<u64>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Cancel every watch currently handed out.
    pub fn cancel(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> CancelWatch {
        let rx = self.tx.subscribe();
        let seen = *rx.borrow();
        CancelWatch { rx, seen }
    }
}

#[derive(Debug, Clone)]
pub struct CancelWatch {
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl CancelWatch {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.seen
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// signal is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_watch_sees_later_cancel_only() {
        let signal = CancelSignal::new();
        signal.cancel();
        let watch = signal.subscribe();
        assert!(!watch.is_cancelled());
        signal.cancel();
        assert!(watch.is_cancelled());
        assert!(!signal.subscribe().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let signal = CancelSignal::new();
        let mut watch = signal.subscribe();
        let task = tokio::spawn(async move {
            tokio::time::timeout(Duration::from_secs(2), watch.cancelled())
                .await
                .is_ok()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();
        assert!(task.await.unwrap());
    }
}
