// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Queue payloads: closures and poll-until-condition descriptors.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cancel::CancelWatch;
use crate::{BoxFuture, DynResult};

/// One-shot asynchronous closure carried by a marker.
pub type Action = Box<dyn FnOnce() -> BoxFuture<'static, DynResult<()>> + Send>;

/// Repeatable predicate polled by [`AwaitCondition`].
pub type Condition = Arc<dyn Fn() -> BoxFuture<'static, DynResult<bool>> + Send + Sync>;

/// Hook fired once an entry has been dispatched.
pub type OnSent = Box<dyn FnOnce() + Send>;

/// Provenance strings such as `source:api`.
pub type Tags = BTreeSet<String>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn boxed_action<F, Fut>(f: F) -> Action
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = DynResult<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Run an action on its own task, logging instead of propagating its
/// failure. A panicking action is reported and contained.
pub async fn run_logged(action: Action, what: &str) {
    match tokio::spawn(async move { action().await }).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Error while running {}: {}", what, e),
        Err(e) if e.is_panic() => error!("{} panicked", what),
        Err(e) => warn!("{} did not finish: {}", what, e),
    }
}

pub enum QueueMarker {
    /// Runs inline when reached; never counts against the gate.
    Plain(Action),
    /// Executed as a dispatched command.
    Send(Action),
    /// Optional dispatched callback followed by polling a predicate.
    AwaitCondition(AwaitCondition),
}

impl QueueMarker {
    pub fn plain<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DynResult<()>> + Send + 'static,
    {
        Self::Plain(boxed_action(f))
    }

    pub fn send<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DynResult<()>> + Send + 'static,
    {
        Self::Send(boxed_action(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::Send(_) => "send",
            Self::AwaitCondition(_) => "await-condition",
        }
    }
}

impl fmt::Debug for QueueMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitCondition(cond) => f.debug_tuple("AwaitCondition").field(cond).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// How an [`AwaitCondition`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    Done,
    TimedOut,
    Cancelled,
    Failed,
}

pub struct AwaitCondition {
    callback: Option<Action>,
    condition: Condition,
    cancel: Option<Action>,
    on_timeout: Option<Action>,
    interval: Duration,
    timeout: Option<Duration>,
}

impl fmt::Debug for AwaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitCondition")
            .field("has_callback", &self.callback.is_some())
            .field("has_cancel", &self.cancel.is_some())
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AwaitCondition {
    pub fn new<C, Fut>(condition: C) -> Self
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DynResult<bool>> + Send + 'static,
    {
        Self {
            callback: None,
            condition: Arc::new(move || Box::pin(condition())),
            cancel: None,
            on_timeout: None,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    /// Command dispatched before polling starts.
    pub fn with_callback<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DynResult<()>> + Send + 'static,
    {
        self.callback = Some(boxed_action(f));
        self
    }

    pub fn with_cancel<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DynResult<()>> + Send + 'static,
    {
        self.cancel = Some(boxed_action(f));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_timeout<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DynResult<()>> + Send + 'static,
    {
        self.on_timeout = Some(boxed_action(f));
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn take_callback(&mut self) -> Option<Action> {
        self.callback.take()
    }

    /// Evaluate the predicate once. The returned future owns its state,
    /// so it can be awaited without borrowing the marker.
    pub fn done(&self) -> BoxFuture<'static, DynResult<bool>> {
        (self.condition)()
    }

    /// Poll until the predicate holds, the timeout elapses or `cancel` fires.
    ///
    /// The cancel hook runs before the marker is abandoned; the timeout
    /// hook runs before it is treated as finished.
    pub async fn wait(&mut self, cancel: &mut CancelWatch) -> AwaitOutcome {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            match self.done().await {
                Ok(true) => return AwaitOutcome::Done,
                Ok(false) => {}
                Err(e) => {
                    warn!("Await condition failed: {}", e);
                    return AwaitOutcome::Failed;
                }
            }
            if cancel.is_cancelled() {
                debug!("Await condition cancelled");
                if let Some(hook) = self.cancel.take() {
                    run_logged(hook, "await cancel hook").await;
                }
                return AwaitOutcome::Cancelled;
            }
            let mut pause = self.interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    debug!("Await condition timed out after {:?}", self.timeout);
                    if let Some(hook) = self.on_timeout.take() {
                        run_logged(hook, "await timeout hook").await;
                    }
                    return AwaitOutcome::TimedOut;
                }
                pause = pause.min(deadline - now);
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

/// A queued command with its routing metadata.
pub struct CommandEntry {
    pub marker: QueueMarker,
    pub cmd_type: Option<String>,
    pub on_sent: Option<OnSent>,
    pub tags: Tags,
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("marker", &self.marker)
            .field("cmd_type", &self.cmd_type)
            .field("tags", &self.tags)
            .finish()
    }
}

impl CommandEntry {
    pub fn new(marker: QueueMarker) -> Self {
        Self {
            marker,
            cmd_type: None,
            on_sent: None,
            tags: Tags::new(),
        }
    }

    pub fn with_type(mut self, cmd_type: impl Into<String>) -> Self {
        self.cmd_type = Some(cmd_type.into());
        self
    }

    pub fn on_sent(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_sent = Some(Box::new(f));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn is_plain(&self) -> bool {
        matches!(self.marker, QueueMarker::Plain(_))
    }
}
