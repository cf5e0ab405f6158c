// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Queue hierarchy feeding the dispatch loops.
//!
//! - [`TypedQueue`]: FIFO with at most one queued entry per type.
//! - [`SendQueue`]: immediate-dispatch queue with a resend sub-queue
//!   that is always drained first.
//! - [`JobQueue`]: plain FIFO for experiment traffic.

mod job;
pub mod marker;
mod send;
mod typed;

use thiserror::Error;

pub use job::JobQueue;
pub use marker::{
    Action, AwaitCondition, AwaitOutcome, CommandEntry, Condition, OnSent, QueueMarker, Tags,
};
pub use send::{SendQueue, SendTarget};
pub use typed::TypedQueue;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("type '{0}' is already in queue")]
    TypeAlreadyInQueue(String),
}
