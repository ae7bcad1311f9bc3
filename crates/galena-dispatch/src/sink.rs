//! Response delivery.
//!
//! Every submitted command ends its life in a [`ResponseSink`], carrying
//! its write-once response. [`ResponseQueue`] is the bundled lock-free
//! collector for embedders (and tests) that want to drain completed
//! commands from another thread.

use crossbeam_queue::SegQueue;
use galena_types::Command;

/// Receives completed commands from the worker pool.
pub trait ResponseSink: Send + Sync {
    /// Called exactly once per finalized command.
    fn complete(&self, command: Command);
}

/// A lock-free, unbounded collector of completed commands.
#[derive(Debug, Default)]
pub struct ResponseQueue {
    inner: SegQueue<Command>,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the oldest completed command, if any.
    pub fn pop(&self) -> Option<Command> {
        self.inner.pop()
    }

    /// Drains everything currently queued.
    pub fn drain(&self) -> Vec<Command> {
        let mut out = Vec::with_capacity(self.inner.len());
        while let Some(command) = self.inner.pop() {
            out.push(command);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl ResponseSink for ResponseQueue {
    fn complete(&self, command: Command) {
        self.inner.push(command);
    }
}
