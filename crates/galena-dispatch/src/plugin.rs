//! Plugin seam for command handling.
//!
//! A plugin implements the two-phase protocol for the methods it owns:
//! a side-effect-free `peek` that may run on any node, any number of
//! times, and a transactional `process` that runs only on the leader
//! inside a coordinator-owned transaction. The no-store-writes rule for
//! `peek` is structural: `peek` is simply not given a transaction handle.

use galena_types::Command;
use thiserror::Error;

/// Result of the peek phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekOutcome {
    /// The response is fully populated; no further work needed.
    Complete,
    /// The command needs the process phase (on the leader).
    Escalate,
}

/// Result of the process phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Writes were applied; the coordinator must commit and replicate.
    Committed,
    /// No writes occurred; the coordinator rolls back the empty
    /// transaction and does not replicate.
    NoChange,
}

/// A crash inside a handler phase.
///
/// Workers convert this into a quarantine event and a 500 response; it
/// never propagates past the worker loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("handler fault: {0}")]
pub struct HandlerFault(pub String);

impl HandlerFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A handler for some set of methods, registered on a core instance.
///
/// `T` is the coordinator's transaction type; plugins see the store only
/// through it, and only during `process` and `upgrade_store`.
///
/// Contracts, per phase:
///
/// - `peek` must not mutate the store and may be invoked multiple times
///   for the same command, including on different nodes; external side
///   effects must be idempotent. Returning `Ok(None)` means "not my
///   method" and the next plugin is consulted.
/// - `process` runs inside an already-open transaction and must neither
///   commit nor roll back; the coordinator owns the transaction lifecycle
///   and may re-invoke `process` on a fresh transaction after a commit
///   conflict, so it must be re-entrant.
/// - `upgrade_store` runs once at node startup inside its own
///   transaction, before any command is dispatched.
pub trait Plugin<T>: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Classification phase. `Ok(None)` if this plugin does not handle
    /// the command's method.
    fn peek(&self, command: &mut Command) -> Result<Option<PeekOutcome>, HandlerFault>;

    /// Mutation phase, leader-only. `Ok(None)` if this plugin does not
    /// handle the command's method.
    fn process(
        &self,
        txn: &mut T,
        command: &mut Command,
    ) -> Result<Option<ProcessOutcome>, HandlerFault>;

    /// Schema evolution hook, run once at startup.
    fn upgrade_store(&self, _txn: &mut T) -> Result<(), HandlerFault> {
        Ok(())
    }
}
