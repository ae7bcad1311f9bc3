//! The peek/process handler core.
//!
//! `DispatchCore` owns the plugin registry for one node instance and runs
//! the two-phase protocol over it. Peek classifies a command without
//! touching the store; process mutates the store inside a transaction the
//! coordinator has already opened. Methods no plugin recognizes answer
//! `430 Unrecognized command`.

use std::sync::Arc;

use galena_types::{Command, Response, TimingPhase};
use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::coordinator::{CommitOutcome, Coordinator};
use crate::plugin::{HandlerFault, PeekOutcome, Plugin, ProcessOutcome};

/// The two-phase command handler, bound to one coordinator and one set of
/// plugins.
pub struct DispatchCore<C: Coordinator> {
    coordinator: Arc<C>,
    plugins: Vec<Arc<dyn Plugin<C::Txn>>>,
    clock: Arc<dyn Clock>,
}

impl<C: Coordinator> DispatchCore<C> {
    pub fn new(
        coordinator: Arc<C>,
        plugins: Vec<Arc<dyn Plugin<C::Txn>>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            plugins,
            clock,
        }
    }

    /// Classification phase.
    ///
    /// May be called multiple times for the same command, including on
    /// different nodes; plugins must keep it free of store side effects
    /// (they are not handed a transaction). Increments the command's peek
    /// counter and attributes elapsed time to the `Peek` phase. A fault
    /// is returned to the worker, which turns it into a quarantine event.
    pub fn peek(&self, command: &mut Command) -> Result<PeekOutcome, HandlerFault> {
        command.peek_count += 1;
        command.timing.start(TimingPhase::Peek, self.clock.now());
        let routed = self.route_peek(command);
        command.timing.stop(TimingPhase::Peek, self.clock.now());

        match routed? {
            Some(PeekOutcome::Complete) => {
                if command.response().is_none() {
                    command.set_response(Response::ok());
                }
                Ok(PeekOutcome::Complete)
            }
            Some(PeekOutcome::Escalate) => Ok(PeekOutcome::Escalate),
            None => {
                debug!(method = %command.request.method_line, "no plugin recognizes method");
                command.set_response(Response::unrecognized());
                Ok(PeekOutcome::Complete)
            }
        }
    }

    fn route_peek(&self, command: &mut Command) -> Result<Option<PeekOutcome>, HandlerFault> {
        for plugin in &self.plugins {
            if let Some(outcome) = plugin.peek(command)? {
                debug!(plugin = plugin.name(), ?outcome, "peeked");
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    /// Mutation phase, leader-only.
    ///
    /// `txn` is already open and stays open: committing or rolling back is
    /// the caller's job, driven by the returned outcome. Re-entrant across
    /// transactions, because a conflicted commit re-runs it afresh.
    pub fn process(
        &self,
        txn: &mut C::Txn,
        command: &mut Command,
    ) -> Result<ProcessOutcome, HandlerFault> {
        command.timing.start(TimingPhase::Process, self.clock.now());
        let routed = self.route_process(txn, command);
        command.timing.stop(TimingPhase::Process, self.clock.now());

        match routed? {
            Some(outcome) => Ok(outcome),
            None => {
                debug!(method = %command.request.method_line, "no plugin recognizes method");
                command.set_response(Response::unrecognized());
                Ok(ProcessOutcome::NoChange)
            }
        }
    }

    fn route_process(
        &self,
        txn: &mut C::Txn,
        command: &mut Command,
    ) -> Result<Option<ProcessOutcome>, HandlerFault> {
        for plugin in &self.plugins {
            if let Some(outcome) = plugin.process(txn, command)? {
                debug!(plugin = plugin.name(), ?outcome, "processed");
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    /// One-shot schema evolution, run at node startup before any command
    /// is dispatched. Every plugin's upgrade hook runs inside a single
    /// dedicated transaction; a fault rolls the whole upgrade back.
    #[instrument(skip_all)]
    pub fn upgrade_store(&self) -> Result<(), HandlerFault> {
        let mut txn = self.coordinator.begin();
        for plugin in &self.plugins {
            if let Err(fault) = plugin.upgrade_store(&mut txn) {
                self.coordinator.rollback(txn);
                return Err(fault);
            }
        }
        match self.coordinator.commit(txn) {
            CommitOutcome::Ok => Ok(()),
            CommitOutcome::Conflict => {
                Err(HandlerFault::new("store upgrade lost a commit conflict"))
            }
            CommitOutcome::Fatal => Err(HandlerFault::new("store upgrade commit failed")),
        }
    }
}
