//! Worker pool driving the per-command state machine.
//!
//! A fixed set of OS threads pulls from the scheduling queue and walks
//! each command through: deadline check, built-in status answer,
//! quarantine short-circuit, peek, then forward-to-leader or the
//! process/commit loop. Shutdown is cooperative: the flag is re-checked
//! after every `take` return or timeout, so shutdown latency is bounded
//! by one tick and in-flight commands are always drained, never dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use galena_types::{Command, Response, StatusReport, TimingPhase};
use tracing::{debug, error, instrument, warn};

use crate::clock::Clock;
use crate::coordinator::{ClusterLink, CommitOutcome, Coordinator};
use crate::core::DispatchCore;
use crate::error::TakeError;
use crate::plugin::{PeekOutcome, ProcessOutcome};
use crate::quarantine::{CrashPhase, QuarantineRegistry};
use crate::queue::CommandQueue;
use crate::sink::ResponseSink;

/// The well-known method answered by the dispatch core itself.
pub const STATUS_METHOD: &str = "Status";

/// Everything a worker thread needs, shared across the pool.
pub(crate) struct WorkerShared<C: Coordinator> {
    pub queue: Arc<CommandQueue>,
    pub core: Arc<DispatchCore<C>>,
    pub quarantine: Arc<QuarantineRegistry>,
    pub coordinator: Arc<C>,
    pub link: Arc<dyn ClusterLink>,
    pub sink: Arc<dyn ResponseSink>,
    pub clock: Arc<dyn Clock>,
    pub in_flight: Arc<AtomicU64>,
    pub shutdown: Arc<AtomicBool>,
    pub tick: Duration,
    pub max_commit_retries: u32,
}

/// Builds the status payload from live queue and role state.
pub(crate) fn build_status_report<C: Coordinator>(
    queue: &CommandQueue,
    coordinator: &C,
    in_flight: &AtomicU64,
) -> StatusReport {
    StatusReport {
        state: coordinator.state(),
        queued: queue.len(),
        in_flight: in_flight.load(Ordering::SeqCst),
        command_queue: queue.method_lines(),
    }
}

/// Fixed pool of named worker threads.
pub(crate) struct WorkerPool {
    handles: Vec<Option<thread::JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `count` workers over the shared context.
    ///
    /// # Panics
    ///
    /// Panics if `count` is 0.
    pub fn start<C: Coordinator + 'static>(count: usize, shared: Arc<WorkerShared<C>>) -> Self {
        assert!(count > 0, "worker count must be positive");

        let shutdown = Arc::clone(&shared.shutdown);
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("galena-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &shared))
                .expect("failed to spawn worker thread");
            handles.push(Some(handle));
        }

        Self { handles, shutdown }
    }

    /// Stops all workers and joins their threads. Safe to call more than
    /// once.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in &mut self.handles {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
        self.handles.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<C: Coordinator>(worker_id: usize, shared: &WorkerShared<C>) {
    debug!(worker_id, "worker started");
    while !shared.shutdown.load(Ordering::Acquire) {
        match shared.queue.take(shared.tick, &shared.in_flight) {
            Ok(command) => handle_command(shared, command),
            Err(TakeError::TimedOut) => {}
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Walks one command through the state machine. Exactly one of three
/// things happens: the command is finalized into the sink, or it is
/// forwarded to the leader (ownership moves with it).
#[instrument(skip_all, fields(command_id = %command.id, method = %command.request.method_line))]
fn handle_command<C: Coordinator>(shared: &WorkerShared<C>, mut command: Command) {
    // Deadline first: expired commands answer without touching the
    // handler. The queue preempts these to the front, so they surface
    // promptly.
    if command.is_expired(shared.clock.now()) {
        debug!("deadline elapsed while queued");
        command.set_response(Response::timed_out());
        return finalize(shared, command);
    }

    // The status report is answered by the core itself, on any node.
    if command.request.method_line == STATUS_METHOD {
        let report = build_status_report(&shared.queue, &*shared.coordinator, &shared.in_flight);
        let body = serde_json::to_vec(&report).expect("status report serializes");
        command.set_response(Response::ok().with_content(body));
        return finalize(shared, command);
    }

    // Quarantine short-circuits, before any handler runs.
    if command.peek_count == 0
        && shared
            .quarantine
            .is_blacklisted(&command.request, CrashPhase::Peek)
    {
        debug!("peek-blacklisted command short-circuited");
        command.set_response(Response::blacklisted());
        return finalize(shared, command);
    }
    if shared.coordinator.is_leader()
        && shared
            .quarantine
            .is_blacklisted(&command.request, CrashPhase::Process)
    {
        debug!("process-blacklisted command short-circuited");
        command.set_response(Response::blacklisted());
        return finalize(shared, command);
    }

    match shared.core.peek(&mut command) {
        Ok(PeekOutcome::Complete) => finalize(shared, command),
        Ok(PeekOutcome::Escalate) => {
            if shared.coordinator.is_leader() {
                process_on_leader(shared, command);
            } else {
                debug!("forwarding escalated command to the leader");
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                shared.link.forward_to_leader(command);
            }
        }
        Err(fault) => {
            warn!(%fault, "peek crashed");
            quarantine_and_finalize(shared, command, CrashPhase::Peek);
        }
    }
}

/// The leader-side process/commit loop, bounded by the configured retry
/// limit. Each conflict re-runs process on a fresh transaction.
fn process_on_leader<C: Coordinator>(shared: &WorkerShared<C>, mut command: Command) {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let mut txn = shared.coordinator.begin();

        match shared.core.process(&mut txn, &mut command) {
            Ok(ProcessOutcome::NoChange) => {
                shared.coordinator.rollback(txn);
                if command.response().is_none() {
                    command.set_response(Response::ok());
                }
                return finalize(shared, command);
            }
            Ok(ProcessOutcome::Committed) => {
                command.timing.start(TimingPhase::Commit, shared.clock.now());
                let outcome = shared.coordinator.commit(txn);
                command.timing.stop(TimingPhase::Commit, shared.clock.now());

                match outcome {
                    CommitOutcome::Ok => {
                        if command.response().is_none() {
                            command.set_response(Response::ok());
                        }
                        return finalize(shared, command);
                    }
                    CommitOutcome::Conflict => {
                        if attempts > shared.max_commit_retries {
                            warn!(attempts, "commit conflict retries exhausted");
                            command.clear_response();
                            command.set_response(Response::internal_error());
                            return finalize(shared, command);
                        }
                        debug!(attempts, "commit conflict, re-processing on a fresh transaction");
                        command.clear_response();
                    }
                    CommitOutcome::Fatal => {
                        error!("commit failed fatally");
                        command.clear_response();
                        command.set_response(Response::internal_error());
                        return finalize(shared, command);
                    }
                }
            }
            Err(fault) => {
                warn!(%fault, "process crashed");
                shared.coordinator.rollback(txn);
                return quarantine_and_finalize(shared, command, CrashPhase::Process);
            }
        }
    }
}

/// Records the crash locally, tells the peers, and answers a 500.
fn quarantine_and_finalize<C: Coordinator>(
    shared: &WorkerShared<C>,
    mut command: Command,
    phase: CrashPhase,
) {
    shared.quarantine.record_crash(&command.request, phase);
    shared.link.broadcast_crash(&command.request, phase);
    command.clear_response();
    command.set_response(Response::internal_error());
    finalize(shared, command);
}

/// Publishes the finished command: decrement the in-flight tally, then
/// hand the command to the sink.
fn finalize<C: Coordinator>(shared: &WorkerShared<C>, command: Command) {
    debug_assert!(command.is_finished(), "finalizing a command with no response");
    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    shared.sink.complete(command);
}
