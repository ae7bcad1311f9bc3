//! Top-level dispatch facade.
//!
//! A `Dispatcher` wires the scheduling queue, the handler core, the
//! quarantine registry, and the worker pool together for one node, and is
//! the ingress point for requests. Construction is cheap; `start` runs
//! the one-shot store upgrade and spawns the workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use galena_types::{Command, CommandId, Priority, Request, StatusReport, Timestamp, fields};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::coordinator::{ClusterLink, Coordinator};
use crate::core::DispatchCore;
use crate::error::{DispatchError, Result};
use crate::plugin::Plugin;
use crate::quarantine::{CrashPhase, QuarantineRegistry};
use crate::queue::CommandQueue;
use crate::sink::ResponseSink;
use crate::worker::{WorkerPool, WorkerShared, build_status_report};

/// One node's command dispatch core.
pub struct Dispatcher<C: Coordinator + 'static> {
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    coordinator: Arc<C>,
    queue: Arc<CommandQueue>,
    core: Arc<DispatchCore<C>>,
    quarantine: Arc<QuarantineRegistry>,
    link: Arc<dyn ClusterLink>,
    sink: Arc<dyn ResponseSink>,
    in_flight: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    next_id: AtomicU64,
    pool: Mutex<Option<WorkerPool>>,
}

impl<C: Coordinator + 'static> Dispatcher<C> {
    /// Builds a dispatcher over the given coordinator, plugins, cluster
    /// link, and response sink, using the wall clock.
    pub fn new(
        config: DispatchConfig,
        coordinator: Arc<C>,
        plugins: Vec<Arc<dyn Plugin<C::Txn>>>,
        link: Arc<dyn ClusterLink>,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<Self> {
        Self::with_clock(config, coordinator, plugins, link, sink, Arc::new(SystemClock::new()))
    }

    /// Same as [`Dispatcher::new`] with an explicit clock, for tests and
    /// simulations.
    pub fn with_clock(
        config: DispatchConfig,
        coordinator: Arc<C>,
        plugins: Vec<Arc<dyn Plugin<C::Txn>>>,
        link: Arc<dyn ClusterLink>,
        sink: Arc<dyn ResponseSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(CommandQueue::new(Arc::clone(&clock)));
        let core = Arc::new(DispatchCore::new(
            Arc::clone(&coordinator),
            plugins,
            Arc::clone(&clock),
        ));

        Ok(Self {
            config,
            clock,
            coordinator,
            queue,
            core,
            quarantine: Arc::new(QuarantineRegistry::new()),
            link,
            sink,
            in_flight: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            pool: Mutex::new(None),
        })
    }

    /// Runs the one-shot store upgrade, then spawns the worker pool.
    pub fn start(&self) -> Result<()> {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        if pool.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        self.core.upgrade_store()?;

        self.shutdown.store(false, Ordering::Release);
        let shared = Arc::new(WorkerShared {
            queue: Arc::clone(&self.queue),
            core: Arc::clone(&self.core),
            quarantine: Arc::clone(&self.quarantine),
            coordinator: Arc::clone(&self.coordinator),
            link: Arc::clone(&self.link),
            sink: Arc::clone(&self.sink),
            clock: Arc::clone(&self.clock),
            in_flight: Arc::clone(&self.in_flight),
            shutdown: Arc::clone(&self.shutdown),
            tick: self.config.take_tick(),
            max_commit_retries: self.config.max_commit_retries,
        });
        *pool = Some(WorkerPool::start(self.config.worker_count, shared));

        info!(workers = self.config.worker_count, "dispatcher started");
        Ok(())
    }

    /// Cooperative stop: workers exit after their current command (or the
    /// next tick) and are joined. Idempotent.
    pub fn stop(&self) {
        let pool = self.pool.lock().expect("pool lock poisoned").take();
        if let Some(mut pool) = pool {
            pool.shutdown();
            info!("dispatcher stopped");
        }
    }

    /// Ingress: admits a request as a queued command, transferring
    /// ownership into the queue.
    ///
    /// Scheduling fields are resolved here: `priority` (clamped, default
    /// NORMAL), `commandExecuteTime` (microseconds since the epoch,
    /// absent or 0 means now) and `timeout` (milliseconds, default from
    /// the configuration). A request whose execute time lands past its
    /// own deadline is rejected.
    pub fn submit(&self, request: Request) -> Result<CommandId> {
        let now = self.clock.now();

        let priority = match request.field(fields::PRIORITY) {
            Some(_) => Priority::clamped(request.calc_i32(fields::PRIORITY)),
            None => Priority::NORMAL,
        };

        let execute_micros = request.calc_u64(fields::EXECUTE_TIME);
        let execute_at = if execute_micros == 0 {
            now
        } else {
            Timestamp::from_micros(execute_micros)
        };

        let timeout_ms = request.calc_u64(fields::TIMEOUT);
        let timeout_micros = if timeout_ms == 0 {
            self.config.default_timeout_micros()
        } else {
            timeout_ms.saturating_mul(1_000)
        };
        let deadline = now.saturating_add_micros(timeout_micros);

        if deadline < execute_at {
            return Err(DispatchError::InvalidSchedule {
                execute_at: execute_at.as_micros(),
                deadline: deadline.as_micros(),
            });
        }

        let id = CommandId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, method = %request.method_line, %priority, "command admitted");

        self.queue
            .push(Command::new(id, request, priority, execute_at, deadline));
        Ok(id)
    }

    /// Accepts a command escalated by a follower node. The scheduling
    /// envelope travels with the command; the peek counter restarts so
    /// this node's quarantine gate applies from scratch.
    pub fn accept_forwarded(&self, mut command: Command) {
        debug!(id = %command.id, method = %command.request.method_line, "accepted escalated command");
        command.peek_count = 0;
        self.queue.push(command);
    }

    /// Injects a crash record learned from a peer, pre-populating the
    /// quarantine registry without a local crash.
    pub fn note_crashed_command(&self, request: &Request, phase: CrashPhase) {
        self.quarantine.record_crash(request, phase);
    }

    /// The live status payload, as answered to the `Status` command.
    pub fn status_report(&self) -> StatusReport {
        build_status_report(&self.queue, &*self.coordinator, &self.in_flight)
    }

    /// Discards queued commands scheduled more than `window` in the
    /// future. Maintenance for shutdown or role change; in-flight
    /// commands are unaffected.
    pub fn abandon_future_after(&self, window: Duration) -> usize {
        self.queue.abandon_future_after(window)
    }

    /// Best-effort removal of a queued command. Returns whether one was
    /// removed.
    pub fn remove_by_id(&self, id: CommandId) -> bool {
        self.queue.remove_by_id(id)
    }

    /// Commands currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Commands taken by workers and not yet answered or forwarded.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl<C: Coordinator + 'static> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        self.stop();
    }
}
