//! The scheduling queue.
//!
//! Orders commands by priority, then by scheduled execute time, and hands
//! them to workers. Commands whose deadline has already passed preempt the
//! normal order so they surface promptly and receive a timeout response
//! instead of starving behind future-scheduled work.
//!
//! # Design
//!
//! - Primary index: priority buckets (highest first) of commands keyed by
//!   (execute time, insertion sequence). The sequence number gives stable
//!   multi-map semantics: equal execute times dispatch in insertion order.
//! - Secondary index: deadlines keyed by (deadline, insertion sequence),
//!   each holding a logical locator back into the primary index. Locators
//!   are resolved at lookup time, so an entry whose command is gone is
//!   detected as stale and dropped rather than dereferenced.
//! - One mutex guards both indices and serves as the condition variable's
//!   predicate lock. All mutation goes through methods of this type; no
//!   caller ever touches the indices directly.
//!
//! The `admitted` counter passed to [`CommandQueue::take`] is incremented
//! under the lock strictly before the command leaves the indices, so an
//! observer summing `len() + admitted` never sees a command missing from
//! both.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use galena_types::{Command, CommandId, Priority, Timestamp, TimingPhase};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::TakeError;

/// Position of a command within its priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    execute_at: Timestamp,
    seq: u64,
}

/// Position of a command in the deadline index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeadlineKey {
    deadline: Timestamp,
    seq: u64,
}

/// Logical locator for the primary slot a deadline entry refers to.
///
/// Together with the key's `seq` this uniquely identifies one primary
/// entry; resolution happens at lookup time.
#[derive(Debug, Clone, Copy)]
struct SlotRef {
    priority: Priority,
    execute_at: Timestamp,
}

/// Both indices plus the insertion sequence, guarded by one mutex.
///
/// Invariant: priority buckets are never empty, and the two indices always
/// reference the same set of commands.
#[derive(Debug, Default)]
struct QueueState {
    by_priority: BTreeMap<Reverse<Priority>, BTreeMap<SlotKey, Command>>,
    by_deadline: BTreeMap<DeadlineKey, SlotRef>,
    next_seq: u64,
}

impl QueueState {
    /// Removes and returns the first workable command, or `None`.
    ///
    /// Workable means: deadline already passed (dispensed first, regardless
    /// of ordering), or execute time not in the future. Among non-expired
    /// commands, priority trumps execute time; a bucket whose earliest
    /// command is not ready does not block lower-priority buckets.
    fn dispense(&mut self, now: Timestamp, admitted: &AtomicU64) -> Option<Command> {
        // Expired deadlines first, so timeouts surface as ordinary work.
        while let Some((&dkey, &slot)) = self.by_deadline.first_key_value() {
            if dkey.deadline >= now {
                break;
            }
            let bucket_key = Reverse(slot.priority);
            let slot_key = SlotKey {
                execute_at: slot.execute_at,
                seq: dkey.seq,
            };
            let resolvable = self
                .by_priority
                .get(&bucket_key)
                .is_some_and(|bucket| bucket.contains_key(&slot_key));
            if !resolvable {
                warn!(
                    deadline_us = dkey.deadline.as_micros(),
                    seq = dkey.seq,
                    "deadline entry references no queued command, dropping stale entry"
                );
                self.by_deadline.remove(&dkey);
                continue;
            }

            admitted.fetch_add(1, Ordering::SeqCst);
            self.by_deadline.remove(&dkey);
            let bucket = self
                .by_priority
                .get_mut(&bucket_key)
                .expect("resolved above");
            let mut command = bucket.remove(&slot_key).expect("resolved above");
            if bucket.is_empty() {
                self.by_priority.remove(&bucket_key);
            }
            command.timing.stop(TimingPhase::QueueWorker, now);
            return Some(command);
        }

        // Highest priority first; within a bucket only the earliest slot
        // can be ready.
        let mut target: Option<(Reverse<Priority>, SlotKey)> = None;
        for (bucket_key, bucket) in &self.by_priority {
            if let Some((&slot_key, _)) = bucket.first_key_value() {
                if slot_key.execute_at <= now {
                    target = Some((*bucket_key, slot_key));
                    break;
                }
            }
        }
        let (bucket_key, slot_key) = target?;

        admitted.fetch_add(1, Ordering::SeqCst);
        let bucket = self
            .by_priority
            .get_mut(&bucket_key)
            .expect("target bucket exists");
        let mut command = bucket.remove(&slot_key).expect("target slot exists");
        if bucket.is_empty() {
            self.by_priority.remove(&bucket_key);
        }
        self.by_deadline.remove(&DeadlineKey {
            deadline: command.deadline,
            seq: slot_key.seq,
        });
        command.timing.stop(TimingPhase::QueueWorker, now);
        Some(command)
    }
}

/// Thread-safe, multi-priority, time-scheduled command queue with
/// deadline-driven preemption.
pub struct CommandQueue {
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueState>,
    available: Condvar,
}

impl CommandQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().expect("queue lock poisoned")
    }

    /// Transfers `command` into the queue and wakes one waiter.
    ///
    /// Starts the command's queue-wait timer. Duplicate fingerprints are
    /// never coalesced; every push is a distinct entry.
    ///
    /// # Panics
    ///
    /// Panics if `command.deadline < command.execute_at` or if the command
    /// already carries a response; both are caller bugs.
    pub fn push(&self, mut command: Command) {
        assert!(
            command.deadline >= command.execute_at,
            "command {} deadline {} precedes execute time {}",
            command.id,
            command.deadline,
            command.execute_at
        );
        assert!(
            !command.is_finished(),
            "finished command {} must not re-enter the queue",
            command.id
        );

        command.timing.start(TimingPhase::QueueWorker, self.clock.now());

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.by_deadline.insert(
            DeadlineKey {
                deadline: command.deadline,
                seq,
            },
            SlotRef {
                priority: command.priority,
                execute_at: command.execute_at,
            },
        );
        state
            .by_priority
            .entry(Reverse(command.priority))
            .or_default()
            .insert(
                SlotKey {
                    execute_at: command.execute_at,
                    seq,
                },
                command,
            );
        drop(state);

        self.available.notify_one();
    }

    /// Blocks until a workable command is available or `timeout` elapses.
    ///
    /// On success, `admitted` has been incremented under the queue lock
    /// strictly before the command left the indices. Spurious wakeups
    /// re-run the dispense algorithm; the timeout is enforced against
    /// elapsed time, not wakeup count. The wait is not shortened to the
    /// next scheduled execute time; callers poll at their own tick.
    pub fn take(
        &self,
        timeout: Duration,
        admitted: &AtomicU64,
    ) -> std::result::Result<Command, TakeError> {
        let wait_deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(command) = state.dispense(self.clock.now(), admitted) {
                return Ok(command);
            }
            let remaining = wait_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TakeError::TimedOut);
            }
            let (guard, _timed_out) = self
                .available
                .wait_timeout(state, remaining)
                .expect("queue lock poisoned");
            state = guard;
        }
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.lock().by_priority.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_priority.is_empty()
    }

    /// Method line of every queued command, in dispatch order (priority
    /// descending, then execute time, then insertion). For status
    /// reporting.
    pub fn method_lines(&self) -> Vec<String> {
        let state = self.lock();
        state
            .by_priority
            .values()
            .flat_map(|bucket| bucket.values().map(|c| c.request.method_line.clone()))
            .collect()
    }

    /// Best-effort removal by id. O(n); ids are required to be unique, so
    /// the first match is the only match. Returns whether a command was
    /// removed.
    pub fn remove_by_id(&self, id: CommandId) -> bool {
        let mut state = self.lock();
        let mut found: Option<(Reverse<Priority>, SlotKey, Timestamp)> = None;
        'outer: for (bucket_key, bucket) in &state.by_priority {
            for (slot_key, command) in bucket {
                if command.id == id {
                    found = Some((*bucket_key, *slot_key, command.deadline));
                    break 'outer;
                }
            }
        }
        let Some((bucket_key, slot_key, deadline)) = found else {
            return false;
        };

        let bucket = state
            .by_priority
            .get_mut(&bucket_key)
            .expect("found bucket exists");
        bucket.remove(&slot_key);
        if bucket.is_empty() {
            state.by_priority.remove(&bucket_key);
        }
        state.by_deadline.remove(&DeadlineKey {
            deadline,
            seq: slot_key.seq,
        });
        true
    }

    /// Discards every command scheduled more than `window` past the
    /// current clock. Maintenance only: queued commands are the sole
    /// target, in-flight commands are owned by workers and untouched.
    /// Returns how many commands were discarded.
    pub fn abandon_future_after(&self, window: Duration) -> usize {
        let limit = self
            .clock
            .now()
            .saturating_add_micros(window.as_micros() as u64);
        let split_at = SlotKey {
            execute_at: limit.saturating_add_micros(1),
            seq: 0,
        };

        let mut state = self.lock();
        let QueueState {
            by_priority,
            by_deadline,
            ..
        } = &mut *state;

        let mut removed = 0usize;
        let mut emptied: Vec<Reverse<Priority>> = Vec::new();
        for (bucket_key, bucket) in by_priority.iter_mut() {
            let abandoned = bucket.split_off(&split_at);
            for (slot_key, command) in &abandoned {
                by_deadline.remove(&DeadlineKey {
                    deadline: command.deadline,
                    seq: slot_key.seq,
                });
            }
            removed += abandoned.len();
            if bucket.is_empty() {
                emptied.push(*bucket_key);
            }
        }
        for bucket_key in emptied {
            by_priority.remove(&bucket_key);
        }
        drop(state);

        if removed > 0 {
            info!(
                removed,
                window_ms = window.as_millis() as u64,
                "abandoned commands scheduled past the window"
            );
        }
        removed
    }

    /// Verifies the cross-index invariant; test support.
    #[cfg(test)]
    fn assert_indices_consistent(&self) {
        let state = self.lock();
        let mut primary_count = 0usize;
        for (bucket_key, bucket) in &state.by_priority {
            assert!(!bucket.is_empty(), "empty priority bucket retained");
            for (slot_key, command) in bucket {
                primary_count += 1;
                let dkey = DeadlineKey {
                    deadline: command.deadline,
                    seq: slot_key.seq,
                };
                let slot = state
                    .by_deadline
                    .get(&dkey)
                    .expect("queued command missing its deadline entry");
                assert_eq!(slot.priority, bucket_key.0);
                assert_eq!(slot.execute_at, slot_key.execute_at);
            }
        }
        assert_eq!(
            primary_count,
            state.by_deadline.len(),
            "deadline index size diverged from primary index"
        );
    }
}
