//! Crash quarantine.
//!
//! Commands that crash a handler phase are recorded by their
//! (method line, user id) pair. Later submissions of the same pair
//! short-circuit to a `500 Blacklisted` response instead of re-running the
//! phase that crashed. Records live for the life of the node and are never
//! replicated; peer nodes learn about crashes through the cluster link's
//! crash broadcast instead.
//!
//! The registry lock is leaf-level: it is never held across a queue-lock
//! acquisition.

use std::collections::HashMap;
use std::sync::Mutex;

use galena_types::Request;
use tracing::warn;

/// Which handler phase a crash occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPhase {
    /// The side-effect-free classification phase.
    Peek,
    /// The leader-only transactional phase.
    Process,
}

/// Per-(method, user) crash bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
struct CrashRecord {
    crash_count: u64,
    peek_blacklisted: bool,
    process_blacklisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CrashKey {
    method_line: String,
    user_id: String,
}

impl CrashKey {
    fn for_request(request: &Request) -> Self {
        Self {
            method_line: request.method_line.clone(),
            user_id: request.user_id().to_string(),
        }
    }
}

/// Thread-safe registry of commands observed to crash a handler phase.
#[derive(Debug, Default)]
pub struct QuarantineRegistry {
    records: Mutex<HashMap<CrashKey, CrashRecord>>,
}

impl QuarantineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a crash of `request` in `phase`, promoting its
    /// (method, user) pair into the matching blacklist.
    pub fn record_crash(&self, request: &Request, phase: CrashPhase) {
        let key = CrashKey::for_request(request);
        warn!(
            method = %key.method_line,
            user_id = %key.user_id,
            ?phase,
            "quarantining crashed command"
        );

        let mut records = self.records.lock().expect("quarantine lock poisoned");
        let record = records.entry(key).or_default();
        record.crash_count += 1;
        match phase {
            CrashPhase::Peek => record.peek_blacklisted = true,
            CrashPhase::Process => record.process_blacklisted = true,
        }
    }

    /// True if `request`'s (method, user) pair is blacklisted for `phase`.
    pub fn is_blacklisted(&self, request: &Request, phase: CrashPhase) -> bool {
        let key = CrashKey::for_request(request);
        let records = self.records.lock().expect("quarantine lock poisoned");
        records.get(&key).is_some_and(|r| match phase {
            CrashPhase::Peek => r.peek_blacklisted,
            CrashPhase::Process => r.process_blacklisted,
        })
    }

    /// How many crashes have been recorded for `request`'s (method, user)
    /// pair, in any phase.
    pub fn crash_count(&self, request: &Request) -> u64 {
        let key = CrashKey::for_request(request);
        let records = self.records.lock().expect("quarantine lock poisoned");
        records.get(&key).map_or(0, |r| r.crash_count)
    }

    /// Number of distinct quarantined (method, user) pairs.
    pub fn len(&self) -> usize {
        self.records.lock().expect("quarantine lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
