//! # galena-types: Core types for Galena
//!
//! This crate contains the inert types shared across the Galena system:
//! - Entity IDs ([`CommandId`])
//! - Scheduling types ([`Priority`], [`Timestamp`])
//! - Request/response tables ([`Request`], [`Response`])
//! - The unit of work itself ([`Command`])
//! - Phase timing ([`TimingPhase`], [`TimingLog`])
//! - Cluster role reporting ([`NodeState`], [`StatusReport`])
//!
//! Everything here is passive data: no locks, no clocks, no I/O.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs
// ============================================================================

/// Unique identifier for a command on a single node.
///
/// Ids are allocated from a per-node atomic counter by the dispatcher and
/// are required to be unique for the life of the node. `remove_by_id`
/// relies on this uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(u64);

impl CommandId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CommandId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<CommandId> for u64 {
    fn from(id: CommandId) -> Self {
        id.0
    }
}

// ============================================================================
// Scheduling types
// ============================================================================

/// Scheduling priority of a command. Higher values dispatch earlier.
///
/// Requests may carry any integer; ingress clamps it into
/// [`Priority::MIN`]..=[`Priority::MAX`]. The named levels match the wire
/// values accepted from clients.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Priority(i32);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const LOW: Priority = Priority(250);
    pub const NORMAL: Priority = Priority(500);
    pub const HIGH: Priority = Priority(750);
    pub const MAX: Priority = Priority(1000);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    /// Clamps an arbitrary client-supplied value into the accepted range.
    pub fn clamped(value: i32) -> Self {
        Self(value.clamp(Self::MIN.0, Self::MAX.0))
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// A point in time, in microseconds since the Unix epoch.
///
/// `Timestamp::ZERO` doubles as "immediately" in scheduling contexts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns this timestamp advanced by `micros`, saturating at the top of
    /// the range rather than wrapping.
    pub const fn saturating_add_micros(self, micros: u64) -> Self {
        Self(self.0.saturating_add(micros))
    }

    /// Microseconds from `earlier` to `self`, or zero if `earlier` is later.
    pub const fn saturating_micros_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================================================
// Request / Response tables
// ============================================================================

/// Well-known request field names.
pub mod fields {
    /// Grouping key for crash quarantine.
    pub const USER_ID: &str = "userID";
    /// Absolute execute time in microseconds since the epoch; 0 = now.
    pub const EXECUTE_TIME: &str = "commandExecuteTime";
    /// Relative deadline in milliseconds from receipt.
    pub const TIMEOUT: &str = "timeout";
    /// Requested scheduling priority.
    pub const PRIORITY: &str = "priority";
}

/// An inbound request: a method line, an ordered field table, and an opaque
/// content body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Request {
    /// The command name, e.g. `GetJob` or `Status`.
    pub method_line: String,

    /// Named fields. Ordered so that serialized forms are deterministic.
    pub fields: BTreeMap<String, String>,

    /// Opaque payload body.
    pub content: Bytes,
}

impl Request {
    pub fn new(method_line: impl Into<String>) -> Self {
        Self {
            method_line: method_line.into(),
            fields: BTreeMap::new(),
            content: Bytes::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Parses a numeric field, treating absent or malformed values as 0.
    pub fn calc_u64(&self, name: &str) -> u64 {
        self.field(name)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Parses a signed numeric field, treating absent or malformed values
    /// as 0.
    pub fn calc_i32(&self, name: &str) -> i32 {
        self.field(name)
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(0)
    }

    /// The quarantine grouping key. Absent user ids collapse to the empty
    /// string so that anonymous crashes still group together.
    pub fn user_id(&self) -> &str {
        self.field(fields::USER_ID).unwrap_or("")
    }
}

/// A command's result: a status code plus reason phrase, optional named
/// fields, and an opaque content body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Numeric status code, e.g. 200.
    pub code: u16,

    /// Human-readable reason phrase, e.g. `OK` or `Blacklisted`.
    pub reason: String,

    /// Named response fields.
    pub fields: BTreeMap<String, String>,

    /// Opaque payload body.
    pub content: Bytes,
}

impl Response {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            fields: BTreeMap::new(),
            content: Bytes::new(),
        }
    }

    /// `200 OK`.
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// `500 Blacklisted`: quarantine short circuit.
    pub fn blacklisted() -> Self {
        Self::new(500, "Blacklisted")
    }

    /// `555 Timeout`: deadline elapsed before handling.
    pub fn timed_out() -> Self {
        Self::new(555, "Timeout")
    }

    /// `500 Internal Server Error`: uncaught handler fault.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    /// `430 Unrecognized command`: no plugin claims the method.
    pub fn unrecognized() -> Self {
        Self::new(430, "Unrecognized command")
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// The combined status line, e.g. `500 Blacklisted`.
    pub fn status_line(&self) -> String {
        format!("{} {}", self.code, self.reason)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

// ============================================================================
// Phase timing
// ============================================================================

/// The lifecycle phases a command's time is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimingPhase {
    /// Waiting in the scheduling queue for a worker.
    QueueWorker,
    /// Inside the peek phase of the handler.
    Peek,
    /// Inside the process phase of the handler.
    Process,
    /// Inside the coordinator's commit.
    Commit,
}

/// One closed timing interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub phase: TimingPhase,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// Accumulated phase timings for a command.
///
/// At most one phase is open at a time; the component currently holding the
/// command is responsible for pairing `start` with `stop`. A `stop` without
/// a matching open interval is ignored, as is a second `start` before the
/// previous interval closed (the earlier interval wins).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingLog {
    records: Vec<TimingRecord>,
    open: Option<(TimingPhase, Timestamp)>,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an interval for `phase` at `now`.
    pub fn start(&mut self, phase: TimingPhase, now: Timestamp) {
        if self.open.is_none() {
            self.open = Some((phase, now));
        }
    }

    /// Closes the open interval, if it matches `phase`.
    pub fn stop(&mut self, phase: TimingPhase, now: Timestamp) {
        if let Some((open_phase, start)) = self.open {
            if open_phase == phase {
                self.open = None;
                self.records.push(TimingRecord {
                    phase,
                    start,
                    end: now,
                });
            }
        }
    }

    /// Total closed time attributed to `phase`, in microseconds.
    pub fn total_micros(&self, phase: TimingPhase) -> u64 {
        self.records
            .iter()
            .filter(|r| r.phase == phase)
            .map(|r| r.end.saturating_micros_since(r.start))
            .sum()
    }

    pub fn records(&self) -> &[TimingRecord] {
        &self.records
    }
}

// ============================================================================
// Command
// ============================================================================

/// A single unit of work: a request plus its scheduling envelope and its
/// (eventual) response.
///
/// A command is owned by exactly one component at a time; handing it to the
/// queue, a worker, or the response sink is a move. Once a response is set
/// the command is terminal and must not re-enter the queue.
#[derive(Debug, Clone)]
pub struct Command {
    /// Node-unique identifier.
    pub id: CommandId,

    /// The inbound request.
    pub request: Request,

    /// Scheduling priority.
    pub priority: Priority,

    /// Earliest dispatch time.
    pub execute_at: Timestamp,

    /// Absolute deadline; past this the command is timed out.
    pub deadline: Timestamp,

    /// Phase timing counters.
    pub timing: TimingLog,

    /// Number of peek attempts on this node.
    pub peek_count: u32,

    /// Write-once result; private so terminality can be enforced.
    response: Option<Response>,
}

impl Command {
    pub fn new(
        id: CommandId,
        request: Request,
        priority: Priority,
        execute_at: Timestamp,
        deadline: Timestamp,
    ) -> Self {
        Self {
            id,
            request,
            priority,
            execute_at,
            deadline,
            timing: TimingLog::new(),
            peek_count: 0,
            response: None,
        }
    }

    /// Sets the response. The first write wins; later writes are dropped so
    /// a finalized command can never change its answer.
    pub fn set_response(&mut self, response: Response) {
        debug_assert!(
            self.response.is_none(),
            "response already set for command {}",
            self.id
        );
        self.response.get_or_insert(response);
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Discards a provisional response so a re-run of the process phase
    /// (after a commit conflict) can answer afresh. The command stops
    /// being terminal until a response is set again.
    pub fn clear_response(&mut self) {
        self.response = None;
    }

    /// True once a response has been set; the command is terminal.
    pub fn is_finished(&self) -> bool {
        self.response.is_some()
    }

    /// True if the deadline has passed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.deadline < now
    }
}

// ============================================================================
// Cluster role reporting
// ============================================================================

/// The replication role/state of this node, as reported by the commit
/// coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    /// Looking for a cluster to join.
    Searching,
    /// Catching up on the replicated log.
    Synchronizing,
    /// Synchronized, waiting to pick a role.
    Waiting,
    /// In the process of becoming leader.
    Standingup,
    /// Leader: may process commands.
    Mastering,
    /// Stepping down from leadership.
    Standingdown,
    /// Follower: may peek, escalates the rest.
    Slaving,
}

impl NodeState {
    /// Only a mastering node may run the process phase.
    pub fn is_leader(self) -> bool {
        matches!(self, NodeState::Mastering)
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Searching => "SEARCHING",
            NodeState::Synchronizing => "SYNCHRONIZING",
            NodeState::Waiting => "WAITING",
            NodeState::Standingup => "STANDINGUP",
            NodeState::Mastering => "MASTERING",
            NodeState::Standingdown => "STANDINGDOWN",
            NodeState::Slaving => "SLAVING",
        };
        write!(f, "{s}")
    }
}

/// The payload answered to a `Status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Replication state of this node.
    pub state: NodeState,

    /// Commands currently queued.
    #[serde(rename = "queuedCommandCount")]
    pub queued: usize,

    /// Commands taken by workers but not yet answered.
    #[serde(rename = "inFlightCommandCount")]
    pub in_flight: u64,

    /// Method line of every queued command, in dispatch order.
    #[serde(rename = "commandQueue")]
    pub command_queue: Vec<String>,
}

// ============================================================================
// Tests
// ============================================================================
