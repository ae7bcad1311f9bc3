//! # galena-dispatch: the command dispatch core
//!
//! A priority-and-deadline command queue feeding a pool of worker
//! threads, plus the two-phase (peek/process) handler that cooperates
//! with a replicated transactional commit layer.
//!
//! # Architecture
//!
//! ```text
//! submit ──► CommandQueue ──► Worker ──► DispatchCore.peek
//!                                          │
//!                        Complete ◄────────┼──────► Escalate
//!                           │              │           │
//!                           │       (follower) forward │ (leader)
//!                           │              to leader   ▼
//!                           │                   DispatchCore.process
//!                           │                          │
//!                           │                   Coordinator.commit
//!                           ▼                          │
//!                      ResponseSink ◄──────────────────┘
//! ```
//!
//! A command that crashes a handler phase is quarantined: its
//! (method, user) pair is blacklisted and later submissions short-circuit
//! to `500 Blacklisted`. Commands whose deadline lapses while queued are
//! preempted to the front and answered `555 Timeout`.
//!
//! The replicated commit layer, the store, and the node-to-node transport
//! stay behind the [`Coordinator`] and [`ClusterLink`] seams; this crate
//! owns scheduling, role-aware dispatch, and failure quarantine only.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod quarantine;
pub mod queue;
pub mod sink;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DispatchConfig;
pub use coordinator::{ClusterLink, CommitOutcome, Coordinator};
pub use crate::core::DispatchCore;
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, DispatchError, Result, TakeError};
pub use plugin::{HandlerFault, PeekOutcome, Plugin, ProcessOutcome};
pub use quarantine::{CrashPhase, QuarantineRegistry};
pub use queue::CommandQueue;
pub use sink::{ResponseQueue, ResponseSink};
pub use worker::STATUS_METHOD;
