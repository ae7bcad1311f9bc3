//! Seams to the replicated commit layer and the rest of the cluster.
//!
//! Replication, quorum, log durability, and the transport between nodes
//! all live behind these traits. The dispatch core assumes nothing beyond
//! the declared status codes, and that `commit` is atomic with respect to
//! replication.

use galena_types::{Command, NodeState, Request};

use crate::quarantine::CrashPhase;

/// Result of asking the coordinator to commit a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Committed and replicated.
    Ok,
    /// Lost a replication conflict; the command may be re-processed on a
    /// fresh transaction.
    Conflict,
    /// Unrecoverable; not retried.
    Fatal,
}

/// The replicated transactional commit layer.
///
/// One transaction is open per command being processed; the worker owning
/// the command is the only caller. `begin` is paired with exactly one
/// `commit` or `rollback`.
pub trait Coordinator: Send + Sync {
    /// Opaque transaction handle scoping store access.
    type Txn;

    /// Opens a transaction on the underlying store.
    fn begin(&self) -> Self::Txn;

    /// Commits and replicates the transaction.
    fn commit(&self, txn: Self::Txn) -> CommitOutcome;

    /// Discards the transaction without replicating.
    fn rollback(&self, txn: Self::Txn);

    /// True when this node may run the process phase.
    fn is_leader(&self) -> bool;

    /// Replication state of this node, for status reporting.
    fn state(&self) -> NodeState;
}

/// Cross-node escapes from the dispatch core.
///
/// Both calls are opaque to the core: what "forward" and "broadcast" mean
/// on the wire is the embedding server's business.
pub trait ClusterLink: Send + Sync {
    /// Hands an escalated command to the leader. Ownership moves with the
    /// command; the leader's worker will answer the submitter.
    fn forward_to_leader(&self, command: Command);

    /// Tells peer nodes that `request` crashed a handler phase here, so
    /// they can pre-populate their own quarantine registries.
    fn broadcast_crash(&self, _request: &Request, _phase: CrashPhase) {}
}
