//! Shared harness for integration tests: a scriptable in-memory
//! coordinator, a crash-inducing test plugin, and helpers to wire an
//! in-process leader/follower pair through a test cluster link.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use galena_dispatch::{
    ClusterLink, CommitOutcome, Coordinator, CrashPhase, DispatchConfig, Dispatcher, HandlerFault,
    PeekOutcome, Plugin, ProcessOutcome, ResponseQueue, ResponseSink,
};
use galena_types::{Command, NodeState, Request, Response};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Microseconds since the epoch, for building schedule fields.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

// ============================================================================
// Scriptable coordinator
// ============================================================================

/// A transaction buffering writes against the in-memory store.
pub struct MemTxn {
    pub writes: Vec<(String, String)>,
}

/// Coordinator over an in-memory map with a scriptable commit outcome
/// sequence and a switchable node role.
pub struct ScriptedCoordinator {
    state: Mutex<NodeState>,
    commit_script: Mutex<VecDeque<CommitOutcome>>,
    store: Mutex<BTreeMap<String, String>>,
    pub begins: AtomicU64,
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
}

impl ScriptedCoordinator {
    pub fn with_state(state: NodeState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            commit_script: Mutex::new(VecDeque::new()),
            store: Mutex::new(BTreeMap::new()),
            begins: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        })
    }

    pub fn leader() -> Arc<Self> {
        Self::with_state(NodeState::Mastering)
    }

    pub fn follower() -> Arc<Self> {
        Self::with_state(NodeState::Slaving)
    }

    /// Switches the node role, e.g. to promote a follower.
    pub fn set_state(&self, state: NodeState) {
        *self.state.lock().unwrap() = state;
    }

    /// Queues commit outcomes; once drained, commits succeed.
    pub fn script_commits(&self, outcomes: impl IntoIterator<Item = CommitOutcome>) {
        self.commit_script.lock().unwrap().extend(outcomes);
    }

    pub fn store_get(&self, key: &str) -> Option<String> {
        self.store.lock().unwrap().get(key).cloned()
    }

    pub fn store_len(&self) -> usize {
        self.store.lock().unwrap().len()
    }
}

impl Coordinator for ScriptedCoordinator {
    type Txn = MemTxn;

    fn begin(&self) -> MemTxn {
        self.begins.fetch_add(1, Ordering::SeqCst);
        MemTxn { writes: Vec::new() }
    }

    fn commit(&self, txn: MemTxn) -> CommitOutcome {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .commit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CommitOutcome::Ok);
        if outcome == CommitOutcome::Ok {
            let mut store = self.store.lock().unwrap();
            for (key, value) in txn.writes {
                store.insert(key, value);
            }
        }
        outcome
    }

    fn rollback(&self, _txn: MemTxn) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }

    fn is_leader(&self) -> bool {
        self.state.lock().unwrap().is_leader()
    }

    fn state(&self) -> NodeState {
        *self.state.lock().unwrap()
    }
}

// ============================================================================
// Cluster link
// ============================================================================

/// In-process link: forwards escalations into another dispatcher's queue
/// and fans crash broadcasts out to registered peers.
#[derive(Default)]
pub struct TestLink {
    forward_target: Mutex<Option<Arc<Dispatcher<ScriptedCoordinator>>>>,
    crash_peers: Mutex<Vec<Arc<Dispatcher<ScriptedCoordinator>>>>,
    pub forwarded: AtomicU64,
}

impl TestLink {
    pub fn set_forward_target(&self, target: Arc<Dispatcher<ScriptedCoordinator>>) {
        *self.forward_target.lock().unwrap() = Some(target);
    }

    pub fn add_crash_peer(&self, peer: Arc<Dispatcher<ScriptedCoordinator>>) {
        self.crash_peers.lock().unwrap().push(peer);
    }
}

impl ClusterLink for TestLink {
    fn forward_to_leader(&self, command: Command) {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        if let Some(target) = self.forward_target.lock().unwrap().as_ref() {
            target.accept_forwarded(command);
        }
    }

    fn broadcast_crash(&self, request: &Request, phase: CrashPhase) {
        for peer in self.crash_peers.lock().unwrap().iter() {
            peer.note_crashed_command(request, phase);
        }
    }
}

// ============================================================================
// Test plugin
// ============================================================================

/// A job-board plugin covering every phase outcome plus crashes.
///
/// Methods: `CreateJob` (escalate, write, commit), `QueryJob` (complete
/// at peek), `TouchNothing` (escalate, no writes), `CrashPeek`,
/// `CrashProcess`, and `SlowPeek` (complete after a delay).
#[derive(Default)]
pub struct JobBoardPlugin {
    pub peek_calls: AtomicU64,
    pub process_calls: AtomicU64,
}

impl Plugin<MemTxn> for JobBoardPlugin {
    fn name(&self) -> &str {
        "job-board"
    }

    fn peek(&self, command: &mut Command) -> Result<Option<PeekOutcome>, HandlerFault> {
        match command.request.method_line.as_str() {
            "CreateJob" | "TouchNothing" | "CrashProcess" => {
                self.peek_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(PeekOutcome::Escalate))
            }
            "QueryJob" => {
                self.peek_calls.fetch_add(1, Ordering::SeqCst);
                let name = command.request.field("name").unwrap_or("").to_string();
                command.set_response(Response::ok().with_field("name", name));
                Ok(Some(PeekOutcome::Complete))
            }
            "SlowPeek" => {
                self.peek_calls.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
                command.set_response(Response::ok());
                Ok(Some(PeekOutcome::Complete))
            }
            "CrashPeek" => {
                self.peek_calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerFault::new("told to crash in peek"))
            }
            _ => Ok(None),
        }
    }

    fn process(
        &self,
        txn: &mut MemTxn,
        command: &mut Command,
    ) -> Result<Option<ProcessOutcome>, HandlerFault> {
        match command.request.method_line.as_str() {
            "CreateJob" => {
                self.process_calls.fetch_add(1, Ordering::SeqCst);
                let name = command.request.field("name").unwrap_or("unnamed").to_string();
                txn.writes.push((format!("job:{name}"), "pending".to_string()));
                command.set_response(Response::ok().with_field("jobID", format!("job:{name}")));
                Ok(Some(ProcessOutcome::Committed))
            }
            "TouchNothing" => {
                self.process_calls.fetch_add(1, Ordering::SeqCst);
                command.set_response(Response::ok().with_field("changed", "false"));
                Ok(Some(ProcessOutcome::NoChange))
            }
            "CrashProcess" => {
                self.process_calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerFault::new("told to crash in process"))
            }
            _ => Ok(None),
        }
    }

    fn upgrade_store(&self, txn: &mut MemTxn) -> Result<(), HandlerFault> {
        txn.writes
            .push(("schema_version".to_string(), "1".to_string()));
        Ok(())
    }
}

// ============================================================================
// Node harness
// ============================================================================

/// One in-process node: dispatcher plus handles to its collaborators.
pub struct TestNode {
    pub dispatcher: Arc<Dispatcher<ScriptedCoordinator>>,
    pub coordinator: Arc<ScriptedCoordinator>,
    pub plugin: Arc<JobBoardPlugin>,
    pub link: Arc<TestLink>,
    pub responses: Arc<ResponseQueue>,
}

impl TestNode {
    pub fn start(&self) {
        self.dispatcher.start().expect("node starts");
    }
}

/// A small, fast configuration for tests.
pub fn fast_config() -> DispatchConfig {
    DispatchConfig {
        worker_count: 2,
        take_tick_ms: 20,
        ..DispatchConfig::default()
    }
}

pub fn build_node(state: NodeState) -> TestNode {
    build_node_with_config(state, fast_config())
}

pub fn build_node_with_config(state: NodeState, config: DispatchConfig) -> TestNode {
    init_tracing();
    let coordinator = ScriptedCoordinator::with_state(state);
    let plugin = Arc::new(JobBoardPlugin::default());
    let link = Arc::new(TestLink::default());
    let responses = Arc::new(ResponseQueue::new());
    let dispatcher = Arc::new(
        Dispatcher::new(
            config,
            Arc::clone(&coordinator),
            vec![Arc::clone(&plugin) as Arc<dyn Plugin<MemTxn>>],
            Arc::clone(&link) as Arc<dyn ClusterLink>,
            Arc::clone(&responses) as Arc<dyn ResponseSink>,
        )
        .expect("valid test configuration"),
    );
    TestNode {
        dispatcher,
        coordinator,
        plugin,
        link,
        responses,
    }
}

/// Wires a follower to its leader: escalations forward to the leader,
/// and crash broadcasts flow both ways.
pub fn link_pair(leader: &TestNode, follower: &TestNode) {
    follower.link.set_forward_target(Arc::clone(&leader.dispatcher));
    follower.link.add_crash_peer(Arc::clone(&leader.dispatcher));
    leader.link.add_crash_peer(Arc::clone(&follower.dispatcher));
}

/// Blocks until the sink yields a completed command.
pub fn await_response(responses: &ResponseQueue, timeout: Duration) -> Command {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(command) = responses.pop() {
            return command;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for a response"
        );
        thread::sleep(Duration::from_millis(5));
    }
}

/// Blocks until `predicate` holds or the timeout lapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}
