//! Crash quarantine across an in-process leader/follower pair: crashes
//! blacklist their (method, user) pair, the blacklist reaches peers via
//! the crash broadcast, survives promotion, and never leaks across user
//! ids. Also covers follower escalation and the peek-on-both-nodes
//! contract.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{await_response, build_node, link_pair, TestNode};
use galena_types::{NodeState, Request, fields};

fn cluster() -> (TestNode, TestNode) {
    let leader = build_node(NodeState::Mastering);
    let follower = build_node(NodeState::Slaving);
    link_pair(&leader, &follower);
    leader.start();
    follower.start();
    (leader, follower)
}

fn crash_peek_request(user: &str) -> Request {
    Request::new("CrashPeek").with_field(fields::USER_ID, user)
}

fn crash_process_request(user: &str) -> Request {
    Request::new("CrashProcess").with_field(fields::USER_ID, user)
}

#[test]
fn peek_crash_on_the_leader_blacklists_on_the_follower() {
    let (leader, follower) = cluster();

    // First submission crashes the leader's peek; the worker converts the
    // fault into a 500 and broadcasts the crash.
    leader.dispatcher.submit(crash_peek_request("31")).unwrap();
    let first = await_response(&leader.responses, Duration::from_secs(2));
    assert_eq!(
        first.response().unwrap().status_line(),
        "500 Internal Server Error"
    );

    // The identical command on the follower short-circuits without ever
    // reaching the plugin's peek.
    follower.dispatcher.submit(crash_peek_request("31")).unwrap();
    let second = await_response(&follower.responses, Duration::from_secs(2));
    assert_eq!(second.response().unwrap().status_line(), "500 Blacklisted");
    assert_eq!(follower.plugin.peek_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn process_crash_survives_follower_promotion() {
    let (leader, follower) = cluster();

    leader.dispatcher.submit(crash_process_request("32")).unwrap();
    let first = await_response(&leader.responses, Duration::from_secs(2));
    assert_eq!(
        first.response().unwrap().status_line(),
        "500 Internal Server Error"
    );
    assert_eq!(leader.plugin.process_calls.load(Ordering::SeqCst), 1);

    // The leader goes away; the follower is promoted.
    leader.coordinator.set_state(NodeState::Standingdown);
    follower.coordinator.set_state(NodeState::Mastering);

    // The new leader learned of the crash via the broadcast and refuses
    // to process the same (method, user) pair.
    follower
        .dispatcher
        .submit(crash_process_request("32"))
        .unwrap();
    let second = await_response(&follower.responses, Duration::from_secs(2));
    assert_eq!(second.response().unwrap().status_line(), "500 Blacklisted");
    assert_eq!(follower.plugin.process_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn blacklist_is_scoped_to_the_crashing_user() {
    let (leader, follower) = cluster();

    leader.dispatcher.submit(crash_process_request("32")).unwrap();
    await_response(&leader.responses, Duration::from_secs(2));

    leader.coordinator.set_state(NodeState::Standingdown);
    follower.coordinator.set_state(NodeState::Mastering);

    // A different user id on the same method is not quarantined: the
    // crash happens again, first-occurrence style.
    follower
        .dispatcher
        .submit(crash_process_request("33"))
        .unwrap();
    let done = await_response(&follower.responses, Duration::from_secs(2));
    assert_eq!(
        done.response().unwrap().status_line(),
        "500 Internal Server Error"
    );
    assert_eq!(follower.plugin.process_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn follower_escalations_are_processed_by_the_leader() {
    let (leader, follower) = cluster();

    follower
        .dispatcher
        .submit(Request::new("CreateJob").with_field("name", "fwd"))
        .unwrap();

    // The answer comes out of the leader's sink; the follower only peeked.
    let done = await_response(&leader.responses, Duration::from_secs(2));
    assert_eq!(done.response().unwrap().status_line(), "200 OK");
    assert_eq!(done.response().unwrap().field("jobID"), Some("job:fwd"));
    assert_eq!(follower.link.forwarded.load(Ordering::SeqCst), 1);
    assert!(follower.responses.is_empty());

    // Peek ran once per node; the store changed only through the leader's
    // process phase.
    assert_eq!(follower.plugin.peek_calls.load(Ordering::SeqCst), 1);
    assert_eq!(leader.plugin.peek_calls.load(Ordering::SeqCst), 1);
    assert_eq!(follower.plugin.process_calls.load(Ordering::SeqCst), 0);
    assert_eq!(leader.plugin.process_calls.load(Ordering::SeqCst), 1);
    assert_eq!(leader.coordinator.store_get("job:fwd").as_deref(), Some("pending"));
    // The follower's store saw nothing beyond its own schema upgrade.
    assert_eq!(follower.coordinator.store_len(), 1);

    assert_eq!(leader.dispatcher.in_flight(), 0);
    assert_eq!(follower.dispatcher.in_flight(), 0);
}

#[test]
fn read_only_commands_complete_locally_on_a_follower() {
    let (leader, follower) = cluster();

    follower
        .dispatcher
        .submit(Request::new("QueryJob").with_field("name", "local"))
        .unwrap();

    let done = await_response(&follower.responses, Duration::from_secs(2));
    assert_eq!(done.response().unwrap().field("name"), Some("local"));
    assert_eq!(follower.link.forwarded.load(Ordering::SeqCst), 0);
    assert!(leader.responses.is_empty());
}

#[test]
fn repeated_crashes_count_but_blacklist_once() {
    let (leader, _follower) = cluster();

    leader.dispatcher.submit(crash_peek_request("40")).unwrap();
    let first = await_response(&leader.responses, Duration::from_secs(2));
    assert_eq!(first.response().unwrap().code, 500);
    assert_eq!(leader.plugin.peek_calls.load(Ordering::SeqCst), 1);

    // The second submission never reaches the plugin again.
    leader.dispatcher.submit(crash_peek_request("40")).unwrap();
    let second = await_response(&leader.responses, Duration::from_secs(2));
    assert_eq!(second.response().unwrap().status_line(), "500 Blacklisted");
    assert_eq!(leader.plugin.peek_calls.load(Ordering::SeqCst), 1);
}
