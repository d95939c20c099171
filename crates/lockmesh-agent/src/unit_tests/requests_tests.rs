// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::mpsc;

use lockmesh_types::base_types::{AgentId, LockVersion, NodeId, ObjectPath};
use lockmesh_types::error::AgentError;
use lockmesh_types::lock::{Entry, Lock, LockId, Mode, QueueElement};
use lockmesh_types::messages::{
    AgentOptions, AllLocksStatus, LockSpec, LockStateUpdate, Require,
};

use crate::agent::AgentMessage;
use crate::metrics::AgentMetrics;
use crate::state::AgentState;
use crate::test_utils::TestCluster;

fn n1() -> NodeId {
    NodeId::from("n1")
}

fn make_state(
    cluster: &TestCluster,
    byte: u8,
) -> (
    AgentState,
    mpsc::UnboundedSender<AgentMessage>,
    mpsc::UnboundedReceiver<AgentMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = AgentState::new(
        AgentId::new([byte; AgentId::LENGTH]),
        AgentOptions::new("n1"),
        cluster.source(),
        cluster.peers(),
        tx.downgrade(),
        Arc::new(AgentMetrics::new_for_tests()),
    );
    (state, tx, rx)
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn repeat_request_is_idempotent() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let spec = LockSpec::write(ObjectPath::from("o1"), vec![n1()]);
    let first = agent.lock(spec.clone()).await.unwrap();
    assert_eq!(first, AllLocksStatus::HaveAll(vec![]));

    let second = agent.lock(spec).await.unwrap();
    assert_eq!(second, AllLocksStatus::HaveAll(vec![]));

    let info = agent.lock_info().await.unwrap();
    assert!(info.pending.is_empty());
    assert_eq!(info.locks.len(), 1);
    assert_eq!(info.claim_no, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn write_lock_covers_read_request() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();
    let object = ObjectPath::from("o");

    let status = agent
        .lock(LockSpec::write(object.clone(), vec![n1()]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let status = agent
        .lock(LockSpec::read(object.clone(), vec![n1()]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    // The read never reached the server.
    let queue = cluster.queue_snapshot(&n1(), &object).unwrap();
    assert_eq!(queue.len(), 1);
    assert!(matches!(queue[0], QueueElement::Write(_)));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn upgrade_purges_snapshots_and_reissues() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let (mut state, _tx, _rx) = make_state(&cluster, 1);
    let object = ObjectPath::from("o3");

    state
        .submit_lock(LockSpec::read(object.clone(), vec![n1()]))
        .await
        .unwrap();
    let granted = LockStateUpdate {
        lock: Lock {
            id: LockId::new(object.clone(), n1()),
            version: LockVersion::new(1),
            queue: vec![QueueElement::Read(vec![Entry {
                agent: state.id,
                version: LockVersion::new(1),
            }])],
        },
        node: n1(),
        note: None,
    };
    state.ingest_update(granted).await.unwrap();
    assert_eq!(state.locks.len(), 1);
    state.assert_invariants();

    state
        .submit_lock(LockSpec::write(object.clone(), vec![n1()]))
        .await
        .unwrap();
    assert!(state.locks.is_empty(), "stale read snapshot must be purged");
    let pending: Vec<_> = state.pending_iter().collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].mode, Mode::Write);
    state.assert_invariants();

    // The fresh write request reached the server.
    let queue = cluster.queue_snapshot(&n1(), &object).unwrap();
    assert!(matches!(queue.last(), Some(QueueElement::Write(_))));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn conflicting_request_aborts_the_transaction() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();
    let object = ObjectPath::from("o");

    agent
        .lock_nowait(LockSpec::write(object.clone(), vec![n1()]))
        .await
        .unwrap();
    let err = agent
        .lock_nowait(LockSpec::write(object.clone(), vec![n1()]).with_require(Require::Majority))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ConflictingRequest { .. }));
    assert!(matches!(
        agent.join().await.unwrap_err(),
        AgentError::ConflictingRequest { .. }
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn extension_issues_only_the_extra_nodes() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1", "n2"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();
    let object = ObjectPath::from("o");

    let status = agent
        .lock(LockSpec::write(object.clone(), vec![n1()]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let status = agent
        .lock(LockSpec::write(object.clone(), vec![n1(), NodeId::from("n2")]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let info = agent.lock_info().await.unwrap();
    assert_eq!(info.locks.len(), 2);
    assert_eq!(info.claim_no, 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn empty_object_path_is_illegal() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let err = agent
        .lock(LockSpec::write(ObjectPath::new(vec![]), vec![n1()]))
        .await
        .unwrap_err();
    assert_eq!(err, AgentError::IllegalLockPattern);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn bare_lock_targets_the_home_node() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let status = agent
        .lock(LockSpec::write(ObjectPath::from("o"), vec![]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let info = agent.lock_info().await.unwrap();
    assert_eq!(info.locks[0].id.node, n1());
}
