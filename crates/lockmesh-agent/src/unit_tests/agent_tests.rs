// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::time::timeout;

use lockmesh_types::base_types::{NodeId, ObjectPath};
use lockmesh_types::error::AgentError;
use lockmesh_types::messages::{
    AgentEvent, AgentFlag, AgentOptions, AllLocksStatus, LockSpec, Require,
};

use crate::test_utils::TestCluster;

fn node(name: &str) -> NodeId {
    NodeId::from(name)
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn single_local_lock() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let status = agent
        .lock(LockSpec::write(ObjectPath::from("o1"), vec![node("n1")]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let status = agent.await_all_locks().await.unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let info = agent.lock_info().await.unwrap();
    assert!(info.have_all);
    assert_eq!(info.claim_no, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn majority_quorum_rides_out_a_dead_node() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    cluster.stop_server(&node("n2"));
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let spec = LockSpec::read(
        ObjectPath::from("o2"),
        vec![node("n1"), node("n2"), node("n3")],
    )
    .with_require(Require::Majority);
    let status = timeout(Duration::from_secs(5), agent.lock(spec))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn majority_alive_counts_only_live_nodes() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1", "n2", "n3"]);
    cluster.stop_server(&node("n2"));
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let spec = LockSpec::read(
        ObjectPath::from("o"),
        vec![node("n1"), node("n2"), node("n3")],
    )
    .with_require(Require::MajorityAlive);
    let status = timeout(Duration::from_secs(5), agent.lock(spec))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn any_quorum_needs_a_single_grant() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.stop_server(&node("n2"));
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let spec = LockSpec::write(ObjectPath::from("o"), vec![node("n1"), node("n2")])
        .with_require(Require::Any);
    let status = timeout(Duration::from_secs(5), agent.lock(spec))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn node_loss_aborts_when_not_awaiting_nodes() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.stop_server(&node("n2"));
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let object = ObjectPath::from("o6");
    let err = timeout(
        Duration::from_secs(5),
        agent.lock(LockSpec::write(object.clone(), vec![node("n1"), node("n2")])),
    )
    .await
    .unwrap()
    .unwrap_err();
    let AgentError::CannotLockObjects(requests) = err else {
        panic!("expected CannotLockObjects");
    };
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].object, object);

    assert!(matches!(
        agent.join().await.unwrap_err(),
        AgentError::CannotLockObjects(_)
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn node_loss_is_ridden_out_when_awaiting_nodes() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1", "n2"]);
    cluster.stop_server(&node("n2"));
    let mut options = AgentOptions::new("n1");
    options.await_nodes = true;
    let agent = cluster.spawn_agent(options).unwrap();

    let object = ObjectPath::from("o6");
    let status = agent
        .lock_nowait(LockSpec::write(object.clone(), vec![node("n1"), node("n2")]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::Waiting);

    cluster.restart_server(&node("n2"));

    let status = timeout(Duration::from_secs(5), agent.await_all_locks())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let info = agent.lock_info().await.unwrap();
    assert_eq!(info.locks.len(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn lost_lock_is_reacquired_after_node_restart() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1", "n2"]);
    let mut options = AgentOptions::new("n1");
    options.await_nodes = true;
    let agent = cluster.spawn_agent(options).unwrap();

    let object = ObjectPath::from("o");
    let status = agent
        .lock(LockSpec::write(object.clone(), vec![node("n2")]))
        .await
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    cluster.node_down(&node("n2"));
    cluster.restart_server(&node("n2"));

    let status = timeout(Duration::from_secs(5), agent.await_all_locks())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    // Losing and re-acquiring the set claims it a second time.
    let info = agent.lock_info().await.unwrap();
    assert_eq!(info.claim_no, 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn await_with_no_requests_reports_no_locks() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let status = agent.await_all_locks().await.unwrap();
    assert_eq!(status, AllLocksStatus::NoLocks);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn spawn_fails_without_a_home_lock_server() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    cluster.stop_server(&node("n1"));

    let err = cluster
        .spawn_agent(AgentOptions::new("n1"))
        .map(|_| ())
        .unwrap_err();
    assert_eq!(err, AgentError::NotRunning(node("n1")));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn batch_lock_objects() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    agent
        .lock_objects(vec![
            LockSpec::write(ObjectPath::from("o1"), vec![node("n1")]),
            LockSpec::read(ObjectPath::from("o2"), vec![node("n1")]),
        ])
        .await
        .unwrap();

    let status = timeout(Duration::from_secs(5), agent.await_all_locks())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, AllLocksStatus::HaveAll(vec![]));

    let info = agent.lock_info().await.unwrap();
    assert_eq!(info.locks.len(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn event_subscribers_see_progress() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let mut events = agent.subscribe_events().await.unwrap();
    agent
        .lock_nowait(LockSpec::write(ObjectPath::from("o"), vec![node("n1")]))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, AgentEvent::HaveAllLocks(_)));
    let second = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second, AgentEvent::LockState(_)));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn clearing_the_notify_flag_drops_subscribers() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    let mut events = agent.subscribe_events().await.unwrap();
    agent.change_flag(AgentFlag::Notify, false).await.unwrap();

    let closed = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stop_ends_the_transaction_cleanly() {
    telemetry_subscribers::init_for_testing();
    let cluster = TestCluster::new(&["n1"]);
    let agent = cluster.spawn_agent(AgentOptions::new("n1")).unwrap();

    agent
        .lock(LockSpec::write(ObjectPath::from("o"), vec![node("n1")]))
        .await
        .unwrap();
    agent.stop().await.unwrap();
}
