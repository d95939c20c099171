// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory lock servers and peer routing for tests.
//!
//! One [`TestCluster`] stands in for every external collaborator of the
//! agent: per-node lock servers with versioned queues, the node liveness
//! subscription, and the peer mesh. Queue semantics match a real lock
//! server: reads coalesce into the trailing read group, a surrender moves
//! the holder's entry to the tail and emits a confirmation note, and a dead
//! server forgets its queues.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use lockmesh_types::base_types::{AgentId, LockVersion, NodeId, ObjectPath};
use lockmesh_types::error::AgentResult;
use lockmesh_types::lock::{Entry, Lock, LockId, Mode, QueueElement};
use lockmesh_types::messages::{
    AgentOptions, LockStateUpdate, NodeEvent, PeerMessage, UpdateNote,
};

use crate::agent::{Agent, AgentHandle, AgentMailbox};
use crate::lock_server::{LockServerClient, LockServerSource, PeerDirectory};
use crate::metrics::AgentMetrics;

pub struct TestCluster {
    core: Arc<ClusterCore>,
}

struct ClusterCore {
    self_ref: Weak<ClusterCore>,
    state: Mutex<ClusterState>,
    node_events: broadcast::Sender<NodeEvent>,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, TestLockServer>,
    agents: BTreeMap<AgentId, AgentMailbox>,
}

struct TestLockServer {
    running: watch::Sender<bool>,
    locks: BTreeMap<ObjectPath, ServerLock>,
}

struct ServerLock {
    version: u64,
    queue: Vec<QueueElement>,
}

impl TestCluster {
    pub fn new(nodes: &[&str]) -> Self {
        let mut state = ClusterState::default();
        for node in nodes {
            state.nodes.insert(
                NodeId::from(*node),
                TestLockServer {
                    running: watch::channel(true).0,
                    locks: BTreeMap::new(),
                },
            );
        }
        let (node_events, _) = broadcast::channel(128);
        let core = Arc::new_cyclic(|self_ref| ClusterCore {
            self_ref: self_ref.clone(),
            state: Mutex::new(state),
            node_events,
        });
        Self { core }
    }

    pub fn source(&self) -> Arc<dyn LockServerSource> {
        self.core.clone()
    }

    pub fn peers(&self) -> Arc<dyn PeerDirectory> {
        self.core.clone()
    }

    /// Spawns an agent wired to this cluster and registers its mailbox for
    /// update and peer delivery.
    pub fn spawn_agent(&self, options: AgentOptions) -> AgentResult<AgentHandle> {
        let handle = Agent::spawn(
            options,
            self.source(),
            self.peers(),
            Arc::new(AgentMetrics::new_for_tests()),
        )?;
        self.register(&handle);
        Ok(handle)
    }

    pub fn register(&self, handle: &AgentHandle) {
        self.core
            .state
            .lock()
            .agents
            .insert(handle.id(), handle.mailbox());
    }

    /// Kills the lock server on `node`. Its queues are lost.
    pub fn stop_server(&self, node: &NodeId) {
        let mut guard = self.core.state.lock();
        if let Some(server) = guard.nodes.get_mut(node) {
            server.locks.clear();
            server.running.send_replace(false);
        }
    }

    /// Brings the lock server on `node` back with empty queues.
    pub fn restart_server(&self, node: &NodeId) {
        let mut guard = self.core.state.lock();
        if let Some(server) = guard.nodes.get_mut(node) {
            server.running.send_replace(true);
        }
    }

    /// Takes the whole node down: kills its lock server and announces the
    /// membership change.
    pub fn node_down(&self, node: &NodeId) {
        self.stop_server(node);
        let _ = self.core.node_events.send(NodeEvent::Down(node.clone()));
    }

    /// Announces node presence. Does not start a lock server.
    pub fn node_up(&self, node: &NodeId) {
        let _ = self.core.node_events.send(NodeEvent::Up(node.clone()));
    }

    /// The server-side queue for `object` on `node`, for assertions.
    pub fn queue_snapshot(&self, node: &NodeId, object: &ObjectPath) -> Option<Vec<QueueElement>> {
        let guard = self.core.state.lock();
        guard
            .nodes
            .get(node)?
            .locks
            .get(object)
            .map(|slot| slot.queue.clone())
    }
}

impl ClusterCore {
    /// Runs `mutate` against the queue for `object` on `node` and, if it
    /// reports a change, broadcasts the fresh snapshot to every agent in
    /// the queue. `mutate` returns the note to attach, or `None` for no
    /// change.
    fn mutate_lock(
        &self,
        node: &NodeId,
        object: &ObjectPath,
        mutate: impl FnOnce(&mut ServerLock) -> Option<Option<UpdateNote>>,
    ) {
        let (update, mailboxes) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(server) = state.nodes.get_mut(node) else {
                return;
            };
            if !*server.running.borrow() {
                return;
            }
            let slot = server.locks.entry(object.clone()).or_insert(ServerLock {
                version: 0,
                queue: Vec::new(),
            });
            let Some(note) = mutate(&mut *slot) else {
                return;
            };
            let update = LockStateUpdate {
                lock: Lock {
                    id: LockId::new(object.clone(), node.clone()),
                    version: LockVersion::new(slot.version),
                    queue: slot.queue.clone(),
                },
                node: node.clone(),
                note,
            };
            let mailboxes: Vec<AgentMailbox> = slot
                .queue
                .iter()
                .flat_map(|element| element.agents())
                .filter_map(|agent| state.agents.get(&agent).cloned())
                .collect();
            (update, mailboxes)
        };
        for mailbox in mailboxes {
            mailbox.deliver_update(update.clone());
        }
    }
}

/// Removes `agent`'s entry wherever it sits in the queue, dropping emptied
/// read groups. Returns the mode the agent was queued with.
fn remove_agent(queue: &mut Vec<QueueElement>, agent: &AgentId) -> Option<Mode> {
    let mut removed = None;
    queue.retain_mut(|element| match element {
        QueueElement::Write(entry) => {
            if entry.agent == *agent {
                removed = Some(Mode::Write);
                false
            } else {
                true
            }
        }
        QueueElement::Read(group) => {
            if group.iter().any(|entry| entry.agent == *agent) {
                group.retain(|entry| entry.agent != *agent);
                removed = Some(Mode::Read);
            }
            !group.is_empty()
        }
    });
    removed
}

fn enqueue(queue: &mut Vec<QueueElement>, entry: Entry, mode: Mode) {
    match mode {
        Mode::Write => queue.push(QueueElement::Write(entry)),
        Mode::Read => match queue.last_mut() {
            Some(QueueElement::Read(group)) => group.push(entry),
            _ => queue.push(QueueElement::Read(vec![entry])),
        },
    }
}

#[async_trait]
impl LockServerClient for ClusterCore {
    async fn request_lock(&self, object: ObjectPath, node: NodeId, agent: AgentId, mode: Mode) {
        self.mutate_lock(&node, &object, |slot| {
            // A duplicate request with the same mode keeps its place; a
            // mode change forfeits it.
            if slot
                .queue
                .iter()
                .any(|element| element.contains(&agent) && element.mode() == mode)
            {
                return None;
            }
            remove_agent(&mut slot.queue, &agent);
            slot.version += 1;
            let entry = Entry {
                agent,
                version: LockVersion::new(slot.version),
            };
            enqueue(&mut slot.queue, entry, mode);
            Some(None)
        });
    }

    async fn surrender(&self, object: ObjectPath, node: NodeId, agent: AgentId) {
        self.mutate_lock(&node, &object, |slot| {
            let mode = remove_agent(&mut slot.queue, &agent)?;
            slot.version += 1;
            let entry = Entry {
                agent,
                version: LockVersion::new(slot.version),
            };
            enqueue(&mut slot.queue, entry, mode);
            Some(Some(UpdateNote::Surrender(agent)))
        });
    }
}

#[async_trait]
impl LockServerSource for ClusterCore {
    fn client(&self, node: &NodeId) -> Option<Arc<dyn LockServerClient>> {
        let guard = self.state.lock();
        let server = guard.nodes.get(node)?;
        if !*server.running.borrow() {
            return None;
        }
        self.self_ref
            .upgrade()
            .map(|core| core as Arc<dyn LockServerClient>)
    }

    async fn server_down(&self, node: NodeId) {
        let rx = {
            let guard = self.state.lock();
            guard.nodes.get(&node).map(|server| server.running.subscribe())
        };
        match rx {
            // An unknown node counts as down.
            None => {}
            Some(mut rx) => {
                let _ = rx.wait_for(|running| !*running).await;
            }
        }
    }

    async fn server_running(&self, node: NodeId) {
        let rx = {
            let guard = self.state.lock();
            guard.nodes.get(&node).map(|server| server.running.subscribe())
        };
        match rx {
            None => std::future::pending().await,
            Some(mut rx) => {
                if rx.wait_for(|running| *running).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_events.subscribe()
    }
}

impl PeerDirectory for ClusterCore {
    fn send(&self, to: &AgentId, from: AgentId, message: PeerMessage) {
        let mailbox = self.state.lock().agents.get(to).cloned();
        if let Some(mailbox) = mailbox {
            mailbox.deliver_peer(from, message);
        }
    }
}
