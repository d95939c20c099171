// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deadlock analysis: building the wait-for graph from the contended locks,
//! finding cycles, and resolving them by deterministic victim selection.

use std::collections::BTreeSet;

use petgraph::{algo::tarjan_scc, graphmap::DiGraphMap};
use tracing::{debug, info, warn};

use lockmesh_types::base_types::{AgentId, ObjectPath};
use lockmesh_types::error::{AgentError, AgentResult};
use lockmesh_types::fp_bail;
use lockmesh_types::lock::LockId;
use lockmesh_types::messages::{DeadlockRecord, LockStateUpdate, PeerMessage};

use crate::state::AgentState;

#[cfg(test)]
#[path = "unit_tests/deadlock_tests.rs"]
mod deadlock_tests;

/// A vertex of the wait-for graph: an agent together with a lock it holds.
type WaitNode = (AgentId, LockId);

impl AgentState {
    /// Rebuilds the wait-for graph and resolves the first cycle found, if
    /// any. Invoked whenever state changes while the lock set is incomplete.
    ///
    /// Vertices are holder pairs `(agent, lock-held)`. For every contended
    /// lock, each head holder gets an edge to every holder vertex of each
    /// distinct agent waiting in the tail: the waiter is stuck behind the
    /// holder, and can in turn be blocking others only through locks it
    /// holds itself. A waiter holding nothing cannot extend a cycle and
    /// contributes no vertex. The graph is small, bounded by the contended
    /// set times average queue depth, and is recomputed on demand rather
    /// than modeled with owning references.
    pub(crate) async fn analyze_deadlocks(&mut self) -> AgentResult<()> {
        let mut vertices: BTreeSet<WaitNode> = BTreeSet::new();
        let mut edges: Vec<(WaitNode, WaitNode)> = Vec::new();
        for id in &self.interesting {
            let lock = self
                .locks
                .get(id)
                .expect("interesting lock must have a stored snapshot");
            let waiters: BTreeSet<AgentId> = lock.waiters().collect();
            for holder in lock.holders() {
                let from = (holder, id.clone());
                vertices.insert(from.clone());
                for waiter in waiters.iter().filter(|waiter| **waiter != holder) {
                    for held in self.locks_held_by(waiter) {
                        let to = (*waiter, held.clone());
                        vertices.insert(to.clone());
                        edges.push((from.clone(), to));
                    }
                }
            }
        }

        // DiGraphMap wants Copy node weights; intern the pairs as indices
        // into the ordered vertex list.
        let vertices: Vec<WaitNode> = vertices.into_iter().collect();
        let index_of = |node: &WaitNode| {
            vertices
                .binary_search(node)
                .expect("edge endpoints were interned")
        };
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        for index in 0..vertices.len() {
            graph.add_node(index);
        }
        for (from, to) in &edges {
            graph.add_edge(index_of(from), index_of(to), ());
        }

        let Some(cycle) = tarjan_scc(&graph)
            .into_iter()
            .find(|component| component.len() > 1)
        else {
            self.send_indirect_updates();
            return Ok(());
        };

        // Every agent observing this cycle computes the same maximum, so
        // exactly one of them volunteers.
        let (victim, victim_lock) = cycle
            .iter()
            .map(|index| vertices[*index].clone())
            .max()
            .expect("nontrivial component");
        self.metrics.deadlocks_detected.inc();
        if victim == self.id {
            info!(lock = %victim_lock, "deadlock detected, we are the victim");
            self.resolve_as_victim(victim_lock).await
        } else {
            debug!(victim = %victim, lock = %victim_lock, "deadlock detected, waiting on victim");
            self.note_deadlock(DeadlockRecord {
                agent: victim,
                lock: victim_lock,
            });
            Ok(())
        }
    }

    /// Either aborts the transaction or surrenders the contested lock,
    /// depending on whether the lock was already promised to the client.
    async fn resolve_as_victim(&mut self, lock: LockId) -> AgentResult<()> {
        if self.options.abort_on_deadlock && self.object_claimed(&lock.object) {
            warn!(lock = %lock, "victim of a deadlock on a promised lock, aborting");
            fp_bail!(AgentError::Deadlock(lock));
        }
        self.surrender_lock(lock).await
    }

    /// A lock counts as promised once some active request for its object
    /// predates the latest have-all transition.
    fn object_claimed(&self, object: &ObjectPath) -> bool {
        self.active_requests
            .get(object)
            .map_or(false, |requests| {
                requests.iter().any(|request| request.claim_no < self.claim_no)
            })
    }

    /// The surrender protocol: drop the lock locally, remember that a
    /// confirmation is owed, tell the lock server, and tell the involved
    /// peers that are not in the lock's queue (those will hear it from the
    /// server).
    pub(crate) async fn surrender_lock(&mut self, id: LockId) -> AgentResult<()> {
        debug!(lock = %id, "surrendering");
        let queue_agents: BTreeSet<AgentId> = self
            .locks
            .get(&id)
            .map(|lock| lock.queue.iter().flat_map(|element| element.agents()).collect())
            .unwrap_or_default();
        let involved = self.involved_agents();

        self.purge_lock(&id);
        self.sync.insert(id.clone());
        self.metrics.surrenders_initiated.inc();
        match self.source.client(&id.node) {
            Some(client) => {
                client
                    .surrender(id.object.clone(), id.node.clone(), self.id)
                    .await;
            }
            None => warn!(node = %id.node, "no lock server to surrender to"),
        }
        for agent in involved {
            if agent != self.id && !queue_agents.contains(&agent) {
                self.metrics.peer_messages_sent.inc();
                self.peers.send(
                    &agent,
                    self.id,
                    PeerMessage::Surrendered {
                        agent: self.id,
                        lock: id.clone(),
                    },
                );
            }
        }

        // The request backing the surrendered lock is no longer satisfied.
        self.sweep_readiness()
    }

    /// No cycle was found: push our view of the contended locks to involved
    /// agents above us in the identifier order, pruning to locks they might
    /// care about. The asymmetry keeps the mesh from echoing snapshots back
    /// and forth.
    fn send_indirect_updates(&self) {
        for agent in self.involved_agents() {
            if agent <= self.id {
                continue;
            }
            for id in &self.interesting {
                let lock = self
                    .locks
                    .get(id)
                    .expect("interesting lock must have a stored snapshot");
                // They hear about queues they are in from the server, and
                // cannot be deadlocked unless they hold something.
                if lock.in_queue(&agent) || !self.holds_any(&agent) {
                    continue;
                }
                self.metrics.peer_messages_sent.inc();
                self.peers.send(
                    &agent,
                    self.id,
                    PeerMessage::LockState(LockStateUpdate {
                        lock: lock.clone(),
                        node: id.node.clone(),
                        note: None,
                    }),
                );
            }
        }
    }
}
