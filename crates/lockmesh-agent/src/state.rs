// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

use lockmesh_types::base_types::{AgentId, NodeId, ObjectPath};
use lockmesh_types::lock::{Lock, LockId, Mode};
use lockmesh_types::messages::{AgentOptions, DeadlockRecord, Request};

use crate::agent::{AgentMessage, Notifier};
use crate::lock_server::{LockServerSource, PeerDirectory};
use crate::metrics::AgentMetrics;

/// Where the agent stands with respect to its client.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Answer {
    Locking,
    Waiting,
    Done,
}

/// The agent's entire mutable state. Owned exclusively by the event-loop
/// task; nothing here is shared or locked.
pub(crate) struct AgentState {
    pub id: AgentId,
    pub options: AgentOptions,

    /// Lock snapshots by identity, ordered for deterministic iteration.
    pub locks: BTreeMap<LockId, Lock>,
    /// Projection of head-group agents over `locks`. Ordered by agent so a
    /// successor lookup answers "does A hold anything?" in O(log n).
    pub agents_holding: BTreeSet<(AgentId, LockId)>,
    /// Requests not yet satisfied, bagged by object.
    pub pending_requests: BTreeMap<ObjectPath, Vec<Request>>,
    /// Requests currently satisfied, bagged by object.
    pub active_requests: BTreeMap<ObjectPath, Vec<Request>>,
    /// Locks whose queue holds both a holder and at least one waiter.
    pub interesting: BTreeSet<LockId>,
    /// Locks we surrendered and whose confirmation is still outstanding.
    pub sync: BTreeSet<LockId>,
    /// Nodes considered unavailable.
    pub down: BTreeSet<NodeId>,
    /// Liveness watcher per node, in either direction: a death monitor while
    /// the server runs, a return watcher while it is down.
    pub monitored: HashMap<NodeId, AbortHandle>,
    /// Resolved deadlocks, for reporting.
    pub deadlocks: Vec<DeadlockRecord>,
    /// Parked `await_all` repliers and persistent event subscribers.
    pub notify: Vec<Notifier>,

    /// Incremented each time the held set first becomes complete.
    pub claim_no: u64,
    pub have_all: bool,
    pub answer: Answer,

    pub source: Arc<dyn LockServerSource>,
    pub peers: Arc<dyn PeerDirectory>,
    /// Weak so that watcher tasks never keep a dead agent's queue open.
    pub tx: mpsc::WeakUnboundedSender<AgentMessage>,
    /// Membership subscription forwarder, aborted on shutdown.
    pub membership_watch: Option<AbortHandle>,
    pub metrics: Arc<AgentMetrics>,
}

impl AgentState {
    pub fn new(
        id: AgentId,
        options: AgentOptions,
        source: Arc<dyn LockServerSource>,
        peers: Arc<dyn PeerDirectory>,
        tx: mpsc::WeakUnboundedSender<AgentMessage>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            id,
            options,
            locks: BTreeMap::new(),
            agents_holding: BTreeSet::new(),
            pending_requests: BTreeMap::new(),
            active_requests: BTreeMap::new(),
            interesting: BTreeSet::new(),
            sync: BTreeSet::new(),
            down: BTreeSet::new(),
            monitored: HashMap::new(),
            deadlocks: Vec::new(),
            notify: Vec::new(),
            claim_no: 0,
            have_all: false,
            answer: Answer::Locking,
            source,
            peers,
            tx,
            membership_watch: None,
            metrics,
        }
    }

    /// Locks known to be held by `agent`, via a range scan from
    /// `(agent, ⊥)`.
    pub fn locks_held_by<'a>(
        &'a self,
        agent: &AgentId,
    ) -> impl Iterator<Item = &'a LockId> + 'a {
        let agent = *agent;
        self.agents_holding
            .range((Bound::Included((agent, LockId::lowest())), Bound::Unbounded))
            .take_while(move |(holder, _)| *holder == agent)
            .map(|(_, lock)| lock)
    }

    /// True iff `agent` is known to hold at least one lock.
    pub fn holds_any(&self, agent: &AgentId) -> bool {
        self.locks_held_by(agent).next().is_some()
    }

    /// Distinct agents holding any lock we also track, in identifier order.
    pub fn involved_agents(&self) -> BTreeSet<AgentId> {
        self.agents_holding.iter().map(|(agent, _)| *agent).collect()
    }

    /// Applies a fresh snapshot, diffing the holder index against the
    /// previous one and keeping the interesting set current.
    pub fn store_lock(&mut self, lock: Lock) {
        let id = lock.id.clone();
        let before: BTreeSet<AgentId> = self
            .locks
            .get(&id)
            .map(|prev| prev.holders().collect())
            .unwrap_or_default();
        let after: BTreeSet<AgentId> = lock.holders().collect();

        for ceased in before.difference(&after) {
            self.agents_holding.remove(&(*ceased, id.clone()));
        }
        for gained in after.difference(&before) {
            self.agents_holding.insert((*gained, id.clone()));
        }

        if lock.is_contended() {
            self.interesting.insert(id.clone());
        } else {
            self.interesting.remove(&id);
        }
        self.sync.remove(&id);
        self.locks.insert(id, lock);
    }

    /// Removes a lock snapshot and every index entry derived from it.
    pub fn purge_lock(&mut self, id: &LockId) {
        if let Some(lock) = self.locks.remove(id) {
            let holders: Vec<AgentId> = lock.holders().collect();
            for holder in holders {
                self.agents_holding.remove(&(holder, id.clone()));
            }
        }
        self.interesting.remove(id);
        self.sync.remove(id);
    }

    /// Lock identities for `object` across all nodes.
    pub fn lock_ids_for_object(&self, object: &ObjectPath) -> Vec<LockId> {
        self.locks
            .range((
                Bound::Included(LockId::first_for_object(object.clone())),
                Bound::Unbounded,
            ))
            .take_while(|(id, _)| id.object == *object)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Nodes among `nodes` on which this agent holds `object` with a mode
    /// covering `mode`.
    pub fn nodes_held(
        &self,
        object: &ObjectPath,
        mode: Mode,
        nodes: &BTreeSet<NodeId>,
    ) -> BTreeSet<NodeId> {
        nodes
            .iter()
            .filter(|node| {
                let id = LockId::new(object.clone(), (*node).clone());
                self.locks
                    .get(&id)
                    .map_or(false, |lock| lock.holds_with(&self.id, mode))
            })
            .cloned()
            .collect()
    }

    pub fn push_pending(&mut self, request: Request) {
        self.pending_requests
            .entry(request.object.clone())
            .or_default()
            .push(request);
    }

    pub fn push_active(&mut self, request: Request) {
        self.active_requests
            .entry(request.object.clone())
            .or_default()
            .push(request);
    }

    /// First request for `object`, pending checked before active.
    pub fn first_request_for(&self, object: &ObjectPath) -> Option<&Request> {
        self.pending_requests
            .get(object)
            .and_then(|bag| bag.first())
            .or_else(|| self.active_requests.get(object).and_then(|bag| bag.first()))
    }

    pub fn has_requests(&self) -> bool {
        !self.pending_requests.is_empty() || !self.active_requests.is_empty()
    }

    pub fn pending_iter(&self) -> impl Iterator<Item = &Request> {
        self.pending_requests.values().flatten()
    }

    pub fn active_iter(&self) -> impl Iterator<Item = &Request> {
        self.active_requests.values().flatten()
    }

    pub fn note_deadlock(&mut self, record: DeadlockRecord) {
        if !self.deadlocks.contains(&record) {
            trace!(victim = %record.agent, lock = %record.lock, "deadlock recorded");
            self.deadlocks.push(record);
        }
    }

    /// Hands the server-down signal back through the agent's own queue, so
    /// the current handler finishes before the failure is processed.
    pub fn queue_server_down(&self, node: NodeId) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(AgentMessage::ServerDown(node));
        }
    }

    pub fn refresh_gauges(&self) {
        self.metrics
            .pending_requests
            .set(self.pending_iter().count() as i64);
        self.metrics
            .active_requests
            .set(self.active_iter().count() as i64);
        self.metrics.known_locks.set(self.locks.len() as i64);
        self.metrics
            .interesting_locks
            .set(self.interesting.len() as i64);
    }

    pub fn shutdown(&mut self) {
        for (_, watcher) in self.monitored.drain() {
            watcher.abort();
        }
        if let Some(watch) = self.membership_watch.take() {
            watch.abort();
        }
        self.notify.clear();
    }

    /// Verifies the reachable-state invariants. Test builds only.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        use std::collections::HashSet;

        // agents_holding is exactly the head-group projection of locks.
        let projected: BTreeSet<(AgentId, LockId)> = self
            .locks
            .values()
            .flat_map(|lock| lock.holders().map(move |agent| (agent, lock.id.clone())))
            .collect();
        assert_eq!(
            self.agents_holding, projected,
            "holder index diverged from lock snapshots"
        );

        // interesting is exactly the contended subset.
        let contended: BTreeSet<LockId> = self
            .locks
            .values()
            .filter(|lock| lock.is_contended())
            .map(|lock| lock.id.clone())
            .collect();
        assert_eq!(
            self.interesting, contended,
            "interesting set diverged from queue lengths"
        );

        // Each object's request lives in exactly one of the two bags.
        let pending: HashSet<&ObjectPath> = self.pending_requests.keys().collect();
        let active: HashSet<&ObjectPath> = self.active_requests.keys().collect();
        let both: Vec<_> = pending.intersection(&active).collect();
        assert!(both.is_empty(), "requests in both bags: {both:?}");
    }
}

/// Removes one request matching `request` exactly from its bag. Returns
/// whether anything was removed.
pub(crate) fn bag_remove(
    bag: &mut BTreeMap<ObjectPath, Vec<Request>>,
    request: &Request,
) -> bool {
    if let Some(requests) = bag.get_mut(&request.object) {
        if let Some(position) = requests.iter().position(|r| r == request) {
            requests.remove(position);
            if requests.is_empty() {
                bag.remove(&request.object);
            }
            return true;
        }
    }
    false
}
