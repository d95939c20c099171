// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::base_types::{AgentId, NodeId, ObjectPath};
use crate::lock::{Lock, LockId, Mode};

/// Per-request quorum policy: how many of the requested nodes must grant the
/// lock before the request counts as satisfied.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub enum Require {
    All,
    Any,
    Majority,
    MajorityAlive,
}

/// The shape of a lock request as supplied by the client.
///
/// An empty `nodes` list targets the agent's home node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct LockSpec {
    pub object: ObjectPath,
    pub mode: Mode,
    pub nodes: Vec<NodeId>,
    pub require: Require,
}

impl LockSpec {
    pub fn new(object: ObjectPath, mode: Mode, nodes: Vec<NodeId>, require: Require) -> Self {
        Self {
            object,
            mode,
            nodes,
            require,
        }
    }

    /// Exclusive lock on `nodes`, `Require::All`.
    pub fn write(object: ObjectPath, nodes: Vec<NodeId>) -> Self {
        Self::new(object, Mode::Write, nodes, Require::All)
    }

    /// Shared lock on `nodes`, `Require::All`.
    pub fn read(object: ObjectPath, nodes: Vec<NodeId>) -> Self {
        Self::new(object, Mode::Read, nodes, Require::All)
    }

    pub fn with_require(mut self, require: Require) -> Self {
        self.require = require;
        self
    }
}

/// A client lock request as tracked by the agent.
///
/// `claim_no` records the agent's claim counter at the moment the request
/// was first issued; a request whose `claim_no` is below the current counter
/// was part of an already-promised lock set.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Request {
    pub object: ObjectPath,
    pub mode: Mode,
    pub nodes: BTreeSet<NodeId>,
    pub require: Require,
    pub claim_no: u64,
}

/// Note attached by a lock server to a state update.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum UpdateNote {
    /// The named agent voluntarily gave up its held position in this queue.
    Surrender(AgentId),
}

/// Emitted by a lock server whenever the queue for a lock it owns changes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct LockStateUpdate {
    pub lock: Lock,
    pub node: NodeId,
    pub note: Option<UpdateNote>,
}

/// Agent-to-agent messages.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum PeerMessage {
    /// Informational notice that the sender voluntarily gave up a lock.
    Surrendered { agent: AgentId, lock: LockId },
    /// A lock snapshot relayed as if originating from a lock server. Used to
    /// propagate awareness in sparse-contention cases.
    LockState(LockStateUpdate),
}

/// Cluster membership events. Node presence does not imply a functioning
/// lock server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum NodeEvent {
    Up(NodeId),
    Down(NodeId),
}

/// A detected deadlock, for reporting: the victim and the lock it gave up.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct DeadlockRecord {
    pub agent: AgentId,
    pub lock: LockId,
}

/// Answer to `await_all_locks`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum AllLocksStatus {
    /// No locks were ever requested.
    NoLocks,
    /// At least one request is not yet satisfied.
    Waiting,
    /// Every request is satisfied; deadlocks resolved along the way.
    HaveAll(Vec<DeadlockRecord>),
    /// These objects can no longer reach their quorum.
    CannotServe(Vec<ObjectPath>),
}

/// Notification payloads delivered to event subscribers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum AgentEvent {
    LockState(Lock),
    HaveAllLocks(Vec<DeadlockRecord>),
}

/// Introspection snapshot of the agent's request and lock tables.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct LockInfo {
    pub pending: Vec<Request>,
    pub locks: Vec<Lock>,
    pub claim_no: u64,
    pub have_all: bool,
}

/// Runtime flags togglable via `change_flag`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum AgentFlag {
    AbortOnDeadlock,
    AwaitNodes,
    Notify,
}

/// Agent construction options.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct AgentOptions {
    /// The node this agent runs next to. Lock requests with no explicit node
    /// list target this node; a lock server must be running here at agent
    /// creation.
    pub home_node: NodeId,
    /// Abort instead of surrendering when deadlock resolution selects this
    /// agent as the victim and the contested lock was already promised.
    #[serde(default)]
    pub abort_on_deadlock: bool,
    /// Ride out lock-server failures and re-acquire when the server returns,
    /// instead of aborting when a quorum becomes unreachable.
    #[serde(default)]
    pub await_nodes: bool,
    /// Deliver lock-state updates and have-all notifications to event
    /// subscribers.
    #[serde(default)]
    pub notify: bool,
}

impl AgentOptions {
    pub fn new(home_node: impl Into<NodeId>) -> Self {
        Self {
            home_node: home_node.into(),
            abort_on_deadlock: false,
            await_nodes: false,
            notify: false,
        }
    }
}
