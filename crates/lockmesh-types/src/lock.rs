// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::base_types::{AgentId, LockVersion, NodeId, ObjectPath};

/// The unit of locking: a hierarchical object name resident on one node.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub struct LockId {
    pub object: ObjectPath,
    pub node: NodeId,
}

impl LockId {
    pub fn new(object: ObjectPath, node: NodeId) -> Self {
        Self { object, node }
    }

    /// Orders before every real lock identity. Range-scan anchor.
    pub fn lowest() -> Self {
        Self {
            object: ObjectPath::new(vec![]),
            node: NodeId::lowest(),
        }
    }

    /// Orders before every lock identity for `object`, on any node.
    pub fn first_for_object(object: ObjectPath) -> Self {
        Self {
            object,
            node: NodeId::lowest(),
        }
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.object, self.node)
    }
}

/// Lock acquisition mode.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub enum Mode {
    Read,
    Write,
}

impl Mode {
    /// Whether holding `self` satisfies a request for `requested`. A write
    /// holder satisfies a read waiter from the same agent; a read holder
    /// satisfies only reads.
    pub fn covers(&self, requested: Mode) -> bool {
        matches!((self, requested), (Mode::Write, _) | (Mode::Read, Mode::Read))
    }
}

/// An agent-identified participant in a lock queue, stamped with the version
/// at which the lock server admitted it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Entry {
    pub agent: AgentId,
    pub version: LockVersion,
}

/// One element of a lock queue. Reads are granted as a group; a write is
/// exclusive. The head element is the currently granted group.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum QueueElement {
    Read(Vec<Entry>),
    Write(Entry),
}

impl QueueElement {
    pub fn mode(&self) -> Mode {
        match self {
            QueueElement::Read(_) => Mode::Read,
            QueueElement::Write(_) => Mode::Write,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        match self {
            QueueElement::Read(group) => group.as_slice(),
            QueueElement::Write(entry) => std::slice::from_ref(entry),
        }
    }

    pub fn agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.entries().iter().map(|entry| entry.agent)
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.entries().iter().any(|entry| entry.agent == *agent)
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// A versioned snapshot of one lock's queue as arbitrated by its lock
/// server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Lock {
    pub id: LockId,
    pub version: LockVersion,
    pub queue: Vec<QueueElement>,
}

impl Lock {
    /// Agents in the head group, i.e. the current holders.
    pub fn holders(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.queue
            .first()
            .into_iter()
            .flat_map(|element| element.entries())
            .map(|entry| entry.agent)
    }

    /// Agents queued behind the head group.
    pub fn waiters(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.queue
            .iter()
            .skip(1)
            .flat_map(|element| element.entries())
            .map(|entry| entry.agent)
    }

    pub fn in_queue(&self, agent: &AgentId) -> bool {
        self.queue.iter().any(|element| element.contains(agent))
    }

    /// Both a holder and at least one waiter are present.
    pub fn is_contended(&self) -> bool {
        self.queue.len() >= 2
    }

    /// Whether `agent` currently holds this lock in a mode covering `mode`.
    pub fn holds_with(&self, agent: &AgentId, mode: Mode) -> bool {
        self.queue
            .first()
            .map_or(false, |head| head.contains(agent) && head.mode().covers(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> Entry {
        Entry {
            agent: AgentId::new([byte; AgentId::LENGTH]),
            version: LockVersion::new(1),
        }
    }

    fn make_lock(queue: Vec<QueueElement>) -> Lock {
        Lock {
            id: LockId::new(ObjectPath::from("o"), NodeId::from("n1")),
            version: LockVersion::new(1),
            queue,
        }
    }

    #[test]
    fn write_covers_read_but_not_vice_versa() {
        assert!(Mode::Write.covers(Mode::Read));
        assert!(Mode::Write.covers(Mode::Write));
        assert!(Mode::Read.covers(Mode::Read));
        assert!(!Mode::Read.covers(Mode::Write));
    }

    #[test]
    fn holders_and_waiters_split_at_the_head() {
        let lock = make_lock(vec![
            QueueElement::Read(vec![entry(1), entry(2)]),
            QueueElement::Write(entry(3)),
        ]);
        let holders: Vec<_> = lock.holders().collect();
        let waiters: Vec<_> = lock.waiters().collect();
        assert_eq!(holders.len(), 2);
        assert_eq!(waiters, vec![AgentId::new([3; AgentId::LENGTH])]);
        assert!(lock.is_contended());
    }

    #[test]
    fn holds_with_respects_mode_cover() {
        let writer = AgentId::new([1; AgentId::LENGTH]);
        let lock = make_lock(vec![QueueElement::Write(entry(1))]);
        assert!(lock.holds_with(&writer, Mode::Read));
        assert!(lock.holds_with(&writer, Mode::Write));

        let reader = AgentId::new([2; AgentId::LENGTH]);
        let lock = make_lock(vec![QueueElement::Read(vec![entry(2)])]);
        assert!(lock.holds_with(&reader, Mode::Read));
        assert!(!lock.holds_with(&reader, Mode::Write));
    }

    #[test]
    fn waiters_are_not_holders() {
        let waiter = AgentId::new([2; AgentId::LENGTH]);
        let lock = make_lock(vec![
            QueueElement::Write(entry(1)),
            QueueElement::Write(entry(2)),
        ]);
        assert!(lock.in_queue(&waiter));
        assert!(!lock.holds_with(&waiter, Mode::Read));
    }
}
