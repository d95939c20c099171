// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a transaction agent.
///
/// Minted once at agent creation and never reused. Agent identifiers carry a
/// total order; deadlock victim selection is a pure function of that order,
/// which is what lets every peer that observes the same wait-for cycle pick
/// the same victim without further coordination.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AgentId([u8; AgentId::LENGTH]);

impl AgentId {
    pub const LENGTH: usize = 16;

    pub const fn new(bytes: [u8; Self::LENGTH]) -> Self {
        Self(bytes)
    }

    /// Mints a fresh identifier.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn into_bytes(self) -> [u8; Self::LENGTH] {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", hex::encode(self.0))
    }
}

/// Identifier of a cluster node. Nodes host at most one lock server each.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Orders before every real node identifier. Range-scan anchor.
    pub fn lowest() -> Self {
        Self(String::new())
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hierarchical object name, e.g. `["db", "table", "row7"]`.
///
/// The empty path is representable but rejected at the request boundary;
/// it also serves as the low endpoint for ordered range scans.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug,
)]
pub struct ObjectPath(Vec<String>);

impl ObjectPath {
    pub fn new(components: Vec<String>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ObjectPath {
    /// Parses a `/`-separated path. `ObjectPath::from("a/b")` is
    /// `["a", "b"]`.
    fn from(path: &str) -> Self {
        Self(path.split('/').map(str::to_owned).collect())
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Version of a lock snapshot, monotonic per `(object, node)`.
///
/// There is no ordering guarantee between events originating from different
/// lock servers; this version is the only out-of-order defense. A snapshot
/// whose version is not strictly newer than the stored one is dropped.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Debug,
)]
pub struct LockVersion(u64);

impl LockVersion {
    pub const MIN: Self = Self(0);

    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_order_is_total_and_stable() {
        let low = AgentId::new([1; AgentId::LENGTH]);
        let high = AgentId::new([2; AgentId::LENGTH]);
        assert!(low < high);
        assert_eq!(low.max(high), high);
    }

    #[test]
    fn object_path_parses_and_displays() {
        let path = ObjectPath::from("a/b/c");
        assert_eq!(path.components(), &["a", "b", "c"]);
        assert_eq!(path.to_string(), "a/b/c");
    }

    #[test]
    fn lock_version_orders() {
        let v1 = LockVersion::new(1);
        assert!(v1.next() > v1);
        assert!(LockVersion::MIN < v1);
    }
}
