// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Seams to the agent's external collaborators: per-node lock servers, the
//! node liveness subscription, and sibling agents.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use lockmesh_types::base_types::{AgentId, NodeId, ObjectPath};
use lockmesh_types::lock::Mode;
use lockmesh_types::messages::{NodeEvent, PeerMessage};

/// Client to the lock server on one node.
///
/// Sends are fire and forget and never block the agent; results arrive
/// asynchronously as `LockStateUpdate`s on the agent's queue. A dead server
/// is detected through its liveness monitor, not through send failures.
#[async_trait]
pub trait LockServerClient: Send + Sync + 'static {
    /// Enqueue this agent for `object` on `node`. The server answers with a
    /// state update once the queue changes.
    async fn request_lock(&self, object: ObjectPath, node: NodeId, agent: AgentId, mode: Mode);

    /// Give up a held position in the queue for `object` on `node`. The
    /// server confirms with a state update whose note names the agent.
    async fn surrender(&self, object: ObjectPath, node: NodeId, agent: AgentId);
}

/// Directory of per-node lock servers and their liveness.
#[async_trait]
pub trait LockServerSource: Send + Sync + 'static {
    /// The client for `node`'s lock server, if one is currently running.
    fn client(&self, node: &NodeId) -> Option<Arc<dyn LockServerClient>>;

    /// Completes when the lock server on `node` dies. Completes immediately
    /// if none is running.
    async fn server_down(&self, node: NodeId);

    /// Completes when a lock server is next observed running on `node`.
    async fn server_running(&self, node: NodeId);

    /// Cluster membership events, the `monitor_nodes` subscription.
    fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent>;
}

/// Fan-out channel to sibling agents.
pub trait PeerDirectory: Send + Sync + 'static {
    /// Delivers `message` to `to` if that agent is reachable. Fire and
    /// forget; the recipient receives a copy.
    fn send(&self, to: &AgentId, from: AgentId, message: PeerMessage);
}
