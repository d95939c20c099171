// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Failure handling: lock-server death, node membership changes, and the
//! watchers that notice a lock server coming back.

use tracing::{debug, info, warn};

use lockmesh_types::base_types::NodeId;
use lockmesh_types::error::AgentResult;
use lockmesh_types::lock::LockId;
use lockmesh_types::messages::{NodeEvent, Request};

use crate::agent::AgentMessage;
use crate::state::{bag_remove, AgentState};

impl AgentState {
    /// Spawns a death monitor for `node`'s lock server, unless the node is
    /// already being watched in either direction.
    pub(crate) fn ensure_monitored(&mut self, node: &NodeId) {
        if self.monitored.contains_key(node) {
            return;
        }
        let source = self.source.clone();
        let tx = self.tx.clone();
        let target = node.clone();
        let watcher = tokio::spawn(async move {
            source.server_down(target.clone()).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(AgentMessage::ServerDown(target));
            }
        });
        self.monitored.insert(node.clone(), watcher.abort_handle());
    }

    /// Spawns a watcher that reports `locks_running` when a lock server is
    /// next observed on `node`.
    pub(crate) fn watch_return(&mut self, node: &NodeId) {
        if self.monitored.contains_key(node) {
            return;
        }
        debug!(%node, "awaiting lock server return");
        let source = self.source.clone();
        let tx = self.tx.clone();
        let target = node.clone();
        let watcher = tokio::spawn(async move {
            source.server_running(target.clone()).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(AgentMessage::LocksRunning(target));
            }
        });
        self.monitored.insert(node.clone(), watcher.abort_handle());
    }

    /// The lock server on `node` died (or was never there). Forget its
    /// snapshots, park the affected requests, and either check whether the
    /// transaction can still succeed or wait for the server to return.
    pub(crate) async fn handle_server_down(&mut self, node: NodeId) -> AgentResult<()> {
        if self.down.contains(&node) {
            // Duplicate signal; a return watcher may already be armed.
            return Ok(());
        }
        if let Some(watcher) = self.monitored.remove(&node) {
            watcher.abort();
        }
        warn!(%node, "lock server down");
        self.down.insert(node.clone());

        let lost: Vec<LockId> = self
            .locks
            .keys()
            .filter(|id| id.node == node)
            .cloned()
            .collect();
        for id in lost {
            self.purge_lock(&id);
        }

        // Requests listing the node fall back to pending; the readiness
        // sweep promotes back any that are still quorate without it.
        let affected: Vec<Request> = self
            .active_iter()
            .filter(|request| request.nodes.contains(&node))
            .cloned()
            .collect();
        for request in affected {
            bag_remove(&mut self.active_requests, &request);
            self.push_pending(request);
        }

        if self.options.await_nodes {
            self.watch_return(&node);
        }
        self.sweep_readiness()?;
        if !self.have_all {
            self.analyze_deadlocks().await?;
        }
        Ok(())
    }

    /// Membership events. A node coming up does not imply a functioning
    /// lock server, so presence only arms the return watcher.
    pub(crate) async fn handle_node_event(&mut self, event: NodeEvent) -> AgentResult<()> {
        match event {
            NodeEvent::Down(node) => self.handle_server_down(node).await,
            NodeEvent::Up(node) => {
                if self.down.contains(&node) {
                    self.watch_return(&node);
                }
                Ok(())
            }
        }
    }

    /// A lock server is back on `node`: re-issue every pending request that
    /// wants a lock there.
    pub(crate) async fn handle_locks_running(&mut self, node: NodeId) -> AgentResult<()> {
        if !self.down.contains(&node) {
            return Ok(());
        }
        if let Some(watcher) = self.monitored.remove(&node) {
            watcher.abort();
        }
        self.down.remove(&node);
        info!(%node, "lock server running again");
        let reissue: Vec<Request> = self
            .pending_iter()
            .filter(|request| request.nodes.contains(&node))
            .cloned()
            .collect();
        for request in reissue {
            self.issue_lock_request(&request.object, &node, request.mode)
                .await;
        }
        self.sweep_readiness()?;
        if !self.have_all {
            self.analyze_deadlocks().await?;
        }
        Ok(())
    }
}
