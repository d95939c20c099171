// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Request normalization: deciding whether a new client lock request
//! duplicates, extends, upgrades, or conflicts with an existing one.

use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use lockmesh_types::base_types::{NodeId, ObjectPath};
use lockmesh_types::error::{AgentError, AgentResult};
use lockmesh_types::fp_bail;
use lockmesh_types::fp_ensure;
use lockmesh_types::lock::Mode;
use lockmesh_types::messages::{LockSpec, Request};

use crate::state::{bag_remove, AgentState, Answer};

#[cfg(test)]
#[path = "unit_tests/requests_tests.rs"]
mod requests_tests;

impl AgentState {
    /// Normalizes and issues one client lock request.
    pub(crate) async fn submit_lock(&mut self, spec: LockSpec) -> AgentResult<()> {
        let LockSpec {
            object,
            mode,
            nodes,
            require,
        } = spec;
        fp_ensure!(!object.is_empty(), AgentError::IllegalLockPattern);
        let nodes: BTreeSet<NodeId> = if nodes.is_empty() {
            // A bare lock targets the node the agent runs next to.
            [self.options.home_node.clone()].into()
        } else {
            nodes.into_iter().collect()
        };
        self.answer = Answer::Locking;

        let Some(previous) = self.first_request_for(&object).cloned() else {
            trace!(%object, ?mode, "new lock request");
            let request = Request {
                object: object.clone(),
                mode,
                nodes: nodes.clone(),
                require,
                claim_no: self.claim_no,
            };
            self.push_pending(request);
            for node in &nodes {
                self.issue_lock_request(&object, node, mode).await;
            }
            return Ok(());
        };

        if previous.mode == mode && previous.require == require {
            if previous.nodes.is_superset(&nodes) {
                trace!(%object, "duplicate lock request, already covered");
                return Ok(());
            }
            // Extend: grow the request to the union, asking only for the
            // nodes it did not already cover.
            let extras: Vec<NodeId> = nodes.difference(&previous.nodes).cloned().collect();
            debug!(%object, ?extras, "extending lock request");
            let mut extended = previous.clone();
            extended.nodes.extend(nodes);
            self.remove_request(&previous);
            self.push_pending(extended);
            for node in &extras {
                self.issue_lock_request(&object, node, mode).await;
            }
            return Ok(());
        }

        if previous.mode == Mode::Write
            && mode == Mode::Read
            && previous.require == require
            && previous.nodes == nodes
        {
            trace!(%object, "write lock already covers read request");
            return Ok(());
        }

        if previous.mode == Mode::Read
            && mode == Mode::Write
            && previous.require == require
            && previous.nodes == nodes
        {
            // Upgrade: purge the object's snapshots on every node to force a
            // full re-acquire, then treat the write as a brand-new request.
            debug!(%object, "upgrading read request to write");
            for id in self.lock_ids_for_object(&object) {
                self.purge_lock(&id);
            }
            self.remove_request(&previous);
            let request = Request {
                object: object.clone(),
                mode,
                nodes: nodes.clone(),
                require,
                claim_no: self.claim_no,
            };
            self.push_pending(request);
            for node in &nodes {
                self.issue_lock_request(&object, node, mode).await;
            }
            return Ok(());
        }

        warn!(%object, "conflicting lock request");
        fp_bail!(AgentError::ConflictingRequest {
            object,
            new_nodes: nodes.into_iter().collect(),
            old_nodes: previous.nodes.iter().cloned().collect(),
        })
    }

    /// Asks `node`'s lock server for `object`, making sure the server's
    /// liveness is monitored first. A node without a running server is
    /// routed through the failure path.
    pub(crate) async fn issue_lock_request(
        &mut self,
        object: &ObjectPath,
        node: &NodeId,
        mode: Mode,
    ) {
        self.ensure_monitored(node);
        match self.source.client(node) {
            Some(client) => {
                trace!(%object, %node, ?mode, "issuing lock request");
                self.metrics.lock_requests_sent.inc();
                client
                    .request_lock(object.clone(), node.clone(), self.id, mode)
                    .await;
            }
            None => {
                warn!(%node, "no lock server running, treating node as down");
                self.queue_server_down(node.clone());
            }
        }
    }

    fn remove_request(&mut self, request: &Request) {
        if !bag_remove(&mut self.pending_requests, request) {
            bag_remove(&mut self.active_requests, request);
        }
    }
}
