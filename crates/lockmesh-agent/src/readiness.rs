// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Readiness evaluation: which requests are satisfied under their quorum
//! policy, and whether the transaction can still conceivably succeed.

use tracing::{debug, warn};

use lockmesh_types::error::{AgentError, AgentResult};
use lockmesh_types::fp_bail;
use lockmesh_types::messages::{AgentEvent, AllLocksStatus, Request, Require};

use crate::agent::Notifier;
use crate::state::{bag_remove, AgentState, Answer};

impl AgentState {
    /// Re-sorts every request between pending and active, checks that
    /// pending requests can still be served, and drives the have-all latch.
    pub(crate) fn sweep_readiness(&mut self) -> AgentResult<()> {
        let newly_active: Vec<Request> = self
            .pending_iter()
            .filter(|request| self.request_satisfied(request))
            .cloned()
            .collect();
        let newly_pending: Vec<Request> = self
            .active_iter()
            .filter(|request| !self.request_satisfied(request))
            .cloned()
            .collect();
        for request in newly_active {
            bag_remove(&mut self.pending_requests, &request);
            self.push_active(request);
        }
        for request in newly_pending {
            bag_remove(&mut self.active_requests, &request);
            self.push_pending(request);
        }

        if !self.options.await_nodes {
            let stuck: Vec<Request> = self
                .pending_iter()
                .filter(|request| !self.request_servable(request))
                .cloned()
                .collect();
            if !stuck.is_empty() {
                warn!(?stuck, "quorum unreachable, aborting");
                fp_bail!(AgentError::CannotLockObjects(stuck));
            }
        }

        let now_have_all = self.pending_requests.is_empty() && !self.active_requests.is_empty();
        if now_have_all && !self.have_all {
            self.have_all = true;
            self.claim_no += 1;
            self.answer = Answer::Done;
            self.metrics.have_all_transitions.inc();
            debug!(claim_no = self.claim_no, "acquired all requested locks");
            self.flush_have_all();
        } else if !now_have_all && self.have_all {
            self.have_all = false;
            self.answer = Answer::Waiting;
            debug!("lock set no longer complete");
        }
        Ok(())
    }

    /// Whether the request's quorum policy is met by the nodes we currently
    /// hold covering locks on.
    pub(crate) fn request_satisfied(&self, request: &Request) -> bool {
        let held = self.nodes_held(&request.object, request.mode, &request.nodes);
        match request.require {
            Require::All => held.len() == request.nodes.len(),
            Require::Any => !held.is_empty(),
            Require::Majority => held.len() * 2 > request.nodes.len(),
            Require::MajorityAlive => {
                let alive = request.nodes.difference(&self.down).count();
                held.len() * 2 > alive
            }
        }
    }

    /// Whether the quorum could still be reached over the nodes that remain
    /// up. With `await_nodes` set, every request is servable: downed nodes
    /// are waited out.
    pub(crate) fn request_servable(&self, request: &Request) -> bool {
        if self.options.await_nodes {
            return true;
        }
        let alive = request.nodes.difference(&self.down).count();
        match request.require {
            Require::All => alive == request.nodes.len(),
            Require::Any => alive > 0,
            Require::Majority => alive * 2 > request.nodes.len(),
            Require::MajorityAlive => alive > 0,
        }
    }

    /// Status summary returned to the client on `await_all_locks`.
    pub(crate) fn all_locks_status(&self) -> AllLocksStatus {
        if !self.has_requests() {
            return AllLocksStatus::NoLocks;
        }
        let unservable: Vec<_> = self
            .pending_iter()
            .filter(|request| !self.request_servable(request))
            .map(|request| request.object.clone())
            .collect();
        if !unservable.is_empty() {
            return AllLocksStatus::CannotServe(unservable);
        }
        if self.pending_requests.is_empty() {
            AllLocksStatus::HaveAll(self.deadlocks.clone())
        } else {
            AllLocksStatus::Waiting
        }
    }

    /// Answers every parked `await_all` caller and tells event subscribers
    /// the lock set is complete.
    fn flush_have_all(&mut self) {
        let status = AllLocksStatus::HaveAll(self.deadlocks.clone());
        for notifier in std::mem::take(&mut self.notify) {
            match notifier {
                Notifier::AwaitAll(reply) => {
                    let _ = reply.send(Ok(status.clone()));
                }
                events @ Notifier::Events(_) => self.notify.push(events),
            }
        }
        self.notify_event(AgentEvent::HaveAllLocks(self.deadlocks.clone()));
    }

    /// Fans one event out to the persistent subscribers, dropping any whose
    /// receiver has gone away.
    pub(crate) fn notify_event(&mut self, event: AgentEvent) {
        self.notify.retain(|notifier| match notifier {
            Notifier::Events(sender) => sender.send(event.clone()).is_ok(),
            Notifier::AwaitAll(_) => true,
        });
    }
}
