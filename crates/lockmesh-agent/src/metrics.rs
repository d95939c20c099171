// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter,
    IntGauge, Registry,
};

#[derive(Clone)]
pub struct AgentMetrics {
    pub(crate) lock_requests_sent: IntCounter,
    pub(crate) lock_updates_received: IntCounter,
    pub(crate) lock_updates_outdated: IntCounter,
    pub(crate) deadlocks_detected: IntCounter,
    pub(crate) surrenders_initiated: IntCounter,
    pub(crate) have_all_transitions: IntCounter,
    pub(crate) peer_messages_sent: IntCounter,

    pub(crate) pending_requests: IntGauge,
    pub(crate) active_requests: IntGauge,
    pub(crate) known_locks: IntGauge,
    pub(crate) interesting_locks: IntGauge,
}

impl AgentMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            lock_requests_sent: register_int_counter_with_registry!(
                "agent_lock_requests_sent",
                "Total number of lock requests issued to lock servers",
                registry,
            )
            .unwrap(),
            lock_updates_received: register_int_counter_with_registry!(
                "agent_lock_updates_received",
                "Total number of lock state updates ingested",
                registry,
            )
            .unwrap(),
            lock_updates_outdated: register_int_counter_with_registry!(
                "agent_lock_updates_outdated",
                "Total number of lock state updates dropped as outdated",
                registry,
            )
            .unwrap(),
            deadlocks_detected: register_int_counter_with_registry!(
                "agent_deadlocks_detected",
                "Total number of wait-for cycles detected",
                registry,
            )
            .unwrap(),
            surrenders_initiated: register_int_counter_with_registry!(
                "agent_surrenders_initiated",
                "Total number of voluntary lock surrenders initiated",
                registry,
            )
            .unwrap(),
            have_all_transitions: register_int_counter_with_registry!(
                "agent_have_all_transitions",
                "Total number of times the agent acquired its full lock set",
                registry,
            )
            .unwrap(),
            peer_messages_sent: register_int_counter_with_registry!(
                "agent_peer_messages_sent",
                "Total number of messages sent to sibling agents",
                registry,
            )
            .unwrap(),
            pending_requests: register_int_gauge_with_registry!(
                "agent_pending_requests",
                "Current number of unsatisfied lock requests",
                registry,
            )
            .unwrap(),
            active_requests: register_int_gauge_with_registry!(
                "agent_active_requests",
                "Current number of satisfied lock requests",
                registry,
            )
            .unwrap(),
            known_locks: register_int_gauge_with_registry!(
                "agent_known_locks",
                "Current number of lock snapshots held",
                registry,
            )
            .unwrap(),
            interesting_locks: register_int_gauge_with_registry!(
                "agent_interesting_locks",
                "Current number of contended locks",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_tests() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
