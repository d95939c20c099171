// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Lock-state ingestion: applying snapshots received from lock servers (or
//! relayed by peers) to the agent's tables.

use tracing::{instrument, trace};

use lockmesh_types::error::AgentResult;
use lockmesh_types::lock::LockId;
use lockmesh_types::messages::{AgentEvent, DeadlockRecord, LockStateUpdate, UpdateNote};

use crate::state::AgentState;

#[cfg(test)]
#[path = "unit_tests/ingest_tests.rs"]
mod ingest_tests;

impl AgentState {
    /// Applies one lock snapshot. Out-of-date snapshots and snapshots for
    /// locks with an outstanding surrender are dropped; surrender notes are
    /// processed regardless.
    #[instrument(level = "trace", skip_all, fields(agent = %self.id))]
    pub(crate) async fn ingest_update(&mut self, update: LockStateUpdate) -> AgentResult<()> {
        self.metrics.lock_updates_received.inc();
        let LockStateUpdate { mut lock, node, note } = update;
        // Qualify the snapshot with its origin; the server only knows the
        // object name.
        let id = LockId::new(lock.id.object.clone(), node);
        lock.id = id.clone();

        // Notes apply even to snapshots the freshness check would drop.
        match note {
            Some(UpdateNote::Surrender(agent)) if agent == self.id => {
                trace!(lock = %id, "surrender confirmed");
                self.sync.remove(&id);
            }
            Some(UpdateNote::Surrender(agent)) => {
                self.note_deadlock(DeadlockRecord {
                    agent,
                    lock: id.clone(),
                });
            }
            None => {}
        }

        if let Some(previous) = self.locks.get(&id) {
            if previous.version >= lock.version {
                trace!(lock = %id, version = %lock.version, "outdated snapshot dropped");
                self.metrics.lock_updates_outdated.inc();
                return Ok(());
            }
        }
        if self.sync.contains(&id) {
            trace!(lock = %id, "snapshot dropped, surrender confirmation outstanding");
            return Ok(());
        }

        self.store_lock(lock.clone());
        self.sweep_readiness()?;
        if !self.have_all {
            self.analyze_deadlocks().await?;
        }
        self.notify_event(AgentEvent::LockState(lock));
        Ok(())
    }
}
