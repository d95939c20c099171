// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The transaction agent of the lockmesh distributed lock coordination
//! system.
//!
//! A client process that needs one or more named locks, possibly on several
//! nodes under various quorum requirements, delegates the work to one
//! [`agent::AgentHandle`]. The agent talks to per-node lock servers, tracks
//! every lock it has requested, detects distributed deadlocks across a mesh
//! of peer agents, and either resolves them by surrendering a contested lock
//! or aborts the transaction.

pub mod agent;
pub mod lock_server;
pub mod metrics;
pub mod test_utils;

mod deadlock;
mod ingest;
mod monitor;
mod readiness;
mod requests;
mod state;

pub use agent::{Agent, AgentHandle, AgentMailbox};
pub use metrics::AgentMetrics;
