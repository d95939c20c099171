// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::base_types::{AgentId, NodeId, ObjectPath};
use crate::lock::LockId;
use crate::messages::Request;

#[macro_export]
macro_rules! fp_bail {
    ($e:expr) => {
        return Err($e)
    };
}

#[macro_export(local_inner_macros)]
macro_rules! fp_ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            fp_bail!($e);
        }
    };
}

pub type AgentResult<T = ()> = Result<T, AgentError>;

/// Abort causes surfaced to the client. Any raised error ends the
/// transaction; the agent task terminates with the error.
#[derive(Eq, PartialEq, Clone, Serialize, Deserialize, Error, Debug)]
pub enum AgentError {
    #[error("no lock server is running on node {0}")]
    NotRunning(NodeId),

    #[error(
        "conflicting request for {object}: requested nodes {new_nodes:?}, \
         existing request covers {old_nodes:?}"
    )]
    ConflictingRequest {
        object: ObjectPath,
        new_nodes: Vec<NodeId>,
        old_nodes: Vec<NodeId>,
    },

    #[error("cannot surrender {object} to {other}: lock not held here or {other} not waiting")]
    CannotSurrender { object: ObjectPath, other: AgentId },

    #[error("quorum can no longer be reached for {0:?}")]
    CannotLockObjects(Vec<Request>),

    #[error("aborted by deadlock resolution: {0} was already promised to the client")]
    Deadlock(LockId),

    #[error("malformed lock request")]
    IllegalLockPattern,

    #[error("agent is shutting down")]
    ShuttingDown,
}
