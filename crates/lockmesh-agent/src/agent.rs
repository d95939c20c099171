// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The agent task and its client interface.
//!
//! The agent is a single event-processing task owning all mutable state.
//! Client calls, lock-server snapshots, peer messages, and failure signals
//! are delivered sequentially through one queue; each message is processed
//! to completion before the next is taken. Handlers never block on I/O:
//! outbound sends are non-blocking and replies travel on one-shot channels.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use lockmesh_types::base_types::{AgentId, NodeId, ObjectPath};
use lockmesh_types::error::{AgentError, AgentResult};
use lockmesh_types::fp_bail;
use lockmesh_types::fp_ensure;
use lockmesh_types::lock::LockId;
use lockmesh_types::messages::{
    AgentEvent, AgentFlag, AgentOptions, AllLocksStatus, DeadlockRecord, LockInfo, LockSpec,
    LockStateUpdate, NodeEvent, PeerMessage,
};

use crate::lock_server::{LockServerSource, PeerDirectory};
use crate::metrics::AgentMetrics;
use crate::state::{AgentState, Answer};

#[cfg(test)]
#[path = "unit_tests/agent_tests.rs"]
mod agent_tests;

/// Client-site deadline for synchronous introspective calls.
const SYNC_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands carried over the client interface.
pub(crate) enum AgentCommand {
    Lock {
        spec: LockSpec,
        wait: bool,
        reply: oneshot::Sender<AgentResult<AllLocksStatus>>,
    },
    LockObjects {
        specs: Vec<LockSpec>,
        reply: oneshot::Sender<AgentResult<()>>,
    },
    Surrender {
        object: ObjectPath,
        to: AgentId,
        nodes: Vec<NodeId>,
        reply: oneshot::Sender<AgentResult<()>>,
    },
    AwaitAll {
        reply: oneshot::Sender<AgentResult<AllLocksStatus>>,
    },
    ChangeFlag {
        flag: AgentFlag,
        value: bool,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<AgentEvent>>,
    },
    LockInfo {
        reply: oneshot::Sender<LockInfo>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Everything the agent task can receive.
pub(crate) enum AgentMessage {
    Command(AgentCommand),
    FromServer(LockStateUpdate),
    FromPeer { from: AgentId, message: PeerMessage },
    ServerDown(NodeId),
    Node(NodeEvent),
    LocksRunning(NodeId),
}

/// A pending client notification: a parked `await_all` reply or a
/// persistent event subscription.
pub(crate) enum Notifier {
    AwaitAll(oneshot::Sender<AgentResult<AllLocksStatus>>),
    Events(mpsc::UnboundedSender<AgentEvent>),
}

/// Write access to an agent's queue for its external collaborators: lock
/// server transports and peer routing deliver through this. Holds only a
/// weak sender, so a mailbox never keeps a dead agent's queue open.
#[derive(Clone)]
pub struct AgentMailbox {
    tx: mpsc::WeakUnboundedSender<AgentMessage>,
}

impl AgentMailbox {
    pub fn deliver_update(&self, update: LockStateUpdate) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(AgentMessage::FromServer(update));
        }
    }

    pub fn deliver_peer(&self, from: AgentId, message: PeerMessage) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(AgentMessage::FromPeer { from, message });
        }
    }
}

pub struct Agent;

impl Agent {
    /// Starts a transaction agent. Fails fast if no lock server is running
    /// on the agent's home node. The agent lives until the handle is
    /// stopped or dropped, or until an abort condition raises.
    pub fn spawn(
        options: AgentOptions,
        source: Arc<dyn LockServerSource>,
        peers: Arc<dyn PeerDirectory>,
        metrics: Arc<AgentMetrics>,
    ) -> AgentResult<AgentHandle> {
        fp_ensure!(
            source.client(&options.home_node).is_some(),
            AgentError::NotRunning(options.home_node.clone())
        );
        let id = AgentId::random();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = AgentState::new(
            id,
            options,
            source.clone(),
            peers,
            tx.downgrade(),
            metrics,
        );

        // monitor_nodes subscription: forward membership events into the
        // queue for as long as the agent is alive.
        let mut events = source.subscribe_nodes();
        let weak = tx.downgrade();
        let membership = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(tx) = weak.upgrade() else { break };
                        if tx.send(AgentMessage::Node(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        state.membership_watch = Some(membership.abort_handle());

        let join = tokio::spawn(run_agent(state, rx));
        Ok(AgentHandle { id, tx, join })
    }
}

async fn run_agent(
    mut state: AgentState,
    mut rx: mpsc::UnboundedReceiver<AgentMessage>,
) -> AgentResult<()> {
    info!(agent = %state.id, home = %state.options.home_node, "transaction agent started");
    let result = loop {
        let Some(message) = rx.recv().await else {
            debug!(agent = %state.id, "client gone, ending transaction");
            break Ok(());
        };
        match state.handle_message(message).await {
            Ok(ControlFlow::Continue(())) => state.refresh_gauges(),
            Ok(ControlFlow::Break(())) => {
                info!(agent = %state.id, "transaction ended");
                break Ok(());
            }
            Err(error) => {
                warn!(agent = %state.id, answer = ?state.answer, %error, "transaction aborted");
                state.fail_notifiers(&error);
                break Err(error);
            }
        }
    };
    state.shutdown();
    result
}

impl AgentState {
    pub(crate) async fn handle_message(
        &mut self,
        message: AgentMessage,
    ) -> AgentResult<ControlFlow<()>> {
        match message {
            AgentMessage::Command(command) => return self.handle_command(command).await,
            AgentMessage::FromServer(update) => self.ingest_update(update).await?,
            AgentMessage::FromPeer { from, message } => self.handle_peer(from, message).await?,
            AgentMessage::ServerDown(node) => self.handle_server_down(node).await?,
            AgentMessage::Node(event) => self.handle_node_event(event).await?,
            AgentMessage::LocksRunning(node) => self.handle_locks_running(node).await?,
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn handle_command(&mut self, command: AgentCommand) -> AgentResult<ControlFlow<()>> {
        match command {
            AgentCommand::Lock { spec, wait, reply } => {
                if let Err(error) = self.submit_lock(spec).await {
                    let _ = reply.send(Err(error.clone()));
                    fp_bail!(error);
                }
                if let Err(error) = self.sweep_readiness() {
                    let _ = reply.send(Err(error.clone()));
                    fp_bail!(error);
                }
                match self.all_locks_status() {
                    AllLocksStatus::Waiting if wait => {
                        self.answer = Answer::Waiting;
                        self.notify.push(Notifier::AwaitAll(reply));
                    }
                    status => {
                        let _ = reply.send(Ok(status));
                    }
                }
            }
            AgentCommand::LockObjects { specs, reply } => {
                for spec in specs {
                    if let Err(error) = self.submit_lock(spec).await {
                        let _ = reply.send(Err(error.clone()));
                        fp_bail!(error);
                    }
                }
                if let Err(error) = self.sweep_readiness() {
                    let _ = reply.send(Err(error.clone()));
                    fp_bail!(error);
                }
                let _ = reply.send(Ok(()));
            }
            AgentCommand::Surrender {
                object,
                to,
                nodes,
                reply,
            } => {
                let nodes = if nodes.is_empty() {
                    vec![self.options.home_node.clone()]
                } else {
                    nodes
                };
                let mut ids = Vec::with_capacity(nodes.len());
                for node in nodes {
                    let id = LockId::new(object.clone(), node);
                    let valid = self.locks.get(&id).map_or(false, |lock| {
                        lock.holders().any(|agent| agent == self.id)
                            && lock.waiters().any(|agent| agent == to)
                    });
                    if !valid {
                        let error = AgentError::CannotSurrender { object, other: to };
                        let _ = reply.send(Err(error.clone()));
                        fp_bail!(error);
                    }
                    ids.push(id);
                }
                for id in ids {
                    if let Err(error) = self.surrender_lock(id).await {
                        let _ = reply.send(Err(error.clone()));
                        fp_bail!(error);
                    }
                }
                if !self.have_all {
                    if let Err(error) = self.analyze_deadlocks().await {
                        let _ = reply.send(Err(error.clone()));
                        fp_bail!(error);
                    }
                }
                let _ = reply.send(Ok(()));
            }
            AgentCommand::AwaitAll { reply } => match self.all_locks_status() {
                AllLocksStatus::Waiting => {
                    self.answer = Answer::Waiting;
                    self.notify.push(Notifier::AwaitAll(reply));
                }
                status => {
                    let _ = reply.send(Ok(status));
                }
            },
            AgentCommand::ChangeFlag { flag, value, reply } => {
                debug!(?flag, value, "changing flag");
                match flag {
                    AgentFlag::AbortOnDeadlock => self.options.abort_on_deadlock = value,
                    AgentFlag::AwaitNodes => {
                        self.options.await_nodes = value;
                        if value {
                            // Nodes that died before the flag flipped still
                            // deserve a return watcher.
                            for node in self.down.clone() {
                                self.watch_return(&node);
                            }
                        }
                    }
                    AgentFlag::Notify => {
                        self.options.notify = value;
                        if !value {
                            self.notify
                                .retain(|notifier| matches!(notifier, Notifier::AwaitAll(_)));
                        }
                    }
                }
                let _ = reply.send(());
                self.sweep_readiness()?;
            }
            AgentCommand::Subscribe { reply } => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                self.options.notify = true;
                self.notify.push(Notifier::Events(events_tx));
                let _ = reply.send(events_rx);
            }
            AgentCommand::LockInfo { reply } => {
                let _ = reply.send(LockInfo {
                    pending: self.pending_iter().cloned().collect(),
                    locks: self.locks.values().cloned().collect(),
                    claim_no: self.claim_no,
                    have_all: self.have_all,
                });
            }
            AgentCommand::Stop { reply } => {
                let _ = reply.send(());
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn handle_peer(&mut self, from: AgentId, message: PeerMessage) -> AgentResult<()> {
        match message {
            PeerMessage::Surrendered { agent, lock } => {
                debug!(peer = %from, victim = %agent, lock = %lock, "peer surrendered a lock");
                self.note_deadlock(DeadlockRecord { agent, lock });
                if !self.have_all {
                    self.analyze_deadlocks().await?;
                }
                Ok(())
            }
            PeerMessage::LockState(update) => self.ingest_update(update).await,
        }
    }

    fn fail_notifiers(&mut self, error: &AgentError) {
        for notifier in std::mem::take(&mut self.notify) {
            if let Notifier::AwaitAll(reply) = notifier {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }
}

/// Owning handle to a running agent: the client interface. Dropping the
/// last handle ends the transaction, mirroring client death.
pub struct AgentHandle {
    id: AgentId,
    tx: mpsc::UnboundedSender<AgentMessage>,
    join: JoinHandle<AgentResult<()>>,
}

impl AgentHandle {
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Delivery address for lock servers and peer routing.
    pub fn mailbox(&self) -> AgentMailbox {
        AgentMailbox {
            tx: self.tx.downgrade(),
        }
    }

    /// Requests a lock and blocks until the whole lock set is held (or the
    /// transaction aborts).
    pub async fn lock(&self, spec: LockSpec) -> AgentResult<AllLocksStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::Lock {
            spec,
            wait: true,
            reply,
        })?;
        self.call(rx).await?
    }

    /// Requests a lock and returns immediately with the current status;
    /// progress flows through event notifications if enabled.
    pub async fn lock_nowait(&self, spec: LockSpec) -> AgentResult<AllLocksStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::Lock {
            spec,
            wait: false,
            reply,
        })?;
        self.call(rx).await?
    }

    /// Batch nowait lock over the given specs.
    pub async fn lock_objects(&self, specs: Vec<LockSpec>) -> AgentResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::LockObjects { specs, reply })?;
        self.call(rx).await?
    }

    /// Voluntarily gives up held locks on `object` so that `to` can take
    /// them. Fails unless this agent holds the lock on every listed node
    /// with `to` waiting behind it.
    pub async fn surrender_nowait(
        &self,
        object: ObjectPath,
        to: AgentId,
        nodes: Vec<NodeId>,
    ) -> AgentResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::Surrender {
            object,
            to,
            nodes,
            reply,
        })?;
        self.call(rx).await?
    }

    /// Blocks until every request is satisfied; returns immediately with
    /// `NoLocks` or `CannotServe` when there is nothing to wait for.
    pub async fn await_all_locks(&self) -> AgentResult<AllLocksStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::AwaitAll { reply })?;
        self.call(rx).await?
    }

    pub async fn change_flag(&self, flag: AgentFlag, value: bool) -> AgentResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::ChangeFlag { flag, value, reply })?;
        self.call(rx).await
    }

    /// Registers an event subscription and turns the notify flag on.
    pub async fn subscribe_events(&self) -> AgentResult<mpsc::UnboundedReceiver<AgentEvent>> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::Subscribe { reply })?;
        self.call(rx).await
    }

    /// Snapshot of the pending-request and lock tables.
    pub async fn lock_info(&self) -> AgentResult<LockInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(AgentCommand::LockInfo { reply })?;
        match timeout(SYNC_CALL_TIMEOUT, rx).await {
            Ok(Ok(info)) => Ok(info),
            _ => Err(AgentError::ShuttingDown),
        }
    }

    /// Ends the transaction and waits for the agent task to finish.
    pub async fn stop(self) -> AgentResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.send(AgentCommand::Stop { reply }).is_ok() {
            let _ = timeout(SYNC_CALL_TIMEOUT, rx).await;
        }
        self.join.await.unwrap_or(Err(AgentError::ShuttingDown))
    }

    /// Waits for the agent task to terminate on its own, surfacing the
    /// abort cause if the transaction failed.
    pub async fn join(self) -> AgentResult<()> {
        self.join.await.unwrap_or(Err(AgentError::ShuttingDown))
    }

    fn send(&self, command: AgentCommand) -> AgentResult<()> {
        self.tx
            .send(AgentMessage::Command(command))
            .map_err(|_| AgentError::ShuttingDown)
    }

    async fn call<T>(&self, rx: oneshot::Receiver<T>) -> AgentResult<T> {
        rx.await.map_err(|_| AgentError::ShuttingDown)
    }
}
