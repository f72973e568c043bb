//! Node controller: the single-writer owner of per-peer state, and the
//! dispatcher that routes decoded messages to the membership, election,
//! and consensus handlers. Mirrors the teacher's per-replica struct with
//! its behavior spread across sibling modules via further `impl
//! Controller` blocks in `election.rs` and `consensus.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::codec::{self, Message, Round};
use crate::membership::Liveness;
use crate::value::ValueSupplier;
use crate::{ConcordError, Pid, Role, Tunables};

/// Per-round value-collection bookkeeping, shared by the follower
/// accumulation path and the leader's own response computation -- see
/// `consensus.rs`.
#[derive(Default)]
pub(crate) struct RoundValues {
    pub(crate) values: HashMap<Pid, u64>,
    pub(crate) responded: bool,
    pub(crate) timer_armed: bool,
}

/// Leader-only state for the in-flight round: phase, round-query
/// responses (phase 1), and collected RESPONSE contributions (phase 5).
/// VALUE contributions live in `ControllerState::consensus_rounds`,
/// shared with the follower-side accumulation logic.
pub(crate) struct LeaderRound {
    pub(crate) phase: LeaderPhase,
    pub(crate) round: Round,
    pub(crate) query_responses: HashMap<Pid, Round>,
    pub(crate) responses: HashMap<Pid, u64>,
    pub(crate) decided: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaderPhase {
    Querying,
    Starting,
    ValuesOpen,
    ResponsesOpen,
}

impl LeaderRound {
    pub(crate) fn querying() -> Self {
        LeaderRound {
            phase: LeaderPhase::Querying,
            round: 0,
            query_responses: HashMap::new(),
            responses: HashMap::new(),
            decided: false,
        }
    }

    pub(crate) fn starting(round: Round) -> Self {
        LeaderRound {
            phase: LeaderPhase::Starting,
            round,
            query_responses: HashMap::new(),
            responses: HashMap::new(),
            decided: false,
        }
    }
}

pub(crate) struct ControllerState {
    pub(crate) role: Role,
    pub(crate) round: Round,
    pub(crate) known_leader: Option<Pid>,
    pub(crate) liveness: Liveness,
    pub(crate) consensus_leader: Option<LeaderRound>,
    pub(crate) consensus_rounds: HashMap<Round, RoundValues>,
}

/// A committed consensus decision, broadcast on [`Controller::decisions`]
/// for anything embedding this crate (or a test) to observe without
/// scraping logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub round: Round,
    pub value: u64,
}

/// Owns one peer's entire protocol-engine state and drives its tokio
/// tasks. Always held behind an `Arc` so the long-lived background
/// tasks (receive loop, heartbeat ticker, election timers, consensus
/// round driver) can each hold a cheap clone.
pub struct Controller {
    pub pid: Pid,
    pub tunables: Tunables,
    pub(crate) transport: Arc<dyn crate::transport::Transport>,
    pub(crate) value_supplier: Arc<dyn ValueSupplier>,
    pub(crate) state: Mutex<ControllerState>,
    pub decisions: broadcast::Sender<Decision>,
    /// Handles of the receive loop and heartbeat ticker, populated by
    /// [`Controller::run`]. Lets an embedder (a supervisor process, or a
    /// multi-peer test harness sharing one [`crate::transport::ChannelTransport`]
    /// bus) simulate this peer crashing via [`Controller::shutdown`]
    /// without tearing down the whole process.
    tasks: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl Controller {
    pub fn new(
        pid: Pid,
        tunables: Tunables,
        transport: Arc<dyn crate::transport::Transport>,
        value_supplier: Arc<dyn ValueSupplier>,
    ) -> Arc<Self> {
        let (decisions, _rx) = broadcast::channel(64);
        Arc::new(Controller {
            pid,
            tunables,
            transport,
            value_supplier,
            state: Mutex::new(ControllerState {
                role: Role::Follower,
                round: 0,
                known_leader: None,
                liveness: Liveness::new(pid),
                consensus_leader: None,
                consensus_rounds: HashMap::new(),
            }),
            decisions,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Encodes and publishes a message to the whole multicast group.
    /// There is no unicast: per the wire protocol, a "reply" is just
    /// another broadcast that uninterested peers ignore.
    pub(crate) async fn broadcast(&self, msg: Message) {
        pf_trace!("-> {}", msg.type_tag());
        self.transport.send(&codec::encode(&msg)).await;
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn round(&self) -> Round {
        self.state.lock().await.round
    }

    pub async fn known_leader(&self) -> Option<Pid> {
        self.state.lock().await.known_leader
    }

    pub async fn live_peer_count(&self) -> usize {
        self.state.lock().await.liveness.live_count()
    }

    /// Runs this peer forever: starts the background tasks, performs
    /// startup discovery, then blocks on the receive loop. Returns only
    /// on a fatal transport error.
    pub async fn run(self: &Arc<Self>) -> Result<(), ConcordError> {
        let recv_ctrl = self.clone();
        let recv_task = tokio::spawn(async move { recv_ctrl.recv_loop().await });

        let hb_ctrl = self.clone();
        let hb_task = tokio::spawn(async move { hb_ctrl.heartbeat_loop().await });

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(recv_task.abort_handle());
            tasks.push(hb_task.abort_handle());
        }

        self.broadcast(Message::Hello { from: self.pid }).await;
        tokio::time::sleep(self.tunables.hello_timeout()).await;
        let has_leader = self.state.lock().await.known_leader.is_some();
        if !has_leader {
            pf_info!("no HELLO_ACK within timeout, starting an election");
            self.begin_election().await;
        }

        match recv_task.await {
            Ok(result) => result,
            Err(e) => Err(ConcordError::fatal(format!("receive task panicked: {}", e))),
        }
    }

    /// Aborts this peer's background tasks, simulating an ungraceful
    /// crash. The standalone binary never calls this (the process just
    /// exits); it exists for embedders that run several peers against a
    /// shared [`crate::transport::ChannelTransport`] bus in one process
    /// and need to take one peer down without the others noticing
    /// anything but a stream of missed heartbeats.
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().await;
        for task in tasks.iter() {
            task.abort();
        }
    }

    async fn recv_loop(self: Arc<Self>) -> Result<(), ConcordError> {
        loop {
            let (bytes, _src) = self.transport.recv().await?;
            match codec::decode(&bytes) {
                Ok(Some(msg)) => self.dispatch(msg).await,
                Ok(None) => { /* unrecognized type tag: forward-compatible drop */ }
                Err(e) => pf_debug!("dropping malformed datagram: {}", e),
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tunables.heartbeat_interval());
        loop {
            ticker.tick().await;
            self.broadcast(Message::Heartbeat { from: self.pid }).await;

            let (failed, leader_failed) = {
                let mut st = self.state.lock().await;
                let failed = st.liveness.sweep(self.tunables.fail_timeout());
                let leader_failed = failed.iter().any(|p| Some(*p) == st.known_leader);
                if leader_failed {
                    st.known_leader = None;
                }
                (failed, leader_failed)
            };
            for p in &failed {
                pf_info!("peer {} failed", p);
            }
            if leader_failed {
                pf_info!("leader failed, starting an election");
                self.begin_election().await;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) {
        let from = msg.from_pid();
        if from == self.pid {
            // Protocol violation per spec §7.2 ("message from self"): our
            // own multicast loopback, dropped rather than processed.
            let _: Result<(), ConcordError> =
                logged_err!(Protocol, "dropping {} looped back from self", msg.type_tag());
            return;
        }
        {
            let mut st = self.state.lock().await;
            st.liveness.touch(from);
        }
        pf_trace!("<- {} from {}", msg.type_tag(), from);

        match msg {
            Message::Hello { from } => self.on_hello(from).await,
            Message::HelloAck { from, leader, round } => {
                self.on_hello_ack(from, leader, round).await
            }
            Message::Election { from } => self.on_election(from).await,
            Message::Ok { from } => self.on_ok(from).await,
            Message::Leader { from, pid, round } => self.on_leader(from, pid, round).await,
            Message::Heartbeat { .. } => {} // liveness already touched above
            Message::RoundQuery { from } => self.on_round_query(from).await,
            Message::RoundResponse { from, round } => self.on_round_response(from, round).await,
            Message::RoundUpdate { from: _, round } => self.on_round_update(round).await,
            Message::StartConsensus {
                from: _,
                round,
                leader: _,
            } => self.on_start_consensus(round).await,
            Message::Value { from, round, value } => self.on_value(from, round, value).await,
            Message::Response {
                from,
                round,
                response,
            } => self.on_response(from, round, response).await,
        }
    }
}
