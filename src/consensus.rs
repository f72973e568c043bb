//! Periodic majority-consensus rounds, driven by the sitting leader and
//! participated in by every peer including the leader itself. Split from
//! `controller.rs` the same way `election.rs` is: this file supplies the
//! message handlers the dispatcher calls plus the leader's own round
//! driver loop.
//!
//! A round has five phases on the wire: `ROUND_QUERY`/`ROUND_RESPONSE`
//! let the leader reconcile the round counter against whatever the
//! surviving followers last saw (in case the previous leader crashed
//! mid-round), `ROUND_UPDATE` publishes the reconciled number,
//! `START_CONSENSUS` opens the round, and then every peer submits a
//! `VALUE` and, after a collection window, a `RESPONSE`. The leader
//! alone judges whether the collected `RESPONSE`s reach a majority and
//! is the only one that emits a [`Decision`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{Message, Round};
use crate::controller::{Controller, Decision, LeaderPhase, LeaderRound};
use crate::{Pid, Role};

impl Controller {
    pub(crate) async fn on_round_query(self: &Arc<Self>, _from: Pid) {
        let round = self.state.lock().await.round;
        self.broadcast(Message::RoundResponse {
            from: self.pid,
            round,
        })
        .await;
    }

    pub(crate) async fn on_round_response(self: &Arc<Self>, from: Pid, round: Round) {
        let mut st = self.state.lock().await;
        if let Some(lr) = st.consensus_leader.as_mut() {
            if lr.phase == LeaderPhase::Querying {
                lr.query_responses.insert(from, round);
            }
        }
    }

    pub(crate) async fn on_round_update(self: &Arc<Self>, round: Round) {
        let mut st = self.state.lock().await;
        st.round = st.round.max(round);
    }

    /// Per §4.5 follower duties: only a `START_CONSENSUS` for a round at
    /// or ahead of our own is honored. A round behind our own is a
    /// protocol violation (spec §7.2's "impossible round" case -- a
    /// stale retransmit or reordered duplicate of a round we've already
    /// moved past) and is dropped rather than re-entering a closed round.
    pub(crate) async fn on_start_consensus(self: &Arc<Self>, round: Round) {
        let stale = {
            let mut st = self.state.lock().await;
            if round < st.round {
                true
            } else {
                st.round = round;
                false
            }
        };
        if stale {
            let _: Result<(), crate::ConcordError> =
                logged_err!(Protocol, "dropping START_CONSENSUS for stale round {}", round);
            return;
        }
        self.begin_value_phase(round).await;
    }

    /// Records an incoming `VALUE`. The first `VALUE` seen for a round
    /// arms that round's collection window even without a preceding
    /// `START_CONSENSUS` (a peer that missed the announcement but hears
    /// the chatter around it still converges).
    pub(crate) async fn on_value(self: &Arc<Self>, from: Pid, round: Round, value: u64) {
        let should_spawn = {
            let mut st = self.state.lock().await;
            let rv = st.consensus_rounds.entry(round).or_default();
            rv.values.insert(from, value);
            if rv.timer_armed {
                false
            } else {
                rv.timer_armed = true;
                true
            }
        };
        if should_spawn {
            let ctrl = self.clone();
            tokio::spawn(async move { run_value_window(ctrl, round).await });
        }
    }

    /// Only meaningful while we are the leader driving this exact round;
    /// everyone else's `RESPONSE` bookkeeping lives in `RoundValues` and
    /// is folded in by `run_value_window` itself.
    pub(crate) async fn on_response(self: &Arc<Self>, from: Pid, round: Round, response: u64) {
        let decision = {
            let mut st = self.state.lock().await;
            let live_count = st.liveness.live_count();
            let lr = match st.consensus_leader.as_mut() {
                Some(lr) if lr.round == round => lr,
                _ => return,
            };
            lr.responses.insert(from, response);
            try_decide(lr, live_count, round)
        };
        if let Some(decision) = decision {
            pf_info!("round {} decided value {}", decision.round, decision.value);
            let _ = self.decisions.send(decision);
        }
    }

    /// Ensures a round's value-collection window is armed exactly once,
    /// whether triggered by our own `START_CONSENSUS` handling or by the
    /// leader driving its own round directly (the leader never dispatches
    /// its own broadcasts back to itself, so it must call this
    /// explicitly -- see `run_one_round`).
    pub(crate) async fn begin_value_phase(self: &Arc<Self>, round: Round) {
        let should_spawn = {
            let mut st = self.state.lock().await;
            let rv = st.consensus_rounds.entry(round).or_default();
            if rv.timer_armed {
                false
            } else {
                rv.timer_armed = true;
                true
            }
        };
        if should_spawn {
            let ctrl = self.clone();
            tokio::spawn(async move { run_value_window(ctrl, round).await });
        }
    }
}

/// Drives one peer's participation in round `round`'s value/response
/// exchange: submits our own `VALUE`, waits out the collection window,
/// computes our response as the max over every `VALUE` seen (including
/// our own), and submits it. If this peer happens to be the round's
/// leader, also folds the response into the leader's own bookkeeping,
/// since `dispatch` never delivers our own broadcasts back to us.
async fn run_value_window(ctrl: Arc<Controller>, round: Round) {
    let my_value = ctrl.value_supplier.value(ctrl.pid, round);
    {
        let mut st = ctrl.state.lock().await;
        let rv = st.consensus_rounds.entry(round).or_default();
        rv.values.insert(ctrl.pid, my_value);
    }
    ctrl.broadcast(Message::Value {
        from: ctrl.pid,
        round,
        value: my_value,
    })
    .await;

    tokio::time::sleep(ctrl.tunables.value_process_delay()).await;

    let response = {
        let mut st = ctrl.state.lock().await;
        let rv = st.consensus_rounds.entry(round).or_default();
        if rv.responded {
            return; // a concurrent trigger already closed this window
        }
        rv.responded = true;
        rv.values.values().copied().max().unwrap_or(my_value)
    };
    ctrl.broadcast(Message::Response {
        from: ctrl.pid,
        round,
        response,
    })
    .await;

    let decision = {
        let mut st = ctrl.state.lock().await;
        let live_count = st.liveness.live_count();
        let is_leader = st.role == Role::Leader;
        match st.consensus_leader.as_mut() {
            Some(lr) if lr.round == round && is_leader => {
                lr.responses.insert(ctrl.pid, response);
                try_decide(lr, live_count, round)
            }
            _ => None,
        }
    };
    if let Some(decision) = decision {
        pf_info!("round {} decided value {}", decision.round, decision.value);
        let _ = ctrl.decisions.send(decision);
    }
}

/// Reconciled round number (Open Question: a strict majority of
/// *collected* query responses, falling back to the leader's own round
/// when no value reaches it). Per §4.5 phase 1 this is always
/// `max(own_round, majority)`, never the majority value alone -- a
/// leader's round must never regress, even if a majority of followers
/// report a round behind where this leader has already advanced to.
fn majority_round(query_responses: &HashMap<Pid, Round>, own_round: Round) -> Round {
    if query_responses.is_empty() {
        return own_round;
    }
    let mut counts: HashMap<Round, usize> = HashMap::new();
    for &r in query_responses.values() {
        *counts.entry(r).or_insert(0) += 1;
    }
    let need = query_responses.len() / 2 + 1;
    counts
        .into_iter()
        .find(|(_, count)| *count >= need)
        .map(|(round, _)| round.max(own_round))
        .unwrap_or(own_round)
}

/// Majority among a round's collected `RESPONSE` values, against the
/// live-peer count observed right now (spec's testable "majority of
/// currently live peers" property, not majority of however many
/// responses happened to arrive).
fn majority_response(responses: &HashMap<Pid, u64>, live_count: usize) -> Option<u64> {
    let need = live_count / 2 + 1;
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &v in responses.values() {
        *counts.entry(v).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .find(|(_, count)| *count >= need)
        .map(|(value, _)| value)
}

/// Shared by `on_response` and `run_value_window`'s leader-fold tail: a
/// `RESPONSE` can complete the majority whether it arrived over the
/// network or was the leader's own, and either path must run the exact
/// same check so self-completion isn't silently skipped.
fn try_decide(lr: &mut LeaderRound, live_count: usize, round: Round) -> Option<Decision> {
    if lr.decided {
        return None;
    }
    majority_response(&lr.responses, live_count).map(|value| {
        lr.decided = true;
        Decision { round, value }
    })
}

/// Drives this peer's tenure as leader: one round after another, each
/// separated by `CONSENSUS_INTERVAL`, until a role transition (observed
/// at the top of the loop and after every await point) ends the tenure.
pub(crate) async fn run_as_leader(ctrl: Arc<Controller>) {
    loop {
        if ctrl.state.lock().await.role != Role::Leader {
            return;
        }
        run_one_round(&ctrl).await;
        tokio::time::sleep(ctrl.tunables.consensus_interval()).await;
    }
}

async fn run_one_round(ctrl: &Arc<Controller>) {
    if ctrl.state.lock().await.role != Role::Leader {
        return;
    }
    tokio::time::sleep(ctrl.tunables.leader_query_delay()).await;

    {
        let mut st = ctrl.state.lock().await;
        if st.role != Role::Leader {
            return;
        }
        st.consensus_leader = Some(LeaderRound::querying());
    }
    ctrl.broadcast(Message::RoundQuery { from: ctrl.pid }).await;
    tokio::time::sleep(ctrl.tunables.round_query_timeout()).await;

    let agreed_round = {
        let mut st = ctrl.state.lock().await;
        if st.role != Role::Leader {
            return;
        }
        let own_round = st.round;
        let reconciled = match st.consensus_leader.as_ref() {
            Some(lr) => majority_round(&lr.query_responses, own_round),
            None => own_round,
        };
        st.round = reconciled;
        reconciled
    };

    ctrl.broadcast(Message::RoundUpdate {
        from: ctrl.pid,
        round: agreed_round,
    })
    .await;
    tokio::time::sleep(ctrl.tunables.leader_consensus_delay()).await;

    {
        let mut st = ctrl.state.lock().await;
        if st.role != Role::Leader {
            return;
        }
        let mut lr = LeaderRound::starting(agreed_round);
        lr.phase = LeaderPhase::ValuesOpen;
        st.consensus_leader = Some(lr);
    }
    ctrl.broadcast(Message::StartConsensus {
        from: ctrl.pid,
        round: agreed_round,
        leader: ctrl.pid,
    })
    .await;
    ctrl.begin_value_phase(agreed_round).await;

    tokio::time::sleep(ctrl.tunables.value_process_delay()).await;
    {
        let mut st = ctrl.state.lock().await;
        if let Some(lr) = st.consensus_leader.as_mut() {
            if lr.round == agreed_round {
                lr.phase = LeaderPhase::ResponsesOpen;
            }
        }
    }

    tokio::time::sleep(ctrl.tunables.response_process_delay()).await;
    {
        let mut st = ctrl.state.lock().await;
        if let Some(lr) = st.consensus_leader.as_ref() {
            if lr.round == agreed_round && !lr.decided {
                pf_info!("round {} closed without a majority", agreed_round);
            }
        }
        // Either way the round is now closed: advance past it so the next
        // tenure-loop iteration's query phase reconciles from here, per
        // §4.5 phase 5 ("the leader advances R <- R+1").
        if st.round == agreed_round {
            st.round = agreed_round + 1;
        }
    }
}
