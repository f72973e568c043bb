//! Bully-style leader election, as an `impl Controller` block spread
//! over this file (the controller's message dispatch lives in
//! `controller.rs`; this file supplies the handlers it calls into, plus
//! the two background tasks that drive a candidacy and an "awaiting
//! LEADER" wait to completion).
//!
//! Timer cancellation (spec: "role transitions cancel pending timers of
//! the previous role") is realized here by re-validating the relevant
//! piece of state after every sleep rather than holding an abort handle:
//! a stale candidacy or wait whose outcome was already decided by a
//! message that arrived in the meantime simply finds the state changed
//! and returns without acting. This is equivalent in effect to
//! cancellation and avoids a parallel bookkeeping structure of handles.

use std::sync::Arc;

use crate::codec::{Message, Round};
use crate::controller::Controller;
use crate::{Pid, Role};

impl Controller {
    /// Enters candidacy: broadcasts ELECTION and spawns the timer task
    /// that decides the outcome. Called at startup (no HELLO_ACK within
    /// `HELLO_TIMEOUT`), on leader failure, on losing an `OK` race and
    /// then timing out waiting for a `LEADER` announcement, and when a
    /// lower-PID peer's own `ELECTION` prompts us to contest as well.
    pub(crate) async fn begin_election(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().await;
            st.role = Role::Candidate;
            st.known_leader = None;
            st.consensus_leader = None;
        }
        pf_info!("starting candidacy");
        let ctrl = self.clone();
        tokio::spawn(async move { run_candidacy(ctrl).await });
    }

    pub(crate) async fn on_hello(self: &Arc<Self>, _from: Pid) {
        let (role, round) = {
            let st = self.state.lock().await;
            (st.role, st.round)
        };
        if role == Role::Leader {
            self.broadcast(Message::HelloAck {
                from: self.pid,
                leader: self.pid,
                round,
            })
            .await;
        }
    }

    /// Adopts the announced leader unless we already know of a
    /// higher-PID one. A newly started peer with a PID higher than the
    /// sitting leader still adopts it here -- sitting-leader stability
    /// wins over PID-based preemption (spec §9, resolved in DESIGN.md).
    pub(crate) async fn on_hello_ack(self: &Arc<Self>, _from: Pid, leader: Pid, round: Round) {
        let mut st = self.state.lock().await;
        if let Some(cur) = st.known_leader {
            if leader == cur {
                st.round = st.round.max(round); // idempotent, no role churn
                return;
            }
            if leader < cur {
                return; // stale announcement from a superseded leader
            }
        }
        st.role = Role::Follower;
        st.known_leader = Some(leader);
        st.round = st.round.max(round);
        pf_info!("adopted leader {} at round {} via HELLO_ACK", leader, st.round);
    }

    /// A lower-PID challenger must be told we outrank them, and we must
    /// make sure we are still the rightful leader (or start trying to
    /// become one).
    pub(crate) async fn on_election(self: &Arc<Self>, from: Pid) {
        if from >= self.pid {
            return; // only reply to peers we outrank
        }
        self.broadcast(Message::Ok { from: self.pid }).await;

        let (role, round) = {
            let st = self.state.lock().await;
            (st.role, st.round)
        };
        match role {
            Role::Leader => {
                // Already the rightful leader: re-announce rather than
                // spuriously contesting our own seat.
                self.broadcast(Message::Leader {
                    from: self.pid,
                    pid: self.pid,
                    round: Some(round),
                })
                .await;
            }
            Role::Candidate => {
                // Already contesting this same election; the in-flight
                // candidacy timer covers us, no need to restart it.
            }
            Role::Follower => self.begin_election().await,
        }
    }

    /// A higher-PID peer beat us to it: step down and wait for its
    /// `LEADER` announcement.
    pub(crate) async fn on_ok(self: &Arc<Self>, from: Pid) {
        if from <= self.pid {
            return;
        }
        let conceded = {
            let mut st = self.state.lock().await;
            if st.role == Role::Candidate {
                st.role = Role::Follower;
                true
            } else {
                false
            }
        };
        if conceded {
            pf_debug!("conceded candidacy to {}", from);
            let ctrl = self.clone();
            tokio::spawn(async move { run_leader_wait(ctrl).await });
        }
    }

    /// Adopts `pid` as leader unless we already know of an
    /// equal-or-higher one (ties and lower announcements are ignored,
    /// per the concurrent-LEADER-announcements tie-break). Repeated
    /// announcements of the already-known leader cause no state churn.
    pub(crate) async fn on_leader(self: &Arc<Self>, _from: Pid, pid: Pid, round: Option<Round>) {
        let mut st = self.state.lock().await;
        if let Some(cur) = st.known_leader {
            if pid == cur {
                if let Some(r) = round {
                    st.round = st.round.max(r);
                }
                // Protocol violation per spec §7.2 ("duplicate LEADER"):
                // a repeated announcement of the already-known leader
                // causes no further state churn.
                let _: Result<(), crate::ConcordError> =
                    logged_err!(Protocol, "duplicate LEADER announcement for {}, no churn", pid);
                return;
            }
            if pid < cur {
                return;
            }
        }
        st.role = Role::Follower;
        st.known_leader = Some(pid);
        if let Some(r) = round {
            st.round = st.round.max(r);
        }
        pf_info!("adopted leader {} via LEADER announcement", pid);
    }
}

/// Drives one candidacy to its conclusion: broadcast ELECTION, wait
/// `BULLY_TIMEOUT`, and become leader iff nothing in the meantime moved
/// us out of `Candidate` (an `OK` from a higher PID would have).
async fn run_candidacy(ctrl: Arc<Controller>) {
    ctrl.broadcast(Message::Election { from: ctrl.pid }).await;
    tokio::time::sleep(ctrl.tunables.bully_timeout()).await;

    let round = {
        let mut st = ctrl.state.lock().await;
        if st.role != Role::Candidate {
            return; // outcome already decided elsewhere
        }
        st.role = Role::Leader;
        st.known_leader = Some(ctrl.pid);
        st.round
    };
    pf_info!("elected leader at round {}", round);
    ctrl.broadcast(Message::Leader {
        from: ctrl.pid,
        pid: ctrl.pid,
        round: Some(round),
    })
    .await;

    let leader_ctrl = ctrl.clone();
    tokio::spawn(async move { crate::consensus::run_as_leader(leader_ctrl).await });
}

/// After conceding a candidacy, waits up to `BULLY_TIMEOUT` more for a
/// `LEADER` announcement before restarting the candidacy, per §4.4.
async fn run_leader_wait(ctrl: Arc<Controller>) {
    tokio::time::sleep(ctrl.tunables.bully_timeout()).await;
    let should_restart = {
        let st = ctrl.state.lock().await;
        st.known_leader.is_none() && st.role == Role::Follower
    };
    if should_restart {
        pf_info!("no LEADER announcement arrived, restarting candidacy");
        ctrl.begin_election().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::transport::{test_bus, ChannelTransport};
    use crate::{Controller, PidValue, Role, Tunables};

    fn new_controller(pid: u32, bus: &tokio::sync::broadcast::Sender<Vec<u8>>) -> Arc<Controller> {
        let transport = Arc::new(ChannelTransport::subscribe(bus, ([127, 0, 0, 1], pid as u16).into()));
        Controller::new(pid, Tunables::fast(), transport, Arc::new(PidValue))
    }

    #[tokio::test]
    async fn lower_pid_election_gets_ok_and_yields_to_us() {
        let bus = test_bus(16);
        let ctrl = new_controller(5, &bus);
        ctrl.on_election(2).await;
        assert_eq!(ctrl.role().await, Role::Candidate);
    }

    #[tokio::test]
    async fn higher_pid_election_is_not_challenged() {
        let bus = test_bus(16);
        let ctrl = new_controller(5, &bus);
        ctrl.state.lock().await.role = Role::Follower;
        ctrl.on_election(9).await;
        // We never reply OK to, or contest against, a higher PID's
        // election -- our role is untouched by its mere arrival.
        assert_eq!(ctrl.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn ok_from_higher_pid_concedes_candidacy() {
        let bus = test_bus(16);
        let ctrl = new_controller(2, &bus);
        ctrl.state.lock().await.role = Role::Candidate;
        ctrl.on_ok(9).await;
        assert_eq!(ctrl.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn ok_from_lower_pid_does_not_concede_candidacy() {
        let bus = test_bus(16);
        let ctrl = new_controller(9, &bus);
        ctrl.state.lock().await.role = Role::Candidate;
        ctrl.on_ok(2).await;
        assert_eq!(ctrl.role().await, Role::Candidate);
    }

    #[tokio::test]
    async fn late_joiner_adopts_sitting_leader_even_with_a_higher_own_pid() {
        let bus = test_bus(16);
        let ctrl = new_controller(99, &bus);
        ctrl.on_hello_ack(2, 2, 3).await;
        assert_eq!(ctrl.known_leader().await, Some(2));
        assert_eq!(ctrl.role().await, Role::Follower);
        assert_eq!(ctrl.round().await, 3);
    }

    #[tokio::test]
    async fn leader_announcement_from_a_lower_pid_than_known_is_ignored() {
        let bus = test_bus(16);
        let ctrl = new_controller(1, &bus);
        ctrl.on_leader(5, 5, Some(10)).await;
        assert_eq!(ctrl.known_leader().await, Some(5));

        ctrl.on_leader(3, 3, Some(99)).await;
        assert_eq!(ctrl.known_leader().await, Some(5));
        assert_eq!(ctrl.round().await, 10, "round must not regress either");
    }

    #[tokio::test]
    async fn repeated_leader_announcement_is_idempotent() {
        let bus = test_bus(16);
        let ctrl = new_controller(1, &bus);
        ctrl.on_leader(5, 5, Some(10)).await;
        ctrl.on_leader(5, 5, Some(10)).await;
        assert_eq!(ctrl.known_leader().await, Some(5));
        assert_eq!(ctrl.role().await, Role::Follower);
    }
}
