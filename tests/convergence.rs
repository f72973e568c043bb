//! End-to-end scenarios run with [`ChannelTransport`] standing in for a
//! real multicast group, so an entire small peer set can be exercised
//! in one process on a fast tunable profile.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use concord::transport::{test_bus, ChannelTransport, Transport};
use concord::{ConcordError, Controller, Message, PidValue, Role, Tunables};

fn spawn_peer(pid: u32, bus: &tokio::sync::broadcast::Sender<Vec<u8>>) -> Arc<Controller> {
    let transport = Arc::new(ChannelTransport::subscribe(bus, ([127, 0, 0, 1], pid as u16).into()));
    let controller = Controller::new(pid, Tunables::fast(), transport, Arc::new(PidValue));
    let run_ctrl = controller.clone();
    tokio::spawn(async move {
        let _ = run_ctrl.run().await;
    });
    controller
}

async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn three_peers_elect_the_highest_pid() {
    let bus = test_bus(256);
    let a = spawn_peer(1, &bus);
    let b = spawn_peer(2, &bus);
    let c = spawn_peer(3, &bus);

    let converged = wait_until(Duration::from_secs(5), || {
        let (a, c) = (a.clone(), c.clone());
        Box::pin(async move { a.known_leader().await == Some(3) && c.role().await == Role::Leader })
    })
    .await;
    assert!(converged, "peers never converged on peer 3 as leader");
    assert_eq!(b.known_leader().await, Some(3));
}

#[tokio::test]
async fn solo_peer_becomes_its_own_leader() {
    let bus = test_bus(16);
    let a = spawn_peer(1, &bus);

    let converged = wait_until(Duration::from_secs(4), || {
        let a = a.clone();
        Box::pin(async move { a.role().await == Role::Leader })
    })
    .await;
    assert!(converged, "a lone peer never elected itself");
}

#[tokio::test]
async fn leader_failure_triggers_reelection() {
    let bus = test_bus(256);
    let a = spawn_peer(1, &bus);
    let b = spawn_peer(2, &bus);
    let c = spawn_peer(3, &bus);

    let first_election = wait_until(Duration::from_secs(5), || {
        let a = a.clone();
        Box::pin(async move { a.known_leader().await == Some(3) })
    })
    .await;
    assert!(first_election, "initial election never settled on peer 3");

    // Simulate peer 3 crashing: abort its background tasks so it stops
    // heartbeating, and let the survivors' failure detector age it out.
    c.shutdown().await;

    let reelected = wait_until(Duration::from_secs(8), || {
        let (a, b) = (a.clone(), b.clone());
        Box::pin(async move {
            a.known_leader().await == Some(2) && b.role().await == Role::Leader
        })
    })
    .await;
    assert!(reelected, "survivors never re-elected peer 2 after peer 3's disappearance");
}

#[tokio::test]
async fn a_consensus_round_commits_a_decision() {
    let bus = test_bus(256);
    let _a = spawn_peer(1, &bus);
    let _b = spawn_peer(2, &bus);
    let c = spawn_peer(3, &bus);

    // Only the sitting leader judges majority and emits a `Decision`
    // (followers collect RESPONSEs too, but deciding is the leader's
    // job); peer 3 outranks the other two and wins the election.
    let mut decisions = c.decisions.subscribe();
    let decision = tokio::time::timeout(Duration::from_secs(20), decisions.recv())
        .await
        .expect("no decision arrived within the timeout")
        .expect("decisions channel closed unexpectedly");
    // With PidValue suppliers the max observed value is always 3 (peer
    // 3's own PID), since every peer's value equals its PID.
    assert_eq!(decision.value, 3);
}

#[tokio::test]
async fn late_joiner_with_higher_pid_keeps_the_sitting_leader() {
    let bus = test_bus(256);
    let a = spawn_peer(1, &bus);
    let b = spawn_peer(2, &bus);

    let converged = wait_until(Duration::from_secs(5), || {
        let (a, b) = (a.clone(), b.clone());
        Box::pin(async move { a.known_leader().await == Some(2) && b.role().await == Role::Leader })
    })
    .await;
    assert!(converged, "peers 1 and 2 never converged on peer 2 as leader");
    let round_before = b.round().await;

    // Peer 7 outranks the sitting leader on PID alone, but sitting-leader
    // stability (spec §9) means it must adopt peer 2 rather than forcing
    // a fresh election it would win.
    let late = spawn_peer(7, &bus);
    let adopted = wait_until(Duration::from_secs(5), || {
        let late = late.clone();
        Box::pin(async move { late.known_leader().await == Some(2) })
    })
    .await;
    assert!(
        adopted,
        "late joiner with a higher PID never adopted the sitting leader"
    );
    assert_eq!(late.role().await, Role::Follower);
    assert_eq!(b.role().await, Role::Leader, "sitting leader must not be preempted");
    assert_eq!(a.role().await, Role::Follower);
    assert!(b.round().await >= round_before, "round must not regress");
}

/// Wraps a [`ChannelTransport`] and silently drops any incoming `VALUE`
/// whose `from` is in `deaf_to`, simulating a one-directional partition
/// during the value-collection phase of a single peer's round.
struct ValueDroppingTransport {
    inner: ChannelTransport,
    deaf_to: HashSet<u32>,
}

#[async_trait]
impl Transport for ValueDroppingTransport {
    async fn send(&self, bytes: &[u8]) {
        self.inner.send(bytes).await;
    }

    async fn recv(&self) -> Result<(Vec<u8>, SocketAddr), ConcordError> {
        loop {
            let (bytes, src) = self.inner.recv().await?;
            if let Ok(Message::Value { from, .. }) = serde_json::from_slice::<Message>(&bytes) {
                if self.deaf_to.contains(&from) {
                    continue;
                }
            }
            return Ok((bytes, src));
        }
    }
}

fn spawn_partitioned_peer(
    pid: u32,
    bus: &tokio::sync::broadcast::Sender<Vec<u8>>,
    deaf_to: HashSet<u32>,
) -> Arc<Controller> {
    let inner = ChannelTransport::subscribe(bus, ([127, 0, 0, 1], pid as u16).into());
    let transport = Arc::new(ValueDroppingTransport { inner, deaf_to });
    let controller = Controller::new(pid, Tunables::fast(), transport, Arc::new(PidValue));
    let run_ctrl = controller.clone();
    tokio::spawn(async move {
        let _ = run_ctrl.run().await;
    });
    controller
}

#[tokio::test]
async fn diverging_responses_abort_the_round_but_round_still_advances() {
    let bus = test_bus(256);
    // Peer 1 never hears peer 2's or peer 3's VALUE, so its own RESPONSE
    // is just its own value (1). Peer 2 never hears peer 3's VALUE, so
    // its RESPONSE maxes out at 2. Peer 3 (the leader, PidValue == 3,
    // already the global max) always responds 3 regardless of drops.
    // Three live peers, three distinct RESPONSE values: no value reaches
    // the strict majority of 2, so the round must abort.
    let a = spawn_partitioned_peer(1, &bus, [2, 3].into_iter().collect());
    let b = spawn_partitioned_peer(2, &bus, [3].into_iter().collect());
    let c = spawn_peer(3, &bus);

    let converged = wait_until(Duration::from_secs(5), || {
        let c = c.clone();
        Box::pin(async move { c.role().await == Role::Leader })
    })
    .await;
    assert!(converged, "peer 3 never became leader");

    let mut decisions = c.decisions.subscribe();
    // Long enough for at least one full round-query/value/response cycle
    // under `Tunables::fast()` to run to completion and abort.
    let outcome = tokio::time::timeout(Duration::from_secs(15), decisions.recv()).await;
    assert!(
        outcome.is_err(),
        "a round with three diverging RESPONSE values must not produce a Decision"
    );

    let round_after_first_abort = c.round().await;
    assert!(
        round_after_first_abort > 0,
        "the round counter must advance past an aborted round, not just sit at 0"
    );
    let advanced_again = wait_until(Duration::from_secs(15), || {
        let c = c.clone();
        Box::pin(async move { c.round().await > round_after_first_abort })
    })
    .await;
    assert!(
        advanced_again,
        "the round counter must keep advancing across further aborted rounds too"
    );
    let _ = a.role().await; // keep peer 1 alive for the duration of the test
    let _ = b.role().await;
}

#[tokio::test]
async fn duplicate_start_consensus_does_not_double_submit_value() {
    let bus = test_bus(256);
    let _a = spawn_peer(1, &bus);
    let b = spawn_peer(2, &bus);

    let converged = wait_until(Duration::from_secs(5), || {
        let b = b.clone();
        Box::pin(async move { b.role().await == Role::Leader })
    })
    .await;
    assert!(converged, "peer 2 never became leader");

    // Observe the bus raw so we can both learn the real round number and
    // later inject a forged duplicate of the same START_CONSENSUS.
    let mut observer = bus.subscribe();
    let round = loop {
        let bytes = next_raw(&mut observer).await;
        if let Ok(Message::StartConsensus { round, .. }) = serde_json::from_slice::<Message>(&bytes)
        {
            break round;
        }
    };

    // Inject a duplicate of the same round's START_CONSENSUS directly
    // onto the bus, as if it had been retransmitted or reordered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let duplicate = Message::StartConsensus {
        from: 2,
        round,
        leader: 2,
    };
    let _ = bus.send(serde_json::to_vec(&duplicate).unwrap());

    // Count every VALUE peer 1 submits for this round over a window long
    // enough to contain the entire value-collection phase plus the
    // injected duplicate's processing.
    let mut count = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let next = match tokio::time::timeout(remaining, observer.recv()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        };
        if let Ok(Message::Value { from: 1, round: r, .. }) = serde_json::from_slice::<Message>(&next)
        {
            if r == round {
                count += 1;
            }
        }
    }
    assert_eq!(
        count, 1,
        "a duplicate START_CONSENSUS for an already-open round must not cause a second VALUE submission"
    );
}

async fn next_raw(rx: &mut tokio::sync::broadcast::Receiver<Vec<u8>>) -> Vec<u8> {
    loop {
        match rx.recv().await {
            Ok(bytes) => return bytes,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("test bus closed unexpectedly"),
        }
    }
}
