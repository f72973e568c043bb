//! Liveness table and the sweep half of the failure detector. Heartbeat
//! broadcasting itself lives in the controller's ticker, since it needs
//! the shared transport and config; this module owns only the table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::Pid;

/// Maps PID to last-seen wall-clock instant, updated on receipt of *any*
/// message from that PID. The self-entry is kept for symmetry and never
/// expires.
pub struct Liveness {
    me: Pid,
    last_seen: HashMap<Pid, Instant>,
}

impl Liveness {
    pub fn new(me: Pid) -> Self {
        let mut last_seen = HashMap::new();
        last_seen.insert(me, Instant::now());
        Liveness { me, last_seen }
    }

    /// Records traffic from `pid` just now.
    pub fn touch(&mut self, pid: Pid) {
        self.last_seen.insert(pid, Instant::now());
    }

    /// A PID is alive iff `now - last_seen < fail_timeout`; the local
    /// peer is always alive.
    pub fn is_alive(&self, pid: Pid, fail_timeout: Duration) -> bool {
        if pid == self.me {
            return true;
        }
        self.last_seen
            .get(&pid)
            .is_some_and(|t| t.elapsed() < fail_timeout)
    }

    /// Removes every non-self entry older than `fail_timeout` and returns
    /// the PIDs that were removed, one `peer_failed` event per PID. Reads
    /// a single consistent snapshot of the table, so a PID touched earlier
    /// in the same tick is never swept out in that same call.
    pub fn sweep(&mut self, fail_timeout: Duration) -> Vec<Pid> {
        let me = self.me;
        let mut failed = Vec::new();
        self.last_seen.retain(|&pid, last| {
            if pid == me {
                return true;
            }
            if last.elapsed() >= fail_timeout {
                failed.push(pid);
                false
            } else {
                true
            }
        });
        failed
    }

    /// Current count of PIDs believed alive (self included).
    pub fn live_count(&self) -> usize {
        self.last_seen.len()
    }

    pub fn live_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.last_seen.keys().copied()
    }
}
