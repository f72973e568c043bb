//! Per-peer value computation for the consensus round, abstracted
//! behind a trait so tests can pin it down deterministically (spec §9:
//! "the source does not pin a single domain function").

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::Pid;

/// Supplies this peer's nonnegative-integer value for a consensus round.
pub trait ValueSupplier: Send + Sync {
    fn value(&self, peer: Pid, round: crate::codec::Round) -> u64;
}

/// Deterministic supplier: the peer's own PID. Used in tests where the
/// decided value must be predictable.
pub struct PidValue;

impl ValueSupplier for PidValue {
    fn value(&self, peer: Pid, _round: crate::codec::Round) -> u64 {
        u64::from(peer)
    }
}

/// Seeded pseudo-random supplier, the default for the standalone binary.
/// Seeded (rather than from entropy) so a single process's sequence of
/// round values is reproducible given its PID.
pub struct RandomValue {
    rng: Mutex<StdRng>,
    ceiling: u64,
}

impl RandomValue {
    pub fn new(seed: Pid, ceiling: u64) -> Self {
        RandomValue {
            rng: Mutex::new(StdRng::seed_from_u64(u64::from(seed))),
            ceiling: ceiling.max(1),
        }
    }
}

impl ValueSupplier for RandomValue {
    fn value(&self, _peer: Pid, _round: crate::codec::Round) -> u64 {
        // `try_lock` keeps this call non-async-blocking; contention is
        // impossible in practice since only one task ever computes a
        // peer's own round value at a time.
        let mut rng = self
            .rng
            .try_lock()
            .expect("RandomValue is only ever called from one task at a time");
        rng.gen_range(0..self.ceiling)
    }
}
