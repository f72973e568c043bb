//! Peer identity and role.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A peer process identity. Nonnegative by construction (`u32`); larger
/// PIDs outrank smaller ones in the Bully protocol. Uniqueness within a
/// multicast group is an operator responsibility, not enforced here.
pub type Pid = u32;

/// The role a peer occupies at any instant. Initial role is `Follower`;
/// there is no terminal role short of process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Default for Role {
    fn default() -> Self {
        Role::Follower
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Role::Follower => "FOLLOWER",
            Role::Candidate => "CANDIDATE",
            Role::Leader => "LEADER",
        };
        write!(f, "{}", s)
    }
}
