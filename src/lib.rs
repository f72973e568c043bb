//! Core protocol engine for a multicast group of peers that elect a
//! leader via the Bully algorithm and, under that leader, run periodic
//! majority-consensus rounds over a per-peer value. Linked by the
//! `concord_peer` binary and usable directly by tests via
//! [`transport::ChannelTransport`].

#[macro_use]
mod utils;

mod codec;
mod consensus;
mod election;
mod membership;
mod pid;
mod value;

pub mod controller;
pub mod transport;

pub use codec::{Message, Round};
pub use controller::{Controller, Decision};
pub use membership::Liveness;
pub use pid::{Pid, Role};
pub use transport::{ChannelTransport, Transport, UdpMulticastTransport};
pub use utils::{logger_init, ConcordError, ErrorKind, Tunables};
pub use value::{PidValue, RandomValue, ValueSupplier};
