//! LAN peer discovery over UDP beacons.
//!
//! Every node broadcasts a presence beacon on the discovery port and listens
//! for the beacons of its peers. The same socket carries election traffic
//! (`ELECTION_INIT`, `LCR_TOKEN`, `POP_STALE_LEADER`), which the listener
//! routes into the election engine.

pub mod membership;
pub mod service;
pub mod wire;

pub use membership::{MembershipTable, Peer};
pub use service::{DiscoveryService, UdpTransport};
pub use wire::{Role, WireMessage};
