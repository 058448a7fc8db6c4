//! Ring leader election (LeLann-Chang-Roberts).
//!
//! All nodes converge on the member with the maximal composite UID
//! `(score, ip)` — lexicographic, ties broken by the higher ip. Tokens
//! travel only to each node's ring successor; an announcement token
//! circulates once after the winner is decided.
//!
//! Leader changes are published on a watch channel consumed by the control
//! channel manager and the HTTP layer; nothing registers callbacks into the
//! engine.

mod engine;

pub use engine::{ElectionEngine, ElectionStatus, LeadershipState, RingPosition, ScoreSource, TokenTransport};
