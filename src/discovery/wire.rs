//! Wire format of the UDP discovery/election protocol.
//!
//! Payloads stay colon-delimited text for compatibility with the rest of
//! the fleet; parsing goes through a tagged enum so the dispatch code never
//! touches raw `split(':')` output.
//!
//! - `DISCOVER:<name>:<ip>:<score>:<role>` — presence beacon
//! - `ELECTION_INIT:<ip>:<name>` — start an election round
//! - `LCR_TOKEN:<score>:<ip>:<True|False>` — ring token
//! - `POP_STALE_LEADER:<ip>` — drop a dead leader from every view

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Role a node currently plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Leader,
    Worker,
    Undefined,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "Leader"),
            Role::Worker => write!(f, "Worker"),
            Role::Undefined => write!(f, "Undefined"),
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Leader" => Ok(Role::Leader),
            "Worker" => Ok(Role::Worker),
            "Undefined" => Ok(Role::Undefined),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Discover {
        name: String,
        ip: Ipv4Addr,
        score: u64,
        role: Role,
    },
    ElectionInit {
        initiator_ip: Ipv4Addr,
        initiator_name: String,
    },
    LcrToken {
        score: u64,
        ip: Ipv4Addr,
        is_leader: bool,
    },
    PopStaleLeader {
        ip: Ipv4Addr,
    },
}

impl WireMessage {
    /// Parse a datagram payload. Malformed lines yield `None` and are
    /// dropped by the listener.
    pub fn parse(raw: &str) -> Option<WireMessage> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let (tag, rest) = raw.split_once(':')?;
        match tag {
            "DISCOVER" => {
                let mut parts = rest.splitn(4, ':');
                let name = parts.next()?.to_string();
                let ip = parts.next()?.parse().ok()?;
                let score = parts.next()?.parse().ok()?;
                // Older beacons omit the role field.
                let role = parts
                    .next()
                    .and_then(|r| r.parse().ok())
                    .unwrap_or(Role::Undefined);
                Some(WireMessage::Discover {
                    name,
                    ip,
                    score,
                    role,
                })
            }
            "ELECTION_INIT" => {
                let (ip, name) = rest.split_once(':')?;
                Some(WireMessage::ElectionInit {
                    initiator_ip: ip.parse().ok()?,
                    initiator_name: name.to_string(),
                })
            }
            "LCR_TOKEN" => {
                let mut parts = rest.splitn(3, ':');
                let score = parts.next()?.parse().ok()?;
                let ip = parts.next()?.parse().ok()?;
                let is_leader = match parts.next()? {
                    "True" => true,
                    "False" => false,
                    _ => return None,
                };
                Some(WireMessage::LcrToken {
                    score,
                    ip,
                    is_leader,
                })
            }
            "POP_STALE_LEADER" => Some(WireMessage::PopStaleLeader {
                ip: rest.parse().ok()?,
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            WireMessage::Discover {
                name,
                ip,
                score,
                role,
            } => format!("DISCOVER:{name}:{ip}:{score}:{role}"),
            WireMessage::ElectionInit {
                initiator_ip,
                initiator_name,
            } => format!("ELECTION_INIT:{initiator_ip}:{initiator_name}"),
            WireMessage::LcrToken {
                score,
                ip,
                is_leader,
            } => {
                let flag = if *is_leader { "True" } else { "False" };
                format!("LCR_TOKEN:{score}:{ip}:{flag}")
            }
            WireMessage::PopStaleLeader { ip } => format!("POP_STALE_LEADER:{ip}"),
        }
    }
}
