//! Runtime configuration for a farm node.
//!
//! Every node runs the same binary with the same defaults; the knobs exist
//! so multi-node setups on one host (tests, demos) can pick distinct ports
//! and job roots. Values come from CLI flags or environment variables
//! (`.env` is loaded by the binary before parsing).

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// UDP port carrying discovery beacons and election tokens.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;
/// TCP port of the leader-hosted control-message sequencer.
pub const DEFAULT_SEQUENCER_PORT: u16 = 8890;
/// HTTP port of the node API.
pub const DEFAULT_HTTP_PORT: u16 = 5050;

/// Interval between presence beacons.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(3);
/// Interval between stale-peer sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
/// A peer not heard from for this long is considered gone.
pub const STALE_AFTER: Duration = Duration::from_secs(10);
/// Resource score is recomputed at most this often.
pub const SCORE_REFRESH: Duration = Duration::from_secs(10);
/// Delay between ELECTION_INIT broadcast and the first candidate token, so
/// peers have reset their election state before tokens arrive.
pub const ELECTION_SETTLE: Duration = Duration::from_millis(500);
/// Interval of the jobs-root scanner that auto-broadcasts created jobs.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(2);
/// Timeout for node-to-node HTTP calls.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Parser)]
#[command(name = "farm_server", about = "Distributed render farm node")]
pub struct Config {
    /// Node display name; defaults to the hostname.
    #[arg(long, env = "FARM_NODE_NAME")]
    pub node_name: Option<String>,

    /// Explicit node IP; defaults to the primary local address.
    #[arg(long, env = "FARM_NODE_IP")]
    pub node_ip: Option<Ipv4Addr>,

    /// HTTP API port.
    #[arg(long, env = "FARM_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub http_port: u16,

    /// UDP discovery/election port.
    #[arg(long, env = "FARM_DISCOVERY_PORT", default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    /// TCP sequencer port (used by whichever node is leader).
    #[arg(long, env = "FARM_SEQUENCER_PORT", default_value_t = DEFAULT_SEQUENCER_PORT)]
    pub sequencer_port: u16,

    /// Root directory for job state and render artifacts.
    #[arg(long, env = "FARM_JOBS_DIR", default_value = "jobs")]
    pub jobs_dir: PathBuf,

    /// Blender binary used to render frames.
    #[arg(long, env = "BLENDER_PATH", default_value = "blender")]
    pub blender_path: PathBuf,

    /// ffmpeg binary used to stitch frames into a video.
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg_path: PathBuf,
}

impl Config {
    /// Resolve the node name, falling back to the hostname and finally to a
    /// fixed placeholder so identity is always printable.
    pub fn resolved_name(&self) -> String {
        self.node_name
            .clone()
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "farm-node".to_string())
    }

    /// Resolve the node IP. Falls back to loopback when the host has no
    /// routable address, which keeps single-machine setups working.
    pub fn resolved_ip(&self) -> Ipv4Addr {
        if let Some(ip) = self.node_ip {
            return ip;
        }
        match local_ip_address::local_ip() {
            Ok(std::net::IpAddr::V4(ip)) => ip,
            _ => Ipv4Addr::LOCALHOST,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_name: None,
            node_ip: None,
            http_port: DEFAULT_HTTP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            sequencer_port: DEFAULT_SEQUENCER_PORT,
            jobs_dir: PathBuf::from("jobs"),
            blender_path: PathBuf::from("blender"),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}
