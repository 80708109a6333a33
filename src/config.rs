//! Daemon configuration: CLI surface (`start`/`stop`) plus the env-overridable
//! defaults that shape the broker's runtime behavior.
//!
//! Grounded in the teacher's `forwarder::config` (documented defaults, one
//! struct per concern) and in `clap::Parser`-derived CLIs used elsewhere in
//! the example pack.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/agent-relay.sock";
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 1024 * 1024;
pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER: u32 = 6;
pub const DEFAULT_WRITE_QUEUE_CAP: usize = 2_000;
pub const DEFAULT_WRITE_QUEUE_HIGH: usize = 1_500;
pub const DEFAULT_WRITE_QUEUE_LOW: usize = 500;
pub const DEFAULT_PROCESSING_IDLE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PROCESSING_SNAPSHOT_INTERVAL_MS: u64 = 500;
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 5_000;
pub const DEFAULT_RESUME_TIMEOUT_MS: u64 = 5_000;

/// agent-relay — local Unix-socket message-relay broker for concurrent agent processes.
#[derive(Debug, Parser)]
#[command(name = "agent-relay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the broker daemon (foreground by default).
    Start {
        #[arg(long, env = "AGENT_RELAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,

        #[arg(long, env = "AGENT_RELAY_DB")]
        db: Option<PathBuf>,

        #[arg(long, env = "AGENT_RELAY_TEAM_DIR")]
        team_dir: Option<PathBuf>,

        #[arg(long, env = "AGENT_RELAY_HEARTBEAT_MS", default_value_t = DEFAULT_HEARTBEAT_MS)]
        heartbeat_ms: u64,

        #[arg(long, env = "AGENT_RELAY_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
        max_frame_bytes: u32,
    },
    /// Stop a running broker daemon (reads its PID file and signals it).
    Stop {
        #[arg(long, env = "AGENT_RELAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },
}

/// Fully-resolved runtime configuration for a single daemon instance.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub db_path: PathBuf,
    pub team_dir: PathBuf,
    pub max_frame_bytes: u32,
    pub heartbeat: Duration,
    pub heartbeat_timeout_multiplier: u32,
    pub write_queue_cap: usize,
    pub write_queue_high_watermark: usize,
    pub write_queue_low_watermark: usize,
    pub processing_idle_timeout: Duration,
    pub ack_timeout: Duration,
    pub processing_snapshot_interval: Duration,
    pub close_grace: Duration,
    pub resume_timeout: Duration,
}

impl RelayConfig {
    #[must_use]
    pub fn from_start_args(
        socket: PathBuf,
        db: Option<PathBuf>,
        team_dir: Option<PathBuf>,
        heartbeat_ms: u64,
        max_frame_bytes: u32,
    ) -> Self {
        let team_dir = team_dir.unwrap_or_else(|| {
            socket
                .parent()
                .map(std::path::Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        let db_path = db.unwrap_or_else(|| team_dir.join("relay.sqlite3"));
        let pid_path = socket.with_extension("pid");

        RelayConfig {
            socket_path: socket,
            pid_path,
            db_path,
            team_dir,
            max_frame_bytes,
            heartbeat: Duration::from_millis(heartbeat_ms),
            heartbeat_timeout_multiplier: DEFAULT_HEARTBEAT_TIMEOUT_MULTIPLIER,
            write_queue_cap: DEFAULT_WRITE_QUEUE_CAP,
            write_queue_high_watermark: DEFAULT_WRITE_QUEUE_HIGH,
            write_queue_low_watermark: DEFAULT_WRITE_QUEUE_LOW,
            processing_idle_timeout: Duration::from_millis(DEFAULT_PROCESSING_IDLE_TIMEOUT_MS),
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            processing_snapshot_interval: Duration::from_millis(
                DEFAULT_PROCESSING_SNAPSHOT_INTERVAL_MS,
            ),
            close_grace: Duration::from_millis(DEFAULT_CLOSE_GRACE_MS),
            resume_timeout: Duration::from_millis(DEFAULT_RESUME_TIMEOUT_MS),
        }
    }

    /// Heartbeat timeout: PONG must arrive within this window of the last one.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat * self.heartbeat_timeout_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_dir_defaults_to_socket_parent() {
        let cfg = RelayConfig::from_start_args(
            PathBuf::from("/run/agent-relay/relay.sock"),
            None,
            None,
            DEFAULT_HEARTBEAT_MS,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert_eq!(cfg.team_dir, PathBuf::from("/run/agent-relay"));
        assert_eq!(cfg.db_path, PathBuf::from("/run/agent-relay/relay.sqlite3"));
        assert_eq!(cfg.pid_path, PathBuf::from("/run/agent-relay/relay.pid"));
    }

    #[test]
    fn heartbeat_timeout_is_heartbeat_times_multiplier() {
        let cfg = RelayConfig::from_start_args(
            PathBuf::from("/tmp/agent-relay.sock"),
            None,
            None,
            5_000,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(30));
    }
}
