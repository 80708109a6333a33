//! agent-relay binary: `start` runs the broker in the foreground, `stop`
//! signals a running instance via its PID file.

use clap::Parser;

use agent_relay::config::{Cli, Command, RelayConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Start {
            socket,
            db,
            team_dir,
            heartbeat_ms,
            max_frame_bytes,
        } => {
            let config = RelayConfig::from_start_args(socket, db, team_dir, heartbeat_ms, max_frame_bytes);
            run_start(config)
        }
        Command::Stop { socket } => run_stop(&socket),
    };

    std::process::exit(exit_code);
}

fn run_start(config: RelayConfig) -> i32 {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.socket_path.display(),
        "agent-relay starting"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: failed to start async runtime: {e}");
            return 2;
        }
    };

    match runtime.block_on(agent_relay::server::run(config)) {
        Ok(()) => 0,
        Err(e @ agent_relay::server::ServerError::Storage(_)) => {
            eprintln!("FATAL: {e}");
            2
        }
        Err(e) => {
            eprintln!("FATAL: {e}");
            1
        }
    }
}

fn run_stop(socket: &std::path::Path) -> i32 {
    match agent_relay::server::stop(socket) {
        Ok(()) => {
            tracing::info!(socket = %socket.display(), "stop signal sent");
            0
        }
        Err(e) => {
            eprintln!("failed to stop broker at {}: {e}", socket.display());
            1
        }
    }
}
