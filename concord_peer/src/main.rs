//! `concord_peer`: one process participating in a Bully-election and
//! periodic majority-consensus multicast group.

use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use concord::{logger_init, Controller, RandomValue, Tunables, Transport};

const DEFAULT_VALUE_CEILING: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(name = "concord_peer", about = "Bully election + periodic majority consensus over multicast")]
struct Cli {
    /// This peer's PID. Larger PIDs outrank smaller ones in the Bully
    /// protocol; uniqueness within the group is the operator's job.
    #[arg(long)]
    id: u32,

    /// Informational only: logged at startup, never consulted by the
    /// protocol engine, since membership is discovered dynamically.
    #[arg(long)]
    nodes: Option<u32>,

    /// Multicast group address to join. Overrides the `multicast_grp`
    /// tunable from `--profile`/`--config` when given.
    #[arg(long)]
    group: Option<Ipv4Addr>,

    /// Multicast group port. Overrides the `multicast_port` tunable from
    /// `--profile`/`--config` when given.
    #[arg(long)]
    port: Option<u16>,

    /// Named tunable profile to start from.
    #[arg(long, default_value = "normal")]
    profile: String,

    /// Path to a TOML tunables overlay applied on top of `--profile`.
    #[arg(long)]
    config: Option<String>,

    /// Raise log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logger_init(cli.id);
    apply_verbosity(cli.verbose);

    let mut tunables = match Tunables::by_profile(&cli.profile) {
        Some(t) => t,
        None => {
            eprintln!("unknown profile '{}', expected slow|normal|fast", cli.profile);
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = &cli.config {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("failed to read config file {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = tunables.overlay_toml(&text) {
            eprintln!("failed to parse config file {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    }
    if let Some(group) = cli.group {
        tunables.multicast_grp = group;
    }
    if let Some(port) = cli.port {
        tunables.multicast_port = port;
    }

    log::info!(
        "<{}> starting peer (informational group size {:?}), joining {}:{}",
        cli.id,
        cli.nodes,
        tunables.multicast_grp,
        tunables.multicast_port
    );

    let transport = match concord::UdpMulticastTransport::bind(
        tunables.multicast_grp,
        tunables.multicast_port,
        tunables.multicast_ttl,
    )
    .await
    {
        Ok(t) => Arc::new(t) as Arc<dyn Transport>,
        Err(e) => {
            log::error!("<{}> failed to bind multicast transport: {}", cli.id, e);
            return ExitCode::FAILURE;
        }
    };
    let value_supplier = Arc::new(RandomValue::new(cli.id, DEFAULT_VALUE_CEILING));
    let controller = Controller::new(cli.id, tunables, transport, value_supplier);

    let shutdown_pid = controller.pid;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.blocking_send(());
    })
    .expect("failed to install Ctrl-C handler");

    tokio::select! {
        result = controller.run() => {
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    log::error!("<{}> peer exiting after fatal error: {}", shutdown_pid, e);
                    ExitCode::FAILURE
                }
            }
        }
        _ = shutdown_rx.recv() => {
            log::info!("<{}> received Ctrl-C, shutting down", shutdown_pid);
            ExitCode::SUCCESS
        }
    }
}

fn apply_verbosity(level: u8) {
    let filter = match level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", filter);
    }
}
