//! hoist: operator tool for moving the primary role in a replicated
//! key-value cluster.
//!
//! `promote` runs a fenced promotion, `discover` prints what a service name
//! resolves to, and `counter` is a write-durability harness to run while
//! the cluster is being disturbed.

mod counter;
mod discover;
mod promote;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use hoist_core::{HoistConfig, SrvDiscovery};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exit code for invalid invocations, matching clap's own.
const USAGE_EXIT: u8 = 2;

/// Exit code after a forced second interrupt, the shell's 128 + SIGINT.
const INTERRUPT_EXIT: i32 = 130;

#[derive(Parser)]
#[command(name = "hoist", version, about)]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "HOIST_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// port assumed for addresses given without one
    #[arg(short, long, env = "HOIST_PORT", global = true)]
    port: Option<u16>,

    /// password for AUTH on every node
    #[arg(short = 'a', long, env = "HOIST_PASSWORD", global = true)]
    password: Option<String>,

    /// comma-separated name servers for discovery
    #[arg(short = 'n', long, env = "HOIST_NAMESERVERS", value_delimiter = ',', global = true)]
    nameservers: Vec<String>,

    /// comma-separated search domains for discovery
    #[arg(short = 's', long, env = "HOIST_SEARCH", value_delimiter = ',', global = true)]
    search: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Promote a member to primary and re-parent the rest under it.
    Promote(promote::PromoteArgs),

    /// Resolve service names and print their members.
    Discover(discover::DiscoverArgs),

    /// Push unique values to the primary and report which survived.
    Counter(counter::CounterArgs),
}

/// Applies global CLI overrides. Only values actually given take effect,
/// which keeps the order: defaults, then file, then env and flags.
fn apply_args(cfg: &mut HoistConfig, args: &Args) {
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(ref pass) = args.password {
        cfg.password = pass.clone();
    }
    if !args.nameservers.is_empty() {
        cfg.dns.nameservers = args.nameservers.clone();
    }
    if !args.search.is_empty() {
        cfg.dns.search = args.search.clone();
    }
}

/// Prints a usage problem and returns the usage exit code.
pub(crate) fn usage_error(msg: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}", format!("error: {msg}").red());
    ExitCode::from(USAGE_EXIT)
}

/// Prints a runtime failure and returns a failing exit code.
pub(crate) fn failure(msg: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}", format!("error: {msg}").red());
    ExitCode::FAILURE
}

pub(crate) fn srv_discovery(cfg: &HoistConfig) -> Result<SrvDiscovery, String> {
    let nameservers = cfg.nameserver_ips()?;
    SrvDiscovery::with_servers(&nameservers, &cfg.dns.search).map_err(|e| e.to_string())
}

/// Cancels `token` on the first Ctrl-C and exits on the second, so an
/// interrupt still ends the process if a node has stopped answering.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, cancelling (Ctrl-C again to exit now)");
        token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "error: interrupted".red());
            std::process::exit(INTERRUPT_EXIT);
        }
    });
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoist=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        return match HoistConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                ExitCode::SUCCESS
            }
            Err(e) => failure(format!("failed to generate config template: {e}")),
        };
    }

    let Some(ref command) = args.command else {
        return usage_error("missing subcommand (try --help)");
    };

    // defaults, then TOML file, then CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => match HoistConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => return usage_error(e),
        },
        None => HoistConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Command::Promote(ref p) = command {
        promote::apply_args(&mut cfg, p);
    }
    if let Err(e) = cfg.validate() {
        return usage_error(format!("invalid configuration: {e}"));
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => return failure(format!("failed to create runtime: {e}")),
    };

    rt.block_on(async {
        let cancel = CancellationToken::new();
        cancel_on_interrupt(cancel.clone());

        match command {
            Command::Promote(p) => promote::run(&cfg, p, cancel).await,
            Command::Discover(d) => discover::run(&cfg, d).await,
            Command::Counter(c) => counter::run(&cfg, c, cancel).await,
        }
    })
}
