//! `hoist counter`: a write-durability harness.
//!
//! Pushes unique values onto a list while the operator disturbs the
//! cluster (promotions, restarts, partitions), then reads the list back
//! and reports acknowledged writes that went missing and failed writes
//! that landed anyway.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use hoist_core::{Connector, Discovery, Endpoint, HoistConfig, Session};
use hoist_protocol::Frame;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{failure, srv_discovery, usage_error};

#[derive(Debug, clap::Args)]
pub struct CounterArgs {
    /// primary as host[:port]
    #[arg(long, required_unless_present = "service", conflicts_with = "service")]
    host: Option<String>,

    /// SRV name that resolves to the current primary; re-resolved on reconnect
    #[arg(long, env = "COUNTER_SERVICE")]
    service: Option<String>,

    /// list key to push onto
    #[arg(long, env = "COUNTER_KEY", default_value = "debug:counter:stack")]
    key: String,

    /// number of values to push
    #[arg(long, env = "COUNTER_COUNT", default_value_t = 1000)]
    count: usize,

    /// milliseconds between pushes
    #[arg(long, env = "COUNTER_INTERVAL", default_value_t = 0)]
    interval: u64,

    /// delete the key before starting
    #[arg(long)]
    clear: bool,

    /// run straight through without waiting for ENTER between phases
    #[arg(long)]
    no_prompt: bool,
}

/// Where the primary is: fixed, or looked up again on every connect.
enum Target<'a> {
    Fixed(Endpoint),
    Service(&'a dyn Discovery, String),
}

impl Target<'_> {
    async fn locate(&self) -> Result<Endpoint, String> {
        match self {
            Target::Fixed(ep) => Ok(ep.clone()),
            Target::Service(discovery, name) => discovery
                .resolve_one(name)
                .await
                .ok_or_else(|| format!("could not resolve '{name}'")),
        }
    }
}

async fn connect<C: Connector>(connector: &C, target: &Target<'_>) -> Result<C::Session, String> {
    let endpoint = target.locate().await?;
    let session = connector
        .connect(&endpoint)
        .await
        .map_err(|e| format!("{endpoint}: {e}"))?;
    info!(%endpoint, "connected to primary");
    Ok(session)
}

/// Issues a command, treating error replies as failures.
async fn call<S: Session>(session: &mut S, args: &[&str]) -> Result<Frame, String> {
    match session.call(args).await {
        Ok(Frame::Error(e)) => Err(e),
        Ok(frame) => Ok(frame),
        Err(e) => Err(e.to_string()),
    }
}

/// Values whose push was acknowledged, and values whose push failed.
#[derive(Debug, Default)]
struct Pushed {
    acked: Vec<String>,
    errored: Vec<String>,
}

async fn push_values<C: Connector>(
    connector: &C,
    target: &Target<'_>,
    args: &CounterArgs,
    cancel: &CancellationToken,
) -> Pushed {
    let interval = Duration::from_millis(args.interval);
    let mut pushed = Pushed::default();
    let mut session = match connect(connector, target).await {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("connect failed: {e}");
            None
        }
    };

    for _ in 0..args.count {
        if cancel.is_cancelled() {
            warn!(pushed = pushed.acked.len() + pushed.errored.len(), "stopping early");
            break;
        }

        let value = Uuid::new_v4().to_string();
        let result = match session.as_mut() {
            Some(s) => call(s, &["RPUSH", &args.key, &value]).await,
            None => Err("not connected".to_string()),
        };
        match result {
            Ok(_) => {
                info!(%value, "ack");
                pushed.acked.push(value);
            }
            Err(e) => {
                warn!(%value, "err: {e}");
                pushed.errored.push(value);
                info!("reconnecting");
                session = match connect(connector, target).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!("reconnect failed: {e}");
                        None
                    }
                };
            }
        }

        if !interval.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
    pushed
}

async fn read_back<C: Connector>(
    connector: &C,
    target: &Target<'_>,
    key: &str,
) -> Result<Vec<String>, String> {
    let mut session = connect(connector, target).await?;
    match call(&mut session, &["LRANGE", key, "0", "-1"]).await? {
        Frame::Array(items) => Ok(items
            .iter()
            .filter_map(|f| f.as_text().map(str::to_owned))
            .collect()),
        Frame::Null => Ok(Vec::new()),
        other => Err(format!("LRANGE returned {other:?}")),
    }
}

/// How the persisted list compares with what was pushed.
#[derive(Debug, PartialEq, Eq)]
struct Tally {
    acked: usize,
    missing: Vec<String>,
    errored: usize,
    phantom: Vec<String>,
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ack'd: {} ({} missing) err'd: {} ({} phantom)",
            self.acked,
            self.missing.len(),
            self.errored,
            self.phantom.len()
        )
    }
}

fn reconcile(acked: &[String], errored: &[String], persisted: &[String]) -> Tally {
    let persisted: HashSet<&str> = persisted.iter().map(String::as_str).collect();
    Tally {
        acked: acked.len(),
        missing: acked
            .iter()
            .filter(|v| !persisted.contains(v.as_str()))
            .cloned()
            .collect(),
        errored: errored.len(),
        phantom: errored
            .iter()
            .filter(|v| persisted.contains(v.as_str()))
            .cloned()
            .collect(),
    }
}

/// Waits for one line on `input`. Both prompts share one reader so
/// nothing buffered past the first line is lost.
async fn prompt<R: AsyncBufRead + Unpin>(input: &mut R, msg: &str) {
    println!("{msg}");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if let Err(e) = input.read_line(&mut line).await {
        warn!("reading stdin: {e}");
    }
}

pub async fn run(cfg: &HoistConfig, args: &CounterArgs, cancel: CancellationToken) -> ExitCode {
    let discovery = match &args.service {
        Some(_) => match srv_discovery(cfg) {
            Ok(d) => Some(d),
            Err(e) => return usage_error(e),
        },
        None => None,
    };
    let target = match (&args.host, &args.service, &discovery) {
        (Some(addr), _, _) => match Endpoint::parse(addr, cfg.port) {
            Ok(ep) => Target::Fixed(ep),
            Err(e) => return usage_error(format!("invalid address '{addr}': {e}")),
        },
        (None, Some(name), Some(d)) => Target::Service(d, name.clone()),
        _ => return usage_error("--host or --service is required"),
    };
    let connector = cfg.connector();

    if args.clear {
        let cleared = match connect(&connector, &target).await {
            Ok(mut s) => call(&mut s, &["DEL", &args.key]).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = cleared {
            return failure(format!("clearing {}: {e}", args.key));
        }
        info!(key = %args.key, "cleared");
    }

    let mut stdin = BufReader::new(tokio::io::stdin());
    if !args.no_prompt {
        prompt(&mut stdin, "Okay, start trashing the cluster and then press ENTER").await;
    }
    let pushed = push_values(&connector, &target, args, &cancel).await;

    if !args.no_prompt {
        prompt(&mut stdin, "Okay, stop trashing the cluster and then press ENTER").await;
    }
    let persisted = match read_back(&connector, &target, &args.key).await {
        Ok(values) => values,
        Err(e) => return failure(format!("reading back {}: {e}", args.key)),
    };

    let tally = reconcile(&pushed.acked, &pushed.errored, &persisted);
    for v in &tally.missing {
        warn!(value = %v, "ack'd value missing from persisted set");
    }
    for v in &tally.phantom {
        warn!(value = %v, "err'd value phantom in persisted set");
    }
    println!("{tally}");

    if tally.missing.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
