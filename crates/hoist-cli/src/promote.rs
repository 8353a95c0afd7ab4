//! `hoist promote`: fenced primary promotion.

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use hoist_core::{
    plan_from_service, ConfirmMethod, ConfirmPolicy, Discovery, Endpoint, HoistConfig,
    PromotionOrchestrator, PromotionPlan, PromotionReport,
};
use tokio_util::sync::CancellationToken;

use crate::{failure, srv_discovery, usage_error};

#[derive(Debug, clap::Args)]
pub struct PromoteArgs {
    /// members as host[:port]. the first one becomes the new primary
    #[arg(required_unless_present = "discover", conflicts_with = "discover")]
    nodes: Vec<String>,

    /// resolve members from this service name instead of listing them
    #[arg(long)]
    discover: Option<String>,

    /// new primary as host[:port], when members come from --discover
    #[arg(long, requires = "discover", conflicts_with = "primary_name")]
    primary: Option<String>,

    /// resolve the new primary from this member name
    #[arg(long, requires = "discover")]
    primary_name: Option<String>,

    /// how to confirm re-parented nodes: rendezvous or replica-list
    #[arg(long, env = "HOIST_CONFIRM_METHOD")]
    confirm_method: Option<ConfirmMethod>,

    /// what an unconfirmed node means: best-effort or strict
    #[arg(long, env = "HOIST_CONFIRM_POLICY")]
    confirm_policy: Option<ConfirmPolicy>,

    /// seconds to wait for old primaries to flush. 0 waits indefinitely
    #[arg(long, env = "HOIST_FLUSH_TIMEOUT")]
    flush_timeout: Option<u64>,

    /// seconds to wait for each node to attach. 0 waits indefinitely
    #[arg(long, env = "HOIST_CONFIRM_TIMEOUT")]
    confirm_timeout: Option<u64>,

    /// pub/sub channel for the attach handshake
    #[arg(long, env = "HOIST_CHANNEL")]
    channel: Option<String>,
}

pub fn apply_args(cfg: &mut HoistConfig, args: &PromoteArgs) {
    if let Some(method) = args.confirm_method {
        cfg.confirm_method = method;
    }
    if let Some(policy) = args.confirm_policy {
        cfg.confirm_policy = policy;
    }
    if let Some(secs) = args.flush_timeout {
        cfg.flush_timeout_secs = secs;
    }
    if let Some(secs) = args.confirm_timeout {
        cfg.confirm_timeout_secs = secs;
    }
    if let Some(ref channel) = args.channel {
        cfg.channel = channel.clone();
    }
}

/// Parses an explicit member list; the first entry is the new primary.
fn explicit_plan(nodes: &[String], default_port: u16) -> Result<PromotionPlan, String> {
    let members = nodes
        .iter()
        .map(|n| {
            Endpoint::parse(n, default_port).map_err(|e| format!("invalid address '{n}': {e}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let designated = members
        .first()
        .cloned()
        .ok_or_else(|| "no members given".to_string())?;
    Ok(PromotionPlan::new(members, designated))
}

async fn discovered_plan(
    discovery: &dyn Discovery,
    service: &str,
    args: &PromoteArgs,
    default_port: u16,
) -> Result<PromotionPlan, String> {
    let designated = match (&args.primary, &args.primary_name) {
        (Some(addr), _) => Endpoint::parse(addr, default_port)
            .map_err(|e| format!("invalid address '{addr}': {e}"))?,
        (None, Some(name)) => discovery
            .resolve_one(name)
            .await
            .ok_or_else(|| format!("could not resolve primary '{name}'"))?,
        (None, None) => return Err("--discover needs --primary or --primary-name".into()),
    };
    plan_from_service(discovery, service, designated)
        .await
        .map_err(|e| e.to_string())
}

pub async fn run(cfg: &HoistConfig, args: &PromoteArgs, cancel: CancellationToken) -> ExitCode {
    let plan = match &args.discover {
        Some(service) => {
            let discovery = match srv_discovery(cfg) {
                Ok(d) => d,
                Err(e) => return usage_error(e),
            };
            match discovered_plan(&discovery, service, args, cfg.port).await {
                Ok(plan) => plan,
                Err(e) => return failure(e),
            }
        }
        None => match explicit_plan(&args.nodes, cfg.port) {
            Ok(plan) => plan,
            Err(e) => return usage_error(e),
        },
    };

    println!(
        ">>> promoting {} over {} members",
        plan.designated,
        plan.members.len()
    );

    let mut orchestrator =
        PromotionOrchestrator::new(Arc::new(cfg.connector()), cfg.promotion_options())
            .with_cancellation(cancel)
            .with_progress(|line| println!(">>> {line}"));

    match orchestrator.run(&plan).await {
        Ok(report) => print_report(&report),
        Err(e) => failure(e),
    }
}

/// Prints the outcome. Exits non-zero only if some node is still fenced.
fn print_report(report: &PromotionReport) -> ExitCode {
    println!("{}", format!(">>> {} is primary", report.new_primary).green());
    for ep in &report.confirmed {
        println!("  {} {ep}", "attached".green());
    }
    for (ep, reason) in &report.unconfirmed {
        println!("  {} {ep}: {}", "unconfirmed".yellow(), reason.dimmed());
    }
    for (ep, reason) in &report.persist_failures {
        println!("  {} {ep}: {}", "config not persisted".yellow(), reason.dimmed());
    }
    for (ep, reason) in &report.unfence_failures {
        println!("  {} {ep}: {}", "still fenced".red(), reason.dimmed());
    }

    if report.unfence_failures.is_empty() {
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "{}",
            "some nodes still reject writes; restore min-replicas-to-write by hand".red()
        );
        ExitCode::FAILURE
    }
}
