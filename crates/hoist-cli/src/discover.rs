//! `hoist discover`: print what service names resolve to.

use std::process::ExitCode;

use colored::Colorize;
use hoist_core::{Discovery, HoistConfig};

use crate::{srv_discovery, usage_error};

#[derive(Debug, clap::Args)]
pub struct DiscoverArgs {
    /// service names to resolve
    #[arg(required = true, num_args = 1..)]
    names: Vec<String>,
}

pub async fn run(cfg: &HoistConfig, args: &DiscoverArgs) -> ExitCode {
    let discovery = match srv_discovery(cfg) {
        Ok(d) => d,
        Err(e) => return usage_error(e),
    };
    if print_all(&discovery, &args.names).await == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Prints every name's members; returns how many names resolved to nothing.
async fn print_all(discovery: &dyn Discovery, names: &[String]) -> usize {
    let mut unresolved = 0;
    for name in names {
        let members = discovery.resolve(name).await;
        if members.is_empty() {
            println!("{} {}", name.bold(), "(no records)".yellow());
            unresolved += 1;
            continue;
        }
        println!("{}", name.bold());
        for ep in members {
            println!("  {ep}");
        }
    }
    unresolved
}
