// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dd_workerpool::queue::spool::SpoolDir;
use dd_workerpool::{CommandHandler, PidFile, PoolConfig, Supervisor};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Supervisor for a self-scaling pool of forked workers
#[derive(Parser, Debug)]
#[command(name = "dd-workerpool", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the pool and block until it is drained
    Run {
        /// Pool configuration file
        #[arg(long, env = "DD_WORKERPOOL_CONFIG")]
        config: PathBuf,
    },
    /// Enqueue items into a spool directory
    Push {
        #[arg(long)]
        spool: PathBuf,
        /// Item id; only valid with a single payload
        #[arg(long)]
        id: Option<String>,
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Print the number of pending items
    Len {
        #[arg(long)]
        spool: PathBuf,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Run { config } => run(&config),
        Command::Push {
            spool,
            id,
            payloads,
        } => {
            if id.is_some() && payloads.len() > 1 {
                bail!("--id can only be used with a single payload");
            }
            let spool = SpoolDir::new(spool);
            for payload in &payloads {
                let id = spool
                    .push(id.as_deref(), payload.as_bytes())
                    .with_context(|| format!("pushing into {}", spool.root().display()))?;
                println!("{id}");
            }
            Ok(())
        }
        Command::Len { spool } => {
            let spool = SpoolDir::new(spool);
            let len = spool
                .len()
                .with_context(|| format!("reading {}", spool.root().display()))?;
            println!("{len}");
            Ok(())
        }
    }
}

fn run(config_path: &Path) -> Result<()> {
    let config = PoolConfig::load(config_path)?;
    let level = dd_agent_log::parse_level(&config.log_level)
        .ok_or_else(|| anyhow!("unknown log_level {:?}", config.log_level))?;
    dd_agent_log::init("workerpool", level, config.log_file.as_deref())?;
    info!(
        "dd-workerpool starting (version {}, config {})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    let settings = config.settings()?;
    let spool = SpoolDir::new(&config.queue.spool_dir);
    spool
        .ensure()
        .with_context(|| format!("preparing spool {}", spool.root().display()))?;
    let handler = CommandHandler::from_config(&config.handler);

    let pidfile = config.pidfile.as_ref().map(PidFile::create).transpose()?;
    let result = Supervisor::new(settings, Arc::new(spool), Arc::new(handler)).start();
    drop(pidfile);

    let stats = result.context("worker pool failed")?;
    info!(
        "dd-workerpool stopped (forked={}, reboots={}, saturated_ticks={})",
        stats.forked, stats.reboots, stats.saturated_ticks
    );
    Ok(())
}
