//! Command-line interface for warden.
//!
//! `serve` runs the operator and feeds it newline-delimited JSON envelopes
//! read from stdin. The other commands inspect or clean up local state.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::adapters::{EventBus, LocalBus, OsLauncher};
use crate::config::{self, OperatorConfig};
use crate::core::{purge_leftovers, Collaborators, Operator, ReattachCollection};
use crate::domain::{parse_tags, ExecutionContext, StateChange};

/// warden - local process orchestrator
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (overrides discovery)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the operator, reading state change envelopes (JSON lines) from stdin
    Serve {
        /// Stop all managed programs when input ends
        #[arg(long)]
        stop_on_exit: bool,
    },

    /// List processes recorded for reattachment
    List,

    /// Kill and forget processes left over by a previous run
    Purge,

    /// Show resolved configuration
    Config,

    /// Print the execution context id of a program
    Id {
        /// Binary name
        binary: String,

        /// Version
        version: String,

        /// Tags as key=value
        #[arg(short, long)]
        tag: Vec<String>,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = match &self.config {
            Some(path) => config::load_config_from(path)?,
            None => config::load_config()?,
        };

        match self.command {
            Commands::Serve { stop_on_exit } => serve(cfg, stop_on_exit).await,
            Commands::List => list_processes(&cfg),
            Commands::Purge => purge(&cfg).await,
            Commands::Config => show_config(&cfg),
            Commands::Id {
                binary,
                version,
                tag,
            } => {
                let tags = parse_tags(tag.iter().map(String::as_str))?;
                println!("{}", ExecutionContext::new(binary, version, tags));
                Ok(())
            }
        }
    }
}

async fn serve(cfg: OperatorConfig, stop_on_exit: bool) -> Result<()> {
    let collaborators = Collaborators::local(&cfg);
    let operator = Operator::new(cfg, collaborators).await?;

    let bus = LocalBus::new();
    operator.subscribe(&bus).await?;
    info!(topics = ?bus.topics().await, "Operator ready, reading envelopes from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<StateChange>(&line) {
                    Ok(envelope) => {
                        let delivered = bus.publish(envelope).await?;
                        if delivered == 0 {
                            warn!("Envelope had no subscribers");
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed envelope"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if stop_on_exit {
        let stopped = operator.stop_all().await?;
        info!(stopped, "Stopped managed programs");
    }

    Ok(())
}

fn list_processes(cfg: &OperatorConfig) -> Result<()> {
    let items = ReattachCollection::new(&cfg.reattach_path).items()?;

    if items.is_empty() {
        println!("No processes recorded");
        return Ok(());
    }

    println!("{:<8} {:<22} {}", "PID", "ADDRESS", "PROGRAM");
    println!("{}", "-".repeat(75));
    for item in items {
        println!(
            "{:<8} {:<22} {}",
            item.pid, item.network_address, item.execution_context
        );
    }

    Ok(())
}

async fn purge(cfg: &OperatorConfig) -> Result<()> {
    let reattach = ReattachCollection::new(&cfg.reattach_path);
    let launcher = OsLauncher::new(cfg.process.clone());

    let purged = purge_leftovers(&reattach, &launcher).await?;
    println!("Purged {} process(es)", purged);
    Ok(())
}

fn show_config(cfg: &OperatorConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Install:     {}", cfg.install_path.display());
    println!("  Downloads:   {}", cfg.download.target_directory.display());
    println!("  Artifacts:   {}", cfg.download.source_uri.display());
    println!("  Reattach:    {}", cfg.reattach_path.display());
    println!("  Config dir:  {}", cfg.config_dir.display());
    println!();
    println!(
        "Platform: {}/{}",
        cfg.download.platform.os, cfg.download.platform.arch
    );
    println!("Topics:   {}", cfg.topics.join(", "));
    println!();
    println!("Retry:");
    println!("  Enabled:      {}", cfg.retry.enabled);
    println!("  Max attempts: {}", cfg.retry.max_attempts);
    println!(
        "  Delay:        {}ms..{}ms (x{})",
        cfg.retry.initial_delay_ms, cfg.retry.max_delay_ms, cfg.retry.backoff_multiplier
    );
    println!("  Attempt timeout: {}ms", cfg.retry.attempt_timeout_ms);
    println!();
    println!("Processes:");
    println!(
        "  Ports:        {}-{}",
        cfg.process.min_port, cfg.process.max_port
    );
    println!("  Stop timeout: {}ms", cfg.process.stop_timeout_ms);
    println!(
        "  Restarts:     {} per {}s",
        cfg.restart.max_restarts, cfg.restart.window_seconds
    );
    println!(
        "  Monitoring:   {} (logs: {}, metrics: {})",
        cfg.monitoring.enabled, cfg.monitoring.logs, cfg.monitoring.metrics
    );

    Ok(())
}
