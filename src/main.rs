#![allow(missing_docs)]

//! Straylight — governed autonomy kernel.
//!
//! Thin binary around the kernel facade: boots a persistent kernel,
//! or runs one-shot audit subcommands against the journal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use straylight::config::KernelConfig;
use straylight::kernel::events::EventStore;
use straylight::kernel::journal::AutonomyJournal;
use straylight::kernel::Kernel;

#[derive(Parser)]
#[command(name = "straylight", about = "Governed autonomy kernel", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the kernel and serve until interrupted.
    Start,
    /// Verify the hash chain of one request in the journal.
    VerifyChain {
        /// Request id to verify.
        #[arg(long)]
        request_id: Uuid,
    },
    /// Export expired audit rows as JSONL to stdout.
    ExportAudit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Start => start().await,
        Command::VerifyChain { request_id } => verify_chain(request_id),
        Command::ExportAudit => export_audit(),
    }
}

async fn start() -> Result<()> {
    let config = KernelConfig::load()?;
    let _guard = straylight::logging::init_production(std::path::Path::new(&config.paths.logs_dir))?;

    let (kernel, report) = Kernel::init_persistent(config).context("kernel init failed")?;
    for issue in &report.issues {
        tracing::warn!(field = %issue.field, "config issue: {}", issue.message);
    }
    info!("straylight kernel running; ctrl-c to stop");

    for health in kernel.health_report() {
        info!(
            component = %health.component,
            healthy = health.healthy,
            detail = %health.detail,
            "component health"
        );
    }

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    Ok(())
}

fn verify_chain(request_id: Uuid) -> Result<()> {
    straylight::logging::init_cli();
    let config = KernelConfig::load()?;
    let journal = AutonomyJournal::open(&config.paths.journal_db).context("open journal")?;

    let verification = journal
        .verify_chain(request_id)
        .context("chain verification")?;
    if verification.valid {
        println!("chain valid for request {request_id}");
    } else {
        println!(
            "chain BROKEN for request {request_id} at record {}",
            verification
                .first_broken_at
                .map(|i| i.to_string())
                .unwrap_or_else(|| "?".to_owned())
        );
        std::process::exit(1);
    }
    Ok(())
}

fn export_audit() -> Result<()> {
    straylight::logging::init_cli();
    let config = KernelConfig::load()?;
    let journal = AutonomyJournal::open(&config.paths.journal_db).context("open journal")?;

    let jsonl = journal
        .export_expired(chrono::Utc::now())
        .context("export expired audit rows")?;
    print!("{jsonl}");
    Ok(())
}
