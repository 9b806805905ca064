use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trackrec_core::{decision_table, MatchFlag};
use trackrec_sync::{load_catalog, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "trackrec")]
#[command(about = "Reconcile a shipment sheet against carrier tracking pages")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass over the sheet.
    Sync(SyncArgs),
    /// Show how raw status texts normalize.
    Explain {
        #[arg(required = true)]
        texts: Vec<String>,
    },
    /// Print the compiled catalog and the decision table.
    Catalog,
    /// Run passes on the configured cron schedule until Ctrl-C.
    Schedule,
}

/// Flags override the matching `TRACKREC_*` variables.
#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    carrier: Option<String>,
    #[arg(long)]
    sheet: Option<PathBuf>,
    #[arg(long)]
    start_row: Option<u32>,
    #[arg(long)]
    end_row: Option<u32>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    rps: Option<f64>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long)]
    retries: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    pause_secs: Option<u64>,
    #[arg(long)]
    only_pending: bool,
    #[arg(long)]
    dry_run: bool,
    /// Continue after the row saved by the last interrupted run.
    #[arg(long)]
    resume: bool,
}

impl SyncArgs {
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(carrier) = self.carrier {
            config.carrier = carrier;
        }
        if let Some(sheet) = self.sheet {
            config.sheet_path = sheet;
        }
        if let Some(start_row) = self.start_row {
            config.window.start_row = start_row;
        }
        if self.end_row.is_some() {
            config.window.end_row = self.end_row;
        }
        if self.limit.is_some() {
            config.window.limit = self.limit;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(rps) = self.rps {
            config.rate_per_second = rps;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(secs) = self.pause_secs {
            config.batch_pause = Duration::from_secs(secs);
        }
        config.only_pending |= self.only_pending;
        config.dry_run |= self.dry_run;
        config.resume |= self.resume;
        config
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight fetches");
            token.cancel();
        }
    });
    cancel
}

async fn sync(args: SyncArgs) -> Result<()> {
    let config = args.apply(SyncConfig::from_env());
    let pipeline = SyncPipeline::new(config).await?;
    let summary = pipeline.run_once(&cancel_on_ctrl_c()).await?;
    println!(
        "sync complete: run_id={} rows={} success={} exhausted={} pending={} skipped={} alerts={} cells={} reports={}",
        summary.run_id,
        summary.rows_read,
        summary.outcomes.success,
        summary.outcomes.exhausted,
        summary.outcomes.pending,
        summary.outcomes.skipped,
        summary.alerts,
        summary.write_back.flush.cells_written,
        summary.reports_dir
    );
    if summary.cancelled && !summary.dry_run {
        println!("run interrupted; `trackrec sync --resume` continues after the last settled batch");
    }
    if let Some(row) = summary.resumed_from {
        println!("resumed from row {row}");
    }
    if summary.dry_run {
        println!("dry run: {} cells planned, none written", summary.write_back.planned_cells);
    }
    for failure in &summary.write_back.flush.failures {
        warn!(chunk = failure.chunk_index, ranges = ?failure.ranges, error = %failure.error, "write-back chunk failed");
    }
    Ok(())
}

fn explain(texts: &[String]) -> Result<()> {
    let (catalog, _) = load_catalog(&SyncConfig::from_env())?;
    for text in texts {
        let explanation = catalog.explain(text);
        println!(
            "{:<14} via={:<9} fragment={:<24} {:?}",
            explanation.status.as_str(),
            explanation.via.as_str(),
            explanation.fragment.as_deref().unwrap_or("-"),
            text
        );
    }
    Ok(())
}

fn catalog() -> Result<()> {
    let (catalog, fingerprint) = load_catalog(&SyncConfig::from_env())?;
    println!("fingerprint: {fingerprint}");
    println!("overrides: {}", catalog.override_count());
    println!("keyword precedence:");
    for status in catalog.precedence() {
        let fragments: Vec<&str> = catalog
            .fragments()
            .filter(|(owner, _)| owner == status)
            .map(|(_, fragment)| fragment)
            .collect();
        println!("  {:<14} {}", status.as_str(), fragments.join(", "));
    }

    println!("decisions (source, scraped -> match, alert, can_query):");
    for (source, scraped, decision) in decision_table() {
        let flag = match decision.match_flag {
            MatchFlag::Unknown => "-",
            other => other.as_cell(),
        };
        println!(
            "  {:<14} {:<14} {:<5} {:<5} {}",
            source.as_str(),
            scraped.map(|s| s.as_str()).unwrap_or("(unfetched)"),
            flag,
            decision.alert,
            decision.can_query
        );
    }
    Ok(())
}

async fn schedule() -> Result<()> {
    let config = SyncConfig {
        scheduler_enabled: true,
        ..SyncConfig::from_env()
    };
    let cron = config.cron.clone();
    let pipeline = Arc::new(SyncPipeline::new(config).await?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started; Ctrl-C stops it");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await?,
        Commands::Explain { texts } => explain(&texts)?,
        Commands::Catalog => catalog()?,
        Commands::Schedule => schedule().await?,
    }

    Ok(())
}
