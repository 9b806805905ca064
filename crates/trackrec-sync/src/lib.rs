//! Reconciliation pipeline: configuration, batched fetch runs, write-back,
//! audit trail, run reports and the optional cron schedule.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use trackrec_adapters::{fetcher_for_carrier, CarrierRegistry};
use trackrec_core::{CanonicalStatus, StatusCatalog, TrackingRecord};
use trackrec_fetch::{
    Backoff, DispatchConfig, Dispatcher, Fetcher, RetryPolicy, MIN_RATE_PER_SECOND,
};
use uuid::Uuid;

pub mod audit;
pub mod batch;
pub mod checkpoint;
pub mod store;
pub mod writeback;

use audit::{AuditEntry, JsonlAuditLog, UnmappedCurator};
use batch::{BatchHook, BatchOrchestrator, BatchReport, BatchSettings, RecordOutcome, RecordResult};
use checkpoint::Checkpoint;
use store::{JsonSheetStore, RecordSink, RecordSource, RowCells, RowWindow};
use writeback::{flush_plan, plan_writes, FlushReport, RowChange, WriteLimits};

pub const CRATE_NAME: &str = "trackrec-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub sheet_path: PathBuf,
    pub carrier: String,
    pub concurrency: usize,
    pub rate_per_second: f64,
    pub timeout: Duration,
    pub retries: usize,
    pub retry_base_delay: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub only_pending: bool,
    pub dry_run: bool,
    /// Start after the row recorded by the last interrupted run.
    pub resume: bool,
    pub window: RowWindow,
    /// Keyword precedence as canonical codes; empty keeps the declared order.
    pub status_precedence: Vec<String>,
    pub write_limits: WriteLimits,
    pub scheduler_enabled: bool,
    pub cron: String,
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn truthy(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset or unparsable
    /// values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            workspace_root: get("TRACKREC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            sheet_path: get("TRACKREC_SHEET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/sheet.json")),
            carrier: get("TRACKREC_CARRIER").unwrap_or_else(|| "interrapidisimo".to_string()),
            concurrency: parse_or(get("TRACKREC_CONCURRENCY"), 3),
            rate_per_second: parse_or(get("TRACKREC_RPS"), 0.8),
            timeout: Duration::from_secs(parse_or(get("TRACKREC_TIMEOUT_SECS"), 30)),
            retries: parse_or(get("TRACKREC_RETRIES"), 2),
            retry_base_delay: Duration::from_millis(parse_or(get("TRACKREC_RETRY_BASE_MS"), 500)),
            batch_size: parse_or(get("TRACKREC_BATCH_SIZE"), 500),
            batch_pause: Duration::from_secs(parse_or(get("TRACKREC_BATCH_PAUSE_SECS"), 0)),
            only_pending: truthy(get("TRACKREC_ONLY_PENDING")),
            dry_run: truthy(get("TRACKREC_DRY_RUN")),
            resume: truthy(get("TRACKREC_RESUME")),
            window: RowWindow {
                start_row: parse_or(get("TRACKREC_START_ROW"), store::FIRST_DATA_ROW),
                end_row: get("TRACKREC_END_ROW").and_then(|v| v.trim().parse().ok()),
                limit: get("TRACKREC_LIMIT").and_then(|v| v.trim().parse().ok()),
            },
            status_precedence: get("TRACKREC_STATUS_PRECEDENCE")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            write_limits: WriteLimits::default(),
            scheduler_enabled: truthy(get("TRACKREC_SCHEDULER_ENABLED")),
            cron: get("TRACKREC_CRON").unwrap_or_else(|| "0 0 7 * * *".to_string()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "concurrency must be at least 1");
        ensure!(self.batch_size > 0, "batch size must be at least 1");
        ensure!(
            self.rate_per_second.is_finite() && self.rate_per_second >= MIN_RATE_PER_SECOND,
            "rate budget must be at least one request per day, got {} per second",
            self.rate_per_second
        );
        ensure!(!self.timeout.is_zero(), "fetch timeout must be positive");
        ensure!(
            self.window.start_row >= store::FIRST_DATA_ROW,
            "start row must be {} or later (row {} is the header)",
            store::FIRST_DATA_ROW,
            store::HEADER_ROW
        );
        if let Some(end_row) = self.window.end_row {
            ensure!(
                end_row >= self.window.start_row,
                "end row {end_row} precedes start row {}",
                self.window.start_row
            );
        }
        if self.window.limit == Some(0) {
            bail!("row limit must be at least 1 when set");
        }
        ensure!(!self.carrier.trim().is_empty(), "carrier id must not be empty");
        self.precedence()?;
        Ok(())
    }

    pub fn precedence(&self) -> Result<Vec<CanonicalStatus>> {
        self.status_precedence
            .iter()
            .map(|code| {
                code.parse::<CanonicalStatus>()
                    .with_context(|| format!("invalid status in precedence order: {code}"))
            })
            .collect()
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn keywords_path(&self) -> PathBuf {
        self.workspace_root.join("mappings").join("status_keywords.json")
    }

    pub fn overrides_path(&self) -> PathBuf {
        self.workspace_root.join("mappings").join("status_overrides.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace_root.join("logs")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.logs_dir().join("checkpoint.json")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retries,
            backoff: Backoff::Exponential {
                base: self.retry_base_delay,
                max: self.retry_base_delay.saturating_mul(16),
            },
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            concurrency: self.concurrency,
            rate_per_second: Some(self.rate_per_second),
            burst: 1,
            timeout: self.timeout,
            retry: self.retry_policy(),
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch_size,
            pause: self.batch_pause,
            only_pending: self.only_pending,
        }
    }
}

/// SHA-256 over both mapping documents, identifying the catalog a run used.
pub fn catalog_fingerprint(keywords: &[u8], overrides: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(keywords);
    hasher.update([0u8]);
    hasher.update(overrides);
    hex::encode(hasher.finalize())
}

/// Loads and compiles the mapping documents. Any malformed entry is fatal.
pub fn load_catalog(config: &SyncConfig) -> Result<(StatusCatalog, String)> {
    let keywords_path = config.keywords_path();
    let overrides_path = config.overrides_path();
    let keywords = std::fs::read_to_string(&keywords_path)
        .with_context(|| format!("reading {}", keywords_path.display()))?;
    let overrides = std::fs::read_to_string(&overrides_path)
        .with_context(|| format!("reading {}", overrides_path.display()))?;
    let catalog = StatusCatalog::from_documents(&keywords, &overrides)
        .context("compiling status catalog")?
        .with_precedence(&config.precedence()?)
        .context("applying status precedence")?;
    let fingerprint = catalog_fingerprint(keywords.as_bytes(), overrides.as_bytes());
    Ok((catalog, fingerprint))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub pending: usize,
    pub exhausted: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    fn tally(results: &[RecordResult]) -> Self {
        let mut counts = Self::default();
        for result in results {
            match result.outcome {
                RecordOutcome::Success => counts.success += 1,
                RecordOutcome::Pending => counts.pending += 1,
                RecordOutcome::Exhausted => counts.exhausted += 1,
                RecordOutcome::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteBackTotals {
    pub planned_rows: usize,
    pub planned_cells: usize,
    pub planned_chunks: usize,
    pub excluded_rows: usize,
    pub flush: FlushReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub carrier: String,
    pub dry_run: bool,
    pub cancelled: bool,
    /// First row read when the window was moved forward by a checkpoint.
    pub resumed_from: Option<u32>,
    pub rows_read: usize,
    pub batches: Vec<BatchReport>,
    pub outcomes: OutcomeCounts,
    pub alerts: usize,
    pub write_back: WriteBackTotals,
    pub unmapped_statuses: usize,
    pub catalog_fingerprint: String,
    pub reports_dir: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    catalog: StatusCatalog,
    catalog_fingerprint: String,
    dispatcher: Dispatcher,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    audit: JsonlAuditLog,
    run_lock: tokio::sync::Mutex<()>,
}

impl SyncPipeline {
    /// Wires the pipeline from configuration: mapping documents, carrier
    /// registry and the JSON sheet.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let (catalog, fingerprint) = load_catalog(&config)?;
        let registry = CarrierRegistry::load(config.workspace_root.join("carriers.yaml"))
            .context("loading carrier registry")?;
        let fetcher = fetcher_for_carrier(&registry, &config.carrier, &config.workspace_root)
            .with_context(|| format!("building fetcher for carrier {}", config.carrier))?;
        let sheet_path = config.resolve(&config.sheet_path);
        let store = Arc::new(
            JsonSheetStore::open(&sheet_path)
                .await
                .with_context(|| format!("opening sheet {}", sheet_path.display()))?,
        );
        Self::from_parts(config, catalog, fingerprint, fetcher, store.clone(), store)
    }

    pub fn from_parts(
        config: SyncConfig,
        catalog: StatusCatalog,
        catalog_fingerprint: String,
        fetcher: Arc<dyn Fetcher>,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(fetcher, config.dispatch_config());
        let audit = JsonlAuditLog::new(config.logs_dir());
        Ok(Self {
            config,
            catalog,
            catalog_fingerprint,
            dispatcher,
            source,
            sink,
            audit,
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn catalog(&self) -> &StatusCatalog {
        &self.catalog
    }

    /// One full pass over the configured row window. Runs never overlap.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<SyncRunSummary> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, carrier = %self.config.carrier);
        self.run_inner(run_id, cancel).instrument(span).await
    }

    /// The configured window, moved past the saved checkpoint when resuming.
    async fn resolve_window(&self) -> Result<(RowWindow, Option<u32>)> {
        let mut window = self.config.window;
        if !self.config.resume {
            return Ok((window, None));
        }
        let path = self.config.checkpoint_path();
        match Checkpoint::load(&path).await? {
            Some(saved) if saved.carrier == self.config.carrier && saved.resume_row() > window.start_row => {
                info!(
                    last_row = saved.last_row,
                    last_tracking = %saved.last_tracking,
                    previous_run = %saved.run_id,
                    "resuming after checkpoint"
                );
                window.start_row = saved.resume_row();
                Ok((window, Some(window.start_row)))
            }
            Some(saved) => {
                info!(
                    last_row = saved.last_row,
                    carrier = %saved.carrier,
                    "checkpoint does not apply; using configured window"
                );
                Ok((window, None))
            }
            None => Ok((window, None)),
        }
    }

    async fn run_inner(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let (window, resumed_from) = self.resolve_window().await?;
        let rows = self
            .source
            .read_window(&window)
            .await
            .context("reading record window")?;
        let rows_read = rows.len();
        info!(rows = rows_read, dry_run = self.config.dry_run, "record window loaded");

        let curator = UnmappedCurator::new(&self.catalog);
        let mut before: HashMap<u32, RowCells> = HashMap::with_capacity(rows.len());
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            curator.observe(&self.catalog.explain(&row.source_status_raw), started_at);
            let record = TrackingRecord::new(row.row_index, row.tracking_id, row.source_status_raw, &self.catalog)
                .with_scraped(row.existing.scraped_raw.clone(), &self.catalog);
            before.insert(row.row_index, row.existing);
            records.push(record);
        }

        let hook = WriteBackHook {
            pipeline: self,
            run_id,
            before: &before,
            curator: &curator,
            totals: Mutex::new(WriteBackTotals::default()),
        };
        let orchestrated = BatchOrchestrator::new(&self.dispatcher, &self.catalog, self.config.batch_settings())
            .run(&mut records, cancel, &hook)
            .await;

        if orchestrated.cancelled {
            warn!("run cancelled; skipping compare pass for rows that were not fetched");
        } else {
            // Rows not fetched this run still get refreshed normalized and decision cells.
            let untouched: Vec<&TrackingRecord> = records
                .iter()
                .zip(&orchestrated.results)
                .filter(|(_, result)| result.outcome == RecordOutcome::Skipped)
                .map(|(record, _)| record)
                .collect();
            hook.write_back(&untouched).await;
            if !self.config.dry_run {
                if let Err(err) = Checkpoint::clear(&self.config.checkpoint_path()).await {
                    warn!(error = %err, "could not clear checkpoint");
                }
            }
        }

        let unmapped_path = self.config.logs_dir().join("unmapped_statuses.json");
        if let Err(err) = curator.merge_into(&unmapped_path).await {
            warn!(error = %err, "could not update unmapped status catalog");
        }

        let reports_dir = self
            .config
            .workspace_root
            .join("reports")
            .join(run_id.to_string());
        let write_back = hook.into_totals();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            carrier: self.config.carrier.clone(),
            dry_run: self.config.dry_run,
            cancelled: orchestrated.cancelled,
            resumed_from,
            rows_read,
            batches: orchestrated.batches,
            outcomes: OutcomeCounts::tally(&orchestrated.results),
            alerts: records.iter().filter(|r| r.alert).count(),
            write_back,
            unmapped_statuses: curator.len(),
            catalog_fingerprint: self.catalog_fingerprint.clone(),
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &summary, &orchestrated.results).await?;
        info!(
            success = summary.outcomes.success,
            exhausted = summary.outcomes.exhausted,
            skipped = summary.outcomes.skipped,
            alerts = summary.alerts,
            chunk_failures = summary.write_back.flush.failures.len(),
            "sync run complete"
        );
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(&CancellationToken::new()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rows = summary.rows_read,
                        alerts = summary.alerts,
                        "scheduled sync complete"
                    ),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Per-batch write-back: audit, curation and the planned range writes.
struct WriteBackHook<'a> {
    pipeline: &'a SyncPipeline,
    run_id: Uuid,
    before: &'a HashMap<u32, RowCells>,
    curator: &'a UnmappedCurator,
    totals: Mutex<WriteBackTotals>,
}

impl WriteBackHook<'_> {
    async fn write_back(&self, records: &[&TrackingRecord]) {
        let changes: Vec<RowChange> = records
            .iter()
            .map(|record| RowChange {
                row_index: record.row_index,
                before: self.before.get(&record.row_index).cloned().unwrap_or_default(),
                after: RowCells::from_record(record),
            })
            .collect();
        let config = &self.pipeline.config;
        let plan = plan_writes(&changes, &config.write_limits);

        let flushed = if config.dry_run || plan.is_empty() {
            if config.dry_run && !plan.is_empty() {
                info!(
                    ranges = plan.range_count(),
                    cells = plan.cells,
                    "dry run; write-back skipped"
                );
            }
            FlushReport::default()
        } else {
            flush_plan(self.pipeline.sink.as_ref(), &plan, &config.retry_policy()).await
        };

        if let Ok(mut totals) = self.totals.lock() {
            totals.planned_rows += plan.rows;
            totals.planned_cells += plan.cells;
            totals.planned_chunks += plan.chunks.len();
            totals.excluded_rows += plan.excluded_rows;
            totals.flush.merge(flushed);
        }
    }

    fn into_totals(self) -> WriteBackTotals {
        self.totals.into_inner().unwrap_or_default()
    }
}

#[async_trait]
impl BatchHook for WriteBackHook<'_> {
    async fn batch_settled(&self, batch: &BatchReport, records: &[TrackingRecord]) -> Result<()> {
        let catalog = &self.pipeline.catalog;
        let at = batch.finished_at;
        let entries: Vec<AuditEntry> = records
            .iter()
            .map(|record| {
                if record.has_scraped() {
                    self.curator.observe(&catalog.explain(&record.scraped_status_raw), at);
                }
                AuditEntry::from_record(record, catalog, at)
            })
            .collect();

        let refs: Vec<&TrackingRecord> = records.iter().collect();
        self.write_back(&refs).await;

        let config = &self.pipeline.config;
        if let Some(last_row) = batch.settled_through.filter(|_| !config.dry_run) {
            let saved = Checkpoint {
                last_row,
                last_tracking: records
                    .iter()
                    .find(|record| record.row_index == last_row)
                    .map(|record| record.tracking_id.clone())
                    .unwrap_or_default(),
                carrier: config.carrier.clone(),
                run_id: self.run_id,
                saved_at: at,
            };
            if let Err(err) = saved.save(&config.checkpoint_path()).await {
                warn!(error = %err, last_row, "could not save checkpoint");
            }
        }

        self.pipeline
            .audit
            .append(&entries)
            .await
            .context("appending audit entries")
    }
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary, results: &[RecordResult]) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let outcomes_json = serde_json::to_vec_pretty(results).context("serializing record outcomes")?;
    fs::write(reports_dir.join("record_outcomes.json"), outcomes_json)
        .await
        .context("writing record_outcomes.json")?;
    Ok(())
}

pub async fn run_sync_once(config: SyncConfig, cancel: &CancellationToken) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(config).await?;
    pipeline.run_once(cancel).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env(), &CancellationToken::new()).await
}
