//! Sequential batch orchestration over the fetch dispatcher.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use trackrec_core::{StatusCatalog, TrackingRecord};
use trackrec_fetch::{DispatchStats, Dispatcher, FetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub pause: Duration,
    /// Only query rows whose carrier status is empty or not yet terminal.
    pub only_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Success,
    /// Not fetched because the run was cancelled first.
    Pending,
    Exhausted,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordResult {
    pub row_index: u32,
    pub tracking_id: String,
    pub outcome: RecordOutcome,
    pub attempts: u32,
    pub error: Option<FetchError>,
    /// Whether the stored carrier text changed.
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub rows: Vec<u32>,
    /// Highest row of the batch with every earlier row of the batch settled
    /// too; `None` when cancellation caught the first row.
    pub settled_through: Option<u32>,
    pub stats: DispatchStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorReport {
    /// One result per input record, in row order.
    pub results: Vec<RecordResult>,
    pub batches: Vec<BatchReport>,
    pub cancelled: bool,
}

impl OrchestratorReport {
    pub fn count(&self, outcome: RecordOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }
}

/// Called once per settled batch with the batch's updated records, before
/// the next batch starts. Errors are logged and never stop later batches.
#[async_trait]
pub trait BatchHook: Send + Sync {
    async fn batch_settled(&self, batch: &BatchReport, records: &[TrackingRecord]) -> Result<()>;
}

#[derive(Default)]
pub struct NoopBatchHook;

#[async_trait]
impl BatchHook for NoopBatchHook {
    async fn batch_settled(&self, _batch: &BatchReport, _records: &[TrackingRecord]) -> Result<()> {
        Ok(())
    }
}

pub fn is_eligible(record: &TrackingRecord, only_pending: bool) -> bool {
    if !record.can_query() {
        return false;
    }
    !only_pending || !record.has_scraped() || !record.scraped_status.is_terminal()
}

pub struct BatchOrchestrator<'a> {
    dispatcher: &'a Dispatcher,
    catalog: &'a StatusCatalog,
    settings: BatchSettings,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(dispatcher: &'a Dispatcher, catalog: &'a StatusCatalog, settings: BatchSettings) -> Self {
        Self {
            dispatcher,
            catalog,
            settings,
        }
    }

    /// Filters `records`, then fetches the eligible ones batch by batch,
    /// applying each settled fetch to its record in place.
    pub async fn run(
        &self,
        records: &mut [TrackingRecord],
        cancel: &CancellationToken,
        hook: &dyn BatchHook,
    ) -> OrchestratorReport {
        let mut results: Vec<Option<RecordResult>> = vec![None; records.len()];
        let mut eligible = Vec::new();
        for (position, record) in records.iter().enumerate() {
            if is_eligible(record, self.settings.only_pending) {
                eligible.push(position);
            } else {
                results[position] = Some(settled(record, RecordOutcome::Skipped, None, false));
            }
        }

        let batch_size = self.settings.batch_size.max(1);
        let total_batches = eligible.len().div_ceil(batch_size);
        info!(
            rows = records.len(),
            eligible = eligible.len(),
            batches = total_batches,
            batch_size,
            "starting batches"
        );

        let mut report = OrchestratorReport::default();
        for (index, positions) in eligible.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let started_at = Utc::now();
            let ids: Vec<String> = positions
                .iter()
                .map(|&p| records[p].tracking_id.clone())
                .collect();
            let span = info_span!("dispatch_batch", batch = index + 1, of = total_batches, size = ids.len());
            let dispatched = self.dispatcher.dispatch(&ids, cancel).instrument(span).await;

            let now = Utc::now();
            let mut settled_through = None;
            let mut interrupted = false;
            for (&position, outcome) in positions.iter().zip(dispatched.outcomes) {
                let record = &mut records[position];
                let changed = record.apply_fetch(&outcome.raw_status, outcome.attempts, self.catalog, now);
                let kind = if outcome.is_success() {
                    RecordOutcome::Success
                } else if outcome.error == Some(FetchError::Cancelled) {
                    RecordOutcome::Pending
                } else {
                    RecordOutcome::Exhausted
                };
                if kind == RecordOutcome::Pending {
                    interrupted = true;
                } else if !interrupted {
                    settled_through = Some(record.row_index);
                }
                results[position] = Some(settled(record, kind, outcome.error, changed));
            }

            let batch = BatchReport {
                index,
                rows: positions.iter().map(|&p| records[p].row_index).collect(),
                settled_through,
                stats: dispatched.stats,
                started_at,
                finished_at: Utc::now(),
            };
            info!(
                batch = index + 1,
                of = total_batches,
                succeeded = batch.stats.succeeded,
                exhausted = batch.stats.exhausted,
                "batch settled"
            );

            let settled_records: Vec<TrackingRecord> =
                positions.iter().map(|&p| records[p].clone()).collect();
            if let Err(err) = hook.batch_settled(&batch, &settled_records).await {
                warn!(batch = index + 1, error = %err, "batch hook failed");
            }
            report.batches.push(batch);

            let is_last = index + 1 == total_batches;
            if !is_last && !self.settings.pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.pause) => {}
                }
            }
        }
        report.cancelled |= cancel.is_cancelled();

        report.results = results
            .into_iter()
            .zip(records.iter())
            .map(|(result, record)| {
                result.unwrap_or_else(|| settled(record, RecordOutcome::Pending, None, false))
            })
            .collect();
        report.results.sort_by_key(|r| r.row_index);
        report
    }
}

fn settled(
    record: &TrackingRecord,
    outcome: RecordOutcome,
    error: Option<FetchError>,
    changed: bool,
) -> RecordResult {
    RecordResult {
        row_index: record.row_index,
        tracking_id: record.tracking_id.clone(),
        outcome,
        attempts: record.attempt_count,
        error,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use trackrec_adapters::FixtureFetcher;
    use trackrec_fetch::{DispatchConfig, RetryPolicy};

    fn catalog() -> StatusCatalog {
        StatusCatalog::from_documents(
            r#"{"ENTREGADO": ["fue entregado"], "EN_TRANSITO": ["en camino"]}"#,
            "{}",
        )
        .unwrap()
    }

    fn dispatcher(statuses: &[(&str, &str)]) -> Dispatcher {
        let fetcher = FixtureFetcher::from_statuses(
            "test",
            statuses.iter().map(|(k, v)| (k.to_string(), v.to_string())),
        );
        Dispatcher::new(
            Arc::new(fetcher),
            DispatchConfig {
                concurrency: 2,
                rate_per_second: None,
                burst: 1,
                timeout: Duration::from_secs(1),
                retry: RetryPolicy::none(),
            },
        )
    }

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl BatchHook for Recorder {
        async fn batch_settled(&self, batch: &BatchReport, records: &[TrackingRecord]) -> Result<()> {
            assert_eq!(batch.rows.len(), records.len());
            self.batches.lock().unwrap().push(batch.rows.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_sources_are_skipped_and_never_fetched() {
        let catalog = catalog();
        let dispatcher = dispatcher(&[("A", "Tu envío fue entregado"), ("B", "Tu envío está en camino")]);
        let mut records = vec![
            TrackingRecord::new(2, "A", "EN_TRANSITO", &catalog),
            TrackingRecord::new(3, "B", "ENTREGADO", &catalog),
        ];
        let settings = BatchSettings {
            batch_size: 10,
            pause: Duration::ZERO,
            only_pending: false,
        };
        let report = BatchOrchestrator::new(&dispatcher, &catalog, settings)
            .run(&mut records, &CancellationToken::new(), &NoopBatchHook)
            .await;

        assert_eq!(report.results[0].outcome, RecordOutcome::Success);
        assert!(report.results[0].changed);
        assert_eq!(report.results[1].outcome, RecordOutcome::Skipped);
        assert_eq!(report.results[1].attempts, 0);
        assert_eq!(records[1].scraped_status_raw, "");
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.batches[0].stats.launched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_pending_filter_drops_terminal_carrier_rows() {
        let catalog = catalog();
        let dispatcher = dispatcher(&[]);
        let mut records = vec![
            TrackingRecord::new(2, "A", "EN_TRANSITO", &catalog).with_scraped("Tu envío fue entregado", &catalog),
            TrackingRecord::new(3, "B", "EN_TRANSITO", &catalog).with_scraped("Tu envío está en camino", &catalog),
            TrackingRecord::new(4, "C", "EN_TRANSITO", &catalog),
        ];
        assert!(!is_eligible(&records[0], true));
        assert!(is_eligible(&records[0], false));
        assert!(is_eligible(&records[1], true));
        assert!(is_eligible(&records[2], true));

        let settings = BatchSettings {
            batch_size: 10,
            pause: Duration::ZERO,
            only_pending: true,
        };
        let report = BatchOrchestrator::new(&dispatcher, &catalog, settings)
            .run(&mut records, &CancellationToken::new(), &NoopBatchHook)
            .await;
        let outcomes: Vec<_> = report.results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![RecordOutcome::Skipped, RecordOutcome::Exhausted, RecordOutcome::Exhausted]
        );
        // Empty fetch kept the previously known carrier status.
        assert_eq!(records[1].scraped_status_raw, "Tu envío está en camino");
    }

    #[tokio::test(start_paused = true)]
    async fn batches_run_in_order_with_pause_between() {
        let catalog = catalog();
        let dispatcher = dispatcher(&[]);
        let mut records: Vec<_> = (0..7)
            .map(|i| TrackingRecord::new(2 + i, format!("G{i}"), "PENDIENTE", &catalog))
            .collect();
        let settings = BatchSettings {
            batch_size: 3,
            pause: Duration::from_secs(20),
            only_pending: false,
        };
        let recorder = Recorder::default();
        let started = tokio::time::Instant::now();
        let report = BatchOrchestrator::new(&dispatcher, &catalog, settings)
            .run(&mut records, &CancellationToken::new(), &recorder)
            .await;

        assert_eq!(
            *recorder.batches.lock().unwrap(),
            vec![vec![2, 3, 4], vec![5, 6, 7], vec![8]]
        );
        assert_eq!(started.elapsed(), Duration::from_secs(40));
        let settled: Vec<_> = report.batches.iter().map(|b| b.settled_through).collect();
        assert_eq!(settled, vec![Some(4), Some(7), Some(8)]);
        assert!(report
            .batches
            .windows(2)
            .all(|w| w[0].finished_at <= w[1].started_at));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_remaining_rows_pending() {
        let catalog = catalog();
        let dispatcher = dispatcher(&[]);
        let mut records: Vec<_> = (0..4)
            .map(|i| TrackingRecord::new(2 + i, format!("G{i}"), "PENDIENTE", &catalog))
            .collect();
        let settings = BatchSettings {
            batch_size: 2,
            pause: Duration::from_secs(60),
            only_pending: false,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let report = BatchOrchestrator::new(&dispatcher, &catalog, settings)
            .run(&mut records, &cancel, &NoopBatchHook)
            .await;

        assert!(report.cancelled);
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.batches[0].settled_through, Some(3));
        assert_eq!(report.count(RecordOutcome::Exhausted), 2);
        assert_eq!(report.count(RecordOutcome::Pending), 2);
    }
}
