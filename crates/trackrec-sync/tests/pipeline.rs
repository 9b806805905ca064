use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;
use trackrec_adapters::FixtureFetcher;
use trackrec_core::{CanonicalStatus, StatusCatalog};
use trackrec_fetch::{FetchError, Fetcher};
use trackrec_sync::checkpoint::Checkpoint;
use trackrec_sync::store::{Column, JsonSheetStore, SheetDocument};
use trackrec_sync::{load_catalog, SyncConfig, SyncPipeline};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn shipped_catalog() -> (StatusCatalog, String) {
    let config = SyncConfig {
        workspace_root: workspace_root(),
        ..SyncConfig::from_lookup(|_| None)
    };
    load_catalog(&config).expect("shipped mappings load")
}

fn fast_config(root: &Path) -> SyncConfig {
    SyncConfig {
        workspace_root: root.to_path_buf(),
        sheet_path: PathBuf::from("data/sheet.json"),
        concurrency: 16,
        rate_per_second: 10_000.0,
        timeout: Duration::from_secs(5),
        retry_base_delay: Duration::from_millis(1),
        ..SyncConfig::from_lookup(|_| None)
    }
}

fn sheet_rows(rows: &[&[&str]]) -> SheetDocument {
    SheetDocument::with_rows(
        rows.iter()
            .map(|cells| cells.iter().map(|c| c.to_string()).collect::<Vec<_>>()),
    )
}

fn pipeline_with(
    dir: &TempDir,
    config: SyncConfig,
    fetcher: Arc<dyn Fetcher>,
    sheet: SheetDocument,
) -> (SyncPipeline, Arc<JsonSheetStore>) {
    let (catalog, fingerprint) = shipped_catalog();
    let store = Arc::new(JsonSheetStore::new(dir.path().join("data/sheet.json"), sheet));
    let pipeline =
        SyncPipeline::from_parts(config, catalog, fingerprint, fetcher, store.clone(), store.clone())
            .expect("pipeline");
    (pipeline, store)
}

struct AlwaysEmpty;

#[async_trait]
impl Fetcher for AlwaysEmpty {
    fn name(&self) -> &str {
        "always-empty"
    }

    async fn fetch(&self, _tracking_id: &str, _timeout: Duration) -> Result<String, FetchError> {
        Ok(String::new())
    }
}

#[tokio::test]
async fn twelve_hundred_rows_run_as_three_sequential_batches() {
    let dir = tempdir().unwrap();
    let ids: Vec<String> = (0..1200).map(|i| format!("24{i:010}")).collect();
    let sheet = SheetDocument::with_rows(ids.iter().map(|id| vec![id.clone(), "EN_TRANSITO".to_string()]));
    let fetcher = FixtureFetcher::from_statuses(
        "fixture",
        ids.iter().map(|id| (id.clone(), "Tu envío está en camino".to_string())),
    );
    let config = fast_config(dir.path());
    let (pipeline, store) = pipeline_with(&dir, config, Arc::new(fetcher), sheet);

    let summary = pipeline.run_once(&CancellationToken::new()).await.unwrap();

    let sizes: Vec<_> = summary.batches.iter().map(|b| b.rows.len()).collect();
    assert_eq!(sizes, vec![500, 500, 200]);
    assert!(summary
        .batches
        .windows(2)
        .all(|w| w[0].finished_at <= w[1].started_at && w[0].rows.last() < w[1].rows.first()));
    assert!(summary.batches.iter().all(|b| b.stats.peak_in_flight <= 16));
    assert_eq!(summary.outcomes.success, 1200);
    assert_eq!(summary.alerts, 0);

    let written = store.snapshot().await;
    assert_eq!(written.cell(2, Column::ScrapedStatus), Some("EN_TRANSITO"));
    assert_eq!(written.cell(1201, Column::Match), Some("TRUE"));
    assert!(summary.write_back.flush.failures.is_empty());
    // Each batch writes one contiguous range per column.
    assert_eq!(summary.write_back.flush.chunks_written, 3);
}

#[tokio::test]
async fn always_empty_carrier_exhausts_retries_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let sheet = sheet_rows(&[
        &["G1", "EN_TRANSITO"],
        &["G2", "PENDIENTE"],
        &["G3", "NOVEDAD", "Dirección errada", "NOVEDAD", "TRUE", "FALSE"],
    ]);
    let config = SyncConfig {
        retries: 2,
        ..fast_config(dir.path())
    };
    let (pipeline, store) = pipeline_with(&dir, config, Arc::new(AlwaysEmpty), sheet.clone());

    let summary = pipeline.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.outcomes.exhausted, 3);
    assert_eq!(summary.write_back.excluded_rows, 2);
    assert_eq!(summary.write_back.planned_cells, 0);
    assert_eq!(store.snapshot().await, sheet);

    let outcomes: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(Path::new(&summary.reports_dir).join("record_outcomes.json")).unwrap(),
    )
    .unwrap();
    let attempts: Vec<_> = outcomes
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["attempts"].as_u64().unwrap())
        .collect();
    assert_eq!(attempts, vec![3, 3, 3]);
    assert_eq!(outcomes[0]["outcome"], "exhausted");
    assert_eq!(outcomes[0]["error"]["kind"], "empty");
}

/// Answers every id, cancelling the run once it has served `last`.
struct StopAfter {
    last: &'static str,
    cancel: CancellationToken,
}

#[async_trait]
impl Fetcher for StopAfter {
    fn name(&self) -> &str {
        "stop-after"
    }

    async fn fetch(&self, tracking_id: &str, _timeout: Duration) -> Result<String, FetchError> {
        if tracking_id == self.last {
            self.cancel.cancel();
        }
        Ok("Tu envío está en camino".to_string())
    }
}

#[tokio::test]
async fn interrupted_run_leaves_checkpoint_and_resume_continues_after_it() {
    let dir = tempdir().unwrap();
    let sheet = sheet_rows(&[
        &["G1", "EN_TRANSITO"],
        &["G2", "EN_TRANSITO"],
        &["G3", "EN_TRANSITO"],
        &["G4", "EN_TRANSITO"],
        &["G5", "EN_TRANSITO"],
    ]);
    let config = SyncConfig {
        concurrency: 1,
        batch_size: 2,
        ..fast_config(dir.path())
    };
    let checkpoint_path = config.checkpoint_path();

    let cancel = CancellationToken::new();
    let stop = StopAfter {
        last: "G2",
        cancel: cancel.clone(),
    };
    let (pipeline, store) = pipeline_with(&dir, config.clone(), Arc::new(stop), sheet);
    let first = pipeline.run_once(&cancel).await.unwrap();

    assert!(first.cancelled);
    assert_eq!(first.resumed_from, None);
    assert_eq!(first.outcomes.success, 2);
    assert_eq!(first.outcomes.pending, 3);
    let saved = Checkpoint::load(&checkpoint_path).await.unwrap().expect("checkpoint saved");
    assert_eq!(saved.last_row, 3);
    assert_eq!(saved.last_tracking, "G2");
    assert_eq!(saved.run_id, first.run_id);

    let partial = store.snapshot().await;
    assert_eq!(partial.cell(3, Column::ScrapedStatus), Some("EN_TRANSITO"));
    assert!(partial.cell(4, Column::ScrapedRaw).unwrap_or_default().is_empty());

    let fetcher = FixtureFetcher::from_statuses(
        "fixture",
        ["G1", "G2", "G3", "G4", "G5"]
            .iter()
            .map(|id| (id.to_string(), "Tu envío está en camino".to_string())),
    );
    let resumed_config = SyncConfig {
        resume: true,
        ..config
    };
    let (pipeline, store) = pipeline_with(&dir, resumed_config, Arc::new(fetcher), partial);
    let second = pipeline.run_once(&CancellationToken::new()).await.unwrap();

    assert!(!second.cancelled);
    assert_eq!(second.resumed_from, Some(4));
    assert_eq!(second.rows_read, 3);
    assert_eq!(second.outcomes.success, 3);
    let finished = store.snapshot().await;
    assert_eq!(finished.cell(6, Column::Match), Some("TRUE"));
    assert_eq!(Checkpoint::load(&checkpoint_path).await.unwrap(), None);
}

fn copy_into(src: &Path, dst: &Path) {
    fs::create_dir_all(dst.parent().unwrap()).unwrap();
    fs::copy(src, dst).unwrap();
}

fn stage_workspace(dir: &TempDir) {
    let root = workspace_root();
    for rel in [
        "carriers.yaml",
        "mappings/status_keywords.json",
        "mappings/status_overrides.json",
        "fixtures/interrapidisimo/sample/statuses.json",
        "fixtures/interrapidisimo/sample/pages/delivered.html",
        "fixtures/interrapidisimo/sample/pages/card_only.html",
        "fixtures/interrapidisimo/sample/pages/novelty.html",
    ] {
        copy_into(&root.join(rel), &dir.path().join(rel));
    }
    let sheet = sheet_rows(&[
        &["240000000001", "EN_TRANSITO"],
        &["240000000002", "EN_TRANSITO"],
        &["240000000007", "ENTREGADO"],
        &["240000000004", "EN_TRANSITO", "Recibimos tu envío"],
        &["240000000005", "PENDIENTE"],
        &["240000000003", "EN_TRANSITO"],
    ]);
    fs::create_dir_all(dir.path().join("data")).unwrap();
    fs::write(
        dir.path().join("data/sheet.json"),
        serde_json::to_vec_pretty(&sheet).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn fixture_carrier_run_reconciles_sheet_end_to_end() {
    let dir = tempdir().unwrap();
    stage_workspace(&dir);
    let config = SyncConfig {
        carrier: "interrapidisimo-fixture".to_string(),
        batch_size: 4,
        ..fast_config(dir.path())
    };
    let pipeline = SyncPipeline::new(config).await.unwrap();
    let summary = pipeline.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.rows_read, 6);
    assert_eq!(summary.outcomes.skipped, 1);
    assert_eq!(summary.outcomes.success, 4);
    assert_eq!(summary.outcomes.exhausted, 1);
    assert_eq!(summary.batches.len(), 2);

    let sheet: SheetDocument =
        serde_json::from_str(&fs::read_to_string(dir.path().join("data/sheet.json")).unwrap()).unwrap();
    // Delivered while the source still says in transit.
    assert_eq!(sheet.cell(2, Column::ScrapedStatus), Some("ENTREGADO"));
    assert_eq!(sheet.cell(2, Column::Alert), Some("TRUE"));
    // Returned while the source says in transit.
    assert_eq!(sheet.cell(3, Column::ScrapedStatus), Some(CanonicalStatus::Devuelto.as_str()));
    assert_eq!(sheet.cell(3, Column::Match), Some("FALSE"));
    // Terminal source row is never queried and has nothing to write.
    assert!(sheet.cell(4, Column::ScrapedRaw).unwrap_or_default().is_empty());
    // Empty fetch keeps the known carrier text; derived cells are filled in.
    assert_eq!(sheet.cell(5, Column::ScrapedRaw), Some("Recibimos tu envío"));
    assert_eq!(sheet.cell(5, Column::ScrapedStatus), Some("EN_TRANSITO"));
    assert_eq!(sheet.cell(5, Column::Match), Some("TRUE"));
    // Unmapped text falls back to DESCONOCIDO and raises an alert.
    assert_eq!(sheet.cell(6, Column::ScrapedStatus), Some("DESCONOCIDO"));
    assert_eq!(sheet.cell(6, Column::Alert), Some("TRUE"));
    assert_eq!(sheet.cell(7, Column::Match), Some("TRUE"));
    assert!(!sheet.cell(7, Column::CheckedAt).unwrap_or_default().is_empty());

    let unmapped = fs::read_to_string(dir.path().join("logs/unmapped_statuses.json")).unwrap();
    assert!(unmapped.contains("Estado sin catalogar XYZ"));
    assert_eq!(summary.unmapped_statuses, 1);

    let report: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(Path::new(&summary.reports_dir).join("run_summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(report["catalog_fingerprint"].as_str().unwrap().len(), 64);
    assert_eq!(report["outcomes"]["success"], 4);

    let audit_files = fs::read_dir(dir.path().join("logs"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("audit_"))
        .count();
    assert_eq!(audit_files, 1);
}

#[tokio::test]
async fn dry_run_plans_but_leaves_sheet_untouched() {
    let dir = tempdir().unwrap();
    stage_workspace(&dir);
    let before = fs::read_to_string(dir.path().join("data/sheet.json")).unwrap();
    let config = SyncConfig {
        carrier: "interrapidisimo-fixture".to_string(),
        dry_run: true,
        ..fast_config(dir.path())
    };
    let summary = SyncPipeline::new(config)
        .await
        .unwrap()
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert!(summary.write_back.planned_cells > 0);
    assert_eq!(summary.write_back.flush.chunks_written, 0);
    assert_eq!(fs::read_to_string(dir.path().join("data/sheet.json")).unwrap(), before);
}

#[tokio::test]
async fn malformed_mapping_document_is_fatal_before_any_fetch() {
    let dir = tempdir().unwrap();
    stage_workspace(&dir);
    fs::write(
        dir.path().join("mappings/status_keywords.json"),
        r#"{"PERDIDO": ["se perdio"]}"#,
    )
    .unwrap();
    let config = SyncConfig {
        carrier: "interrapidisimo-fixture".to_string(),
        ..fast_config(dir.path())
    };
    let err = SyncPipeline::new(config).await.err().expect("load must fail");
    assert!(format!("{err:#}").contains("PERDIDO"));
}
