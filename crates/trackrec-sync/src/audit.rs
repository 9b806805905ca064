//! Append-only audit trail and the curation list of unmapped carrier texts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use trackrec_core::{fold, CanonicalStatus, Explanation, MatchFlag, NormalizationVia, StatusCatalog, TrackingRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub row_index: u32,
    pub tracking_id: String,
    pub source_raw: String,
    pub source_norm: CanonicalStatus,
    pub scraped_raw: String,
    pub scraped_norm: Option<CanonicalStatus>,
    pub scraped_via: Option<NormalizationVia>,
    #[serde(rename = "match")]
    pub match_flag: MatchFlag,
    pub alert: bool,
    pub attempts: u32,
}

impl AuditEntry {
    pub fn from_record(record: &TrackingRecord, catalog: &StatusCatalog, at: DateTime<Utc>) -> Self {
        let scraped = record
            .has_scraped()
            .then(|| catalog.explain(&record.scraped_status_raw));
        Self {
            timestamp: at,
            row_index: record.row_index,
            tracking_id: record.tracking_id.clone(),
            source_raw: record.source_status_raw.clone(),
            source_norm: record.source_status,
            scraped_raw: record.scraped_status_raw.clone(),
            scraped_norm: scraped.as_ref().map(|e| e.status),
            scraped_via: scraped.as_ref().map(|e| e.via),
            match_flag: record.match_flag,
            alert: record.alert,
            attempts: record.attempt_count,
        }
    }
}

/// Daily JSONL files under `logs/`, one line per reconciled record.
#[derive(Debug, Clone)]
pub struct JsonlAuditLog {
    dir: PathBuf,
}

impl JsonlAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, day: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("audit_{}.jsonl", day.format("%Y%m%d")))
    }

    pub async fn append(&self, entries: &[AuditEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let mut lines = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut lines, entry).context("serializing audit entry")?;
            lines.push(b'\n');
        }

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(first.timestamp);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(&lines)
            .await
            .with_context(|| format!("appending to {}", path.display()))?;
        file.flush().await?;
        debug!(entries = entries.len(), path = %path.display(), "audit appended");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedObservation {
    pub raw: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub nearest_fragment: Option<String>,
    #[serde(default)]
    pub nearest_status: Option<CanonicalStatus>,
    #[serde(default)]
    pub similarity: Option<f64>,
}

/// Collects carrier texts that fell through to `DESCONOCIDO` so the mapping
/// documents can be curated. Observing never fails.
#[derive(Debug)]
pub struct UnmappedCurator {
    fragments: Vec<(CanonicalStatus, String)>,
    observed: Mutex<BTreeMap<String, UnmappedObservation>>,
}

impl UnmappedCurator {
    pub fn new(catalog: &StatusCatalog) -> Self {
        Self {
            fragments: catalog
                .fragments()
                .map(|(status, fragment)| (status, fragment.to_string()))
                .collect(),
            observed: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn observe(&self, explanation: &Explanation, at: DateTime<Utc>) {
        if !explanation.is_unmapped() {
            return;
        }
        let key = fold(&explanation.raw);
        let Ok(mut observed) = self.observed.lock() else {
            warn!("unmapped status catalog lock poisoned; observation dropped");
            return;
        };
        observed
            .entry(key.clone())
            .and_modify(|entry| {
                entry.count += 1;
                entry.last_seen = at;
            })
            .or_insert_with(|| {
                let nearest = self.nearest(&key);
                UnmappedObservation {
                    raw: explanation.raw.trim().to_string(),
                    count: 1,
                    first_seen: at,
                    last_seen: at,
                    nearest_fragment: nearest.as_ref().map(|(_, f, _)| f.clone()),
                    nearest_status: nearest.as_ref().map(|(s, _, _)| *s),
                    similarity: nearest.map(|(_, _, score)| (score * 1000.0).round() / 1000.0),
                }
            });
    }

    fn nearest(&self, folded: &str) -> Option<(CanonicalStatus, String, f64)> {
        self.fragments
            .iter()
            .map(|(status, fragment)| (*status, fragment.clone(), jaro_winkler(folded, fragment)))
            .max_by(|a, b| a.2.total_cmp(&b.2))
    }

    pub fn len(&self) -> usize {
        self.observed.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<UnmappedObservation> {
        self.observed
            .lock()
            .map(|o| o.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Merges this run's observations into the JSON catalog at `path`,
    /// summing counts and widening the seen window.
    pub async fn merge_into(&self, path: &Path) -> Result<usize> {
        let observed = self.snapshot();
        if observed.is_empty() {
            return Ok(0);
        }

        let mut merged: BTreeMap<String, UnmappedObservation> = match fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        for entry in observed {
            merged
                .entry(fold(&entry.raw))
                .and_modify(|existing| {
                    existing.count += entry.count;
                    existing.first_seen = existing.first_seen.min(entry.first_seen);
                    existing.last_seen = existing.last_seen.max(entry.last_seen);
                    if existing.nearest_fragment.is_none() {
                        existing.nearest_fragment = entry.nearest_fragment.clone();
                        existing.nearest_status = entry.nearest_status;
                        existing.similarity = entry.similarity;
                    }
                })
                .or_insert(entry);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&merged).context("serializing unmapped statuses")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(merged.len())
    }
}
