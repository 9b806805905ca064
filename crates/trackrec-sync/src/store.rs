//! Record source/sink contracts and the JSON-backed sheet that implements them.
//!
//! Row 1 holds the header, data starts at row 2. Columns `A..G` are tracking
//! id, source status, carrier status (raw), carrier status (normalized),
//! match, alert and checked-at.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use trackrec_core::{MatchFlag, TrackingRecord};

use crate::writeback::WriteChunk;

pub const HEADER_ROW: u32 = 1;
pub const FIRST_DATA_ROW: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    TrackingId,
    SourceStatus,
    ScrapedRaw,
    ScrapedStatus,
    Match,
    Alert,
    CheckedAt,
}

impl Column {
    pub const ALL: [Column; 7] = [
        Column::TrackingId,
        Column::SourceStatus,
        Column::ScrapedRaw,
        Column::ScrapedStatus,
        Column::Match,
        Column::Alert,
        Column::CheckedAt,
    ];

    /// Columns the reconciler is allowed to write.
    pub const WRITABLE: [Column; 5] = [
        Column::ScrapedRaw,
        Column::ScrapedStatus,
        Column::Match,
        Column::Alert,
        Column::CheckedAt,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }

    pub fn header(self) -> &'static str {
        match self {
            Column::TrackingId => "tracking_id",
            Column::SourceStatus => "source_status",
            Column::ScrapedRaw => "carrier_status_raw",
            Column::ScrapedStatus => "carrier_status",
            Column::Match => "match",
            Column::Alert => "alert",
            Column::CheckedAt => "checked_at",
        }
    }
}

/// Values of the writable columns for one row, as sheet cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCells {
    pub scraped_raw: String,
    pub scraped_status: String,
    pub match_flag: String,
    pub alert: String,
    pub checked_at: String,
}

impl RowCells {
    pub fn from_record(record: &TrackingRecord) -> Self {
        let scraped = record.has_scraped();
        let alert = match record.match_flag {
            MatchFlag::Unknown => "",
            _ if record.alert => "TRUE",
            _ => "FALSE",
        };
        Self {
            scraped_raw: record.scraped_status_raw.clone(),
            scraped_status: if scraped {
                record.scraped_status.as_str().to_string()
            } else {
                String::new()
            },
            match_flag: record.match_flag.as_cell().to_string(),
            alert: alert.to_string(),
            checked_at: record
                .checked_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        }
    }

    fn from_row(row: &[String]) -> Self {
        let cell = |column: Column| row.get(column.index()).map(|v| v.trim().to_string()).unwrap_or_default();
        Self {
            scraped_raw: cell(Column::ScrapedRaw),
            scraped_status: cell(Column::ScrapedStatus),
            match_flag: cell(Column::Match),
            alert: cell(Column::Alert),
            checked_at: cell(Column::CheckedAt),
        }
    }

    pub fn get(&self, column: Column) -> &str {
        match column {
            Column::ScrapedRaw => &self.scraped_raw,
            Column::ScrapedStatus => &self.scraped_status,
            Column::Match => &self.match_flag,
            Column::Alert => &self.alert,
            Column::CheckedAt => &self.checked_at,
            Column::TrackingId | Column::SourceStatus => "",
        }
    }
}

/// One data row as read from the source, including the carrier columns
/// already present in the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub row_index: u32,
    pub tracking_id: String,
    pub source_status_raw: String,
    pub existing: RowCells,
}

/// Which data rows a run reads. `end_row` is inclusive; `limit` caps the
/// number of rows with a tracking id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowWindow {
    pub start_row: u32,
    pub end_row: Option<u32>,
    pub limit: Option<usize>,
}

impl Default for RowWindow {
    fn default() -> Self {
        Self {
            start_row: FIRST_DATA_ROW,
            end_row: None,
            limit: None,
        }
    }
}

impl RowWindow {
    pub fn contains(&self, row_index: u32) -> bool {
        row_index >= self.start_row.max(FIRST_DATA_ROW) && self.end_row.map_or(true, |end| row_index <= end)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing sheet {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing sheet: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SinkWriteError {
    #[error("sink temporarily unavailable: {0}")]
    Transient(String),
    #[error("range {range} is outside the sheet ({rows} data rows)")]
    OutOfBounds { range: String, rows: usize },
    #[error("range {range} targets a read-only column")]
    ReadOnlyColumn { range: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SinkWriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkWriteError::Transient(_) | SinkWriteError::Store(_))
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn read_window(&self, window: &RowWindow) -> Result<Vec<SourceRow>, StoreError>;
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Applies every range of the chunk or none of them.
    async fn write_chunk(&self, chunk: &WriteChunk) -> Result<(), SinkWriteError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetDocument {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SheetDocument {
    pub fn with_rows<I, R>(rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = String>,
    {
        Self {
            header: Column::ALL.iter().map(|c| c.header().to_string()).collect(),
            rows: rows.into_iter().map(|r| r.into_iter().collect()).collect(),
        }
    }

    pub fn cell(&self, row_index: u32, column: Column) -> Option<&str> {
        let offset = row_index.checked_sub(FIRST_DATA_ROW)? as usize;
        self.rows
            .get(offset)?
            .get(column.index())
            .map(String::as_str)
    }
}

/// Local stand-in for the spreadsheet: a JSON document rewritten atomically
/// after every applied chunk.
#[derive(Debug)]
pub struct JsonSheetStore {
    path: PathBuf,
    sheet: Mutex<SheetDocument>,
}

impl JsonSheetStore {
    pub fn new(path: impl Into<PathBuf>, sheet: SheetDocument) -> Self {
        Self {
            path: path.into(),
            sheet: Mutex::new(sheet),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = fs::read_to_string(&path).await.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        let sheet = serde_json::from_str(&text).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok(Self::new(path, sheet))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> SheetDocument {
        self.sheet.lock().await.clone()
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let sheet = self.sheet.lock().await;
        write_atomically(&self.path, &sheet).await
    }
}

async fn write_atomically(path: &Path, sheet: &SheetDocument) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(sheet).map_err(StoreError::Encode)?;
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl RecordSource for JsonSheetStore {
    async fn read_window(&self, window: &RowWindow) -> Result<Vec<SourceRow>, StoreError> {
        let sheet = self.sheet.lock().await;
        let rows = sheet
            .rows
            .iter()
            .enumerate()
            .map(|(offset, row)| (FIRST_DATA_ROW + offset as u32, row))
            .filter(|(row_index, _)| window.contains(*row_index))
            .filter_map(|(row_index, row)| {
                let tracking_id = row.get(Column::TrackingId.index())?.trim();
                if tracking_id.is_empty() {
                    return None;
                }
                Some(SourceRow {
                    row_index,
                    tracking_id: tracking_id.to_string(),
                    source_status_raw: row
                        .get(Column::SourceStatus.index())
                        .map(|v| v.trim().to_string())
                        .unwrap_or_default(),
                    existing: RowCells::from_row(row),
                })
            })
            .take(window.limit.unwrap_or(usize::MAX))
            .collect::<Vec<_>>();
        debug!(rows = rows.len(), path = %self.path.display(), "sheet window read");
        Ok(rows)
    }
}

#[async_trait]
impl RecordSink for JsonSheetStore {
    async fn write_chunk(&self, chunk: &WriteChunk) -> Result<(), SinkWriteError> {
        let mut sheet = self.sheet.lock().await;
        let data_rows = sheet.rows.len();
        for range in &chunk.ranges {
            if !Column::WRITABLE.contains(&range.column) {
                return Err(SinkWriteError::ReadOnlyColumn { range: range.a1() });
            }
            if range.start_row < FIRST_DATA_ROW
                || (range.end_row() - FIRST_DATA_ROW) as usize >= data_rows
            {
                return Err(SinkWriteError::OutOfBounds {
                    range: range.a1(),
                    rows: data_rows,
                });
            }
        }

        let mut staged = sheet.clone();
        for range in &chunk.ranges {
            for (offset, value) in range.values.iter().enumerate() {
                let row = &mut staged.rows[(range.start_row - FIRST_DATA_ROW) as usize + offset];
                if row.len() < Column::ALL.len() {
                    row.resize(Column::ALL.len(), String::new());
                }
                row[range.column.index()] = value.clone();
            }
        }
        write_atomically(&self.path, &staged).await?;
        *sheet = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writeback::RangeWrite;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn sample() -> SheetDocument {
        SheetDocument::with_rows(vec![
            row(&["G1", "EN_TRANSITO"]),
            row(&["", "ENTREGADO"]),
            row(&["G3", "ENTREGADO", "Tu envío fue entregado", "ENTREGADO", "TRUE", "FALSE", "2026-01-01T00:00:00Z"]),
            row(&["G4", "PENDIENTE"]),
            row(&["G5", "NOVEDAD"]),
        ])
    }

    #[tokio::test]
    async fn window_skips_blank_ids_and_honours_bounds() {
        let dir = tempdir().unwrap();
        let store = JsonSheetStore::new(dir.path().join("sheet.json"), sample());

        let all = store.read_window(&RowWindow::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| (r.row_index, r.tracking_id.as_str())).collect();
        assert_eq!(ids, vec![(2, "G1"), (4, "G3"), (5, "G4"), (6, "G5")]);
        assert_eq!(all[1].existing.scraped_raw, "Tu envío fue entregado");
        assert_eq!(all[1].existing.match_flag, "TRUE");

        let window = RowWindow {
            start_row: 3,
            end_row: Some(5),
            limit: None,
        };
        let rows = store.read_window(&window).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.row_index).collect::<Vec<_>>(), vec![4, 5]);

        let limited = RowWindow {
            limit: Some(2),
            ..RowWindow::default()
        };
        assert_eq!(store.read_window(&limited).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chunk_is_applied_and_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sheet.json");
        let store = JsonSheetStore::new(&path, sample());
        let chunk = WriteChunk {
            index: 0,
            ranges: vec![RangeWrite {
                column: Column::ScrapedRaw,
                start_row: 5,
                values: vec!["Recibimos tu envío".into(), "Dirección errada".into()],
            }],
        };
        store.write_chunk(&chunk).await.unwrap();

        let reopened = JsonSheetStore::open(&path).await.unwrap().snapshot().await;
        assert_eq!(reopened.cell(5, Column::ScrapedRaw), Some("Recibimos tu envío"));
        assert_eq!(reopened.cell(6, Column::ScrapedRaw), Some("Dirección errada"));
        assert_eq!(reopened.cell(6, Column::SourceStatus), Some("NOVEDAD"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn invalid_chunk_leaves_sheet_untouched() {
        let dir = tempdir().unwrap();
        let store = JsonSheetStore::new(dir.path().join("sheet.json"), sample());
        let chunk = WriteChunk {
            index: 0,
            ranges: vec![
                RangeWrite {
                    column: Column::Alert,
                    start_row: 2,
                    values: vec!["TRUE".into()],
                },
                RangeWrite {
                    column: Column::Alert,
                    start_row: 6,
                    values: vec!["TRUE".into(), "TRUE".into()],
                },
            ],
        };
        let err = store.write_chunk(&chunk).await.unwrap_err();
        assert!(matches!(err, SinkWriteError::OutOfBounds { .. }));
        assert!(!err.is_retryable());
        assert_eq!(store.snapshot().await, sample());

        let read_only = WriteChunk {
            index: 1,
            ranges: vec![RangeWrite {
                column: Column::SourceStatus,
                start_row: 2,
                values: vec!["ENTREGADO".into()],
            }],
        };
        assert!(matches!(
            store.write_chunk(&read_only).await,
            Err(SinkWriteError::ReadOnlyColumn { .. })
        ));
    }

    #[test]
    fn column_letters_follow_layout() {
        let letters: String = Column::ALL.iter().map(|c| c.letter()).collect();
        assert_eq!(letters, "ABCDEFG");
    }
}
