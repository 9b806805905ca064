//! Write-back planning and flushing.
//!
//! Changed cells are grouped per column into contiguous A1 ranges, split into
//! chunks no larger than the sink accepts, then flushed chunk by chunk with
//! retries. A failing chunk never stops its siblings.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};
use trackrec_fetch::{retry_with_policy, RetryPolicy};

use crate::store::{Column, RecordSink, RowCells, SinkWriteError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeWrite {
    pub column: Column,
    pub start_row: u32,
    pub values: Vec<String>,
}

impl RangeWrite {
    pub fn end_row(&self) -> u32 {
        self.start_row + self.values.len().max(1) as u32 - 1
    }

    /// `C5:C9`, or `C5` for a single cell.
    pub fn a1(&self) -> String {
        let letter = self.column.letter();
        if self.end_row() == self.start_row {
            format!("{letter}{}", self.start_row)
        } else {
            format!("{letter}{}:{letter}{}", self.start_row, self.end_row())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteChunk {
    pub index: usize,
    pub ranges: Vec<RangeWrite>,
}

impl WriteChunk {
    pub fn cell_count(&self) -> usize {
        self.ranges.iter().map(|r| r.values.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLimits {
    pub max_ranges_per_chunk: usize,
    pub max_cells_per_range: usize,
}

impl Default for WriteLimits {
    fn default() -> Self {
        Self {
            max_ranges_per_chunk: 100,
            max_cells_per_range: 500,
        }
    }
}

/// Destination cells before and after reconciliation for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub row_index: u32,
    pub before: RowCells,
    pub after: RowCells,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WritePlan {
    pub chunks: Vec<WriteChunk>,
    pub rows: usize,
    pub cells: usize,
    /// Rows left out because the carrier side is still empty.
    pub excluded_rows: usize,
}

impl WritePlan {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn range_count(&self) -> usize {
        self.chunks.iter().map(|c| c.ranges.len()).sum()
    }
}

pub fn plan_writes(changes: &[RowChange], limits: &WriteLimits) -> WritePlan {
    let mut cells: BTreeMap<Column, BTreeMap<u32, String>> = BTreeMap::new();
    let mut rows = 0;
    let mut excluded_rows = 0;

    for change in changes {
        if change.after.scraped_raw.trim().is_empty() {
            excluded_rows += 1;
            continue;
        }
        let mut touched = false;
        for column in Column::WRITABLE {
            let after = change.after.get(column);
            if after.is_empty() || after == change.before.get(column) {
                continue;
            }
            cells
                .entry(column)
                .or_default()
                .insert(change.row_index, after.to_string());
            touched = true;
        }
        if touched {
            rows += 1;
        }
    }

    let max_cells = limits.max_cells_per_range.max(1);
    let mut ranges: Vec<RangeWrite> = Vec::new();
    for (column, by_row) in cells {
        let mut current: Option<RangeWrite> = None;
        for (row_index, value) in by_row {
            let extends = matches!(
                &current,
                Some(range) if range.end_row() + 1 == row_index && range.values.len() < max_cells
            );
            match current.as_mut() {
                Some(range) if extends => range.values.push(value),
                _ => {
                    ranges.extend(current.take());
                    current = Some(RangeWrite {
                        column,
                        start_row: row_index,
                        values: vec![value],
                    });
                }
            }
        }
        ranges.extend(current);
    }

    let total_cells: usize = ranges.iter().map(|r| r.values.len()).sum();
    let chunks = ranges
        .chunks(limits.max_ranges_per_chunk.max(1))
        .enumerate()
        .map(|(index, ranges)| WriteChunk {
            index,
            ranges: ranges.to_vec(),
        })
        .collect();

    WritePlan {
        chunks,
        rows,
        cells: total_cells,
        excluded_rows,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub ranges: Vec<String>,
    pub attempts: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub chunks_written: usize,
    pub cells_written: usize,
    pub failures: Vec<ChunkFailure>,
}

impl FlushReport {
    pub fn merge(&mut self, other: FlushReport) {
        self.chunks_written += other.chunks_written;
        self.cells_written += other.cells_written;
        self.failures.extend(other.failures);
    }
}

pub async fn flush_plan(sink: &dyn RecordSink, plan: &WritePlan, policy: &RetryPolicy) -> FlushReport {
    let mut report = FlushReport::default();
    for chunk in &plan.chunks {
        let outcome = retry_with_policy(
            policy,
            |_| sink.write_chunk(chunk),
            |err: &SinkWriteError| err.is_retryable(),
        )
        .await;
        match outcome.result {
            Ok(()) => {
                report.chunks_written += 1;
                report.cells_written += chunk.cell_count();
            }
            Err(err) => {
                warn!(
                    chunk = chunk.index,
                    attempts = outcome.attempts,
                    error = %err,
                    "write chunk failed; continuing with remaining chunks"
                );
                report.failures.push(ChunkFailure {
                    chunk_index: chunk.index,
                    ranges: chunk.ranges.iter().map(RangeWrite::a1).collect(),
                    attempts: outcome.attempts,
                    error: err.to_string(),
                });
            }
        }
    }
    info!(
        chunks = report.chunks_written,
        cells = report.cells_written,
        failed = report.failures.len(),
        "write-back flushed"
    );
    report
}
