//! Core domain model for delivery status reconciliation: canonical statuses,
//! the decision engine and the per-row tracking record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;

pub use catalog::{fold, CatalogError, Explanation, NormalizationVia, StatusCatalog};

pub const CRATE_NAME: &str = "trackrec-core";

/// Closed set of normalized delivery states.
///
/// Declaration order is the default keyword precedence used by
/// [`StatusCatalog::normalize`]: when raw text contains fragments of two
/// statuses, the one declared first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalStatus {
    Devuelto,
    Cancelado,
    Reenvio,
    Novedad,
    Entregado,
    EnAgencia,
    EnTransito,
    GuiaGenerada,
    Pendiente,
    Desconocido,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 10] = [
        CanonicalStatus::Devuelto,
        CanonicalStatus::Cancelado,
        CanonicalStatus::Reenvio,
        CanonicalStatus::Novedad,
        CanonicalStatus::Entregado,
        CanonicalStatus::EnAgencia,
        CanonicalStatus::EnTransito,
        CanonicalStatus::GuiaGenerada,
        CanonicalStatus::Pendiente,
        CanonicalStatus::Desconocido,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalStatus::Devuelto => "DEVUELTO",
            CanonicalStatus::Cancelado => "CANCELADO",
            CanonicalStatus::Reenvio => "REENVIO",
            CanonicalStatus::Novedad => "NOVEDAD",
            CanonicalStatus::Entregado => "ENTREGADO",
            CanonicalStatus::EnAgencia => "EN_AGENCIA",
            CanonicalStatus::EnTransito => "EN_TRANSITO",
            CanonicalStatus::GuiaGenerada => "GUIA_GENERADA",
            CanonicalStatus::Pendiente => "PENDIENTE",
            CanonicalStatus::Desconocido => "DESCONOCIDO",
        }
    }

    /// Shipments in a terminal state are closed and never re-queried.
    pub fn is_terminal(self) -> bool {
        matches!(self, CanonicalStatus::Entregado | CanonicalStatus::Devuelto)
    }

    pub fn is_known(self) -> bool {
        self != CanonicalStatus::Desconocido
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown canonical status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for CanonicalStatus {
    type Err = UnknownStatus;

    /// Parses a canonical code. `DEVOLUCION` is accepted as an alias of `DEVUELTO`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase().replace(' ', "_");
        if code == "DEVOLUCION" {
            return Ok(CanonicalStatus::Devuelto);
        }
        CanonicalStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == code)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Tri-state match flag; `Unknown` while the carrier side has not been fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchFlag {
    True,
    False,
    #[default]
    Unknown,
}

impl MatchFlag {
    /// Sheet cell representation. `Unknown` renders as an empty cell.
    pub fn as_cell(self) -> &'static str {
        match self {
            MatchFlag::True => "TRUE",
            MatchFlag::False => "FALSE",
            MatchFlag::Unknown => "",
        }
    }

    pub fn from_cell(cell: &str) -> Self {
        match cell.trim().to_ascii_uppercase().as_str() {
            "TRUE" | "VERDADERO" | "SI" | "SÍ" | "YES" | "1" => MatchFlag::True,
            "FALSE" | "FALSO" | "NO" | "0" => MatchFlag::False,
            _ => MatchFlag::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub match_flag: MatchFlag,
    pub alert: bool,
    pub can_query: bool,
}

/// Decision engine.
///
/// `scraped` is `None` while the carrier status has not been fetched; the
/// alert is then withheld and the match flag stays unknown. `DESCONOCIDO`
/// never satisfies a match, on either side.
pub fn decide(source: CanonicalStatus, scraped: Option<CanonicalStatus>) -> Decision {
    let can_query = !source.is_terminal();
    match scraped {
        None => Decision {
            match_flag: MatchFlag::Unknown,
            alert: false,
            can_query,
        },
        Some(scraped) => {
            let matched = source == scraped && source.is_known();
            Decision {
                match_flag: if matched { MatchFlag::True } else { MatchFlag::False },
                alert: !matched,
                can_query,
            }
        }
    }
}

/// Every `(source, scraped)` pair of the closed set with its decision.
pub fn decision_table() -> Vec<(CanonicalStatus, Option<CanonicalStatus>, Decision)> {
    let scraped_side = std::iter::once(None).chain(CanonicalStatus::ALL.into_iter().map(Some));
    let scraped_side: Vec<_> = scraped_side.collect();
    CanonicalStatus::ALL
        .into_iter()
        .flat_map(|source| {
            scraped_side
                .iter()
                .map(move |scraped| (source, *scraped, decide(source, *scraped)))
        })
        .collect()
}

/// One row of the reconciliation sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub row_index: u32,
    pub tracking_id: String,
    pub source_status_raw: String,
    pub source_status: CanonicalStatus,
    pub scraped_status_raw: String,
    pub scraped_status: CanonicalStatus,
    pub match_flag: MatchFlag,
    pub alert: bool,
    pub attempt_count: u32,
    pub checked_at: Option<DateTime<Utc>>,
}

impl TrackingRecord {
    pub fn new(
        row_index: u32,
        tracking_id: impl Into<String>,
        source_status_raw: impl Into<String>,
        catalog: &StatusCatalog,
    ) -> Self {
        let source_status_raw = source_status_raw.into();
        let source_status = catalog.normalize(&source_status_raw);
        let mut record = Self {
            row_index,
            tracking_id: tracking_id.into().trim().to_string(),
            source_status_raw,
            source_status,
            scraped_status_raw: String::new(),
            scraped_status: CanonicalStatus::Desconocido,
            match_flag: MatchFlag::Unknown,
            alert: false,
            attempt_count: 0,
            checked_at: None,
        };
        record.refresh_decision();
        record
    }

    /// Seeds the previously known carrier status, e.g. read back from the sheet.
    pub fn with_scraped(mut self, scraped_raw: impl Into<String>, catalog: &StatusCatalog) -> Self {
        self.scraped_status_raw = scraped_raw.into().trim().to_string();
        self.scraped_status = catalog.normalize(&self.scraped_status_raw);
        self.refresh_decision();
        self
    }

    pub fn has_scraped(&self) -> bool {
        !self.scraped_status_raw.trim().is_empty()
    }

    pub fn scraped_for_decision(&self) -> Option<CanonicalStatus> {
        self.has_scraped().then_some(self.scraped_status)
    }

    pub fn decision(&self) -> Decision {
        decide(self.source_status, self.scraped_for_decision())
    }

    pub fn can_query(&self) -> bool {
        self.decision().can_query
    }

    /// Applies a settled fetch. An empty result never replaces a known
    /// carrier status; the attempt count is recorded either way. Returns
    /// whether the stored carrier text changed.
    pub fn apply_fetch(
        &mut self,
        raw: &str,
        attempts: u32,
        catalog: &StatusCatalog,
        at: DateTime<Utc>,
    ) -> bool {
        self.attempt_count = attempts;
        let raw = raw.trim();
        if raw.is_empty() {
            return false;
        }
        let changed = raw != self.scraped_status_raw;
        self.scraped_status_raw = raw.to_string();
        self.scraped_status = catalog.normalize(raw);
        self.checked_at = Some(at);
        self.refresh_decision();
        changed
    }

    /// Recomputes both normalized values and the decision with `catalog`.
    pub fn renormalize(&mut self, catalog: &StatusCatalog) {
        self.source_status = catalog.normalize(&self.source_status_raw);
        self.scraped_status = catalog.normalize(&self.scraped_status_raw);
        self.refresh_decision();
    }

    fn refresh_decision(&mut self) {
        let decision = self.decision();
        self.match_flag = decision.match_flag;
        self.alert = decision.alert;
    }
}
