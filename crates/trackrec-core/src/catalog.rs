//! Status mapping catalog and normalizer.
//!
//! The catalog is built once from two JSON documents and is immutable
//! afterwards:
//!
//! * keyword table: `{"ENTREGADO": ["fue entregado", ...], ...}`
//! * override table: `{"envio pendiente por admitir": "PENDIENTE", ...}`
//!
//! Normalization precedence is override (exact phrase), then keyword substring
//! scan in catalog precedence order, then a small built-in heuristic set, then
//! `DESCONOCIDO`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::CanonicalStatus;

/// Last-resort synonyms, consulted only when neither table matches.
const HEURISTICS: &[(&str, CanonicalStatus)] = &[
    ("devuelt", CanonicalStatus::Devuelto),
    ("devolucion", CanonicalStatus::Devuelto),
    ("retorno", CanonicalStatus::Devuelto),
    ("cancelad", CanonicalStatus::Cancelado),
    ("anulad", CanonicalStatus::Cancelado),
    ("reenvi", CanonicalStatus::Reenvio),
    ("reexpedi", CanonicalStatus::Reenvio),
    ("novedad", CanonicalStatus::Novedad),
    ("entregad", CanonicalStatus::Entregado),
    ("agencia", CanonicalStatus::EnAgencia),
    ("recoger", CanonicalStatus::EnAgencia),
    ("transito", CanonicalStatus::EnTransito),
    ("camino", CanonicalStatus::EnTransito),
    ("ruta", CanonicalStatus::EnTransito),
    ("centro", CanonicalStatus::EnTransito),
    ("recibimos", CanonicalStatus::EnTransito),
    ("guia generada", CanonicalStatus::GuiaGenerada),
    ("preparado para transportadora", CanonicalStatus::GuiaGenerada),
    ("pendiente", CanonicalStatus::Pendiente),
    ("origen", CanonicalStatus::Pendiente),
];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading mapping document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {document} mapping document: {source}")]
    Parse {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{document} mapping document references unknown canonical status `{key}`")]
    UnknownStatus { document: &'static str, key: String },
    #[error("empty keyword fragment under `{status}`")]
    EmptyFragment { status: CanonicalStatus },
    #[error("keyword fragment `{fragment}` listed under both `{first}` and `{second}`")]
    DuplicateFragment {
        fragment: String,
        first: CanonicalStatus,
        second: CanonicalStatus,
    },
    #[error("override phrase `{phrase}` maps to both `{first}` and `{second}`")]
    ConflictingOverride {
        phrase: String,
        first: CanonicalStatus,
        second: CanonicalStatus,
    },
    #[error("override phrase `{phrase}` would remap canonical status `{canonical}` to `{target}`")]
    RemappedCanonical {
        phrase: String,
        canonical: CanonicalStatus,
        target: CanonicalStatus,
    },
    #[error("status `{0}` appears more than once in the precedence order")]
    RepeatedPrecedence(CanonicalStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationVia {
    Override,
    Keyword,
    Heuristic,
    Fallback,
}

impl NormalizationVia {
    pub fn as_str(self) -> &'static str {
        match self {
            NormalizationVia::Override => "override",
            NormalizationVia::Keyword => "keyword",
            NormalizationVia::Heuristic => "heuristic",
            NormalizationVia::Fallback => "fallback",
        }
    }
}

/// How a raw status was classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Explanation {
    pub raw: String,
    pub status: CanonicalStatus,
    pub via: NormalizationVia,
    pub fragment: Option<String>,
}

impl Explanation {
    /// Non-empty text that no table or heuristic recognised.
    pub fn is_unmapped(&self) -> bool {
        self.via == NormalizationVia::Fallback && !self.raw.trim().is_empty()
    }
}

/// Trims, lower-cases, strips diacritics and collapses inner whitespace.
pub fn fold(raw: &str) -> String {
    raw.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct StatusCatalog {
    overrides: HashMap<String, CanonicalStatus>,
    keywords: BTreeMap<CanonicalStatus, Vec<String>>,
    precedence: Vec<CanonicalStatus>,
}

impl StatusCatalog {
    /// Builds the catalog from the two JSON documents. Any malformed entry
    /// fails the whole load.
    pub fn from_documents(keywords_json: &str, overrides_json: &str) -> Result<Self, CatalogError> {
        let raw_keywords: BTreeMap<String, Vec<String>> = serde_json::from_str(keywords_json)
            .map_err(|source| CatalogError::Parse {
                document: "keyword",
                source,
            })?;
        let raw_overrides: BTreeMap<String, String> = serde_json::from_str(overrides_json)
            .map_err(|source| CatalogError::Parse {
                document: "override",
                source,
            })?;

        let mut keywords: BTreeMap<CanonicalStatus, Vec<String>> = BTreeMap::new();
        let mut owner: HashMap<String, CanonicalStatus> = HashMap::new();
        for (key, fragments) in raw_keywords {
            let status: CanonicalStatus = key.parse().map_err(|_| CatalogError::UnknownStatus {
                document: "keyword",
                key: key.clone(),
            })?;
            for fragment in fragments {
                let folded = fold(&fragment);
                if folded.is_empty() {
                    return Err(CatalogError::EmptyFragment { status });
                }
                match owner.get(&folded).copied() {
                    Some(first) if first != status => {
                        return Err(CatalogError::DuplicateFragment {
                            fragment: folded,
                            first,
                            second: status,
                        });
                    }
                    Some(_) => continue,
                    None => {
                        owner.insert(folded.clone(), status);
                        keywords.entry(status).or_default().push(folded);
                    }
                }
            }
        }

        // Canonical codes always map to themselves.
        let mut overrides: HashMap<String, CanonicalStatus> = HashMap::new();
        for status in CanonicalStatus::ALL {
            let code = fold(status.as_str());
            overrides.insert(code.replace('_', " "), status);
            overrides.insert(code, status);
        }
        overrides.insert("devolucion".to_string(), CanonicalStatus::Devuelto);

        let mut explicit: HashMap<String, CanonicalStatus> = HashMap::new();
        for (phrase, target) in raw_overrides {
            let status: CanonicalStatus = target.parse().map_err(|_| CatalogError::UnknownStatus {
                document: "override",
                key: target.clone(),
            })?;
            let folded = fold(&phrase);
            if folded.is_empty() {
                return Err(CatalogError::EmptyFragment { status });
            }
            if let Some(first) = explicit.insert(folded.clone(), status) {
                if first != status {
                    return Err(CatalogError::ConflictingOverride {
                        phrase: folded,
                        first,
                        second: status,
                    });
                }
            }
        }
        for (phrase, target) in explicit {
            if let Some(canonical) = overrides.get(&phrase).copied() {
                if canonical != target {
                    return Err(CatalogError::RemappedCanonical {
                        phrase,
                        canonical,
                        target,
                    });
                }
                continue;
            }
            overrides.insert(phrase, target);
        }

        tracing::debug!(
            overrides = overrides.len(),
            fragments = owner.len(),
            "status catalog compiled"
        );

        Ok(Self {
            overrides,
            keywords,
            precedence: CanonicalStatus::ALL.to_vec(),
        })
    }

    pub fn load(keywords_path: &Path, overrides_path: &Path) -> Result<Self, CatalogError> {
        let keywords = read_document(keywords_path)?;
        let overrides = read_document(overrides_path)?;
        Self::from_documents(&keywords, &overrides)
    }

    /// Reorders keyword precedence. Statuses not listed keep their declared
    /// order after the listed ones.
    pub fn with_precedence(mut self, order: &[CanonicalStatus]) -> Result<Self, CatalogError> {
        let mut precedence = Vec::with_capacity(CanonicalStatus::ALL.len());
        for status in order {
            if precedence.contains(status) {
                return Err(CatalogError::RepeatedPrecedence(*status));
            }
            precedence.push(*status);
        }
        for status in CanonicalStatus::ALL {
            if !precedence.contains(&status) {
                precedence.push(status);
            }
        }
        self.precedence = precedence;
        Ok(self)
    }

    pub fn precedence(&self) -> &[CanonicalStatus] {
        &self.precedence
    }

    /// Keyword fragments in precedence order.
    pub fn fragments(&self) -> impl Iterator<Item = (CanonicalStatus, &str)> + '_ {
        self.precedence.iter().flat_map(move |status| {
            self.keywords
                .get(status)
                .into_iter()
                .flatten()
                .map(move |fragment| (*status, fragment.as_str()))
        })
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    pub fn normalize(&self, raw: &str) -> CanonicalStatus {
        self.explain(raw).status
    }

    pub fn explain(&self, raw: &str) -> Explanation {
        let folded = fold(raw);
        let explained = |status, via, fragment: Option<&str>| Explanation {
            raw: raw.to_string(),
            status,
            via,
            fragment: fragment.map(str::to_string),
        };

        if folded.is_empty() {
            return explained(CanonicalStatus::Desconocido, NormalizationVia::Fallback, None);
        }
        if let Some(status) = self.overrides.get(&folded) {
            return explained(*status, NormalizationVia::Override, Some(folded.as_str()));
        }
        if let Some((status, fragment)) = self
            .fragments()
            .find(|(_, fragment)| folded.contains(fragment))
        {
            return explained(status, NormalizationVia::Keyword, Some(fragment));
        }
        if let Some((fragment, status)) = HEURISTICS
            .iter()
            .find(|(fragment, _)| folded.contains(fragment))
        {
            return explained(*status, NormalizationVia::Heuristic, Some(*fragment));
        }
        explained(CanonicalStatus::Desconocido, NormalizationVia::Fallback, None)
    }
}

fn read_document(path: &Path) -> Result<String, CatalogError> {
    std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })
}
