//! Core domain model, row normalization and fingerprinting for kiwatch.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "kiwatch-core";

/// Header used when a page carries a known-issues table without a readable heading.
pub const DEFAULT_HEADER: &str = "Known issues";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serializing canonical payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unknown classification: {0}")]
    UnknownClassification(String),
}

/// One table row as handed over by an extractor: field name -> cell text.
pub type RawRow = HashMap<String, String>;

/// Extraction handoff contract from adapters into the detection pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawExtract {
    pub header: String,
    pub rows: Vec<RawRow>,
}

impl RawExtract {
    pub fn new(header: impl Into<String>, rows: Vec<RawRow>) -> Self {
        Self {
            header: header.into(),
            rows,
        }
    }
}

/// The fixed set of known-issue columns, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownField {
    Summary,
    OriginatingUpdate,
    Status,
    LastUpdated,
}

impl KnownField {
    pub const ORDER: [KnownField; 4] = [
        KnownField::Summary,
        KnownField::OriginatingUpdate,
        KnownField::Status,
        KnownField::LastUpdated,
    ];

    pub fn label(self) -> &'static str {
        match self {
            KnownField::Summary => "Summary",
            KnownField::OriginatingUpdate => "Originating update",
            KnownField::Status => "Status",
            KnownField::LastUpdated => "Last updated",
        }
    }

    /// Match an input column name, ignoring case and surrounding whitespace.
    pub fn from_label(label: &str) -> Option<Self> {
        let wanted = label.trim();
        Self::ORDER
            .into_iter()
            .find(|field| field.label().eq_ignore_ascii_case(wanted))
    }
}

/// Canonical field set of a single known-issue row.
///
/// Field declaration order is the serialization order and therefore part of the
/// fingerprint contract. Do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KnownIssueRow {
    #[serde(rename = "Summary")]
    pub summary: String,
    #[serde(rename = "Originating update")]
    pub originating_update: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Last updated")]
    pub last_updated: String,
}

impl KnownIssueRow {
    fn slot(&mut self, field: KnownField) -> &mut String {
        match field {
            KnownField::Summary => &mut self.summary,
            KnownField::OriginatingUpdate => &mut self.originating_update,
            KnownField::Status => &mut self.status,
            KnownField::LastUpdated => &mut self.last_updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KnownIssuesSection {
    pub header: String,
    pub row: KnownIssueRow,
}

/// Normalized `{header, row}` representation of one logical row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CanonicalPayload {
    pub known_issues: KnownIssuesSection,
}

impl CanonicalPayload {
    pub fn new(header: impl Into<String>, row: KnownIssueRow) -> Self {
        Self {
            known_issues: KnownIssuesSection {
                header: header.into(),
                row,
            },
        }
    }

    pub fn header(&self) -> &str {
        &self.known_issues.header
    }

    pub fn row(&self) -> &KnownIssueRow {
        &self.known_issues.row
    }

    /// Compact JSON in fixed key order; this is the fingerprint input.
    pub fn to_canonical_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Leading `YYYY-MM-DD` of the "Last updated" cell, if it has one.
    pub fn last_updated_date(&self) -> Option<NaiveDate> {
        let text = self.row().last_updated.trim();
        let head = text.get(..10)?;
        NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
    }
}

/// Turn one raw extract into one canonical payload per row.
///
/// Keys are matched case-insensitively, values are trimmed, absent columns become
/// empty strings and unknown columns are dropped.
pub fn normalize(extract: &RawExtract) -> Vec<CanonicalPayload> {
    let header = extract.header.trim();
    let header = if header.is_empty() { DEFAULT_HEADER } else { header };
    extract
        .rows
        .iter()
        .map(|raw| CanonicalPayload::new(header, normalize_row(raw)))
        .collect()
}

fn normalize_row(raw: &RawRow) -> KnownIssueRow {
    let mut row = KnownIssueRow::default();
    let mut keys: Vec<&String> = raw.keys().collect();
    // Two source keys can map to one field ("Status" and "status "); sorting keeps
    // the winner independent of map iteration order.
    keys.sort();
    for key in keys {
        let Some(field) = KnownField::from_label(key) else {
            continue;
        };
        let slot = row.slot(field);
        if slot.is_empty() {
            *slot = raw[key].trim().to_string();
        }
    }
    row
}

/// Lowercase hex SHA-256 over a canonical payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const HEX_LEN: usize = 64;

    pub fn of(payload: &CanonicalPayload) -> Result<Self, CoreError> {
        let json = payload.to_canonical_json()?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Wrap a digest read back from storage.
    pub fn from_stored(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintedRow {
    pub payload: CanonicalPayload,
    pub fingerprint: Fingerprint,
}

/// Normalize and fingerprint every row of an extract, preserving row order.
pub fn prepare_batch(extract: &RawExtract) -> Result<Vec<FingerprintedRow>, CoreError> {
    normalize(extract)
        .into_iter()
        .map(|payload| {
            let fingerprint = Fingerprint::of(&payload)?;
            Ok(FingerprintedRow {
                payload,
                fingerprint,
            })
        })
        .collect()
}

/// Triage label a reviewer assigns to an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Critical,
    Active,
    Resolved,
    Ignore,
    Unknown,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Critical => "Critical",
            Classification::Active => "Active",
            Classification::Resolved => "Resolved",
            Classification::Ignore => "Ignore",
            Classification::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Classification::Critical,
            Classification::Active,
            Classification::Resolved,
            Classification::Ignore,
            Classification::Unknown,
        ]
        .into_iter()
        .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| CoreError::UnknownClassification(s.to_string()))
    }
}

/// A tracked page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub url: String,
    pub last_swept_at: Option<DateTime<Utc>>,
}

/// One persisted capture of a single canonical row for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub target_id: i64,
    pub captured_at: DateTime<Utc>,
    pub payload: CanonicalPayload,
    pub fingerprint: Fingerprint,
    pub classification: Option<Classification>,
    pub comment: Option<String>,
    pub alert: bool,
}

/// Insert contract for a freshly detected row; triage fields start unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObservation {
    pub target_id: i64,
    pub captured_at: DateTime<Utc>,
    pub payload: CanonicalPayload,
    pub fingerprint: Fingerprint,
}

impl NewObservation {
    pub fn from_row(target_id: i64, captured_at: DateTime<Utc>, row: FingerprintedRow) -> Self {
        Self {
            target_id,
            captured_at,
            payload: row.payload,
            fingerprint: row.fingerprint,
        }
    }
}

/// Partial triage update.
///
/// For `classification` and `comment` a missing key leaves the stored value
/// alone, an explicit `null` clears it and a value replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObservationUpdate {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub classification: Option<Option<Classification>>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub comment: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<bool>,
}

/// Marks a key that was present in the input, even when its value is `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
