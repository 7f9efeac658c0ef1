//! Fetch/extract collaborators: turn a tracked page into a [`RawExtract`].
//!
//! Extraction owns every fragile HTML heuristic; the detection core only ever sees
//! structured `{header, rows}` records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiwatch_core::{KnownField, RawExtract, RawRow, DEFAULT_HEADER};
use kiwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "kiwatch-adapters";

const HEADER_SELECTOR: &str = "h2#known-issues";
const TABLE_SELECTOR: &str = "table";
const ROW_SELECTOR: &str = "tbody tr";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("missing expected structure: {0}")]
    MissingStructure(String),
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Extract every table row instead of only the first (most recent) one.
    pub deep: bool,
}

#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, url: &str, options: ExtractOptions) -> Result<RawExtract, ExtractError>;
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// Text fragments of a cell, each trimmed, joined with `" | "`.
fn cell_text_joined(cell: ElementRef<'_>) -> String {
    cell.text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

fn row_fields(row: ElementRef<'_>) -> RawRow {
    let cells = row
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "td")
        .collect::<Vec<_>>();

    KnownField::ORDER
        .into_iter()
        .enumerate()
        .map(|(idx, field)| {
            let value = match (field, cells.get(idx)) {
                (_, None) => String::new(),
                // Multi-line "KB / OS build" cells keep their line structure.
                (KnownField::OriginatingUpdate, Some(cell)) => cell_text_joined(*cell),
                (_, Some(cell)) => cell_text(*cell),
            };
            (field.label().to_string(), value)
        })
        .collect()
}

/// Parse the known-issues table out of a release-health style page.
pub fn parse_known_issues(html: &str, options: ExtractOptions) -> Result<RawExtract, ExtractError> {
    let document = Html::parse_document(html);

    let header = document
        .select(&selector(HEADER_SELECTOR)?)
        .next()
        .ok_or_else(|| ExtractError::MissingStructure(format!("no {HEADER_SELECTOR} heading")))?;
    let table = document
        .select(&selector(TABLE_SELECTOR)?)
        .next()
        .ok_or_else(|| ExtractError::MissingStructure("no table".to_string()))?;

    let header_text = cell_text(header);
    let header_text = if header_text.is_empty() {
        DEFAULT_HEADER.to_string()
    } else {
        header_text
    };

    let row_sel = selector(ROW_SELECTOR)?;
    let rows = table.select(&row_sel).map(row_fields);
    let rows: Vec<RawRow> = if options.deep {
        rows.collect()
    } else {
        rows.take(1).collect()
    };

    Ok(RawExtract::new(header_text, rows))
}

/// Live extractor: fetch over HTTP, then parse the known-issues table.
#[derive(Debug, Clone)]
pub struct KnownIssuesExtractor {
    http: Arc<HttpFetcher>,
}

impl KnownIssuesExtractor {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageExtractor for KnownIssuesExtractor {
    async fn extract(
        &self,
        url: &str,
        options: ExtractOptions,
    ) -> Result<RawExtract, ExtractError> {
        let page = self.http.fetch_text(url).await?;
        let extract = parse_known_issues(&page.body, options)?;
        debug!(url, rows = extract.rows.len(), deep = options.deep, "known issues extracted");
        Ok(extract)
    }
}

#[derive(Debug, Clone)]
enum Canned {
    Extract(RawExtract),
    Failure(String),
}

/// In-memory extractor serving canned results per URL; unknown URLs fail.
///
/// Used for offline runs and tests. Results can be swapped between sweeps.
#[derive(Debug, Default)]
pub struct StaticExtractor {
    pages: Mutex<HashMap<String, Canned>>,
    delay: Option<Duration>,
}

impl StaticExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering, to exercise timeouts and cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn set_page(&self, url: impl Into<String>, extract: RawExtract) {
        self.pages
            .lock()
            .await
            .insert(url.into(), Canned::Extract(extract));
    }

    pub async fn set_failure(&self, url: impl Into<String>, reason: impl Into<String>) {
        self.pages
            .lock()
            .await
            .insert(url.into(), Canned::Failure(reason.into()));
    }
}

#[async_trait]
impl PageExtractor for StaticExtractor {
    async fn extract(
        &self,
        url: &str,
        options: ExtractOptions,
    ) -> Result<RawExtract, ExtractError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let canned = self.pages.lock().await.get(url).cloned();
        match canned {
            Some(Canned::Extract(mut extract)) => {
                if !options.deep {
                    extract.rows.truncate(1);
                }
                Ok(extract)
            }
            Some(Canned::Failure(reason)) => Err(ExtractError::Message(reason)),
            None => Err(ExtractError::MissingStructure(format!("no canned page for {url}"))),
        }
    }
}
