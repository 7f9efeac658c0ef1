//! [`UrlIdentityCache`]: in-memory set of registered target URLs in front of the
//! authoritative `targets.url` unique constraint.

use std::collections::HashSet;

use kiwatch_core::Target;
use kiwatch_storage::{Store, StorageError};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid target url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("target {0} reported as duplicate but could not be read back")]
    Vanished(String),
}

/// Parse and re-serialize a URL so equivalent spellings share one identity.
pub fn canonical_url(raw: &str) -> Result<String, RegistryError> {
    let parsed = Url::parse(raw.trim()).map_err(|e| RegistryError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(RegistryError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

#[derive(Debug)]
pub struct UrlIdentityCache {
    store: Store,
    known: RwLock<HashSet<String>>,
}

impl UrlIdentityCache {
    /// Build the cache from every target already in storage.
    pub async fn load(store: Store) -> Result<Self, StorageError> {
        let urls = store.target_urls().await?;
        info!(targets = urls.len(), "url identity cache loaded");
        Ok(Self {
            store,
            known: RwLock::new(urls.into_iter().collect()),
        })
    }

    pub async fn contains(&self, url: &str) -> bool {
        match canonical_url(url) {
            Ok(url) => self.known.read().await.contains(&url),
            Err(_) => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.known.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.known.read().await.is_empty()
    }

    /// Return the target for `url`, registering it first if needed.
    ///
    /// A lost insert race surfaces as a unique violation and resolves to the row
    /// the other writer created.
    pub async fn ensure(&self, url: &str) -> Result<Target, RegistryError> {
        let url = canonical_url(url)?;

        if self.known.read().await.contains(&url) {
            if let Some(target) = self.store.target_by_url(&url).await? {
                return Ok(target);
            }
            // Storage is authoritative; a stale entry falls through to insert.
            debug!(%url, "cached url missing from storage");
        }

        let target = match self.store.insert_target(&url).await {
            Ok(target) => {
                info!(target_id = target.id, %url, "target registered");
                target
            }
            Err(StorageError::UniqueViolation(_)) => {
                debug!(%url, "target inserted concurrently; reading existing row");
                self.store
                    .target_by_url(&url)
                    .await?
                    .ok_or_else(|| RegistryError::Vanished(url.clone()))?
            }
            Err(err) => return Err(err.into()),
        };

        self.known.write().await.insert(url);
        Ok(target)
    }
}
