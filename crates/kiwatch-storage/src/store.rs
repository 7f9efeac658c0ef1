//! [`Store`], the SQLite implementation of the persistence collaborator.

use std::cmp::Reverse;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use kiwatch_core::{
    CanonicalPayload, Classification, Fingerprint, NewObservation, Observation,
    ObservationUpdate, Target,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use crate::schema::SCHEMA;
use crate::{Result, StorageError};

const OBSERVATION_COLUMNS: &str =
    "id, target_id, captured_at, content, fingerprint, classification, comment, alert";

/// Target/observation store. Cloning is cheap; the pool is reference-counted.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory store for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every new connection would be a fresh empty database, so pin exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start a transaction scope for one detection pass.
    ///
    /// The write lock is taken up front so concurrent passes queue on the busy
    /// timeout instead of failing when a reader upgrades to a writer.
    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin_with("BEGIN IMMEDIATE").await?,
        })
    }

    /// Insert a new target. A duplicate URL yields [`StorageError::UniqueViolation`].
    pub async fn insert_target(&self, url: &str) -> Result<Target> {
        let row = sqlx::query("INSERT INTO targets (url) VALUES (?1) RETURNING id")
            .bind(url)
            .fetch_one(&self.pool)
            .await
            .map_err(map_unique_violation)?;
        Ok(Target {
            id: row.try_get("id")?,
            url: url.to_string(),
            last_swept_at: None,
        })
    }

    pub async fn target_by_url(&self, url: &str) -> Result<Option<Target>> {
        let row = sqlx::query("SELECT id, url, last_swept_at FROM targets WHERE url = ?1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(target_from_row).transpose()
    }

    pub async fn target(&self, id: i64) -> Result<Target> {
        let row = sqlx::query("SELECT id, url, last_swept_at FROM targets WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => target_from_row(&row),
            None => Err(StorageError::NotFound {
                entity: "target",
                id,
            }),
        }
    }

    pub async fn list_targets(&self, skip: i64, limit: i64) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            "SELECT id, url, last_swept_at FROM targets ORDER BY id LIMIT ?1 OFFSET ?2",
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(target_from_row).collect()
    }

    pub async fn all_targets(&self) -> Result<Vec<Target>> {
        let rows = sqlx::query("SELECT id, url, last_swept_at FROM targets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(target_from_row).collect()
    }

    pub async fn target_urls(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT url FROM targets")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("url").map_err(StorageError::from))
            .collect()
    }

    pub async fn observation(&self, id: i64) -> Result<Observation> {
        let row = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => observation_from_row(&row),
            None => Err(StorageError::NotFound {
                entity: "observation",
                id,
            }),
        }
    }

    pub async fn list_observations(&self, skip: i64, limit: i64) -> Result<Vec<Observation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations ORDER BY id LIMIT ?1 OFFSET ?2"
        ))
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    /// Observations of one target, newest "Last updated" date first.
    ///
    /// Rows whose date cannot be parsed sort last; ties fall back to capture time.
    pub async fn observations_for_target(
        &self,
        target_id: i64,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<Observation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE target_id = ?1"
        ))
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;
        let mut observations = rows
            .iter()
            .map(observation_from_row)
            .collect::<Result<Vec<_>>>()?;
        observations.sort_by_key(|o| {
            (
                Reverse(o.payload.last_updated_date()),
                Reverse(o.captured_at),
                Reverse(o.id),
            )
        });
        Ok(observations.into_iter().skip(skip).take(limit).collect())
    }

    pub async fn flagged_observations(&self) -> Result<Vec<Observation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE alert = 1 ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    pub async fn latest_observation_for_url(&self, url: &str) -> Result<Option<Observation>> {
        let row = sqlx::query(
            "SELECT o.id, o.target_id, o.captured_at, o.content, o.fingerprint,
                    o.classification, o.comment, o.alert
               FROM observations o
               JOIN targets t ON t.id = o.target_id
              WHERE t.url = ?1
              ORDER BY o.captured_at DESC, o.id DESC
              LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(observation_from_row).transpose()
    }

    pub async fn count_observations(&self, target_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM observations WHERE target_id = ?1")
                .bind(target_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Apply a triage update. Only the classification, comment and alert columns
    /// are ever written after insert; an explicit `null` clears the first two.
    pub async fn update_observation(
        &self,
        id: i64,
        update: &ObservationUpdate,
    ) -> Result<Observation> {
        let result = sqlx::query(
            "UPDATE observations
                SET classification = CASE WHEN ?1 THEN ?2 ELSE classification END,
                    comment        = CASE WHEN ?3 THEN ?4 ELSE comment END,
                    alert          = COALESCE(?5, alert)
              WHERE id = ?6",
        )
        .bind(update.classification.is_some())
        .bind(update.classification.flatten().map(Classification::as_str))
        .bind(update.comment.is_some())
        .bind(update.comment.as_ref().and_then(|c| c.as_deref()))
        .bind(update.alert)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "observation",
                id,
            });
        }
        debug!(observation_id = id, ?update, "observation triaged");
        self.observation(id).await
    }
}

/// Transaction scope of one detection pass. Dropping it without [`StoreTx::commit`]
/// rolls everything back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    /// Most recent observation of `target_id` carrying `fingerprint`, if any.
    pub async fn find_observation_by_fingerprint(
        &mut self,
        target_id: i64,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Observation>> {
        let row = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
              WHERE target_id = ?1 AND fingerprint = ?2
              ORDER BY captured_at DESC, id DESC
              LIMIT 1"
        ))
        .bind(target_id)
        .bind(fingerprint.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(observation_from_row).transpose()
    }

    /// Insert an untriaged observation.
    ///
    /// Returns `None` when the `(target_id, fingerprint)` pair already exists, which
    /// happens when a concurrent pass committed the same row first.
    pub async fn insert_observation(
        &mut self,
        new: &NewObservation,
    ) -> Result<Option<Observation>> {
        let content = new.payload.to_canonical_json()?;
        let row = sqlx::query(
            "INSERT INTO observations
                 (target_id, captured_at, content, fingerprint, classification, comment, alert)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, 0)
             ON CONFLICT (target_id, fingerprint) DO NOTHING
             RETURNING id",
        )
        .bind(new.target_id)
        .bind(encode_dt(new.captured_at))
        .bind(&content)
        .bind(new.fingerprint.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Observation {
            id: row.try_get("id")?,
            target_id: new.target_id,
            captured_at: new.captured_at,
            payload: new.payload.clone(),
            fingerprint: new.fingerprint.clone(),
            classification: None,
            comment: None,
            alert: false,
        }))
    }

    pub async fn mark_swept(&mut self, target_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE targets SET last_swept_at = ?1 WHERE id = ?2")
            .bind(encode_dt(at))
            .bind(target_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn map_unique_violation(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::UniqueViolation(db.message().to_string())
        }
        _ => StorageError::Database(err),
    }
}

/// Fixed-width RFC 3339 so lexical order in SQL matches time order.
fn encode_dt(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_dt(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc))
}

fn target_from_row(row: &SqliteRow) -> Result<Target> {
    let last_swept_at: Option<String> = row.try_get("last_swept_at")?;
    Ok(Target {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        last_swept_at: last_swept_at.as_deref().map(decode_dt).transpose()?,
    })
}

fn observation_from_row(row: &SqliteRow) -> Result<Observation> {
    let captured_at: String = row.try_get("captured_at")?;
    let content: String = row.try_get("content")?;
    let fingerprint: String = row.try_get("fingerprint")?;
    let classification: Option<String> = row.try_get("classification")?;
    Ok(Observation {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        captured_at: decode_dt(&captured_at)?,
        payload: CanonicalPayload::from_json(&content)?,
        fingerprint: Fingerprint::from_stored(fingerprint),
        classification: classification
            .as_deref()
            .map(Classification::from_str)
            .transpose()?,
        comment: row.try_get("comment")?,
        alert: row.try_get("alert")?,
    })
}
