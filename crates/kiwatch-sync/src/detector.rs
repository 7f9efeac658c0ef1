//! [`ChangeDetector`]: decide which rows of a fresh batch are new for a target and
//! persist exactly those.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiwatch_core::{FingerprintedRow, NewObservation, Observation, Target};
use kiwatch_storage::{Store, StorageError};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionOutcome {
    /// Observations created by this pass, in batch order.
    pub new_observations: Vec<Observation>,
    /// Rows whose fingerprint was already stored for the target.
    pub duplicates: usize,
}

#[derive(Debug)]
pub struct ChangeDetector {
    store: Store,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChangeDetector {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn target_lock(&self, target_id: i64) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(target_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one detection pass for `target` inside a single transaction.
    ///
    /// Any storage error rolls the whole pass back; nothing from a failed batch is
    /// committed. Passes for the same target are serialized within this detector,
    /// and the `(target, fingerprint)` unique constraint covers other processes.
    pub async fn detect(
        &self,
        target: &Target,
        rows: Vec<FingerprintedRow>,
        swept_at: DateTime<Utc>,
    ) -> Result<DetectionOutcome, StorageError> {
        let lock = self.target_lock(target.id).await;
        let _guard = lock.lock().await;

        let mut tx = self.store.begin().await?;
        let mut outcome = DetectionOutcome::default();

        for row in rows {
            if let Some(existing) = tx
                .find_observation_by_fingerprint(target.id, &row.fingerprint)
                .await?
            {
                debug!(
                    target_id = target.id,
                    fingerprint = %row.fingerprint,
                    existing_id = existing.id,
                    "row already observed"
                );
                outcome.duplicates += 1;
                continue;
            }

            let new = NewObservation::from_row(target.id, swept_at, row);
            match tx.insert_observation(&new).await? {
                Some(observation) => outcome.new_observations.push(observation),
                None => {
                    debug!(
                        target_id = target.id,
                        fingerprint = %new.fingerprint,
                        "row committed concurrently; skipping"
                    );
                    outcome.duplicates += 1;
                }
            }
        }

        tx.mark_swept(target.id, swept_at).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwatch_core::{prepare_batch, RawExtract, RawRow};

    fn row(summary: &str, status: &str, last_updated: &str) -> RawRow {
        RawRow::from([
            ("Summary".to_string(), summary.to_string()),
            ("Status".to_string(), status.to_string()),
            ("Last updated".to_string(), last_updated.to_string()),
        ])
    }

    fn batch(rows: Vec<RawRow>) -> Vec<FingerprintedRow> {
        prepare_batch(&RawExtract::new("Known issues", rows)).unwrap()
    }

    async fn setup() -> (ChangeDetector, Target) {
        let store = Store::open_in_memory().await.unwrap();
        let target = store.insert_target("https://example.com/status").await.unwrap();
        (ChangeDetector::new(store), target)
    }

    #[tokio::test]
    async fn second_identical_pass_creates_nothing() {
        let (detector, target) = setup().await;
        let rows = vec![
            row("Printer bug", "Active", "2024-01-01"),
            row("VPN drops", "Resolved", "2024-01-03"),
        ];

        let first = detector
            .detect(&target, batch(rows.clone()), Utc::now())
            .await
            .unwrap();
        assert_eq!(first.new_observations.len(), 2);
        assert_eq!(first.duplicates, 0);

        let second = detector.detect(&target, batch(rows), Utc::now()).await.unwrap();
        assert!(second.new_observations.is_empty());
        assert_eq!(second.duplicates, 2);
        assert_eq!(detector.store().count_observations(target.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn only_unseen_rows_are_created() {
        let (detector, target) = setup().await;
        detector
            .detect(
                &target,
                batch(vec![row("Printer bug", "Active", "2024-01-01")]),
                Utc::now(),
            )
            .await
            .unwrap();

        let outcome = detector
            .detect(
                &target,
                batch(vec![
                    row("Printer bug", "Active", "2024-01-01"),
                    row("Printer bug", "Resolved", "2024-01-05"),
                ]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.new_observations.len(), 1);
        assert_eq!(outcome.duplicates, 1);
        let created = &outcome.new_observations[0];
        assert_eq!(created.payload.row().status, "Resolved");
        assert_eq!(created.classification, None);
        assert_eq!(created.comment, None);
        assert!(!created.alert);
    }

    #[tokio::test]
    async fn repeated_row_within_one_batch_is_stored_once() {
        let (detector, target) = setup().await;
        let same = row("Printer bug", "Active", "2024-01-01");
        let outcome = detector
            .detect(&target, batch(vec![same.clone(), same]), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.new_observations.len(), 1);
        assert_eq!(outcome.duplicates, 1);
    }

    #[tokio::test]
    async fn existing_observation_is_left_untouched() {
        let (detector, target) = setup().await;
        let rows = vec![row("Printer bug", "Active", "2024-01-01")];
        let first = detector
            .detect(&target, batch(rows.clone()), Utc::now())
            .await
            .unwrap();
        let original = first.new_observations[0].clone();

        detector.detect(&target, batch(rows), Utc::now()).await.unwrap();
        let reread = detector.store().observation(original.id).await.unwrap();
        assert_eq!(reread, original);
    }

    #[tokio::test]
    async fn pass_records_sweep_time_on_target() {
        let (detector, target) = setup().await;
        let swept_at = Utc::now();
        detector.detect(&target, Vec::new(), swept_at).await.unwrap();
        let reread = detector.store().target(target.id).await.unwrap();
        assert!(reread.last_swept_at.is_some());
    }

    #[tokio::test]
    async fn failed_pass_commits_nothing() {
        let (detector, _) = setup().await;
        // No such target: the foreign key rejects the insert mid-batch.
        let ghost = Target {
            id: 9_999,
            url: "https://example.com/ghost".into(),
            last_swept_at: None,
        };
        let err = detector
            .detect(
                &ghost,
                batch(vec![row("Printer bug", "Active", "2024-01-01")]),
                Utc::now(),
            )
            .await;
        assert!(err.is_err());
        assert_eq!(detector.store().count_observations(ghost.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_passes_on_one_target_never_double_insert() {
        let (detector, target) = setup().await;
        let detector = Arc::new(detector);
        let shared = row("Printer bug", "Active", "2024-01-01");

        let mut handles = Vec::new();
        for i in 0..8 {
            let detector = detector.clone();
            let target = target.clone();
            let rows = batch(vec![
                shared.clone(),
                row(&format!("Issue {}", i % 2), "Active", ""),
            ]);
            handles.push(tokio::spawn(async move {
                detector.detect(&target, rows, Utc::now()).await
            }));
        }
        let mut created = 0;
        for handle in handles {
            created += handle.await.unwrap().unwrap().new_observations.len();
        }

        assert_eq!(created, 3);
        assert_eq!(detector.store().count_observations(target.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn separate_detectors_on_one_database_keep_fingerprints_unique() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("detect.db").display());
        let store_a = Store::connect(&url).await.unwrap();
        let store_b = Store::connect(&url).await.unwrap();
        let target = store_a.insert_target("https://example.com/status").await.unwrap();
        let a = ChangeDetector::new(store_a.clone());
        let b = ChangeDetector::new(store_b);

        let rows = vec![
            row("Printer bug", "Active", "2024-01-01"),
            row("VPN drops", "Active", "2024-01-02"),
        ];
        let (ra, rb) = tokio::join!(
            a.detect(&target, batch(rows.clone()), Utc::now()),
            b.detect(&target, batch(rows.clone()), Utc::now()),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.new_observations.len() + rb.new_observations.len(), 2);
        assert_eq!(ra.duplicates + rb.duplicates, 2);
        assert_eq!(store_a.count_observations(target.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn passes_for_different_targets_on_a_file_store_both_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("detect.db").display());
        let store = Store::connect(&url).await.unwrap();
        let a = store.insert_target("https://example.com/a").await.unwrap();
        let b = store.insert_target("https://example.com/b").await.unwrap();
        let detector = ChangeDetector::new(store.clone());

        let rows = |label: &str| {
            batch(
                (0..20)
                    .map(|i| row(&format!("{label} issue {i}"), "Active", "2024-01-01"))
                    .collect(),
            )
        };
        for _ in 0..10 {
            let (ra, rb) = tokio::join!(
                detector.detect(&a, rows("A"), Utc::now()),
                detector.detect(&b, rows("B"), Utc::now()),
            );
            ra.unwrap();
            rb.unwrap();
        }
        assert_eq!(store.count_observations(a.id).await.unwrap(), 20);
        assert_eq!(store.count_observations(b.id).await.unwrap(), 20);
    }
}
