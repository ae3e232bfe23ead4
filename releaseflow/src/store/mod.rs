//! Durable map from version key to [`ReleaseJob`].
//!
//! All writes after creation go through [`JobStore::compare_and_swap`],
//! which only succeeds when the stored job still has the stage and revision
//! the writer read. The store bumps the revision on every successful swap.

mod file;

pub use file::FileJobStore;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::{JobKey, ReleaseJob, ReleaseStage};
use crate::errors::StoreError;

/// Persistence for release jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Returns the job stored under `key`.
    async fn get(&self, key: &JobKey) -> Result<Option<ReleaseJob>, StoreError>;

    /// Stores `job` unless a job already exists for its key.
    ///
    /// Returns the stored job and whether it was inserted by this call.
    async fn insert_if_absent(&self, job: ReleaseJob) -> Result<(ReleaseJob, bool), StoreError>;

    /// Replaces the job under `key` with `next` if it still has
    /// `expected_stage` at `expected_revision`.
    ///
    /// Returns the stored job with its revision bumped.
    async fn compare_and_swap(
        &self,
        key: &JobKey,
        expected_stage: ReleaseStage,
        expected_revision: u64,
        next: ReleaseJob,
    ) -> Result<ReleaseJob, StoreError>;

    /// Returns every stored job, ordered by key.
    async fn list(&self) -> Result<Vec<ReleaseJob>, StoreError>;
}

/// Job store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobKey, ReleaseJob>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `jobs`.
    #[must_use]
    pub fn from_jobs(jobs: impl IntoIterator<Item = ReleaseJob>) -> Self {
        let store = Self::new();
        for job in jobs {
            store.jobs.insert(job.key(), job);
        }
        store
    }

    /// Returns the number of stored jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if no jobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn get_sync(&self, key: &JobKey) -> Option<ReleaseJob> {
        self.jobs.get(key).map(|entry| entry.value().clone())
    }

    fn insert_if_absent_sync(&self, job: ReleaseJob) -> (ReleaseJob, bool) {
        match self.jobs.entry(job.key()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(vacant) => {
                vacant.insert(job.clone());
                (job, true)
            }
        }
    }

    /// Checks that the job under `key` still has `expected_stage` at
    /// `expected_revision` and returns `next` as it would be stored.
    fn prepare_swap(
        &self,
        key: &JobKey,
        expected_stage: ReleaseStage,
        expected_revision: u64,
        next: ReleaseJob,
    ) -> Result<ReleaseJob, StoreError> {
        let entry = self
            .jobs
            .get(key)
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        swapped(key, entry.value(), expected_stage, expected_revision, next)
    }

    fn compare_and_swap_sync(
        &self,
        key: &JobKey,
        expected_stage: ReleaseStage,
        expected_revision: u64,
        next: ReleaseJob,
    ) -> Result<ReleaseJob, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(key)
            .ok_or_else(|| StoreError::Missing(key.to_string()))?;
        let next = swapped(key, entry.value(), expected_stage, expected_revision, next)?;
        *entry.value_mut() = next.clone();
        Ok(next)
    }

    fn put_sync(&self, job: ReleaseJob) {
        self.jobs.insert(job.key(), job);
    }

    fn list_sync(&self) -> Vec<ReleaseJob> {
        let mut jobs: Vec<ReleaseJob> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.key().cmp(&b.key()));
        jobs
    }
}

fn swapped(
    key: &JobKey,
    current: &ReleaseJob,
    expected_stage: ReleaseStage,
    expected_revision: u64,
    mut next: ReleaseJob,
) -> Result<ReleaseJob, StoreError> {
    if current.stage != expected_stage || current.revision != expected_revision {
        return Err(StoreError::Conflict {
            key: key.to_string(),
            expected_stage,
            expected_revision,
            actual_stage: current.stage,
            actual_revision: current.revision,
        });
    }
    next.revision = expected_revision + 1;
    next.updated_at = Utc::now();
    Ok(next)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, key: &JobKey) -> Result<Option<ReleaseJob>, StoreError> {
        Ok(self.get_sync(key))
    }

    async fn insert_if_absent(&self, job: ReleaseJob) -> Result<(ReleaseJob, bool), StoreError> {
        Ok(self.insert_if_absent_sync(job))
    }

    async fn compare_and_swap(
        &self,
        key: &JobKey,
        expected_stage: ReleaseStage,
        expected_revision: u64,
        next: ReleaseJob,
    ) -> Result<ReleaseJob, StoreError> {
        self.compare_and_swap_sync(key, expected_stage, expected_revision, next)
    }

    async fn list(&self) -> Result<Vec<ReleaseJob>, StoreError> {
        Ok(self.list_sync())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TriggerKind;
    use std::sync::Arc;

    fn job(version: &str) -> ReleaseJob {
        ReleaseJob::new(version, "abc", TriggerKind::TagPushed)
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let store = InMemoryJobStore::new();
        let (first, inserted) = store.insert_if_absent(job("1.0.0")).await.unwrap();
        assert!(inserted);

        let mut other = job("v1.0.0");
        other.commit = "def".to_string();
        let (existing, inserted) = store.insert_if_absent(other).await.unwrap();
        assert!(!inserted);
        assert_eq!(existing, first);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_bumps_revision() {
        let store = InMemoryJobStore::new();
        let (stored, _) = store.insert_if_absent(job("1.0.0")).await.unwrap();

        let mut next = stored.clone();
        next.stage = ReleaseStage::Built;
        let swapped = store
            .compare_and_swap(&stored.key(), ReleaseStage::Pending, 0, next)
            .await
            .unwrap();
        assert_eq!(swapped.revision, 1);
        assert_eq!(swapped.stage, ReleaseStage::Built);
        assert_eq!(store.get(&stored.key()).await.unwrap(), Some(swapped));
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = InMemoryJobStore::new();
        let (stored, _) = store.insert_if_absent(job("1.0.0")).await.unwrap();
        let key = stored.key();

        let mut built = stored.clone();
        built.stage = ReleaseStage::Built;
        store
            .compare_and_swap(&key, ReleaseStage::Pending, 0, built.clone())
            .await
            .unwrap();

        let err = store
            .compare_and_swap(&key, ReleaseStage::Pending, 0, built)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                actual_stage: ReleaseStage::Built,
                actual_revision: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = InMemoryJobStore::new();
        let err = store
            .compare_and_swap(&JobKey::new("9.9.9"), ReleaseStage::Pending, 0, job("9.9.9"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[tokio::test]
    async fn test_concurrent_swaps_have_one_winner() {
        let store = Arc::new(InMemoryJobStore::new());
        let (stored, _) = store.insert_if_absent(job("1.0.0")).await.unwrap();

        let attempts = (0..8).map(|_| {
            let store = store.clone();
            let mut next = stored.clone();
            next.stage = ReleaseStage::Built;
            tokio::spawn(async move {
                store
                    .compare_and_swap(&next.key(), ReleaseStage::Pending, 0, next.clone())
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_list_sorted_by_key() {
        let store = InMemoryJobStore::from_jobs([job("2.0.0"), job("1.0.0")]);
        let versions: Vec<_> = store.list().await.unwrap().into_iter().map(|j| j.version).collect();
        assert_eq!(versions, vec!["1.0.0", "2.0.0"]);
    }
}
