//! Job store persisted as a JSON snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{InMemoryJobStore, JobStore};
use crate::core::{JobKey, ReleaseJob, ReleaseStage};
use crate::errors::StoreError;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    jobs: Vec<ReleaseJob>,
}

/// Job store that rewrites a JSON snapshot on every mutation.
///
/// The snapshot is written to a sibling temp file and renamed into place,
/// so readers never observe a partial file. Memory only changes once the
/// snapshot is on disk; a failed write leaves both untouched.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    inner: InMemoryJobStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileJobStore {
    /// Opens the store at `path`, loading an existing snapshot.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?.jobs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), jobs = jobs.len(), "Opened job store");

        Ok(Self {
            path,
            inner: InMemoryJobStore::from_jobs(jobs),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current jobs with `job` added or replaced, ordered by key.
    fn snapshot_with(&self, job: &ReleaseJob) -> Snapshot {
        let key = job.key();
        let mut jobs: Vec<ReleaseJob> = self
            .inner
            .list_sync()
            .into_iter()
            .filter(|j| j.key() != key)
            .collect();
        jobs.push(job.clone());
        jobs.sort_by(|a, b| a.key().cmp(&b.key()));
        Snapshot {
            version: SNAPSHOT_VERSION,
            jobs,
        }
    }

    /// Writes `snapshot` to disk. Callers hold `write_lock`.
    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get(&self, key: &JobKey) -> Result<Option<ReleaseJob>, StoreError> {
        Ok(self.inner.get_sync(key))
    }

    async fn insert_if_absent(&self, job: ReleaseJob) -> Result<(ReleaseJob, bool), StoreError> {
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self.inner.get_sync(&job.key()) {
            return Ok((existing, false));
        }
        self.persist(&self.snapshot_with(&job)).await?;
        self.inner.put_sync(job.clone());
        Ok((job, true))
    }

    async fn compare_and_swap(
        &self,
        key: &JobKey,
        expected_stage: ReleaseStage,
        expected_revision: u64,
        next: ReleaseJob,
    ) -> Result<ReleaseJob, StoreError> {
        let _guard = self.write_lock.lock().await;
        let next = self
            .inner
            .prepare_swap(key, expected_stage, expected_revision, next)?;
        self.persist(&self.snapshot_with(&next)).await?;
        self.inner.put_sync(next.clone());
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<ReleaseJob>, StoreError> {
        Ok(self.inner.list_sync())
    }
}
