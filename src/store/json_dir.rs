use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::scheduler::Job;
use crate::store::{JobStore, JobUpdate, StoreError};

/// One JSON document per job under a directory.
///
/// Writes go to a temporary file that is renamed over the record, so a
/// crash never leaves a half-written job behind.
#[derive(Debug)]
pub struct JsonDirJobStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles of `update`
    write_lock: Mutex<()>,
}

impl JsonDirJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    async fn read(&self, path: &Path) -> Result<Option<Job>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path_for(job.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for JsonDirJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.path_for(job.id)).await? {
            return Err(StoreError::AlreadyExists(job.id));
        }
        self.write(job).await
    }

    async fn update(&self, job_id: Uuid, update: &JobUpdate) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .read(&self.path_for(job_id))
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        update.apply(&mut job);
        self.write(&job).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.read(&self.path_for(job_id)).await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ResourceId;
    use crate::scheduler::{JobSpec, JobStatus};

    fn job() -> Job {
        Job::new(JobSpec {
            name: "resnet".to_string(),
            resource: ResourceId::gpu(0),
            image: "img".to_string(),
            workspace: PathBuf::from("/w"),
            output_dir: PathBuf::from("/o"),
            command: None,
        })
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = job();
        {
            let store = JsonDirJobStore::open(dir.path()).await.unwrap();
            store.create(&a).await.unwrap();
            store
                .update(
                    a.id,
                    &JobUpdate {
                        status: Some(JobStatus::Running),
                        assigned_resource: Some(ResourceId::gpu(0)),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let store = JsonDirJobStore::open(dir.path()).await.unwrap();
        let jobs = store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, a.id);
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert_eq!(jobs[0].assigned_resource, Some(ResourceId::gpu(0)));
    }

    #[tokio::test]
    async fn duplicate_create_and_missing_update_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirJobStore::open(dir.path()).await.unwrap();
        let a = job();
        store.create(&a).await.unwrap();
        assert!(matches!(
            store.create(&a).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.update(Uuid::new_v4(), &JobUpdate::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unreadable_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirJobStore::open(dir.path()).await.unwrap();
        store.create(&job()).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"{not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"ignored")
            .await
            .unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
