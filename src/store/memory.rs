use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::scheduler::Job;
use crate::store::{JobStore, JobUpdate, StoreError};

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing records, e.g. to simulate a restart.
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: RwLock::new(jobs.into_iter().map(|j| (j.id, j)).collect()),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job_id: Uuid, update: &JobUpdate) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        update.apply(job);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ResourceId;
    use crate::scheduler::{JobSpec, JobStatus};
    use std::path::PathBuf;

    fn job(name: &str) -> Job {
        Job::new(JobSpec {
            name: name.to_string(),
            resource: ResourceId::cpu(),
            image: "img".to_string(),
            workspace: PathBuf::from("/w"),
            output_dir: PathBuf::from("/o"),
            command: None,
        })
    }

    #[tokio::test]
    async fn crud() {
        let store = MemoryJobStore::new();
        let a = job("a");
        store.create(&a).await.unwrap();
        assert!(matches!(
            store.create(&a).await,
            Err(StoreError::AlreadyExists(_))
        ));

        store
            .update(
                a.id,
                &JobUpdate {
                    status: Some(JobStatus::Cancelled),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.get(a.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );

        let missing = Uuid::new_v4();
        assert!(store.get(missing).await.unwrap().is_none());
        assert!(matches!(
            store.update(missing, &JobUpdate::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_is_oldest_first() {
        let first = job("first");
        let mut second = job("second");
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        let store = MemoryJobStore::with_jobs([second.clone(), first.clone()]);

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}
