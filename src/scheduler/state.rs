use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::inventory::{Resource, ResourceId, ResourceInventory};
use crate::runtime::ContainerHandle;
use crate::scheduler::{ExitInfo, Job, JobSpec, JobStatus, PendingQueues};
use crate::telemetry::TelemetrySample;

pub const RESOURCE_GONE: &str = "resource no longer present";
pub const LOST_DURING_RESTART: &str = "lost during restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResourceState {
    Free,
    Busy { job_id: Uuid },
}

/// A resource as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceView {
    #[serde(flatten)]
    pub resource: Resource,
    pub state: ResourceState,
    pub queue_depth: usize,
    pub telemetry: Option<TelemetrySample>,
}

/// How a running job came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The container exited on its own or after a stop.
    Exited(i64),
    /// The container never started.
    LaunchFailed(String),
    /// The container can no longer be observed.
    Lost(String),
}

impl ExitOutcome {
    fn exit_info(&self) -> ExitInfo {
        match self {
            ExitOutcome::Exited(code) => ExitInfo::code(*code),
            ExitOutcome::LaunchFailed(message) => {
                ExitInfo::reason(format!("launch failed: {}", message))
            }
            ExitOutcome::Lost(reason) => ExitInfo::reason(reason.clone()),
        }
    }

    fn status(&self) -> JobStatus {
        match self {
            ExitOutcome::Exited(0) => JobStatus::Completed,
            _ => JobStatus::Failed,
        }
    }
}

/// What the coordinator must do to honor a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelAction {
    /// The job was pending and is now cancelled.
    Cancelled(Job),
    /// Stop this container and wait for its exit.
    Stop(ContainerHandle),
    /// The container start is in flight; stop it once it returns.
    AwaitStart,
}

/// Jobs, queues and resource occupancy.
///
/// Pure bookkeeping with no I/O. The coordinator owns the only instance and
/// performs the side effects each transition asks for.
#[derive(Debug)]
pub struct SchedulerState {
    inventory: ResourceInventory,
    jobs: HashMap<Uuid, Job>,
    queues: PendingQueues,
    busy: HashMap<ResourceId, Uuid>,
    starting: HashSet<Uuid>,
    cancel_requested: HashSet<Uuid>,
}

impl SchedulerState {
    pub fn new(inventory: ResourceInventory) -> Self {
        let queues = PendingQueues::new(inventory.ids());
        Self {
            inventory,
            jobs: HashMap::new(),
            queues,
            busy: HashMap::new(),
            starting: HashSet::new(),
            cancel_requested: HashSet::new(),
        }
    }

    pub fn inventory(&self) -> &ResourceInventory {
        &self.inventory
    }

    fn validate(&self, spec: &JobSpec) -> Result<()> {
        if !self.inventory.contains(&spec.resource) {
            return Err(SchedulerError::InvalidResource(spec.resource.to_string()));
        }
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::InvalidSpec("name must not be empty".to_string()));
        }
        if spec.image.trim().is_empty() {
            return Err(SchedulerError::InvalidSpec("image must not be empty".to_string()));
        }
        Ok(())
    }

    /// Record a new pending job and queue it. Nothing changes on error.
    pub fn submit(&mut self, spec: JobSpec) -> Result<Job> {
        self.validate(&spec)?;
        let job = Job::new(spec);
        self.queues.push(&job.requested_resource, job.id);
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Assign the oldest pending job of a free resource to it.
    ///
    /// Returns the job, now running, for the caller to launch. Returns `None`
    /// when the resource is busy or has nothing queued.
    pub fn dispatch(&mut self, resource: &ResourceId) -> Option<Job> {
        if self.busy.contains_key(resource) {
            return None;
        }
        while let Some(job_id) = self.queues.pop(resource) {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.assigned_resource = Some(resource.clone());
            self.busy.insert(resource.clone(), job_id);
            self.starting.insert(job_id);
            return Some(job.clone());
        }
        None
    }

    /// Record the handle of a started container. The flag is true when a
    /// cancel arrived while the start was in flight.
    pub fn mark_started(&mut self, job_id: Uuid, handle: ContainerHandle) -> Option<(Job, bool)> {
        if !self.starting.remove(&job_id) {
            return None;
        }
        let job = self.jobs.get_mut(&job_id)?;
        job.container = Some(handle);
        Some((job.clone(), self.cancel_requested.contains(&job_id)))
    }

    pub fn request_cancel(&mut self, job_id: Uuid) -> Result<CancelAction> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;

        match job.status {
            status if status.is_terminal() => Err(SchedulerError::AlreadyTerminal { job_id, status }),
            JobStatus::Pending => {
                self.queues.remove(&job_id);
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                Ok(CancelAction::Cancelled(job.clone()))
            }
            _ => {
                self.cancel_requested.insert(job_id);
                match (&job.container, self.starting.contains(&job_id)) {
                    (Some(handle), false) => Ok(CancelAction::Stop(handle.clone())),
                    _ => Ok(CancelAction::AwaitStart),
                }
            }
        }
    }

    pub fn is_cancel_requested(&self, job_id: Uuid) -> bool {
        self.cancel_requested.contains(&job_id)
    }

    /// Finalize a running job and free its resource.
    ///
    /// Returns the terminal job and the freed resource, or `None` if the job
    /// was not running.
    pub fn on_exit(&mut self, job_id: Uuid, outcome: ExitOutcome) -> Option<(Job, ResourceId)> {
        let job = self.jobs.get_mut(&job_id)?;
        if job.status != JobStatus::Running {
            return None;
        }
        let resource = job.assigned_resource.clone()?;

        job.status = if self.cancel_requested.remove(&job_id) {
            JobStatus::Cancelled
        } else {
            outcome.status()
        };
        job.exit = Some(outcome.exit_info());
        job.completed_at = Some(Utc::now());
        self.starting.remove(&job_id);

        if self.busy.get(&resource) == Some(&job_id) {
            self.busy.remove(&resource);
        }
        Some((job.clone(), resource))
    }

    /// Load a job that was already terminal before a restart.
    pub fn restore_terminal(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    /// Re-queue a job that was pending before a restart. Jobs must be
    /// restored oldest first. A job whose resource disappeared is failed and
    /// returned.
    pub fn restore_pending(&mut self, mut job: Job) -> Option<Job> {
        if !self.inventory.contains(&job.requested_resource) {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.exit = Some(ExitInfo::reason(RESOURCE_GONE));
            self.jobs.insert(job.id, job.clone());
            return Some(job);
        }
        self.queues.push(&job.requested_resource, job.id);
        self.jobs.insert(job.id, job);
        None
    }

    /// Re-occupy a resource with a job whose container survived a restart.
    /// Returns false, leaving nothing recorded, when the resource is unknown
    /// or already taken.
    pub fn restore_running(&mut self, mut job: Job, handle: ContainerHandle) -> bool {
        let resource = job
            .assigned_resource
            .clone()
            .unwrap_or_else(|| job.requested_resource.clone());
        if !self.inventory.contains(&resource) || self.busy.contains_key(&resource) {
            return false;
        }
        job.status = JobStatus::Running;
        job.assigned_resource = Some(resource.clone());
        job.container = Some(handle);
        self.busy.insert(resource, job.id);
        self.jobs.insert(job.id, job);
        true
    }

    /// Finalize a job that was running before a restart without occupying
    /// any resource.
    pub fn restore_finished(&mut self, mut job: Job, outcome: ExitOutcome) -> Job {
        job.status = outcome.status();
        job.exit = Some(outcome.exit_info());
        job.completed_at = Some(Utc::now());
        self.jobs.insert(job.id, job.clone());
        job
    }

    pub fn get(&self, job_id: Uuid) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn busy_job(&self, resource: &ResourceId) -> Option<Uuid> {
        self.busy.get(resource).copied()
    }

    pub fn free_resources(&self) -> Vec<ResourceId> {
        self.inventory
            .ids()
            .into_iter()
            .filter(|id| !self.busy.contains_key(id))
            .collect()
    }

    pub fn pending_for(&self, resource: &ResourceId) -> Vec<Uuid> {
        self.queues.pending_for(resource)
    }

    /// Resource views without telemetry.
    pub fn resource_views(&self) -> Vec<ResourceView> {
        self.inventory
            .list()
            .iter()
            .map(|resource| ResourceView {
                resource: resource.clone(),
                state: match self.busy.get(&resource.id) {
                    Some(job_id) => ResourceState::Busy { job_id: *job_id },
                    None => ResourceState::Free,
                },
                queue_depth: self.queues.depth(&resource.id),
                telemetry: None,
            })
            .collect()
    }
}
