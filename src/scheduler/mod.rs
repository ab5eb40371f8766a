//! Job scheduling: per-resource FIFO queues, exclusive resource assignment
//! and the coordinator that drives jobs through their containers.

mod coordinator;
pub mod job;
pub mod queue;
mod reconcile;
pub mod state;
mod supervisor;

pub use coordinator::{Scheduler, SchedulerHandle};
pub use job::{ExitInfo, Job, JobSpec, JobStatus};
pub use queue::PendingQueues;
pub use state::{ExitOutcome, ResourceState, ResourceView, SchedulerState};
