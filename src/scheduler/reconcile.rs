use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::publisher::StatusChange;
use crate::runtime::{ContainerHandle, ContainerState};
use crate::scheduler::coordinator::Coordinator;
use crate::scheduler::state::{ExitOutcome, LOST_DURING_RESTART, RESOURCE_GONE};
use crate::scheduler::{Job, JobStatus};

#[derive(Debug, Default)]
struct ReconcileReport {
    terminal: usize,
    requeued: usize,
    reattached: usize,
    finished: usize,
    failed: usize,
}

impl Coordinator {
    /// Rebuild state from the store after a restart.
    ///
    /// Pending jobs go back on their queues in submission order. Running
    /// jobs are checked against the runtime: live containers are followed
    /// again from the moment of the restart, exited ones are finalized with their exit code, and anything
    /// else is failed.
    pub(super) async fn reconcile(&mut self) -> Result<()> {
        let restarted_at = Utc::now();
        let mut jobs = self.store.list().await?;
        jobs.sort_by_key(|j| j.created_at);
        let mut report = ReconcileReport::default();

        for job in jobs {
            match job.status {
                status if status.is_terminal() => {
                    self.state.restore_terminal(job);
                    report.terminal += 1;
                }
                JobStatus::Pending => {
                    let job_id = job.id;
                    match self.state.restore_pending(job) {
                        None => {
                            self.publisher.open(job_id);
                            report.requeued += 1;
                        }
                        Some(failed) => {
                            tracing::warn!(
                                job_id = %failed.id,
                                resource = %failed.requested_resource,
                                "Pending job targets a resource that is gone"
                            );
                            self.persist(&failed).await;
                            report.failed += 1;
                        }
                    }
                }
                _ => self.reconcile_running(job, restarted_at, &mut report).await,
            }
        }

        tracing::info!(
            terminal = report.terminal,
            requeued = report.requeued,
            reattached = report.reattached,
            finished = report.finished,
            failed = report.failed,
            "Reconciled jobs from store"
        );
        Ok(())
    }

    async fn reconcile_running(
        &mut self,
        job: Job,
        restarted_at: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) {
        let handle = job
            .container
            .clone()
            .unwrap_or_else(|| ContainerHandle::for_job(job.id));
        let runtime = self.supervisor.runtime.clone();

        let observed = match runtime.inspect(&handle).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Cannot inspect container");
                ContainerState::Missing
            }
        };

        match observed {
            ContainerState::Running => {
                let job_id = job.id;
                let resource = job
                    .assigned_resource
                    .clone()
                    .unwrap_or_else(|| job.requested_resource.clone());

                if self.state.restore_running(job.clone(), handle.clone()) {
                    tracing::info!(job_id = %job_id, resource = %resource, "Re-attached to running container");
                    self.publisher.open(job_id);
                    if let Some(job) = self.state.get(job_id).cloned() {
                        self.persist(&job).await;
                        self.publisher.publish_status(StatusChange::of(&job));
                    }
                    self.start_sampler(resource, job_id);
                    self.supervisor.attach(job_id, handle, restarted_at);
                    report.reattached += 1;
                } else {
                    tracing::warn!(job_id = %job_id, resource = %resource, "Cannot re-occupy resource, removing container");
                    self.supervisor.reap(job_id, handle);
                    let failed = self
                        .state
                        .restore_finished(job, ExitOutcome::Lost(RESOURCE_GONE.to_string()));
                    self.persist(&failed).await;
                    report.failed += 1;
                }
            }
            ContainerState::Exited {
                exit_code: Some(code),
            } => {
                tracing::info!(job_id = %job.id, exit_code = code, "Container exited while scheduler was down");
                let done = self.state.restore_finished(job, ExitOutcome::Exited(code));
                self.persist(&done).await;
                if self.supervisor.sandbox.remove_on_exit {
                    self.supervisor.reap(done.id, handle);
                }
                report.finished += 1;
            }
            ContainerState::Exited { exit_code: None } | ContainerState::Missing => {
                tracing::warn!(job_id = %job.id, "Container lost during restart");
                let failed = self
                    .state
                    .restore_finished(job, ExitOutcome::Lost(LOST_DURING_RESTART.to_string()));
                self.persist(&failed).await;
                report.failed += 1;
            }
        }
    }
}
