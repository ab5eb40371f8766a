use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::runtime::{
    container_name, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState,
    OutputStream, RuntimeError,
};

/// Exit code reported when a scripted container is stopped (SIGTERM).
pub const STOPPED_EXIT_CODE: i64 = 143;
/// Exit code reported when a running scripted container is force-removed.
pub const KILLED_EXIT_CODE: i64 = 137;

struct ScriptedContainer {
    // Everything printed so far, replayed to each new follower
    output: Vec<(DateTime<Utc>, String)>,
    followers: Vec<mpsc::UnboundedSender<String>>,
    exit_tx: watch::Sender<Option<i64>>,
    stop_requests: usize,
    removed: bool,
}

impl ScriptedContainer {
    fn new() -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            output: Vec::new(),
            followers: Vec::new(),
            exit_tx,
            stop_requests: 0,
            removed: false,
        }
    }

    fn exit_code(&self) -> Option<i64> {
        *self.exit_tx.borrow()
    }

    fn print(&mut self, line: &str) -> bool {
        if self.exit_code().is_some() {
            return false;
        }
        self.output.push((Utc::now(), line.to_string()));
        self.followers.retain(|tx| tx.send(line.to_string()).is_ok());
        true
    }

    fn follow(&mut self, since: Option<DateTime<Utc>>) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        for (at, line) in &self.output {
            if since.map_or(true, |since| *at >= since) {
                let _ = tx.send(line.clone());
            }
        }
        if self.exit_code().is_none() {
            self.followers.push(tx);
        }
        rx
    }

    fn finish(&mut self, code: i64) -> bool {
        if self.exit_code().is_some() {
            return false;
        }
        self.followers.clear();
        self.exit_tx.send_replace(Some(code));
        true
    }
}

#[derive(Default)]
struct ScriptState {
    containers: HashMap<String, ScriptedContainer>,
    launch_failures: HashMap<String, String>,
    ignore_stop: bool,
    started: Vec<ContainerSpec>,
}

/// In-memory container runtime driven by the caller.
///
/// Containers start instantly and run until [`ScriptedRuntime::exit`] or a
/// stop request ends them. Output is fed with [`ScriptedRuntime::emit`] and
/// kept with its timestamp, so following a container replays it the way
/// `docker logs --follow [--since]` does.
///
/// Containers are keyed by their deterministic job name, so callers address
/// them by job id.
#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // A poisoned lock only means a test panicked mid-call; the map is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every start of `image` fail with `message`.
    pub fn fail_launches(&self, image: &str, message: &str) {
        self.lock()
            .launch_failures
            .insert(image.to_string(), message.to_string());
    }

    /// When set, stop requests are recorded but containers keep running.
    pub fn ignore_stop(&self, ignore: bool) {
        self.lock().ignore_stop = ignore;
    }

    /// Print a line from a job's container. Returns false if it is not running.
    pub fn emit(&self, job_id: Uuid, line: &str) -> bool {
        match self.lock().containers.get_mut(&container_name(job_id)) {
            Some(container) => container.print(line),
            None => false,
        }
    }

    /// End a job's container with `code`. Returns false if it already exited.
    pub fn exit(&self, job_id: Uuid, code: i64) -> bool {
        let mut state = self.lock();
        match state.containers.get_mut(&container_name(job_id)) {
            Some(container) => container.finish(code),
            None => false,
        }
    }

    /// Register a container that existed before the scheduler started, as
    /// found after a restart. `exit_code: None` leaves it running.
    pub fn adopt(&self, job_id: Uuid, exit_code: Option<i64>) -> ContainerHandle {
        let mut container = ScriptedContainer::new();
        if let Some(code) = exit_code {
            container.finish(code);
        }
        let handle = ContainerHandle::for_job(job_id);
        self.lock().containers.insert(handle.name.clone(), container);
        handle
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.lock()
            .containers
            .get(&container_name(job_id))
            .map(|c| c.exit_code().is_none() && !c.removed)
            .unwrap_or(false)
    }

    pub fn is_removed(&self, job_id: Uuid) -> bool {
        self.lock()
            .containers
            .get(&container_name(job_id))
            .map(|c| c.removed)
            .unwrap_or(false)
    }

    pub fn stop_requests(&self, job_id: Uuid) -> usize {
        self.lock()
            .containers
            .get(&container_name(job_id))
            .map(|c| c.stop_requests)
            .unwrap_or(0)
    }

    /// Specs of every successful start, in start order.
    pub fn started(&self) -> Vec<ContainerSpec> {
        self.lock().started.clone()
    }

    /// Poll until the job's container has been started, or `timeout` passes.
    pub async fn wait_for_start(&self, job_id: Uuid, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_running(job_id) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let mut state = self.lock();
        if let Some(message) = state.launch_failures.get(&spec.image) {
            return Err(RuntimeError::LaunchFailed(message.clone()));
        }
        if let Some(existing) = state.containers.get(&spec.name) {
            if !existing.removed {
                return Err(RuntimeError::LaunchFailed(format!(
                    "container name {} is already in use",
                    spec.name
                )));
            }
        }
        state
            .containers
            .insert(spec.name.clone(), ScriptedContainer::new());
        state.started.push(spec.clone());
        Ok(ContainerHandle {
            id: spec.name.clone(),
            name: spec.name.clone(),
        })
    }

    fn stream_output(&self, handle: &ContainerHandle, since: Option<DateTime<Utc>>) -> OutputStream {
        match self.lock().containers.get_mut(&handle.name) {
            Some(container) if !container.removed => {
                UnboundedReceiverStream::new(container.follow(since)).boxed()
            }
            _ => futures::stream::empty().boxed(),
        }
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let ignore = state.ignore_stop;
        if let Some(container) = state.containers.get_mut(&handle.name) {
            container.stop_requests += 1;
            if !ignore {
                container.finish(STOPPED_EXIT_CODE);
            }
        }
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let mut rx = {
            let state = self.lock();
            match state.containers.get(&handle.name) {
                Some(c) if !c.removed => c.exit_tx.subscribe(),
                _ => return Err(RuntimeError::NotFound(handle.name.clone())),
            }
        };
        let code = *rx
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| RuntimeError::NotFound(handle.name.clone()))?;
        Ok(code.unwrap_or(KILLED_EXIT_CODE))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        let state = self.lock();
        Ok(match state.containers.get(&handle.name) {
            None => ContainerState::Missing,
            Some(c) if c.removed => ContainerState::Missing,
            Some(c) => match c.exit_code() {
                None => ContainerState::Running,
                Some(code) => ContainerState::Exited {
                    exit_code: Some(code),
                },
            },
        })
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if let Some(container) = state.containers.get_mut(&handle.name) {
            container.finish(KILLED_EXIT_CODE);
            container.removed = true;
        }
        Ok(())
    }
}
