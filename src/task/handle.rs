//! Task Handle & Lifecycle (C4, spec §4.3, §4.8).
//!
//! Grounded on the teacher's `environment/docker/power.rs` goroutine shape
//! (`start_container`/`wait_for_stop`/`terminate_container`) and
//! `environment/docker/environment.rs`'s atomic state + transition
//! logging, generalized from one long-lived process to one task
//! container's full create-to-destroy lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineClient;
use crate::error::{DriverError, DriverResult};
use crate::signal::translate_stop_signal;
use crate::task::exec::{exec_task, ExecResult};
use crate::task::state::{ExitResult, TaskState};

/// Engine-grace margin added on top of the caller's stop timeout so the
/// driver's own deadline never races the engine's internal one (§4.3 Kill).
const ENGINE_GRACE_MARGIN: Duration = Duration::from_secs(5);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct DriverNetwork {
    pub ip: Option<String>,
    pub auto_advertise: bool,
    pub port_map: HashMap<String, u16>,
}

/// Per-task state and supervising task (spec §3 "Task Handle").
pub struct TaskHandle {
    task_id: String,
    alloc_id: String,
    container_id: String,
    image_id: String,
    container_name: String,
    net_info: RwLock<DriverNetwork>,
    state: RwLock<TaskState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    wait_tx: watch::Sender<Option<ExitResult>>,
    wait_rx: watch::Receiver<Option<ExitResult>>,
    remove_on_exit: bool,
    cpuset_source: RwLock<Option<String>>,
    cpuset_dest: RwLock<Option<String>>,
    engine: Arc<dyn EngineClient>,
    cancel: CancellationToken,
}

impl TaskHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: String,
        alloc_id: String,
        container_id: String,
        container_name: String,
        image_id: String,
        remove_on_exit: bool,
        engine: Arc<dyn EngineClient>,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let (wait_tx, wait_rx) = watch::channel(None);
        Self {
            task_id,
            alloc_id,
            container_id,
            image_id,
            container_name,
            net_info: RwLock::new(DriverNetwork::default()),
            state: RwLock::new(TaskState::Created),
            done_tx,
            done_rx,
            wait_tx,
            wait_rx,
            remove_on_exit,
            cpuset_source: RwLock::new(None),
            cpuset_dest: RwLock::new(None),
            engine,
            cancel: CancellationToken::new(),
        }
    }

    /// Minimal constructor for store/reconciler unit tests that don't
    /// exercise the supervising task itself.
    pub fn new_for_test(
        task_id: String,
        alloc_id: String,
        container_id: String,
        image_id: String,
        engine: Arc<dyn EngineClient>,
    ) -> Self {
        let name = container_id.clone();
        Self::new(task_id, alloc_id, container_id, name, image_id, true, engine)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn alloc_id(&self) -> &str {
        &self.alloc_id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    pub fn net_info(&self) -> DriverNetwork {
        self.net_info.read().clone()
    }

    pub fn set_net_info(&self, net: DriverNetwork) {
        *self.net_info.write() = net;
    }

    pub fn set_cpuset(&self, source: Option<String>, dest: Option<String>) {
        *self.cpuset_source.write() = source;
        *self.cpuset_dest.write() = dest;
    }

    pub fn cpuset_source(&self) -> Option<String> {
        self.cpuset_source.read().clone()
    }

    pub fn cpuset_dest(&self) -> Option<String> {
        self.cpuset_dest.read().clone()
    }

    pub fn mark_running(&self) {
        *self.state.write() = TaskState::Running;
    }

    /// Subscribe to `doneCh`: fires once, after the engine reports exit.
    /// Consumed by Stats Pump, Log Shipper's grace timer, Cpuset Fixer.
    pub fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Cancellation token for subordinate loops bound to this handle's
    /// lifetime (driver shutdown, not task exit).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `WaitTask`: returns the same `ExitResult` to every caller, whether
    /// they arrived before or after the supervising task finished (I4).
    pub async fn wait(&self) -> ExitResult {
        let mut rx = self.wait_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever assigning a result: this
                // only happens if the supervising task panicked.
                return ExitResult {
                    exit_code: -1,
                    signal: 0,
                    oom_killed: false,
                    err: Some("supervising task ended without a result".to_string()),
                };
            }
        }
    }

    pub fn cached_exit_result(&self) -> Option<ExitResult> {
        self.wait_rx.borrow().clone()
    }

    /// Spawn the supervising task (spec §4.3 "Supervising goroutine
    /// (`run`)"). Takes `Arc<Self>` so the spawned task can outlive the
    /// caller's stack frame.
    pub fn spawn_supervisor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run().await;
        })
    }

    async fn run(&self) {
        // Step 1: block on ContainerWait using a context that outlives the
        // driver (no timeout applied here on purpose).
        let wait_result = self.engine.wait_container(&self.container_name).await;
        let exit_code = match wait_result {
            Ok(mut stream) => {
                use futures_util::StreamExt;
                match stream.next().await {
                    Some(Ok(code)) => code,
                    Some(Err(e)) => {
                        warn!(task = %self.task_id, error = %e, "wait stream error");
                        -1
                    }
                    None => 0,
                }
            }
            Err(e) => {
                warn!(task = %self.task_id, error = %e, "failed to open wait stream");
                -1
            }
        };

        // Step 2: inspect for OOMKilled, bounded by a short timeout.
        let oom_killed = match tokio::time::timeout(
            INSPECT_TIMEOUT,
            self.engine.inspect_container(&self.container_name),
        )
        .await
        {
            Ok(Ok(inspect)) => inspect
                .state
                .as_ref()
                .and_then(|s| s.oom_killed)
                .unwrap_or(false),
            Ok(Err(e)) => {
                warn!(task = %self.task_id, error = %e, "post-exit inspect failed");
                false
            }
            Err(_) => {
                warn!(task = %self.task_id, "post-exit inspect timed out");
                false
            }
        };

        // Step 3: close doneCh.
        let _ = self.done_tx.send(true);
        *self.state.write() = TaskState::Exited;
        info!(task = %self.task_id, exit_code, oom_killed, "task exited");

        // Step 4: idempotent belt-and-suspenders stop.
        if let Err(e) = self.engine.stop_container(&self.container_name, 0).await {
            debug!(task = %self.task_id, error = %e, "post-exit stop no-op failed");
        }

        // Step 5: remove if configured to.
        if self.remove_on_exit {
            if let Err(e) = self
                .engine
                .remove_container(&self.container_name, true)
                .await
            {
                warn!(task = %self.task_id, error = %e, "failed to remove container on exit");
            } else {
                *self.state.write() = TaskState::Destroyed;
            }
        }

        // Step 6: assign exitResult, close waitCh.
        let err = if oom_killed {
            Some("OOM Killed".to_string())
        } else {
            None
        };
        let result = ExitResult {
            exit_code,
            signal: 0,
            oom_killed,
            err,
        };
        let _ = self.wait_tx.send(Some(result));
    }

    /// `Kill(timeout, signal)` (§4.3).
    pub async fn kill(&self, timeout: Duration, signal: &str) -> DriverResult<()> {
        if signal.is_empty() {
            let timeout_secs = timeout.as_secs() as i64;
            tokio::time::timeout(
                timeout + ENGINE_GRACE_MARGIN,
                self.engine
                    .stop_container(&self.container_name, timeout_secs),
            )
            .await
            .map_err(|_| DriverError::Other("stop timed out".to_string()))?
            .map_err(DriverError::Engine)?;
            return Ok(());
        }

        let translated = translate_stop_signal(signal);
        self.engine
            .kill_container(&self.container_name, &translated)
            .await
            .map_err(DriverError::Engine)?;

        let mut rx = self.wait_rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if rx.borrow().is_some() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        if waited.is_err() {
            self.engine
                .stop_container(&self.container_name, 0)
                .await
                .map_err(DriverError::Engine)?;
        }

        Ok(())
    }

    /// `ExecTask` (§4.1, §4.3).
    pub async fn exec(&self, argv: Vec<String>, timeout: Duration) -> DriverResult<ExecResult> {
        exec_task(self.engine.as_ref(), &self.container_name, argv, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockContainer, MockEngine};
    use std::collections::HashMap as Map;

    fn seeded_handle(running: bool, exit_code: i64) -> (Arc<MockEngine>, Arc<TaskHandle>) {
        seeded_handle_oom(running, exit_code, false)
    }

    fn seeded_handle_oom(
        running: bool,
        exit_code: i64,
        oom_killed: bool,
    ) -> (Arc<MockEngine>, Arc<TaskHandle>) {
        let engine = MockEngine::new();
        engine.seed_container(MockContainer {
            id: "cid1".into(),
            name: "task-alloc".into(),
            image: "redis:7".into(),
            running,
            exit_code,
            oom_killed,
            labels: Map::new(),
            mounts: vec![],
            created_unix: 0,
        });
        let handle = Arc::new(TaskHandle::new(
            "task1".into(),
            "alloc1".into(),
            "cid1".into(),
            "task-alloc".into(),
            "redis:7".into(),
            true,
            engine.clone(),
        ));
        (engine, handle)
    }

    #[tokio::test]
    async fn wait_returns_exit_result_after_supervisor_completes() {
        let (_engine, handle) = seeded_handle(true, 7);
        handle.spawn_supervisor();
        let result = handle.wait().await;
        assert_eq!(result.exit_code, 7);
        assert_eq!(handle.state(), TaskState::Destroyed);
    }

    #[tokio::test]
    async fn late_waiter_observes_same_cached_result() {
        let (_engine, handle) = seeded_handle(true, 3);
        handle.spawn_supervisor();
        let first = handle.wait().await;
        let second = handle.wait().await;
        assert_eq!(first.exit_code, second.exit_code);
        assert_eq!(second.exit_code, 3);
    }

    #[tokio::test]
    async fn kill_with_empty_signal_uses_stop_container() {
        let (engine, handle) = seeded_handle(true, 0);
        handle.kill(Duration::from_secs(1), "").await.unwrap();
        assert!(!engine.containers.lock().get("task-alloc").unwrap().running);
    }

    #[tokio::test]
    async fn kill_on_already_stopped_container_is_success() {
        let (_engine, handle) = seeded_handle(false, 0);
        handle
            .kill(Duration::from_millis(50), "SIGTERM")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn oom_killed_container_is_reported_on_the_exit_result() {
        let (_engine, handle) = seeded_handle_oom(true, 137, true);
        handle.spawn_supervisor();
        let result = handle.wait().await;
        assert_eq!(result.exit_code, 137);
        assert!(result.oom_killed);
        assert_eq!(result.err.as_deref(), Some("OOM Killed"));
    }
}
