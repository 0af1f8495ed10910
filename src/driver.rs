//! Driver Core (C9, spec §4.1): owns every subsystem and exposes the
//! operations the orchestrator calls.
//!
//! Grounded on the teacher's `server::Manager` (one struct owning every
//! other subsystem, constructed once at process start) generalized from
//! "manage one game server process" to "manage N task containers plus the
//! shared Image Coordinator/Reconciler/Cpuset Fixer singletons".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::cpuset::{detect_cgroup_mode, CgroupMode, CpusetFixer, CpusetTarget};
use crate::engine::{BollardEngine, CreateOutcome, EngineClient};
use crate::error::{DriverError, DriverResult};
use crate::image::{ImageCoordinator, ProgressSink};
use crate::logs::{LogShipper, LogShipperOptions, Sink};
use crate::network::{NetworkHandle, NetworkRequest, SandboxManager};
use crate::policy::{self, PolicyConfig};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::stats::{ResourceUsage, StatsPump};
use crate::task::exec::ExecResult;
use crate::task::{DriverNetwork, TaskHandle, TaskSpec, TaskState, TaskStore};

/// Fingerprint health as reported by the periodic loop (spec §4.1
/// "Fingerprint", §4.10 failure table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintHealth {
    Undetected,
    Healthy,
    Unhealthy,
}

pub struct DriverHandleState {
    pub task_id: String,
    pub container_id: String,
    pub state: TaskState,
    pub network: DriverNetwork,
}

/// How long the Log Shipper keeps retrying a FIFO that's never been read
/// from before giving up (matches the window exercised in logs::tests).
const LOG_SHIPPER_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Opens an orchestrator-provided FIFO for writing, or a discarding sink
/// when no path was given, so `ship_logs` always has somewhere to write.
async fn open_fifo_sink(path: Option<&str>) -> DriverResult<Sink> {
    match path {
        Some(p) => {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(p)
                .await
                .map_err(|e| DriverError::Other(format!("opening log fifo {}: {}", p, e)))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::sink())),
    }
}

pub struct Driver {
    engine: Arc<dyn EngineClient>,
    store: Arc<TaskStore>,
    images: Arc<ImageCoordinator>,
    reconciler: Arc<Reconciler>,
    cpuset_fixer: Arc<CpusetFixer>,
    sandboxes: SandboxManager,
    policy: PolicyConfig,
    extra_label_globs: Vec<String>,
    pull_activity_timeout: Duration,
    infra_pull_timeout: Duration,
    disable_log_collection: bool,
    gc_container: bool,
    cgroup_mode: Option<CgroupMode>,
    fingerprint_detected: AtomicBool,
    cancel: CancellationToken,
}

impl Driver {
    pub fn new(engine: Arc<dyn EngineClient>, config: &Configuration) -> Arc<Self> {
        let store = Arc::new(TaskStore::new());
        let images = Arc::new(ImageCoordinator::new(
            engine.clone(),
            config.gc.image_delay,
            config.gc.image,
        ));
        let reconciler = Reconciler::new(
            engine.clone(),
            store.clone(),
            ReconcilerConfig {
                period: config.gc.dangling_containers.period,
                creation_grace: config.gc.dangling_containers.creation_grace,
                dry_run: config.gc.dangling_containers.dry_run,
            },
        );
        let sandboxes = SandboxManager::new(engine.clone(), config.infra_image.clone());

        Arc::new(Self {
            engine,
            store,
            images,
            reconciler,
            cpuset_fixer: CpusetFixer::new(),
            sandboxes,
            policy: config.policy(),
            extra_label_globs: config.extra_labels.clone(),
            pull_activity_timeout: config.pull_activity_timeout,
            infra_pull_timeout: config.infra_image_pull_timeout,
            disable_log_collection: config.disable_log_collection,
            gc_container: config.gc.container,
            cgroup_mode: detect_cgroup_mode(),
            fingerprint_detected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn connect(config: &Configuration) -> DriverResult<Arc<Self>> {
        let engine: Arc<dyn EngineClient> = Arc::new(
            BollardEngine::connect_socket(&config.endpoint).map_err(DriverError::Engine)?,
        );
        Ok(Self::new(engine, config))
    }

    pub fn task_store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Shuts down every background subsystem (§5 "Driver shutdown cancels
    /// the root driver context"). Does not abort in-flight waits.
    pub fn shutdown(&self) {
        self.images.shutdown();
        self.cancel.cancel();
    }

    /// `Fingerprint()`: spawns the periodic capability-report loop and
    /// returns the receiving half (§4.1, SPEC_FULL §B).
    pub fn spawn_fingerprint(self: &Arc<Self>, period: Duration) -> mpsc::Receiver<FingerprintHealth> {
        let (tx, rx) = mpsc::channel(1);
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let health = match this.engine.ping().await {
                            Ok(()) => {
                                if !this.fingerprint_detected.swap(true, Ordering::SeqCst) {
                                    this.reconciler.mark_fingerprinted();
                                }
                                FingerprintHealth::Healthy
                            }
                            Err(e) => {
                                warn!(error = %e, "fingerprint ping failed");
                                if this.fingerprint_detected.load(Ordering::SeqCst) {
                                    FingerprintHealth::Unhealthy
                                } else {
                                    FingerprintHealth::Undetected
                                }
                            }
                        };
                        if tx.send(health).await.is_err() {
                            return;
                        }
                    }
                    _ = this.cancel.cancelled() => return,
                }
            }
        });
        rx
    }

    pub fn spawn_reconciler(self: &Arc<Self>) {
        self.reconciler.spawn(self.cancel.clone());
    }

    /// `StartTask(spec)` (§4.1).
    pub async fn start_task(
        self: &Arc<Self>,
        spec: TaskSpec,
        progress_sink: Option<ProgressSink>,
    ) -> DriverResult<DriverHandleState> {
        let runtime = policy::check_all(&spec, &self.policy)?;
        let mut spec = spec;
        spec.runtime = runtime;

        let outcome = self
            .images
            .pull_image(
                &spec.image,
                &spec.task_id,
                progress_sink,
                self.infra_pull_timeout,
                self.pull_activity_timeout,
            )
            .await?;

        let name = spec.container_name();
        let config = spec.to_bollard_config(&outcome.image_id, &self.extra_label_globs);

        match self.engine.create_container(&name, config.clone()).await? {
            CreateOutcome::Created => {}
            CreateOutcome::NameConflict => {
                info!(container = %name, "name conflict on create, removing stale container and retrying");
                self.engine.remove_container(&name, true).await?;
                match self.engine.create_container(&name, config).await? {
                    CreateOutcome::Created => {}
                    CreateOutcome::NameConflict => {
                        return Err(DriverError::Other(
                            "container name conflict persisted after retry".to_string(),
                        ));
                    }
                }
            }
        }

        self.engine.start_container(&name).await?;

        let inspect = self.engine.inspect_container(&name).await?;
        let container_id = inspect.id.clone().unwrap_or_else(|| name.clone());

        let handle = Arc::new(TaskHandle::new(
            spec.task_id.clone(),
            spec.alloc_id.clone(),
            container_id.clone(),
            name.clone(),
            outcome.image_id.clone(),
            self.gc_container,
            self.engine.clone(),
        ));
        handle.mark_running();

        let network = self.build_driver_network(&inspect);
        handle.set_net_info(network.clone());

        handle.spawn_supervisor();

        self.store.insert(spec.task_id.clone(), handle.clone());

        if !self.disable_log_collection {
            if let Err(e) = self
                .attach_log_shipper(&spec.task_id, &spec.log_stdout_fifo, &spec.log_stderr_fifo)
                .await
            {
                warn!(task = %spec.task_id, error = %e, "failed to attach log shipper");
            }
        }

        if let Some(cpuset_path) = spec.resources.cpuset_path.clone() {
            if let Some(mode) = self.cgroup_mode {
                if let Err(e) =
                    self.start_cpuset_fixer(&spec.task_id, std::path::PathBuf::from(cpuset_path), mode)
                {
                    warn!(task = %spec.task_id, error = %e, "failed to attach cpuset fixer");
                }
            } else {
                warn!(task = %spec.task_id, "cpuset_path set but no cgroup mode detected, fixer not started");
            }
        }

        info!(task = %spec.task_id, container = %name, "task started");

        Ok(DriverHandleState {
            task_id: spec.task_id,
            container_id,
            state: handle.state(),
            network,
        })
    }

    fn build_driver_network(&self, inspect: &bollard::models::ContainerInspectResponse) -> DriverNetwork {
        let ip = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ip_address.clone())
            .filter(|s| !s.is_empty());
        DriverNetwork {
            ip,
            auto_advertise: false,
            port_map: HashMap::new(),
        }
    }

    /// Opens the orchestrator-provided stdout/stderr FIFOs (when the spec
    /// names them) and attaches a Log Shipper to write decoded output into
    /// them (§4.5, SPEC_FULL §B). A task with neither fifo path is left
    /// without a shipper; logs remain available via `ship_logs` on demand.
    async fn attach_log_shipper(
        &self,
        task_id: &str,
        stdout_fifo: &Option<String>,
        stderr_fifo: &Option<String>,
    ) -> DriverResult<()> {
        if stdout_fifo.is_none() && stderr_fifo.is_none() {
            return Ok(());
        }
        let stdout_sink = open_fifo_sink(stdout_fifo.as_deref()).await?;
        let stderr_sink = open_fifo_sink(stderr_fifo.as_deref()).await?;
        let start_unix_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.ship_logs(
            task_id,
            stdout_sink,
            stderr_sink,
            start_unix_time,
            LOG_SHIPPER_GRACE_PERIOD,
        )?;
        Ok(())
    }

    /// Attach a Log Shipper to a running task, streaming demultiplexed
    /// stdout/stderr into the given sinks (§4.5).
    pub fn ship_logs(
        &self,
        task_id: &str,
        stdout_sink: Sink,
        stderr_sink: Sink,
        start_unix_time: i64,
        grace_period: Duration,
    ) -> DriverResult<tokio::task::JoinHandle<()>> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| DriverError::NotFound(task_id.to_string()))?;

        let shipper = LogShipper::new(self.engine.clone());
        let opts = LogShipperOptions {
            container_name: handle.container_name().to_string(),
            tty: false,
            start_unix_time,
            grace_period,
        };
        Ok(shipper.start(
            opts,
            stdout_sink,
            stderr_sink,
            handle.subscribe_done(),
            handle.cancel_token(),
        ))
    }

    /// Attach the Cpuset Fixer to a running task (§4.6).
    pub fn start_cpuset_fixer(
        &self,
        task_id: &str,
        source_dir: std::path::PathBuf,
        mode: CgroupMode,
    ) -> DriverResult<tokio::task::JoinHandle<()>> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| DriverError::NotFound(task_id.to_string()))?;
        let dest_dir = crate::cpuset::resolve_cgroup_path(None, mode, handle.container_id());
        let target = CpusetTarget {
            source_dir,
            dest_dir,
            mode,
        };
        Ok(self.cpuset_fixer.spawn(
            task_id.to_string(),
            target,
            handle.subscribe_done(),
            handle.cancel_token(),
        ))
    }

    /// `WaitTask(ctx, id)` (§4.1).
    pub async fn wait_task(&self, task_id: &str) -> DriverResult<crate::task::ExitResult> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| DriverError::NotFound(task_id.to_string()))?;
        Ok(handle.wait().await)
    }

    /// `StopTask(id, timeout, signal)` (§4.1, I6).
    pub async fn stop_task(&self, task_id: &str, timeout: Duration, signal: &str) -> DriverResult<()> {
        let handle = match self.store.get(task_id) {
            Some(h) => h,
            None => return Ok(()), // not-found is success
        };
        match handle.kill(timeout, signal).await {
            Ok(()) => Ok(()),
            Err(e) if e.classify() == crate::error::Classification::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `SignalTask(id, signal)` (§4.1): one-shot kill, no wait.
    pub async fn signal_task(&self, task_id: &str, signal: &str) -> DriverResult<()> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| DriverError::NotFound(task_id.to_string()))?;
        let translated = crate::signal::translate_stop_signal(signal);
        self.engine
            .kill_container(handle.container_name(), &translated)
            .await
            .map_err(DriverError::Engine)
    }

    /// `DestroyTask(id, force)` (§4.1).
    pub async fn destroy_task(&self, task_id: &str, force: bool) -> DriverResult<()> {
        let handle = match self.store.get(task_id) {
            Some(h) => h,
            None => return Ok(()),
        };

        if matches!(handle.state(), TaskState::Running) && !force {
            return Err(DriverError::StillRunning(task_id.to_string()));
        }

        match self
            .engine
            .remove_container(handle.container_name(), true)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(DriverError::Engine(e)),
        }

        self.images.remove_image(handle.image_id(), task_id);
        self.store.remove(task_id);
        info!(task = %task_id, "task destroyed");
        Ok(())
    }

    /// `InspectTask(id)` (§4.1).
    pub fn inspect_task(&self, task_id: &str) -> DriverResult<DriverHandleState> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| DriverError::NotFound(task_id.to_string()))?;
        Ok(DriverHandleState {
            task_id: task_id.to_string(),
            container_id: handle.container_id().to_string(),
            state: handle.state(),
            network: handle.net_info(),
        })
    }

    /// `TaskStats(ctx, id, interval)` (§4.1).
    pub fn task_stats(
        &self,
        task_id: &str,
        interval: Duration,
    ) -> DriverResult<mpsc::Receiver<ResourceUsage>> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| DriverError::NotFound(task_id.to_string()))?;
        let pump = StatsPump::new(self.engine.clone(), handle.container_name().to_string());
        Ok(pump.start(interval, handle.subscribe_done(), handle.cancel_token()))
    }

    /// `ExecTask(ctx, id, argv, timeout)` (§4.1).
    pub async fn exec_task(
        &self,
        task_id: &str,
        argv: Vec<String>,
        timeout: Duration,
    ) -> DriverResult<ExecResult> {
        let handle = self
            .store
            .get(task_id)
            .ok_or_else(|| DriverError::NotFound(task_id.to_string()))?;
        handle.exec(argv, timeout).await
    }

    /// `RecoverTask(handleState)` (§4.1): re-attach to an existing
    /// container after a driver restart, re-spawning its supervisor.
    pub async fn recover_task(
        self: &Arc<Self>,
        task_id: String,
        alloc_id: String,
        container_id: String,
        image_id: String,
        log_stdout_fifo: Option<String>,
        log_stderr_fifo: Option<String>,
        cpuset_source_dir: Option<String>,
    ) -> DriverResult<DriverHandleState> {
        let inspect = self.engine.inspect_container(&container_id).await?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let handle = Arc::new(TaskHandle::new(
            task_id.clone(),
            alloc_id,
            container_id.clone(),
            container_id.clone(),
            image_id,
            self.gc_container,
            self.engine.clone(),
        ));
        if running {
            handle.mark_running();
        }
        let network = self.build_driver_network(&inspect);
        handle.set_net_info(network.clone());
        handle.spawn_supervisor();

        let state = handle.state();
        self.store.insert(task_id.clone(), handle);

        if !self.disable_log_collection {
            if let Err(e) = self
                .attach_log_shipper(&task_id, &log_stdout_fifo, &log_stderr_fifo)
                .await
            {
                warn!(task = %task_id, error = %e, "failed to attach log shipper on recovery");
            }
        }

        if let Some(source_dir) = cpuset_source_dir {
            if let Some(mode) = self.cgroup_mode {
                if let Err(e) =
                    self.start_cpuset_fixer(&task_id, std::path::PathBuf::from(source_dir), mode)
                {
                    warn!(task = %task_id, error = %e, "failed to attach cpuset fixer on recovery");
                }
            } else {
                warn!(task = %task_id, "cpuset source dir set but no cgroup mode detected, fixer not started");
            }
        }

        Ok(DriverHandleState {
            task_id,
            container_id,
            state,
            network,
        })
    }

    /// `CreateNetwork(allocId, req)` (§4.1, §4.9).
    pub async fn create_network(&self, req: NetworkRequest) -> DriverResult<NetworkHandle> {
        self.sandboxes.create_network(req).await
    }

    /// `DestroyNetwork` (§4.1, §4.9).
    pub async fn destroy_network(&self, handle: &NetworkHandle) -> DriverResult<()> {
        self.sandboxes.destroy_network(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::task::spec::{Mount, ResourceLimits};
    use std::collections::HashMap as Map;

    fn test_config() -> Configuration {
        toml::from_str("").unwrap()
    }

    fn spec(task_id: &str, command: &str) -> TaskSpec {
        TaskSpec {
            task_id: task_id.to_string(),
            alloc_id: format!("{}-alloc", task_id),
            task_name: "echoer".to_string(),
            job_name: None,
            task_group_name: None,
            image: "busybox:latest".to_string(),
            command: Some(command.to_string()),
            args: vec![],
            env: Map::new(),
            working_dir: None,
            user: None,
            labels: Map::new(),
            cap_add: vec![],
            cap_drop: vec![],
            devices: vec![],
            mounts: vec![],
            ports: vec![],
            dns: vec![],
            resources: ResourceLimits::default(),
            runtime: None,
            kill_signal: None,
            kill_timeout_secs: 5,
            log_stdout_fifo: None,
            log_stderr_fifo: None,
            tty: false,
            privileged: false,
            network_mode: None,
            extra_hosts: vec![],
        }
    }

    #[tokio::test]
    async fn start_task_registers_handle_and_waits_to_completion() {
        let engine = MockEngine::new();
        let driver = Driver::new(engine, &test_config());

        let result = driver.start_task(spec("t1", "echo"), None).await.unwrap();
        assert_eq!(result.state, TaskState::Running);
        assert!(driver.task_store().contains("t1"));

        let exit = driver.wait_task("t1").await.unwrap();
        assert_eq!(exit.exit_code, 0);
    }

    #[tokio::test]
    async fn stop_task_on_unknown_id_is_success() {
        let engine = MockEngine::new();
        let driver = Driver::new(engine, &test_config());
        driver
            .stop_task("nope", Duration::from_secs(1), "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn destroy_task_requires_force_while_running() {
        // Supervisor intentionally not spawned, so the handle stays in
        // `Running` deterministically instead of racing the mock's
        // instantly-resolving wait stream.
        let engine = MockEngine::new();
        engine.seed_container(crate::engine::mock::MockContainer {
            id: "cid1".to_string(),
            name: "cid1".to_string(),
            image: "busybox:latest".to_string(),
            running: true,
            exit_code: 0,
            oom_killed: false,
            labels: Map::new(),
            mounts: vec![],
            created_unix: 0,
        });
        let driver = Driver::new(engine.clone(), &test_config());
        let handle = Arc::new(TaskHandle::new_for_test(
            "t1".to_string(),
            "alloc1".to_string(),
            "cid1".to_string(),
            "busybox:latest".to_string(),
            engine,
        ));
        handle.mark_running();
        driver.task_store().insert("t1".to_string(), handle);

        let err = driver.destroy_task("t1", false).await;
        assert!(matches!(err, Err(DriverError::StillRunning(_))));

        driver.destroy_task("t1", true).await.unwrap();
        assert!(!driver.task_store().contains("t1"));
    }

    #[tokio::test]
    async fn destroy_task_removes_container_and_releases_image_ref() {
        let engine = MockEngine::new();
        let driver = Driver::new(engine.clone(), &test_config());
        driver.start_task(spec("t1", "echo"), None).await.unwrap();
        driver.wait_task("t1").await.unwrap();

        driver.destroy_task("t1", true).await.unwrap();
        assert!(!driver.task_store().contains("t1"));
    }

    #[tokio::test]
    async fn name_conflict_on_create_is_resolved_by_remove_and_retry() {
        let engine = MockEngine::new();
        engine.seed_container(crate::engine::mock::MockContainer {
            id: "stale".to_string(),
            name: "echoer-t1-alloc".to_string(),
            image: "busybox:latest".to_string(),
            running: true,
            exit_code: 0,
            oom_killed: false,
            labels: Map::new(),
            mounts: vec![],
            created_unix: 0,
        });

        let driver = Driver::new(engine, &test_config());
        let result = driver.start_task(spec("t1", "echo hello"), None).await.unwrap();
        assert_eq!(result.state, TaskState::Running);
    }

    #[tokio::test]
    async fn volumes_disabled_rejects_absolute_bind_mount() {
        let engine = MockEngine::new();
        let mut config = test_config();
        config.volumes.enabled = false;
        let driver = Driver::new(engine, &config);

        let mut s = spec("t1", "echo");
        s.mounts.push(Mount::Bind {
            source: "/host/data".to_string(),
            target: "/data".to_string(),
            read_only: false,
        });

        let result = driver.start_task(s, None).await;
        assert!(result.is_err());
    }
}
