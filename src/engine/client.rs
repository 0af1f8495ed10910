//! Engine Client (C1): the narrow async interface every other subsystem
//! calls into. Real containers flow through [`BollardEngine`]; tests swap
//! in [`crate::engine::mock::MockEngine`] (§9 Design Note).

use async_trait::async_trait;
use bollard::container::{
    Config, KillContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, Stats, StatsOptions, StopContainerOptions, UpdateContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerSummary, CreateImageInfo, ImageInspect};
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Default per-call timeout (spec §5 "Cancellation & timeouts"). Every
/// one-shot engine call (create/start/inspect/stop/remove/kill/list/
/// update/exec/ping) is bounded by this. The streaming calls
/// (`pull_image`, `logs`, `stats`, `start_exec`) and `wait_container` are
/// exempted: they're governed by their own caller-driven timeouts instead
/// (the Image Coordinator's pull/progress timeouts, the Log Shipper's
/// grace period, a task's own lifetime), since a flat 30s bound would cut
/// a slow image pull or a long-lived log stream short.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds a one-shot engine call to [`DEFAULT_CALL_TIMEOUT`].
async fn with_call_timeout<T>(
    fut: impl std::future::Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    match tokio::time::timeout(DEFAULT_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout),
    }
}

/// Outcome of container creation, distinguishing the name-conflict case the
/// Driver Core handles by removing and retrying (spec §4.1).
#[derive(Debug)]
pub enum CreateOutcome {
    Created,
    NameConflict,
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Pull an image, streaming progress events. Each item is one decoded
    /// status line; the caller drives both the total-duration and
    /// progress-gap watchdogs (spec §4.2).
    async fn pull_image(
        &self,
        image: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<CreateImageInfo>>>;

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInspect>;

    /// Remove an image by id or ref. "Not found" is swallowed by callers,
    /// not by this method, so the Image Coordinator can log it (§4.2).
    async fn remove_image(&self, image: &str) -> EngineResult<()>;

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> EngineResult<CreateOutcome>;

    async fn start_container(&self, name: &str) -> EngineResult<()>;

    async fn inspect_container(&self, name: &str) -> EngineResult<ContainerInspectResponse>;

    /// `timeout` of `0` requests an immediate kill after the engine's grace
    /// signal, matching the "belt-and-suspenders" idempotent stop (§4.3).
    async fn stop_container(&self, name: &str, timeout_secs: i64) -> EngineResult<()>;

    async fn remove_container(&self, name: &str, force: bool) -> EngineResult<()>;

    async fn kill_container(&self, name: &str, signal: &str) -> EngineResult<()>;

    /// Stream of wait results; completes once the container reaches the
    /// `not-running` condition. The returned stream must be driven with a
    /// context that outlives the driver process (§4.3 step 1).
    async fn wait_container(
        &self,
        name: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<i64>>>;

    async fn logs(
        &self,
        name: &str,
        opts: LogsOptions<String>,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogOutput>>>;

    async fn stats(
        &self,
        name: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<Stats>>>;

    async fn list_containers(
        &self,
        all: bool,
        label_filters: Vec<String>,
    ) -> EngineResult<Vec<ContainerSummary>>;

    async fn update_container(
        &self,
        name: &str,
        update: UpdateContainerOptions<String>,
    ) -> EngineResult<()>;

    async fn create_exec(&self, name: &str, argv: Vec<String>) -> EngineResult<String>;

    async fn start_exec(
        &self,
        exec_id: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogOutput>>>;

    /// Exit code of a completed exec.
    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<Option<i64>>;

    async fn ping(&self) -> EngineResult<()>;
}

/// Thin wrapper over bollard's HTTP/socket client.
#[derive(Clone)]
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn connect_local() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(EngineError::Docker)?;
        Ok(Self { docker })
    }

    pub fn connect_socket(path: &str) -> EngineResult<Self> {
        let docker = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(EngineError::Docker)?;
        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl EngineClient for BollardEngine {
    async fn pull_image(
        &self,
        image: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<CreateImageInfo>>> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let stream = self
            .docker
            .create_image(Some(options), None, None)
            .map(|item| item.map_err(EngineError::Docker));
        Ok(Box::pin(stream))
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInspect> {
        with_call_timeout(async {
            self.docker
                .inspect_image(image)
                .await
                .map_err(EngineError::Docker)
        })
        .await
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        with_call_timeout(async {
            self.docker
                .remove_image(image, None, None)
                .await
                .map_err(EngineError::Docker)?;
            Ok(())
        })
        .await
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> EngineResult<CreateOutcome> {
        with_call_timeout(async {
            use bollard::container::CreateContainerOptions;
            let options = CreateContainerOptions {
                name: name.to_string(),
                platform: None,
            };
            match self.docker.create_container(Some(options), config).await {
                Ok(_) => Ok(CreateOutcome::Created),
                Err(e) => {
                    let wrapped = EngineError::Docker(e);
                    if wrapped.is_conflict() {
                        Ok(CreateOutcome::NameConflict)
                    } else {
                        Err(wrapped)
                    }
                }
            }
        })
        .await
    }

    async fn start_container(&self, name: &str) -> EngineResult<()> {
        with_call_timeout(async {
            use bollard::container::StartContainerOptions;
            match self
                .docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => {
                    let wrapped = EngineError::Docker(e);
                    if wrapped.is_not_modified() {
                        Ok(())
                    } else {
                        Err(wrapped)
                    }
                }
            }
        })
        .await
    }

    async fn inspect_container(&self, name: &str) -> EngineResult<ContainerInspectResponse> {
        with_call_timeout(async {
            self.docker
                .inspect_container(name, None)
                .await
                .map_err(EngineError::Docker)
        })
        .await
    }

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> EngineResult<()> {
        with_call_timeout(async {
            let options = StopContainerOptions { t: timeout_secs };
            match self.docker.stop_container(name, Some(options)).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    let wrapped = EngineError::Docker(e);
                    if wrapped.is_not_found() || wrapped.is_not_modified() {
                        Ok(())
                    } else {
                        Err(wrapped)
                    }
                }
            }
        })
        .await
    }

    async fn remove_container(&self, name: &str, force: bool) -> EngineResult<()> {
        with_call_timeout(async {
            let options = RemoveContainerOptions {
                force,
                v: false,
                ..Default::default()
            };
            match self.docker.remove_container(name, Some(options)).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    let wrapped = EngineError::Docker(e);
                    if wrapped.is_not_found() {
                        Ok(())
                    } else {
                        Err(wrapped)
                    }
                }
            }
        })
        .await
    }

    async fn kill_container(&self, name: &str, signal: &str) -> EngineResult<()> {
        with_call_timeout(async {
            let options = KillContainerOptions {
                signal: signal.to_string(),
            };
            match self.docker.kill_container(name, Some(options)).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    let wrapped = EngineError::Docker(e);
                    if wrapped.is_not_found() || wrapped.is_conflict() {
                        // Conflict here means "container not running".
                        Ok(())
                    } else {
                        Err(wrapped)
                    }
                }
            }
        })
        .await
    }

    async fn wait_container(
        &self,
        name: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<i64>>> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let stream = self
            .docker
            .wait_container(name, Some(options))
            .map(|item| item.map(|r| r.status_code).map_err(EngineError::Docker));
        Ok(Box::pin(stream))
    }

    async fn logs(
        &self,
        name: &str,
        opts: LogsOptions<String>,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogOutput>>> {
        let stream = self
            .docker
            .logs(name, Some(opts))
            .map(|item| item.map_err(EngineError::Docker));
        Ok(Box::pin(stream))
    }

    async fn stats(
        &self,
        name: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<Stats>>> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };
        let stream = self
            .docker
            .stats(name, Some(options))
            .map(|item| item.map_err(EngineError::Docker));
        Ok(Box::pin(stream))
    }

    async fn list_containers(
        &self,
        all: bool,
        label_filters: Vec<String>,
    ) -> EngineResult<Vec<ContainerSummary>> {
        with_call_timeout(async {
            let mut filters: HashMap<String, Vec<String>> = HashMap::new();
            if !label_filters.is_empty() {
                filters.insert("label".to_string(), label_filters);
            }
            let options = ListContainersOptions {
                all,
                filters,
                ..Default::default()
            };
            self.docker
                .list_containers(Some(options))
                .await
                .map_err(EngineError::Docker)
        })
        .await
    }

    async fn update_container(
        &self,
        name: &str,
        update: UpdateContainerOptions<String>,
    ) -> EngineResult<()> {
        with_call_timeout(async {
            self.docker
                .update_container(name, update)
                .await
                .map_err(EngineError::Docker)?;
            Ok(())
        })
        .await
    }

    async fn create_exec(&self, name: &str, argv: Vec<String>) -> EngineResult<String> {
        with_call_timeout(async {
            let options = CreateExecOptions {
                cmd: Some(argv),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            };
            let result = self
                .docker
                .create_exec(name, options)
                .await
                .map_err(EngineError::Docker)?;
            Ok(result.id)
        })
        .await
    }

    async fn start_exec(
        &self,
        exec_id: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogOutput>>> {
        match self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(EngineError::Docker)?
        {
            StartExecResults::Attached { output, .. } => {
                Ok(Box::pin(output.map(|item| item.map_err(EngineError::Docker))))
            }
            StartExecResults::Detached => Ok(Box::pin(futures_util::stream::empty())),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> EngineResult<Option<i64>> {
        with_call_timeout(async {
            let info = self
                .docker
                .inspect_exec(exec_id)
                .await
                .map_err(EngineError::Docker)?;
            Ok(info.exit_code)
        })
        .await
    }

    async fn ping(&self) -> EngineResult<()> {
        with_call_timeout(async {
            self.docker.ping().await.map_err(EngineError::Docker)?;
            Ok(())
        })
        .await
    }
}
