//! In-memory fake engine, used by unit and integration tests in place of a
//! real Docker daemon (§9 Design Note: "tests substitute a mock
//! implementing a narrow interface").

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, LogOutput, LogsOptions, Stats, UpdateContainerOptions,
};
use bollard::models::{
    ContainerInspectResponse, ContainerState, ContainerSummary, CreateImageInfo, ImageInspect,
};
use futures_util::stream::BoxStream;
use parking_lot::Mutex;

use super::client::{CreateOutcome, EngineClient};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<String>,
    pub created_unix: i64,
}

/// Scriptable fake engine. Every call is counted so tests can assert
/// invariants like I1 ("the engine receives exactly one pull").
pub struct MockEngine {
    pub containers: Mutex<HashMap<String, MockContainer>>,
    pub images: Mutex<Vec<String>>,
    pub pull_count: AtomicU32,
    pub remove_image_count: AtomicU32,
    pub next_container_id: AtomicI64,
    /// Artificial delay injected into `pull_image`, to make dedup races
    /// reproducible in tests.
    pub pull_delay: Mutex<Duration>,
    pub fail_pull: Mutex<Option<String>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            images: Mutex::new(Vec::new()),
            pull_count: AtomicU32::new(0),
            remove_image_count: AtomicU32::new(0),
            next_container_id: AtomicI64::new(1),
            pull_delay: Mutex::new(Duration::from_millis(0)),
            fail_pull: Mutex::new(None),
        }
    }
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_pull_delay(self: &Arc<Self>, delay: Duration) {
        *self.pull_delay.lock() = delay;
    }

    pub fn set_fail_pull(self: &Arc<Self>, message: Option<String>) {
        *self.fail_pull.lock() = message;
    }

    pub fn seed_container(&self, c: MockContainer) {
        self.containers.lock().insert(c.name.clone(), c);
    }

    fn next_id(&self) -> String {
        let n = self.next_container_id.fetch_add(1, Ordering::SeqCst);
        format!("mockid{:016x}", n)
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn pull_image(
        &self,
        image: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<CreateImageInfo>>> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = self.fail_pull.lock().clone() {
            // A registry/engine 503 is the canonical transient pull
            // failure (spec §8 "Image pull transient -> RecoverableError");
            // scripting it this way, rather than as `EngineError::Other`,
            // lets tests assert the classification survives intact.
            return Ok(Box::pin(futures_util::stream::once(async move {
                Err(EngineError::Docker(
                    bollard::errors::Error::DockerResponseServerError {
                        status_code: 503,
                        message: msg,
                    },
                ))
            })));
        }
        self.images.lock().push(image.to_string());
        let info = CreateImageInfo {
            status: Some(format!("Pull complete: {}", image)),
            ..Default::default()
        };
        Ok(Box::pin(futures_util::stream::once(async move { Ok(info) })))
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInspect> {
        Ok(ImageInspect {
            id: Some(format!("sha256:{:x}", md5ish(image))),
            repo_tags: Some(vec![image.to_string()]),
            ..Default::default()
        })
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        self.remove_image_count.fetch_add(1, Ordering::SeqCst);
        self.images.lock().retain(|i| i != image);
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> EngineResult<CreateOutcome> {
        let mut containers = self.containers.lock();
        if containers.contains_key(name) {
            return Ok(CreateOutcome::NameConflict);
        }
        let id = self.next_id();
        containers.insert(
            name.to_string(),
            MockContainer {
                id,
                name: name.to_string(),
                image: config.image.unwrap_or_default(),
                running: false,
                exit_code: 0,
                oom_killed: false,
                labels: config.labels.unwrap_or_default(),
                mounts: Vec::new(),
                created_unix: 0,
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn start_container(&self, name: &str) -> EngineResult<()> {
        let mut containers = self.containers.lock();
        match containers.get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(EngineError::Docker(
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message: "no such container".into(),
                },
            )),
        }
    }

    async fn inspect_container(&self, name: &str) -> EngineResult<ContainerInspectResponse> {
        let containers = self.containers.lock();
        let c = containers.get(name).ok_or_else(|| {
            EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "no such container".into(),
            })
        })?;
        Ok(ContainerInspectResponse {
            id: Some(c.id.clone()),
            name: Some(format!("/{}", c.name)),
            created: Some(c.created_unix.to_string()),
            state: Some(Box::new(ContainerState {
                running: Some(c.running),
                exit_code: Some(c.exit_code),
                oom_killed: Some(c.oom_killed),
                started_at: Some("2026-01-01T00:00:00Z".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        })
    }

    async fn stop_container(&self, name: &str, _timeout_secs: i64) -> EngineResult<()> {
        let mut containers = self.containers.lock();
        if let Some(c) = containers.get_mut(name) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> EngineResult<()> {
        self.containers.lock().remove(name);
        Ok(())
    }

    async fn kill_container(&self, name: &str, _signal: &str) -> EngineResult<()> {
        let mut containers = self.containers.lock();
        if let Some(c) = containers.get_mut(name) {
            c.running = false;
        }
        Ok(())
    }

    async fn wait_container(
        &self,
        name: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<i64>>> {
        let exit_code = {
            let containers = self.containers.lock();
            containers.get(name).map(|c| c.exit_code).unwrap_or(0)
        };
        Ok(Box::pin(futures_util::stream::once(async move {
            Ok(exit_code)
        })))
    }

    async fn logs(
        &self,
        _name: &str,
        _opts: LogsOptions<String>,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogOutput>>> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn stats(
        &self,
        _name: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<Stats>>> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn list_containers(
        &self,
        all: bool,
        label_filters: Vec<String>,
    ) -> EngineResult<Vec<ContainerSummary>> {
        let containers = self.containers.lock();
        let out = containers
            .values()
            .filter(|c| all || c.running)
            .filter(|c| {
                label_filters.is_empty()
                    || label_filters.iter().any(|f| {
                        let (k, v) = f.split_once('=').unwrap_or((f.as_str(), ""));
                        c.labels.get(k).map(|lv| lv == v).unwrap_or(false)
                    })
            })
            .map(|c| ContainerSummary {
                id: Some(c.id.clone()),
                names: Some(vec![format!("/{}", c.name)]),
                image: Some(c.image.clone()),
                labels: Some(c.labels.clone()),
                mounts: Some(
                    c.mounts
                        .iter()
                        .map(|m| bollard::models::MountPoint {
                            destination: Some(m.clone()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                created: Some(c.created_unix),
                state: Some(if c.running {
                    "running".to_string()
                } else {
                    "exited".to_string()
                }),
                ..Default::default()
            })
            .collect();
        Ok(out)
    }

    async fn update_container(
        &self,
        _name: &str,
        _update: UpdateContainerOptions<String>,
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn create_exec(&self, _name: &str, _argv: Vec<String>) -> EngineResult<String> {
        Ok("mock-exec".to_string())
    }

    async fn start_exec(
        &self,
        _exec_id: &str,
    ) -> EngineResult<BoxStream<'static, EngineResult<LogOutput>>> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn inspect_exec(&self, _exec_id: &str) -> EngineResult<Option<i64>> {
        Ok(Some(0))
    }

    async fn ping(&self) -> EngineResult<()> {
        Ok(())
    }
}

fn md5ish(s: &str) -> u64 {
    s.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
}
