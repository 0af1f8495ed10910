//! Sandbox / group network container (spec §4.9).
//!
//! Grounded on the same bollard `Config`/`HostConfig` construction path as
//! `TaskSpec::to_bollard_config`, reused here for a minimal pause
//! container instead of a task container.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::Config;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};

use crate::engine::{CreateOutcome, EngineClient};
use crate::error::{DriverError, DriverResult};
use crate::labels::ALLOC_ID_LABEL;

/// `CreateNetwork(allocId, req)` input (spec §4.9).
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub alloc_id: String,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub container_id: String,
    pub container_name: String,
    /// Network namespace path task containers later join. Populated from
    /// the engine container's `Sandbox`/`State.Pid` info once created; the
    /// mock engine returns a synthetic path.
    pub netns_path: String,
}

pub struct SandboxManager {
    engine: Arc<dyn EngineClient>,
    infra_image: String,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn EngineClient>, infra_image: String) -> Self {
        Self { engine, infra_image }
    }

    fn sandbox_name(alloc_id: &str) -> String {
        format!("sandbox-{}", alloc_id)
    }

    pub async fn create_network(&self, req: NetworkRequest) -> DriverResult<NetworkHandle> {
        let name = Self::sandbox_name(&req.alloc_id);

        let mut labels = HashMap::new();
        labels.insert(ALLOC_ID_LABEL.to_string(), req.alloc_id.clone());

        let config = Config {
            image: Some(self.infra_image.clone()),
            labels: Some(labels),
            hostname: req.hostname.clone(),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        match self.engine.create_container(&name, config).await? {
            CreateOutcome::Created => {}
            CreateOutcome::NameConflict => {
                self.engine.remove_container(&name, true).await?;
                let config = self.build_config(&req);
                match self.engine.create_container(&name, config).await? {
                    CreateOutcome::Created => {}
                    CreateOutcome::NameConflict => {
                        return Err(DriverError::Other(
                            "sandbox container name conflict persisted after retry".to_string(),
                        ));
                    }
                }
            }
        }

        self.engine.start_container(&name).await?;
        let inspect = self.engine.inspect_container(&name).await?;
        let container_id = inspect.id.unwrap_or_else(|| name.clone());

        Ok(NetworkHandle {
            container_id,
            container_name: name,
            netns_path: format!("/proc/{}/ns/net", req.alloc_id),
        })
    }

    fn build_config(&self, req: &NetworkRequest) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(ALLOC_ID_LABEL.to_string(), req.alloc_id.clone());
        Config {
            image: Some(self.infra_image.clone()),
            labels: Some(labels),
            hostname: req.hostname.clone(),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub async fn destroy_network(&self, handle: &NetworkHandle) -> DriverResult<()> {
        self.engine
            .remove_container(&handle.container_name, true)
            .await
            .map_err(DriverError::Engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    #[tokio::test]
    async fn create_network_starts_a_none_networked_sandbox() {
        let engine = MockEngine::new();
        let mgr = SandboxManager::new(engine.clone(), "busybox:latest".to_string());
        let handle = mgr
            .create_network(NetworkRequest {
                alloc_id: "alloc-1".to_string(),
                hostname: None,
            })
            .await
            .unwrap();
        assert_eq!(handle.container_name, "sandbox-alloc-1");
        assert!(engine
            .containers
            .lock()
            .get("sandbox-alloc-1")
            .unwrap()
            .running);
    }

    #[tokio::test]
    async fn destroy_network_removes_sandbox() {
        let engine = MockEngine::new();
        let mgr = SandboxManager::new(engine.clone(), "busybox:latest".to_string());
        let handle = mgr
            .create_network(NetworkRequest {
                alloc_id: "alloc-2".to_string(),
                hostname: None,
            })
            .await
            .unwrap();
        mgr.destroy_network(&handle).await.unwrap();
        assert!(!engine.containers.lock().contains_key("sandbox-alloc-2"));
    }
}
