//! Task Spec input struct and its conversion into bollard's
//! `Config`/`HostConfig` (spec §3 "Task Spec (input)").

use std::collections::HashMap;

use bollard::container::Config;
use bollard::models::{
    HostConfig, PortBinding, PortMap, RestartPolicy, RestartPolicyNameEnum,
};
use serde::{Deserialize, Serialize};

use crate::labels;

/// One bind/tmpfs/volume mount request (§3 "mounts (bind/tmpfs/volume)").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mount {
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    Tmpfs {
        target: String,
        size_bytes: Option<i64>,
    },
    Volume {
        name: String,
        target: String,
        read_only: bool,
        driver: Option<String>,
    },
}

/// A declared port mapping; both tcp and udp are exposed per I9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub label: String,
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_soft_mb: Option<i64>,
    pub memory_hard_mb: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpu_period_us: Option<i64>,
    pub cpu_quota_us: Option<i64>,
    pub cpuset_path: Option<String>,
    pub pids_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub alloc_id: String,
    pub task_name: String,
    pub job_name: Option<String>,
    pub task_group_name: Option<String>,
    pub image: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub resources: ResourceLimits,
    pub runtime: Option<String>,
    #[serde(default)]
    pub kill_signal: Option<String>,
    pub kill_timeout_secs: i64,
    pub log_stdout_fifo: Option<String>,
    pub log_stderr_fifo: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub privileged: bool,
    pub network_mode: Option<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
}

impl TaskSpec {
    /// Container name per §6 "Container naming": `<sanitized_task_name>-<alloc_id>`.
    pub fn container_name(&self) -> String {
        let sanitized: String = self
            .task_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        format!("{}-{}", sanitized, self.alloc_id)
    }

    /// Build the bollard container config, applying labels but not yet
    /// policy (policy coercion, e.g. GPU runtime, happens in the Driver
    /// Core before this is called).
    pub fn to_bollard_config(
        &self,
        image_id: &str,
        extra_label_globs: &[String],
    ) -> Config<String> {
        let mut cmd = Vec::new();
        if let Some(c) = &self.command {
            cmd.push(c.clone());
        }
        cmd.extend(self.args.iter().cloned());

        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let labels = labels::build(self, extra_label_globs);

        let host_config = self.to_host_config();

        Config {
            image: Some(image_id.to_string()),
            cmd: if cmd.is_empty() { None } else { Some(cmd) },
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: self.working_dir.clone(),
            user: self.user.clone(),
            labels: Some(labels),
            tty: Some(self.tty),
            host_config: Some(host_config),
            exposed_ports: self.exposed_ports(),
            ..Default::default()
        }
    }

    fn exposed_ports(&self) -> Option<HashMap<String, HashMap<(), ()>>> {
        if self.ports.is_empty() {
            return None;
        }
        let mut map = HashMap::new();
        for p in &self.ports {
            map.insert(format!("{}/tcp", p.container_port), HashMap::new());
            map.insert(format!("{}/udp", p.container_port), HashMap::new());
        }
        Some(map)
    }

    fn port_bindings(&self) -> Option<PortMap> {
        if self.ports.is_empty() {
            return None;
        }
        let mut map: PortMap = HashMap::new();
        for p in &self.ports {
            let binding = vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(p.host_port.to_string()),
            }];
            map.insert(format!("{}/tcp", p.container_port), Some(binding.clone()));
            map.insert(format!("{}/udp", p.container_port), Some(binding));
        }
        Some(map)
    }

    fn to_host_config(&self) -> HostConfig {
        let mut binds = Vec::new();
        let mut tmpfs = HashMap::new();
        let mut volume_names = Vec::new();

        for m in &self.mounts {
            match m {
                Mount::Bind {
                    source,
                    target,
                    read_only,
                } => {
                    let flag = if *read_only { ":ro" } else { "" };
                    binds.push(format!("{}:{}{}", source, target, flag));
                }
                Mount::Tmpfs { target, size_bytes } => {
                    let opts = size_bytes
                        .map(|s| format!("size={}", s))
                        .unwrap_or_default();
                    tmpfs.insert(target.clone(), opts);
                }
                Mount::Volume {
                    name,
                    target,
                    read_only,
                    ..
                } => {
                    let flag = if *read_only { ":ro" } else { "" };
                    binds.push(format!("{}:{}{}", name, target, flag));
                    volume_names.push(name.clone());
                }
            }
        }

        HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
            cap_add: if self.cap_add.is_empty() {
                None
            } else {
                Some(self.cap_add.clone())
            },
            cap_drop: if self.cap_drop.is_empty() {
                None
            } else {
                Some(self.cap_drop.clone())
            },
            privileged: Some(self.privileged),
            dns: if self.dns.is_empty() {
                None
            } else {
                Some(self.dns.clone())
            },
            extra_hosts: if self.extra_hosts.is_empty() {
                None
            } else {
                Some(self.extra_hosts.clone())
            },
            memory: self.resources.memory_hard_mb.map(|mb| mb * 1024 * 1024),
            memory_reservation: self
                .resources
                .memory_soft_mb
                .map(|mb| mb * 1024 * 1024),
            cpu_shares: self.resources.cpu_shares,
            cpu_period: self.resources.cpu_period_us,
            cpu_quota: self.resources.cpu_quota_us,
            cpuset_cpus: None, // engine-owned cgroup; the Cpuset Fixer converges this post-create
            pids_limit: self.resources.pids_limit,
            runtime: self.runtime.clone(),
            network_mode: self.network_mode.clone(),
            port_bindings: self.port_bindings(),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        }
    }
}
