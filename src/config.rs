//! Driver-wide configuration (spec §6 "Configuration", SPEC_FULL §A.3).
//!
//! Shape and loading code grounded on the teacher's `config/config.rs`:
//! `#[serde(default = "...")]` per-field defaults and a `load(path)`
//! entry point returning `anyhow::Result`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    #[serde(default)]
    pub tls_ca: Option<String>,

    #[serde(default)]
    pub allow_privileged: bool,
    #[serde(default = "default_allow_caps")]
    pub allow_caps: Vec<String>,
    #[serde(default = "default_allow_runtimes")]
    pub allow_runtimes: Vec<String>,
    #[serde(default = "default_gpu_runtime_name")]
    pub gpu_runtime_name: String,

    #[serde(default)]
    pub volumes: VolumesConfiguration,

    #[serde(default)]
    pub pids_limit: Option<i64>,

    #[serde(default)]
    pub gc: GcConfiguration,

    #[serde(default = "default_infra_image")]
    pub infra_image: String,
    #[serde(default = "default_infra_image_pull_timeout", with = "humantime_secs")]
    pub infra_image_pull_timeout: Duration,

    #[serde(default = "default_pull_activity_timeout", with = "humantime_secs")]
    pub pull_activity_timeout: Duration,

    #[serde(default)]
    pub extra_labels: Vec<String>,

    #[serde(default)]
    pub logging: LoggingConfiguration,

    #[serde(default)]
    pub disable_log_collection: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumesConfiguration {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub selinux_label: Option<String>,
}

impl Default for VolumesConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            selinux_label: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcConfiguration {
    #[serde(default = "default_true")]
    pub container: bool,
    #[serde(default = "default_true")]
    pub image: bool,
    #[serde(default = "default_image_delay", with = "humantime_secs")]
    pub image_delay: Duration,
    #[serde(default)]
    pub dangling_containers: DanglingContainersConfiguration,
}

impl Default for GcConfiguration {
    fn default() -> Self {
        Self {
            container: true,
            image: true,
            image_delay: default_image_delay(),
            dangling_containers: DanglingContainersConfiguration::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DanglingContainersConfiguration {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconciler_period", with = "humantime_secs")]
    pub period: Duration,
    #[serde(default = "default_creation_grace", with = "humantime_secs")]
    pub creation_grace: Duration,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for DanglingContainersConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            period: default_reconciler_period(),
            creation_grace: default_creation_grace(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfiguration {
    #[serde(default = "default_log_driver")]
    pub r#type: String,
    #[serde(default)]
    pub config: std::collections::HashMap<String, String>,
}

fn default_log_driver() -> String {
    "json-file".to_string()
}

fn default_endpoint() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_allow_caps() -> Vec<String> {
    crate::policy::PolicyConfig::default().allow_caps
}

fn default_allow_runtimes() -> Vec<String> {
    vec!["runc".to_string(), "nvidia".to_string()]
}

fn default_gpu_runtime_name() -> String {
    "nvidia".to_string()
}

fn default_infra_image() -> String {
    "registry.k8s.io/pause:3.9".to_string()
}

fn default_infra_image_pull_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_pull_activity_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_image_delay() -> Duration {
    Duration::from_secs(3 * 60)
}

fn default_reconciler_period() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_creation_grace() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_true() -> bool {
    true
}

/// Durations are expressed in seconds in the TOML file, matching the
/// teacher's preference for plain scalar config values over a duration
/// string parser dependency.
mod humantime_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Configuration {
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", path))?;
        let config: Configuration =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;
        Ok(config)
    }

    pub fn policy(&self) -> crate::policy::PolicyConfig {
        crate::policy::PolicyConfig {
            allow_runtimes: self.allow_runtimes.clone(),
            allow_caps: self.allow_caps.clone(),
            gpu_runtime_name: self.gpu_runtime_name.clone(),
            volumes_enabled: self.volumes.enabled,
            pids_limit_ceiling: self.pids_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_populate_without_any_toml_keys() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.endpoint, default_endpoint());
        assert!(config.volumes.enabled);
        assert!(config.gc.container);
        assert!(config.gc.dangling_containers.enabled);
        assert_eq!(config.gc.image_delay, Duration::from_secs(180));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let toml_str = r#"
            endpoint = "unix:///custom.sock"
            allow_runtimes = ["runc"]

            [gc]
            container = false

            [gc.dangling_containers]
            period = 60
            dry_run = true
        "#;
        let config: Configuration = toml::from_str(toml_str).unwrap();
        assert_eq!(config.endpoint, "unix:///custom.sock");
        assert_eq!(config.allow_runtimes, vec!["runc".to_string()]);
        assert!(!config.gc.container);
        assert_eq!(config.gc.dangling_containers.period, Duration::from_secs(60));
        assert!(config.gc.dangling_containers.dry_run);
    }
}
