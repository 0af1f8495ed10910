//! Policy checks applied at `StartTask` (spec §4.1 "Policy checks at
//! StartTask").
//!
//! No direct teacher counterpart (the teacher hardcodes dropped
//! capabilities in `DockerEnvironment::dropped_capabilities` rather than
//! enforcing an allow-list); written in the same small-pure-function
//! style and tested the way `environment/docker/stats.rs`'s calculation
//! functions are tested.

use std::collections::HashSet;

use crate::error::DriverError;
use crate::task::TaskSpec;

pub const GPU_INDICATOR_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub allow_runtimes: Vec<String>,
    pub allow_caps: Vec<String>,
    pub gpu_runtime_name: String,
    pub volumes_enabled: bool,
    pub pids_limit_ceiling: Option<i64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_runtimes: vec!["runc".to_string(), "nvidia".to_string()],
            allow_caps: default_docker_caps(),
            gpu_runtime_name: "nvidia".to_string(),
            volumes_enabled: true,
            pids_limit_ceiling: None,
        }
    }
}

fn default_docker_caps() -> Vec<String> {
    [
        "CHOWN", "DAC_OVERRIDE", "FSETID", "FOWNER", "MKNOD", "NET_RAW", "SETGID", "SETUID",
        "SETFCAP", "SETPCAP", "NET_BIND_SERVICE", "SYS_CHROOT", "KILL", "AUDIT_WRITE",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Resolved runtime after GPU coercion (spec §4.1 "GPU" rule).
pub fn resolve_runtime(spec: &TaskSpec, cfg: &PolicyConfig) -> Result<Option<String>, DriverError> {
    let wants_gpu = spec.env.keys().any(|k| k == GPU_INDICATOR_ENV);
    if wants_gpu {
        match &spec.runtime {
            Some(r) if r != &cfg.gpu_runtime_name => Err(DriverError::Config(format!(
                "task requests GPU device but also sets conflicting runtime {}",
                r
            ))),
            _ => Ok(Some(cfg.gpu_runtime_name.clone())),
        }
    } else {
        Ok(spec.runtime.clone())
    }
}

pub fn check_runtime_allowed(runtime: Option<&str>, cfg: &PolicyConfig) -> Result<(), DriverError> {
    match runtime {
        None => Ok(()),
        Some(r) if cfg.allow_runtimes.iter().any(|a| a == r) => Ok(()),
        Some(r) => Err(DriverError::Config(format!("runtime {} is not allowed", r))),
    }
}

/// Effective caps = defaults + capAdd - capDrop; must be a subset of the
/// allow-list unless it contains `"all"`.
pub fn check_caps_allowed(spec: &TaskSpec, cfg: &PolicyConfig) -> Result<(), DriverError> {
    if cfg.allow_caps.iter().any(|c| c.eq_ignore_ascii_case("all")) {
        return Ok(());
    }
    let allow: HashSet<&str> = cfg.allow_caps.iter().map(|s| s.as_str()).collect();
    let mut effective: HashSet<String> = default_docker_caps().into_iter().collect();
    for c in &spec.cap_add {
        effective.insert(c.clone());
    }
    for c in &spec.cap_drop {
        effective.remove(c);
    }
    for cap in &effective {
        if !allow.contains(cap.as_str()) {
            return Err(DriverError::Config(format!(
                "capability {} is not in the allowed set",
                cap
            )));
        }
    }
    Ok(())
}

pub fn check_pids_limit(spec: &TaskSpec, cfg: &PolicyConfig) -> Result<(), DriverError> {
    match (spec.resources.pids_limit, cfg.pids_limit_ceiling) {
        (Some(requested), Some(ceiling)) if requested > ceiling => Err(DriverError::Config(
            format!("pids_limit {} exceeds ceiling {}", requested, ceiling),
        )),
        _ => Ok(()),
    }
}

/// Rejects absolute host bind mounts and any `volumeDriver` when volumes
/// are disabled.
pub fn check_volumes_allowed(spec: &TaskSpec, cfg: &PolicyConfig) -> Result<(), DriverError> {
    if cfg.volumes_enabled {
        return Ok(());
    }
    for m in &spec.mounts {
        match m {
            crate::task::spec::Mount::Bind { source, .. } if source.starts_with('/') => {
                return Err(DriverError::Config(
                    "absolute host bind mounts are disabled by policy".to_string(),
                ));
            }
            crate::task::spec::Mount::Volume {
                driver: Some(_), ..
            } => {
                return Err(DriverError::Config(
                    "custom volume drivers are disabled by policy".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Runs every `StartTask` policy check (spec §4.1), returning the
/// resolved runtime on success.
pub fn check_all(spec: &TaskSpec, cfg: &PolicyConfig) -> Result<Option<String>, DriverError> {
    let runtime = resolve_runtime(spec, cfg)?;
    check_runtime_allowed(runtime.as_deref(), cfg)?;
    check_caps_allowed(spec, cfg)?;
    check_pids_limit(spec, cfg)?;
    check_volumes_allowed(spec, cfg)?;
    Ok(runtime)
}
