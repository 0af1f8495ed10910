//! Cpuset Fixer (C7, spec §4.6).
//!
//! The loop shape (ticker + cancellation flag) follows the teacher's
//! `cron::scheduler::Job`/`JobHandle`; the cgroup-path resolution and
//! convergence logic are new, grounded directly on spec.md §4.6's stated
//! precedence rules (I8).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

const FIXER_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    V1,
    V2Cgroupfs,
    V2Systemd,
}

/// Detects which cgroup layout the host uses: v2 unified hierarchy
/// (cgroupfs- or systemd-managed) or the legacy v1 cpuset controller.
/// `None` means cgroups v2 is unavailable and the fixer should stay
/// dormant rather than guess at a v1 layout it hasn't verified.
pub fn detect_cgroup_mode() -> Option<CgroupMode> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    if std::path::Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        if std::path::Path::new("/run/systemd/system").exists() {
            Some(CgroupMode::V2Systemd)
        } else {
            Some(CgroupMode::V2Cgroupfs)
        }
    } else if std::path::Path::new("/sys/fs/cgroup/cpuset").exists() {
        Some(CgroupMode::V1)
    } else {
        None
    }
}

/// Resolve the engine container's cgroup cpuset path (§4.6 precedence):
/// an engine-provided path wins if present; otherwise it is derived from
/// the host cgroup mode and driver type.
pub fn resolve_cgroup_path(
    engine_provided: Option<&str>,
    mode: CgroupMode,
    container_id: &str,
) -> PathBuf {
    if let Some(p) = engine_provided {
        return PathBuf::from(p);
    }
    match mode {
        CgroupMode::V1 => {
            PathBuf::from(format!("/sys/fs/cgroup/cpuset/docker/{}", container_id))
        }
        CgroupMode::V2Cgroupfs => {
            PathBuf::from(format!("/sys/fs/cgroup/docker/{}", container_id))
        }
        CgroupMode::V2Systemd => PathBuf::from(format!(
            "/sys/fs/cgroup/system.slice/docker-{}.scope",
            container_id
        )),
    }
}

fn cpus_file(mode: CgroupMode, dir: &std::path::Path) -> PathBuf {
    match mode {
        CgroupMode::V1 => dir.join("cpuset.cpus"),
        CgroupMode::V2Cgroupfs | CgroupMode::V2Systemd => dir.join("cpuset.cpus"),
    }
}

fn effective_cpus_file(dir: &std::path::Path) -> PathBuf {
    dir.join("cpuset.cpus.effective")
}

/// One task's worth of cpuset-fixer state: source (orchestrator-owned)
/// cgroup dir and destination (engine-owned) cgroup dir.
pub struct CpusetTarget {
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub mode: CgroupMode,
}

/// Copies `cpuset.cpus.effective` from the source into `cpuset.cpus` of
/// the destination, only when changed. Returns `Ok(true)` if a write
/// happened.
fn converge_once(target: &CpusetTarget) -> std::io::Result<bool> {
    let source = effective_cpus_file(&target.source_dir);
    let dest = cpus_file(target.mode, &target.dest_dir);

    let wanted = std::fs::read_to_string(&source)?.trim().to_string();
    let current = std::fs::read_to_string(&dest).unwrap_or_default();
    let current = current.trim();

    if wanted == current {
        return Ok(false);
    }
    std::fs::write(&dest, &wanted)?;
    Ok(true)
}

/// Background loop reconciling one task's cpuset every [`FIXER_PERIOD`].
/// Inactive on non-Linux, when cgroups v2 is unavailable, and when the
/// task was assigned static cores (caller simply never starts it then).
pub struct CpusetFixer {
    enabled: AtomicBool,
}

impl CpusetFixer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
        })
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Runs until `done` fires or the token is cancelled.
    pub fn spawn(
        self: &Arc<Self>,
        task_label: String,
        target: CpusetTarget,
        mut done: tokio::sync::watch::Receiver<bool>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FIXER_PERIOD);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !this.enabled.load(Ordering::SeqCst) {
                            continue;
                        }
                        if *done.borrow() {
                            break;
                        }
                        match converge_once(&target) {
                            Ok(true) => debug!(task = %task_label, "cpuset converged"),
                            Ok(false) => {}
                            Err(e) => warn!(task = %task_label, error = %e, "cpuset fixer failed"),
                        }
                    }
                    _ = done.changed() => {
                        if *done.borrow() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_cgroup_path_v1() {
        let p = resolve_cgroup_path(None, CgroupMode::V1, "abc123");
        assert_eq!(p, PathBuf::from("/sys/fs/cgroup/cpuset/docker/abc123"));
    }

    #[test]
    fn resolve_cgroup_path_v2_cgroupfs() {
        let p = resolve_cgroup_path(None, CgroupMode::V2Cgroupfs, "abc123");
        assert_eq!(p, PathBuf::from("/sys/fs/cgroup/docker/abc123"));
    }

    #[test]
    fn resolve_cgroup_path_v2_systemd() {
        let p = resolve_cgroup_path(None, CgroupMode::V2Systemd, "abc123");
        assert_eq!(
            p,
            PathBuf::from("/sys/fs/cgroup/system.slice/docker-abc123.scope")
        );
    }

    #[test]
    fn engine_provided_path_wins_over_derivation() {
        let p = resolve_cgroup_path(Some("/custom/path"), CgroupMode::V1, "abc123");
        assert_eq!(p, PathBuf::from("/custom/path"));
    }

    #[test]
    fn converge_once_copies_effective_into_dest_when_changed() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        std::fs::write(source.path().join("cpuset.cpus.effective"), "0-1\n").unwrap();
        std::fs::write(dest.path().join("cpuset.cpus"), "0\n").unwrap();

        let target = CpusetTarget {
            source_dir: source.path().to_path_buf(),
            dest_dir: dest.path().to_path_buf(),
            mode: CgroupMode::V2Cgroupfs,
        };

        let changed = converge_once(&target).unwrap();
        assert!(changed);
        let result = std::fs::read_to_string(dest.path().join("cpuset.cpus")).unwrap();
        assert_eq!(result.trim(), "0-1");
    }

    #[test]
    fn converge_once_is_noop_when_unchanged() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        std::fs::write(source.path().join("cpuset.cpus.effective"), "0-1\n").unwrap();
        std::fs::write(dest.path().join("cpuset.cpus"), "0-1\n").unwrap();

        let target = CpusetTarget {
            source_dir: source.path().to_path_buf(),
            dest_dir: dest.path().to_path_buf(),
            mode: CgroupMode::V2Cgroupfs,
        };

        let changed = converge_once(&target).unwrap();
        assert!(!changed);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_fixer_converges_on_its_own_tick_and_stops_on_done() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        std::fs::write(source.path().join("cpuset.cpus.effective"), "2-3\n").unwrap();
        std::fs::write(dest.path().join("cpuset.cpus"), "0\n").unwrap();

        let fixer = CpusetFixer::new();
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        let cancel = tokio_util::sync::CancellationToken::new();
        let target = CpusetTarget {
            source_dir: source.path().to_path_buf(),
            dest_dir: dest.path().to_path_buf(),
            mode: CgroupMode::V2Cgroupfs,
        };

        let handle = fixer.spawn("task1".to_string(), target, done_rx, cancel.clone());

        tokio::time::advance(FIXER_PERIOD + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        let dest_contents = std::fs::read_to_string(dest.path().join("cpuset.cpus")).unwrap();
        assert_eq!(dest_contents.trim(), "2-3");

        done_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("fixer loop should stop once done fires")
            .unwrap();
    }
}
