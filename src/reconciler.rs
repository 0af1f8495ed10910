//! Dangling-Container Reconciler (C8, spec §4.7, I7).
//!
//! Loop shape grounded on the teacher's `cron::scheduler::Job`/`JobHandle`;
//! the "ours" heuristic is new, grounded directly on spec.md §4.7's stated
//! label/mount/name rules.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bollard::models::ContainerSummary;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::EngineClient;
use crate::labels::ALLOC_ID_LABEL;
use crate::task::TaskStore;

const LEGACY_MOUNT_PREFIXES: [&str; 3] = ["/alloc", "/local", "/secrets"];

fn legacy_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r".*-[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .unwrap()
    })
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub period: Duration,
    pub creation_grace: Duration,
    pub dry_run: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5 * 60),
            creation_grace: Duration::from_secs(5 * 60),
            dry_run: false,
        }
    }
}

/// Whether a listed container belongs to this driver (§4.7 "Ours").
fn is_ours(container: &ContainerSummary) -> bool {
    if let Some(labels) = &container.labels {
        if labels.contains_key(ALLOC_ID_LABEL) {
            return true;
        }
    }

    let name_matches = container
        .names
        .as_ref()
        .map(|names| names.iter().any(|n| legacy_name_re().is_match(n)))
        .unwrap_or(false);

    let has_all_legacy_mounts = LEGACY_MOUNT_PREFIXES.iter().all(|prefix| {
        container
            .mounts
            .as_ref()
            .map(|mounts| {
                mounts
                    .iter()
                    .any(|m| m.destination.as_deref() == Some(*prefix))
            })
            .unwrap_or(false)
    });

    name_matches && has_all_legacy_mounts
}

fn created_within_grace(container: &ContainerSummary, grace: Duration, now_unix: i64) -> bool {
    match container.created {
        Some(created) => (now_unix - created) < grace.as_secs() as i64,
        None => false,
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Periodic sweep that force-removes containers tagged as ours but
/// untracked in the Task Store (spec §4.7).
pub struct Reconciler {
    engine: Arc<dyn EngineClient>,
    store: Arc<TaskStore>,
    config: ReconcilerConfig,
    fingerprinted: AtomicBool,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        store: Arc<TaskStore>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            config,
            fingerprinted: AtomicBool::new(false),
        })
    }

    /// Only active once the driver has fingerprinted successfully at
    /// least once (§4.7).
    pub fn mark_fingerprinted(&self) {
        self.fingerprinted.store(true, Ordering::SeqCst);
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if this.fingerprinted.load(Ordering::SeqCst) {
                            if let Err(e) = this.sweep_once().await {
                                warn!(error = %e, "reconciler sweep failed");
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// One sweep iteration; returns the set of container ids removed (or
    /// that would have been removed, in dry-run mode) for observability.
    pub async fn sweep_once(&self) -> Result<HashSet<String>, crate::error::EngineError> {
        let tracked = self.store.tracked_container_ids();
        let containers = self.engine.list_containers(false, vec![]).await?;
        let now = now_unix();
        let mut acted_on = HashSet::new();

        for c in containers {
            let id = match &c.id {
                Some(id) => id.clone(),
                None => continue,
            };
            if tracked.contains(&id) {
                continue;
            }
            if created_within_grace(&c, self.config.creation_grace, now) {
                continue;
            }
            if !is_ours(&c) {
                continue;
            }

            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .cloned()
                .unwrap_or_else(|| id.clone());

            if self.config.dry_run {
                info!(container = %name, "reconciler would remove dangling container (dry-run)");
            } else {
                info!(container = %name, "reconciler removing dangling container");
                self.engine.remove_container(&id, true).await?;
            }
            acted_on.insert(id);
        }

        Ok(acted_on)
    }
}
