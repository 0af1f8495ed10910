//! Image Coordinator (C2, spec §4.2).
//!
//! Singleton keyed by normalized image ref: coalesces concurrent pulls,
//! refcounts per caller, and schedules cancellable delayed removal. All
//! four maps share one lock, matching §5 "Shared-resource policy": "one
//! mutex protecting all four maps; operations are short."

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::EngineClient;
use crate::error::{DriverError, DriverResult, EngineError};
use crate::image::reference::normalize_key;

/// Result of a successful pull, shared across every caller that was
/// waiting on the same in-flight future.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    pub image_id: String,
    pub resolved_ref: String,
}

type SharedPullResult = Result<PullOutcome, Arc<DriverError>>;
type SharedPullFuture = Shared<BoxFuture<'static, SharedPullResult>>;

/// Caller-supplied sink for pull progress lines.
pub type ProgressSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct State {
    pull_futures: HashMap<String, SharedPullFuture>,
    pull_sinks: HashMap<String, Vec<ProgressSink>>,
    /// imageId -> set of caller ids holding a reference.
    refcounts: HashMap<String, HashSet<String>>,
    /// normalized ref -> last-known image id, so a `RemoveImage` racing a
    /// fresh `PullImage` for the same ref can find the right delete future
    /// to cancel even before the new pull resolves.
    ref_to_image_id: HashMap<String, String>,
    /// imageId -> cancellation handle for a pending delayed removal.
    delete_futures: HashMap<String, CancellationToken>,
}

pub struct ImageCoordinator {
    engine: Arc<dyn EngineClient>,
    state: Mutex<State>,
    remove_delay: Duration,
    gc_enabled: bool,
    root_cancel: CancellationToken,
}

impl ImageCoordinator {
    pub fn new(engine: Arc<dyn EngineClient>, remove_delay: Duration, gc_enabled: bool) -> Self {
        Self {
            engine,
            state: Mutex::new(State::default()),
            remove_delay,
            gc_enabled,
            root_cancel: CancellationToken::new(),
        }
    }

    /// Cancels pending pulls and prevents new deletes from firing (§5
    /// "Driver shutdown cancels the root driver context").
    pub fn shutdown(&self) {
        self.root_cancel.cancel();
    }

    /// Pull `image_ref` on behalf of `caller_id`. Concurrent callers for the
    /// same ref observe exactly one engine pull and the same outcome (I1).
    pub async fn pull_image(
        &self,
        image_ref: &str,
        caller_id: &str,
        progress_sink: Option<ProgressSink>,
        pull_timeout: Duration,
        progress_timeout: Duration,
    ) -> DriverResult<PullOutcome> {
        let key = normalize_key(image_ref);

        let shared = {
            let mut state = self.state.lock();

            // Step 2: a pending delete for the image this ref last
            // resolved to must be cancelled before we do anything else,
            // so the caller is guaranteed the image exists on return (I3).
            if let Some(image_id) = state.ref_to_image_id.get(&key).cloned() {
                if let Some(cancel) = state.delete_futures.remove(&image_id) {
                    cancel.cancel();
                    debug!(image = %key, %image_id, "cancelled pending delete for re-pulled image");
                }
            }

            if let Some(sink) = &progress_sink {
                state
                    .pull_sinks
                    .entry(key.clone())
                    .or_default()
                    .push(sink.clone());
            }

            if let Some(existing) = state.pull_futures.get(&key) {
                existing.clone()
            } else {
                let fut = self.spawn_pull(key.clone(), pull_timeout, progress_timeout);
                state.pull_futures.insert(key.clone(), fut.clone());
                fut
            }
        };

        let result = shared.await;

        // The future is resolved; drop it from the map so the next pull of
        // this ref starts fresh, and clear its progress sinks.
        {
            let mut state = self.state.lock();
            state.pull_futures.remove(&key);
            state.pull_sinks.remove(&key);
        }

        match result {
            Ok(outcome) => {
                let mut state = self.state.lock();
                state
                    .refcounts
                    .entry(outcome.image_id.clone())
                    .or_default()
                    .insert(caller_id.to_string());
                state
                    .ref_to_image_id
                    .insert(key.clone(), outcome.image_id.clone());
                Ok(outcome)
            }
            Err(e) => Err(DriverError::Shared {
                message: e.to_string(),
                classification: e.classify(),
            }),
        }
    }

    fn spawn_pull(
        &self,
        key: String,
        pull_timeout: Duration,
        progress_timeout: Duration,
    ) -> SharedPullFuture {
        let engine = self.engine.clone();

        let fut: BoxFuture<'static, SharedPullResult> = {
            let cancel = self.root_cancel.clone();
            async move {
                let run = async {
                    let mut stream = engine.pull_image(&key).await.map_err(DriverError::Engine)?;

                    loop {
                        let next = tokio::time::timeout(progress_timeout, stream.next()).await;
                        match next {
                            Ok(Some(Ok(info))) => {
                                if let Some(status) = info.status {
                                    debug!(image = %key, %status, "pull progress");
                                }
                            }
                            Ok(Some(Err(e))) => {
                                return Err(DriverError::Engine(e));
                            }
                            Ok(None) => break,
                            Err(_) => {
                                return Err(DriverError::Engine(EngineError::Timeout));
                            }
                        }
                    }

                    let inspect = engine
                        .inspect_image(&key)
                        .await
                        .map_err(DriverError::Engine)?;
                    let image_id = inspect.id.unwrap_or_else(|| key.clone());
                    info!(image = %key, %image_id, "image pull complete");
                    Ok(PullOutcome {
                        image_id,
                        resolved_ref: key.clone(),
                    })
                };

                tokio::select! {
                    result = tokio::time::timeout(pull_timeout, run) => {
                        match result {
                            Ok(inner) => inner,
                            Err(_) => Err(DriverError::Engine(EngineError::Timeout)),
                        }
                    }
                    _ = cancel.cancelled() => Err(DriverError::Engine(EngineError::Cancelled)),
                }
            }
            .map(|r: DriverResult<PullOutcome>| r.map_err(Arc::new))
            .boxed()
        };

        let shared = fut.shared();
        // Drive it in the background even if every original caller's
        // awaiting future gets dropped.
        tokio::spawn(shared.clone());
        shared
    }

    /// Release `caller_id`'s hold on `image_id`; schedules a delayed
    /// removal once no caller holds it (§4.2 `RemoveImage`).
    pub fn remove_image(self: &Arc<Self>, image_id: &str, caller_id: &str) {
        let should_schedule = {
            let mut state = self.state.lock();
            if let Some(set) = state.refcounts.get_mut(image_id) {
                set.remove(caller_id);
                if set.is_empty() {
                    state.refcounts.remove(image_id);
                }
            }
            self.gc_enabled
                && !state.refcounts.contains_key(image_id)
                && !state.delete_futures.contains_key(image_id)
        };

        if !should_schedule {
            return;
        }

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock();
            state
                .delete_futures
                .insert(image_id.to_string(), cancel.clone());
        }

        let this = self.clone();
        let image_id = image_id.to_string();
        let delay = self.remove_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    this.fire_delete(&image_id).await;
                }
                _ = cancel.cancelled() => {
                    debug!(%image_id, "delayed image removal cancelled");
                }
            }
        });
    }

    async fn fire_delete(&self, image_id: &str) {
        let still_empty = {
            let mut state = self.state.lock();
            state.delete_futures.remove(image_id);
            !state.refcounts.contains_key(image_id)
        };
        if !still_empty {
            return;
        }
        match self.engine.remove_image(image_id).await {
            Ok(()) => info!(%image_id, "removed unreferenced image"),
            Err(e) if e.is_not_found() => {
                debug!(%image_id, "image already gone, nothing to remove")
            }
            Err(e) => warn!(%image_id, error = %e, "failed to remove image"),
        }
    }

    /// Current number of callers holding a reference, for tests/metrics.
    pub fn refcount(&self, image_id: &str) -> usize {
        self.state
            .lock()
            .refcounts
            .get(image_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn has_pending_delete(&self, image_id: &str) -> bool {
        self.state.lock().delete_futures.contains_key(image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use std::sync::atomic::Ordering;

    fn coordinator(engine: Arc<MockEngine>, gc: bool) -> Arc<ImageCoordinator> {
        Arc::new(ImageCoordinator::new(engine, Duration::from_millis(20), gc))
    }

    #[tokio::test]
    async fn concurrent_pulls_dedup_to_one_engine_call() {
        let engine = MockEngine::new();
        engine.with_pull_delay(Duration::from_millis(50));
        let coord = coordinator(engine.clone(), true);

        let a = coord.pull_image("redis:7", "caller-a", None, Duration::from_secs(5), Duration::from_secs(5));
        let b = coord.pull_image("redis:7", "caller-b", None, Duration::from_secs(5), Duration::from_secs(5));
        let (ra, rb) = tokio::join!(a, b);
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.image_id, rb.image_id);
        assert_eq!(engine.pull_count.load(Ordering::SeqCst), 1);
        assert_eq!(coord.refcount(&ra.image_id), 2);
    }

    #[tokio::test]
    async fn remove_image_schedules_delete_only_when_refcount_hits_zero() {
        let engine = MockEngine::new();
        let coord = coordinator(engine.clone(), true);

        let outcome = coord
            .pull_image("redis:7", "caller-a", None, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();

        coord.remove_image(&outcome.image_id, "caller-a");
        assert!(coord.has_pending_delete(&outcome.image_id));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.remove_image_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repulling_before_delete_fires_cancels_the_delete() {
        let engine = MockEngine::new();
        let coord = coordinator(engine.clone(), true);

        let outcome = coord
            .pull_image("redis:7", "caller-a", None, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();
        coord.remove_image(&outcome.image_id, "caller-a");
        assert!(coord.has_pending_delete(&outcome.image_id));

        let reoutcome = coord
            .pull_image("redis:7", "caller-b", None, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reoutcome.image_id, outcome.image_id);
        assert!(!coord.has_pending_delete(&outcome.image_id));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.remove_image_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_pull_failure_stays_recoverable_for_every_sharing_caller() {
        let engine = MockEngine::new();
        engine.set_fail_pull(Some("registry overloaded".to_string()));
        let coord = coordinator(engine.clone(), true);

        let a = coord.pull_image("redis:7", "caller-a", None, Duration::from_secs(5), Duration::from_secs(5));
        let b = coord.pull_image("redis:7", "caller-b", None, Duration::from_secs(5), Duration::from_secs(5));
        let (ra, rb) = tokio::join!(a, b);

        assert!(ra.unwrap_err().is_recoverable());
        assert!(rb.unwrap_err().is_recoverable());
    }

    #[tokio::test]
    async fn gc_disabled_never_schedules_delete() {
        let engine = MockEngine::new();
        let coord = coordinator(engine.clone(), false);

        let outcome = coord
            .pull_image("redis:7", "caller-a", None, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .unwrap();
        coord.remove_image(&outcome.image_id, "caller-a");
        assert!(!coord.has_pending_delete(&outcome.image_id));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.remove_image_count.load(Ordering::SeqCst), 0);
    }
}
