//! Stats Pump (C5, spec §4.4).
//!
//! Grounded on the teacher's `environment/docker/stats.rs` almost
//! directly: the memory/cpu/network calculation functions are the same
//! shape, generalized to the split metrics (user/system/total percentages,
//! throttling counters) spec §4.4 calls for, and with the stopped-container
//! error classification reused for reconnect-vs-give-up decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use bollard::container::{CPUStats, MemoryStats, Stats as BollardStats};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::EngineClient;

const MAX_BACKOFF: Duration = Duration::from_secs(120);
const BASELINE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryUsage {
    pub rss: u64,
    pub cache: u64,
    pub swap: u64,
    pub mapped: u64,
    pub usage: u64,
    pub max_usage: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuUsage {
    pub throttled_periods: u64,
    pub throttled_time_ns: u64,
    pub percent_user: f64,
    pub percent_system: f64,
    pub percent_total: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUsage {
    pub memory: MemoryUsage,
    pub cpu: CpuUsage,
    pub network: NetworkUsage,
}

/// Previous-sample state needed to derive percentages from cumulative
/// cgroup counters.
#[derive(Default)]
struct CpuHistory {
    total: Option<u64>,
    system: Option<u64>,
    kernel: Option<u64>,
    user: Option<u64>,
}

fn calculate_memory(stats: &MemoryStats) -> MemoryUsage {
    if let Some(pws) = stats.private_working_set {
        // Windows / Hyper-V isolation path (spec §9 Open Question: mapped
        // unconditionally, as the source does).
        return MemoryUsage {
            rss: pws,
            cache: 0,
            swap: 0,
            mapped: 0,
            usage: stats.commit.unwrap_or(pws),
            max_usage: stats.commit_peak.unwrap_or(0),
        };
    }

    let inner = stats.stats.clone().unwrap_or_default();
    MemoryUsage {
        rss: inner.rss,
        cache: inner.cache,
        swap: inner.swap,
        mapped: inner.mapped_file,
        usage: stats.usage.unwrap_or(0),
        max_usage: stats.max_usage.unwrap_or(0),
    }
}

fn calculate_cpu(stats: &CPUStats, history: &mut CpuHistory) -> CpuUsage {
    let total = stats.cpu_usage.total_usage;
    let kernel = stats.cpu_usage.usage_in_kernelmode;
    let user = stats.cpu_usage.usage_in_usermode;
    let system = stats.system_cpu_usage.unwrap_or(0);
    let cpus = stats.online_cpus.unwrap_or(1) as f64;

    let (percent_total, percent_system, percent_user) =
        match (history.total, history.system, history.kernel, history.user) {
            (Some(pt), Some(ps), Some(pk), Some(pu)) => {
                let total_delta = total.saturating_sub(pt);
                let system_delta = system.saturating_sub(ps);
                let kernel_delta = kernel.saturating_sub(pk);
                let user_delta = user.saturating_sub(pu);

                if system_delta > 0 && total_delta > 0 {
                    let pct = |delta: u64| {
                        ((delta as f64 / system_delta as f64) * 100.0 * cpus).min(100.0 * cpus)
                    };
                    (pct(total_delta), pct(kernel_delta), pct(user_delta))
                } else {
                    (0.0, 0.0, 0.0)
                }
            }
            _ => (0.0, 0.0, 0.0),
        };

    history.total = Some(total);
    history.system = Some(system);
    history.kernel = Some(kernel);
    history.user = Some(user);

    let throttling = stats.throttling_data.clone().unwrap_or_default();

    CpuUsage {
        throttled_periods: throttling.throttled_periods,
        throttled_time_ns: throttling.throttled_time,
        percent_user,
        percent_system,
        percent_total,
    }
}

fn calculate_network(
    networks: &Option<HashMap<String, bollard::container::NetworkStats>>,
) -> NetworkUsage {
    let mut usage = NetworkUsage::default();
    if let Some(nets) = networks {
        for stats in nets.values() {
            usage.rx_bytes += stats.rx_bytes;
            usage.tx_bytes += stats.tx_bytes;
        }
    }
    usage
}

fn build_usage(stats: &BollardStats, history: &mut CpuHistory) -> ResourceUsage {
    ResourceUsage {
        memory: calculate_memory(&stats.memory_stats),
        cpu: calculate_cpu(&stats.cpu_stats, history),
        network: calculate_network(&stats.networks),
    }
}

fn is_terminal_stats_error(e: &crate::error::EngineError) -> bool {
    e.is_not_found() || e.is_not_modified() || e.is_conflict()
}

/// Per-handle translator from engine raw stats frames into
/// [`ResourceUsage`], with bounded-backoff reconnect (spec §4.4).
pub struct StatsPump {
    engine: Arc<dyn EngineClient>,
    container_name: String,
    /// Exposed for tests/metrics: counts reconnect attempts.
    reconnects: AtomicU64,
}

impl StatsPump {
    pub fn new(engine: Arc<dyn EngineClient>, container_name: String) -> Arc<Self> {
        Arc::new(Self {
            engine,
            container_name,
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// `Stats(ctx, interval)`: spawns the pump and returns a channel of
    /// samples at `interval` cadence. Closed on `done` close or `cancel`.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        done: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ResourceUsage> {
        let (tx, rx) = mpsc::channel(1);
        let this = self.clone();
        tokio::spawn(async move {
            this.run(interval, done, cancel, tx).await;
        });
        rx
    }

    async fn run(
        &self,
        interval: Duration,
        mut done: watch::Receiver<bool>,
        cancel: CancellationToken,
        tx: mpsc::Sender<ResourceUsage>,
    ) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(BASELINE_BACKOFF)
            .with_multiplier(2.0)
            .with_max_interval(MAX_BACKOFF)
            .with_max_elapsed_time(None)
            .build();

        loop {
            if *done.borrow() || cancel.is_cancelled() {
                return;
            }

            let stream = match self.engine.stats(&self.container_name).await {
                Ok(s) => s,
                Err(e) => {
                    if is_terminal_stats_error(&e) {
                        debug!(container = %self.container_name, "container gone, stopping stats pump");
                        return;
                    }
                    warn!(container = %self.container_name, error = %e, "failed to open stats stream");
                    if !self.sleep_backoff(&mut backoff, &mut done, &cancel).await {
                        return;
                    }
                    continue;
                }
            };

            if self
                .drain_stream(stream, interval, &mut done, &cancel, &tx)
                .await
            {
                return;
            }

            if !self.sleep_backoff(&mut backoff, &mut done, &cancel).await {
                return;
            }
        }
    }

    /// Returns `true` when the pump should stop entirely (done/cancelled or
    /// a terminal error), `false` when it should reconnect.
    async fn drain_stream(
        &self,
        mut stream: futures_util::stream::BoxStream<'static, crate::error::EngineResult<BollardStats>>,
        interval: Duration,
        done: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<ResourceUsage>,
    ) -> bool {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut history = CpuHistory::default();
        let mut latest: Option<ResourceUsage> = None;

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(s)) => {
                            latest = Some(build_usage(&s, &mut history));
                        }
                        Some(Err(e)) => {
                            if is_terminal_stats_error(&e) {
                                debug!(container = %self.container_name, "stats stream ended (container stopped)");
                                return true;
                            }
                            warn!(container = %self.container_name, error = %e, "stats stream error, reconnecting");
                            return false;
                        }
                        None => return false,
                    }
                }
                _ = ticker.tick() => {
                    if let Some(sample) = latest.take() {
                        let _ = tx.try_send(sample);
                    }
                }
                _ = done.changed() => {
                    if *done.borrow() {
                        return true;
                    }
                }
                _ = cancel.cancelled() => return true,
            }
        }
    }

    /// Sleeps for the next backoff interval; returns `false` if the pump
    /// should give up instead (done/cancelled while sleeping).
    async fn sleep_backoff(
        &self,
        backoff: &mut backoff::ExponentialBackoff,
        done: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> bool {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let delay = backoff.next_backoff().unwrap_or(MAX_BACKOFF);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = done.changed() => !*done.borrow(),
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_linux_path_reads_cgroup_fields() {
        let mut stats = MemoryStats::default();
        stats.usage = Some(100_000_000);
        stats.max_usage = Some(150_000_000);
        let mem = calculate_memory(&stats);
        assert_eq!(mem.usage, 100_000_000);
        assert_eq!(mem.max_usage, 150_000_000);
    }

    #[test]
    fn memory_windows_path_maps_private_working_set() {
        let mut stats = MemoryStats::default();
        stats.private_working_set = Some(42);
        stats.commit = Some(50);
        stats.commit_peak = Some(60);
        let mem = calculate_memory(&stats);
        assert_eq!(mem.rss, 42);
        assert_eq!(mem.usage, 50);
        assert_eq!(mem.max_usage, 60);
    }

    #[test]
    fn cpu_first_sample_yields_zero_percent() {
        let mut stats = CPUStats::default();
        stats.cpu_usage.total_usage = 200_000_000;
        stats.system_cpu_usage = Some(1_000_000_000);
        stats.online_cpus = Some(4);
        let mut history = CpuHistory::default();
        let cpu = calculate_cpu(&stats, &mut history);
        assert_eq!(cpu.percent_total, 0.0);
    }

    #[test]
    fn cpu_second_sample_computes_percent_from_deltas() {
        let mut history = CpuHistory {
            total: Some(100_000_000),
            system: Some(500_000_000),
            kernel: Some(20_000_000),
            user: Some(80_000_000),
        };
        let mut stats = CPUStats::default();
        stats.cpu_usage.total_usage = 200_000_000;
        stats.cpu_usage.usage_in_kernelmode = 40_000_000;
        stats.cpu_usage.usage_in_usermode = 160_000_000;
        stats.system_cpu_usage = Some(1_000_000_000);
        stats.online_cpus = Some(4);

        let cpu = calculate_cpu(&stats, &mut history);
        // (100M / 500M) * 4 * 100 = 80%
        assert!((cpu.percent_total - 80.0).abs() < 0.1);
    }

    #[test]
    fn network_sums_across_interfaces() {
        let mut nets = HashMap::new();
        let mut eth0 = bollard::container::NetworkStats::default();
        eth0.rx_bytes = 1000;
        eth0.tx_bytes = 2000;
        nets.insert("eth0".to_string(), eth0);
        let usage = calculate_network(&Some(nets));
        assert_eq!(usage.rx_bytes, 1000);
        assert_eq!(usage.tx_bytes, 2000);
    }

    #[tokio::test]
    async fn stops_cleanly_when_cancelled() {
        use crate::engine::mock::MockEngine;
        let engine = MockEngine::new();
        let pump = StatsPump::new(engine, "c1".to_string());
        let (_done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rx = pump.start(Duration::from_millis(10), done_rx, cancel);
        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(result.unwrap(), None);
    }
}
