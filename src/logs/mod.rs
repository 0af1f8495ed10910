//! Log Shipper (C6, spec §4.5).
//!
//! Grounded on the teacher's `environment/docker/power.rs::attach_container`
//! spawn-an-output-task shape, adapted from "broadcast to the event bus" to
//! "demultiplex into two named sinks" with reconnect and a post-exit grace
//! period.

use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use bollard::container::{LogOutput, LogsOptions};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::EngineClient;
use crate::error::EngineError;

const MAX_BACKOFF: Duration = Duration::from_secs(120);
const BASELINE_BACKOFF: Duration = Duration::from_millis(500);

pub type Sink = Box<dyn AsyncWrite + Unpin + Send>;

pub struct LogShipperOptions {
    pub container_name: String,
    pub tty: bool,
    pub start_unix_time: i64,
    pub grace_period: Duration,
}

/// Terminal log errors per spec §4.10: "driver does not support reading",
/// "not implemented" end streaming instead of triggering reconnect.
fn is_terminal_log_error(e: &EngineError) -> bool {
    if e.is_not_found() {
        return true;
    }
    let msg = e.to_string();
    msg.contains("driver does not support reading") || msg.contains("not implemented")
}

pub struct LogShipper {
    engine: Arc<dyn EngineClient>,
}

impl LogShipper {
    pub fn new(engine: Arc<dyn EngineClient>) -> Arc<Self> {
        Arc::new(Self { engine })
    }

    /// `Start(opts)`: begins following the container's log stream from
    /// `start_unix_time`, demultiplexing into `stdout_sink`/`stderr_sink`.
    /// Returns a join handle; `Stop()` is `cancel.cancel()` followed by
    /// awaiting the handle.
    pub fn start(
        self: &Arc<Self>,
        opts: LogShipperOptions,
        stdout_sink: Sink,
        stderr_sink: Sink,
        done: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run(opts, stdout_sink, stderr_sink, done, cancel).await;
        })
    }

    async fn run(
        &self,
        opts: LogShipperOptions,
        mut stdout_sink: Sink,
        mut stderr_sink: Sink,
        mut done: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(BASELINE_BACKOFF)
            .with_multiplier(2.0)
            .with_max_interval(MAX_BACKOFF)
            .with_max_elapsed_time(None)
            .build();

        let mut since = opts.start_unix_time;
        let mut ever_read = false;
        let mut exited_at: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            if *done.borrow() && exited_at.is_none() {
                exited_at = Some(Instant::now());
            }
            if let Some(exit_time) = exited_at {
                if !ever_read && exit_time.elapsed() > opts.grace_period {
                    debug!(container = %opts.container_name, "log shipper giving up after grace period");
                    return;
                }
            }

            let log_opts = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                since,
                timestamps: false,
                ..Default::default()
            };

            match self.engine.logs(&opts.container_name, log_opts).await {
                Ok(stream) => {
                    backoff.reset();
                    let outcome = self
                        .demux(
                            stream,
                            &mut stdout_sink,
                            &mut stderr_sink,
                            &mut ever_read,
                            &mut done,
                            &cancel,
                        )
                        .await;
                    match outcome {
                        DemuxOutcome::Stop => return,
                        DemuxOutcome::Reconnect => {}
                    }
                }
                Err(e) => {
                    if is_terminal_log_error(&e) {
                        debug!(container = %opts.container_name, "log stream ended, not reconnecting");
                        return;
                    }
                    warn!(container = %opts.container_name, error = %e, "failed to open log stream");
                }
            }

            // Reset `since` to now on each retry (spec §4.5).
            since = chrono::Utc::now().timestamp();

            let delay = backoff.next_backoff().unwrap_or(MAX_BACKOFF);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = done.changed() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn demux(
        &self,
        mut stream: futures_util::stream::BoxStream<'static, crate::error::EngineResult<LogOutput>>,
        stdout_sink: &mut Sink,
        stderr_sink: &mut Sink,
        ever_read: &mut bool,
        done: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> DemuxOutcome {
        loop {
            tokio::select! {
                item = stream.next() => {
                    match item {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            *ever_read = true;
                            if stdout_sink.write_all(&message).await.is_err() {
                                return DemuxOutcome::Stop;
                            }
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            *ever_read = true;
                            if stderr_sink.write_all(&message).await.is_err() {
                                return DemuxOutcome::Stop;
                            }
                        }
                        Some(Ok(LogOutput::Console { message })) => {
                            *ever_read = true;
                            if stdout_sink.write_all(&message).await.is_err() {
                                return DemuxOutcome::Stop;
                            }
                        }
                        Some(Ok(LogOutput::StdIn { .. })) => {}
                        Some(Err(e)) => {
                            if is_terminal_log_error(&e) {
                                return DemuxOutcome::Stop;
                            }
                            warn!(error = %e, "log stream error, reconnecting");
                            return DemuxOutcome::Reconnect;
                        }
                        None => return DemuxOutcome::Reconnect,
                    }
                }
                _ = done.changed() => {}
                _ = cancel.cancelled() => return DemuxOutcome::Stop,
            }
        }
    }
}

enum DemuxOutcome {
    Stop,
    Reconnect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    struct VecSink(Vec<u8>);
    impl AsyncWrite for VecSink {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<Result<usize, std::io::Error>> {
            self.get_mut().0.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), std::io::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), std::io::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn gives_up_after_grace_period_when_nothing_ever_read() {
        let engine = MockEngine::new();
        let shipper = LogShipper::new(engine);
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let opts = LogShipperOptions {
            container_name: "c1".to_string(),
            tty: false,
            start_unix_time: 0,
            grace_period: Duration::from_millis(20),
        };

        done_tx.send(true).unwrap();
        let handle = shipper.start(
            opts,
            Box::new(VecSink(Vec::new())),
            Box::new(VecSink(Vec::new())),
            done_rx,
            cancel,
        );
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stops_immediately_when_cancelled() {
        let engine = MockEngine::new();
        let shipper = LogShipper::new(engine);
        let (_done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let opts = LogShipperOptions {
            container_name: "c1".to_string(),
            tty: false,
            start_unix_time: 0,
            grace_period: Duration::from_secs(30),
        };

        let handle = shipper.start(
            opts,
            Box::new(VecSink(Vec::new())),
            Box::new(VecSink(Vec::new())),
            done_rx,
            cancel,
        );
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }
}
