//! `ExecTask` (spec §4.3 `Exec`, §4.1 `ExecTask`).
//!
//! Output is captured into two capped ring buffers (SPEC_FULL §B) rather
//! than an unbounded `Vec<u8>`, so a chatty one-shot exec can't grow
//! memory without bound.

use std::time::Duration;

use bollard::container::LogOutput;
use futures_util::StreamExt;

use crate::engine::EngineClient;
use crate::error::{DriverError, DriverResult, EngineError};

const RING_BUFFER_CAP: usize = 32 * 1024;

/// Fixed-capacity byte ring buffer: once full, the oldest bytes are
/// discarded to make room for new ones.
#[derive(Debug, Default)]
pub struct RingBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(4096)),
            cap,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.cap {
            let drop = self.buf.len() - self.cap;
            self.buf.drain(0..drop);
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_str_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[derive(Debug)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Create an exec object, attach, demultiplex stdout/stderr into capped
/// buffers, await completion, and inspect for exit code.
pub async fn exec_task(
    engine: &dyn EngineClient,
    container_name: &str,
    argv: Vec<String>,
    timeout: Duration,
) -> DriverResult<ExecResult> {
    let exec_id = engine
        .create_exec(container_name, argv)
        .await
        .map_err(DriverError::Engine)?;

    let mut stdout = RingBuffer::new(RING_BUFFER_CAP);
    let mut stderr = RingBuffer::new(RING_BUFFER_CAP);

    let run = async {
        let mut stream = engine.start_exec(&exec_id).await.map_err(DriverError::Engine)?;
        while let Some(item) = stream.next().await {
            match item.map_err(DriverError::Engine)? {
                LogOutput::StdOut { message } => stdout.push(&message),
                LogOutput::StdErr { message } => stderr.push(&message),
                LogOutput::Console { message } => stdout.push(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok::<(), DriverError>(())
    };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(DriverError::Engine(EngineError::Timeout)),
    }

    let exit_code = engine
        .inspect_exec(&exec_id)
        .await
        .map_err(DriverError::Engine)?
        .unwrap_or(-1);

    Ok(ExecResult {
        stdout: stdout.as_str_lossy(),
        stderr: stderr.as_str_lossy(),
        exit_code,
    })
}
