//! Subprocess worker host.
//!
//! Spawns a child process and talks newline-delimited JSON: one
//! `BatchRequest` per line on stdin, one `BatchResponse` per line on stdout.
//! stderr is inherited so the child's own logs reach the terminal.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::host::{BatchRequest, BatchResponse, HostFactory, ResultSink, WorkerHost};

/// Builds `ProcessHost`s from a fixed command line.
pub struct ProcessHostFactory {
    program: String,
    args: Vec<String>,
}

impl ProcessHostFactory {
    /// `command[0]` is the program, the rest are its arguments.
    pub fn new(command: &[String]) -> Result<Self, HostError> {
        let (program, args) = command.split_first().ok_or_else(|| HostError::StartupFailed {
            reason: "empty host command".to_string(),
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl HostFactory for ProcessHostFactory {
    async fn create(&self, sink: Arc<dyn ResultSink>) -> Result<Arc<dyn WorkerHost>, HostError> {
        Ok(Arc::new(ProcessHost::spawn(&self.program, &self.args, sink)?))
    }
}

/// A worker host running as a child process.
pub struct ProcessHost {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    reader: JoinHandle<()>,
}

impl ProcessHost {
    /// Start `program` and begin forwarding its stdout lines to `sink`.
    pub fn spawn(
        program: &str,
        args: &[String],
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, HostError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::StartupFailed {
                reason: format!("failed to spawn {program}: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| HostError::StartupFailed {
            reason: "child stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| HostError::StartupFailed {
            reason: "child stdout not captured".to_string(),
        })?;

        info!(program, pid = ?child.id(), "Spawned worker host process");

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<BatchResponse>(line) {
                            Ok(response) => sink.deliver(response),
                            Err(e) => warn!("Discarding malformed host output: {}", e),
                        }
                    }
                    Ok(None) => {
                        debug!("Worker host stdout closed");
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading worker host stdout: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            name: program.to_string(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            reader,
        })
    }

    /// OS pid of the child, `None` once closed.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl WorkerHost for ProcessHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: BatchRequest) -> Result<(), HostError> {
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(HostError::Closed)?;
        pipe.write_all(&line)
            .await
            .map_err(|e| HostError::Unreachable {
                reason: format!("write to host stdin: {e}"),
            })?;
        pipe.flush().await.map_err(|e| HostError::Unreachable {
            reason: format!("flush host stdin: {e}"),
        })?;
        Ok(())
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take()
            && let Err(e) = child.kill().await
        {
            warn!(host = %self.name, "Failed to kill worker host: {}", e);
        }
        self.reader.abort();
    }
}
