//! Supervision of long-lived background processes (dev servers, workers).
//!
//! Each process runs through `sh -c` in its own process group so the whole
//! subtree can be signalled. Two reader tasks drain stdout and stderr into
//! fixed-size ring buffers, and a waiter task owns the child and publishes its
//! exit through a watch channel. The registry and each buffer sit behind
//! mutexes that are never held across an await.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::command_policy::{DeniedCommand, check_command};
use crate::core::ring_buffer::RingBuffer;
use crate::io::process::{Signal, signal_group};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Denied(#[from] DeniedCommand),
    #[error("spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited immediately ({status})\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}")]
    StartFailed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
    #[error("unknown process handle {0}")]
    UnknownHandle(String),
    #[error("{url} not ready after {attempts} attempts: {last}")]
    NotReady {
        url: String,
        attempts: u32,
        last: String,
    },
}

#[derive(Debug, Clone)]
pub struct ProcessManagerOptions {
    pub buffer_lines: usize,
    /// A process exiting inside this window counts as a failed start.
    pub startup_window: Duration,
    pub stop_grace: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ProcessManagerOptions {
    fn default() -> Self {
        Self {
            buffer_lines: 1000,
            startup_window: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// How a managed process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub error: Option<String>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.error, self.code) {
            (Some(error), _) => write!(f, "wait failed: {error}"),
            (None, Some(code)) => write!(f, "exit code {code}"),
            (None, None) => f.write_str("killed by signal"),
        }
    }
}

struct ManagedProcess {
    command: String,
    pgid: u32,
    started: Instant,
    stdout: Arc<Mutex<RingBuffer>>,
    stderr: Arc<Mutex<RingBuffer>>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ManagedProcess {
    fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSummary {
    pub handle: String,
    pub command: String,
    pub pid: u32,
    pub uptime: Duration,
    pub exit: Option<ExitInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub handle: String,
    pub exit: Option<ExitInfo>,
    /// True when the grace period lapsed and the group was killed.
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyReport {
    pub status: u16,
    pub attempts: u32,
}

pub struct ProcessManager {
    cwd: PathBuf,
    options: ProcessManagerOptions,
    processes: Mutex<HashMap<String, ManagedProcess>>,
    next_id: AtomicU64,
    http: reqwest::Client,
}

impl ProcessManager {
    pub fn new(cwd: impl Into<PathBuf>, options: ProcessManagerOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build readiness http client")?;
        Ok(Self {
            cwd: cwd.into(),
            options,
            processes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            http,
        })
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, ManagedProcess>> {
        self.processes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start `command` in the background and return its handle.
    #[instrument(skip_all, fields(command = %command))]
    pub async fn start(
        &self,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<String, ProcessError> {
        check_command(command)?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            .envs(env)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.to_string(),
                source,
            })?;
        let pgid = child.id().unwrap_or_default();

        let stdout = Arc::new(Mutex::new(RingBuffer::new(self.options.buffer_lines)));
        let stderr = Arc::new(Mutex::new(RingBuffer::new(self.options.buffer_lines)));
        let readers = [
            child
                .stdout
                .take()
                .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout))),
            child
                .stderr
                .take()
                .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr))),
        ];

        let (exit_tx, mut exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    error: None,
                },
                Err(err) => ExitInfo {
                    code: None,
                    error: Some(err.to_string()),
                },
            };
            let _ = exit_tx.send(Some(info));
        });

        let early_exit = match tokio::time::timeout(
            self.options.startup_window,
            exit_rx.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(exit)) => Some(exit.clone()),
            _ => None,
        };
        if let Some(exit) = early_exit {
            let status = exit.as_ref().map(ToString::to_string).unwrap_or_default();
            for reader in readers.into_iter().flatten() {
                let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
            }
            warn!(%status, "background process exited during startup");
            return Err(ProcessError::StartFailed {
                command: command.to_string(),
                status,
                stdout: tail(&stdout, 50),
                stderr: tail(&stderr, 50),
            });
        }

        let handle = format!("bg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        info!(%handle, pgid, "background process started");
        self.registry().insert(
            handle.clone(),
            ManagedProcess {
                command: command.to_string(),
                pgid,
                started: Instant::now(),
                stdout,
                stderr,
                exit: exit_rx,
            },
        );
        Ok(handle)
    }

    /// Gracefully stop one process, escalating to a kill after the grace period.
    #[instrument(skip(self))]
    pub async fn stop(&self, handle: &str) -> Result<StopReport, ProcessError> {
        let process = self
            .registry()
            .remove(handle)
            .ok_or_else(|| ProcessError::UnknownHandle(handle.to_string()))?;
        let (exit, forced) = terminate(&process, self.options.stop_grace).await;
        info!(forced, "background process stopped");
        Ok(StopReport {
            handle: handle.to_string(),
            exit,
            forced,
        })
    }

    /// Last `lines` lines of each stream.
    pub fn logs(&self, handle: &str, lines: usize) -> Result<String, ProcessError> {
        let registry = self.registry();
        let process = registry
            .get(handle)
            .ok_or_else(|| ProcessError::UnknownHandle(handle.to_string()))?;
        let mut out = match process.exit_info() {
            Some(exit) => format!("{handle} ({}): {exit}\n", process.command),
            None => format!("{handle} ({}): running\n", process.command),
        };
        out.push_str("--- stdout ---\n");
        out.push_str(&tail(&process.stdout, lines));
        out.push_str("\n--- stderr ---\n");
        out.push_str(&tail(&process.stderr, lines));
        Ok(out)
    }

    pub fn list(&self) -> Vec<ProcessSummary> {
        let mut summaries: Vec<ProcessSummary> = self
            .registry()
            .iter()
            .map(|(handle, process)| ProcessSummary {
                handle: handle.clone(),
                command: process.command.clone(),
                pid: process.pgid,
                uptime: process.started.elapsed(),
                exit: process.exit_info(),
            })
            .collect();
        summaries.sort_by(|a, b| a.handle.cmp(&b.handle));
        summaries
    }

    /// Poll `url` every `interval` until it answers 2xx/3xx or `timeout` elapses.
    #[instrument(skip(self))]
    pub async fn wait_for_ready(
        &self,
        url: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<ReadyReport, ProcessError> {
        let deadline = Instant::now() + timeout;
        let per_request = interval.max(Duration::from_secs(2));
        let mut attempts = 0u32;
        let mut last = String::from("no response");
        loop {
            attempts += 1;
            match self.http.get(url).timeout(per_request).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status.is_redirection() {
                        debug!(attempts, status = status.as_u16(), "endpoint ready");
                        return Ok(ReadyReport {
                            status: status.as_u16(),
                            attempts,
                        });
                    }
                    last = format!("HTTP {}", status.as_u16());
                }
                Err(err) => last = err.to_string(),
            }
            if Instant::now() + interval >= deadline {
                break;
            }
            tokio::time::sleep(interval).await;
        }
        Err(ProcessError::NotReady {
            url: url.to_string(),
            attempts,
            last,
        })
    }

    /// Stop every remaining process with the shorter shutdown grace.
    pub async fn shutdown(&self) {
        let processes: Vec<(String, ManagedProcess)> = self.registry().drain().collect();
        if processes.is_empty() {
            return;
        }
        info!(count = processes.len(), "shutting down background processes");
        let grace = self.options.shutdown_grace;
        futures::future::join_all(processes.iter().map(|(handle, process)| async move {
            let (_, forced) = terminate(process, grace).await;
            debug!(%handle, forced, "background process torn down");
        }))
        .await;
    }
}

fn spawn_reader<R>(pipe: R, buffer: Arc<Mutex<RingBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    buffer
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push_line(line);
                }
                Err(err) => {
                    debug!(err = %err, "log reader stopped");
                    break;
                }
            }
        }
    })
}

fn tail(buffer: &Arc<Mutex<RingBuffer>>, lines: usize) -> String {
    buffer
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .last(lines)
        .join("\n")
}

async fn send_signal(pgid: u32, signal: Signal) -> Result<()> {
    tokio::task::spawn_blocking(move || signal_group(pgid, signal))
        .await
        .map_err(|err| anyhow!("join signal task: {err}"))?
}

/// TERM the group, wait `grace`, then KILL. Returns the exit and whether it was forced.
async fn terminate(process: &ManagedProcess, grace: Duration) -> (Option<ExitInfo>, bool) {
    let mut exit = process.exit.clone();
    let current = exit.borrow().clone();
    if current.is_some() {
        return (current, false);
    }
    if let Err(err) = send_signal(process.pgid, Signal::Term).await {
        warn!(err = %err, pgid = process.pgid, "TERM failed");
    }
    let graceful = match tokio::time::timeout(grace, exit.wait_for(Option::is_some)).await {
        Ok(Ok(info)) => Some(info.clone()),
        _ => None,
    };
    if let Some(info) = graceful {
        return (info, false);
    }
    warn!(pgid = process.pgid, "grace period lapsed, killing process group");
    if let Err(err) = send_signal(process.pgid, Signal::Kill).await {
        warn!(err = %err, pgid = process.pgid, "KILL failed");
    }
    let info = match tokio::time::timeout(Duration::from_secs(1), exit.wait_for(Option::is_some))
        .await
    {
        Ok(Ok(info)) => info.clone(),
        _ => None,
    };
    (info, true)
}
