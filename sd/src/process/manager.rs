//! Process Manager
//!
//! Owns the OS lifetime of assistant CLI children: spawn with prompt on
//! stdin, capture output, enforce the wall-clock deadline, escalate
//! SIGTERM -> SIGKILL on cancellation, and reclaim zombies left behind by a
//! previous daemon incarnation at startup.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{JobStatus, LlmJob};
use crate::error::{ErrorCode, JobError, JobFailure};
use crate::events::{JobEvent, ProgressBus};
use crate::store::JobStore;

/// Grace period between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Poll interval for wait_all
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// How an assistant child finished
#[derive(Debug)]
pub enum ProcessOutcome {
    /// Exited zero
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// Exited non-zero (or was signalled outside our control)
    Failed {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// Terminated through our cancel path
    Cancelled,
    /// Deadline expired; the child was terminated
    TimedOut,
}

struct ProcEntry {
    pid: u32,
    started_at: Instant,
    cancel_requested: Arc<AtomicBool>,
}

/// Counters from a startup reclamation pass
#[derive(Debug, Default, PartialEq)]
pub struct ReclaimStats {
    /// Records whose pid was already dead
    pub reaped: usize,
    /// Live children of this very process, handles re-registered
    pub reregistered: usize,
    /// Live children of a previous daemon, terminated
    pub terminated: usize,
}

/// Spawns and supervises assistant CLI children
pub struct ProcessManager {
    command: String,
    base_args: Vec<String>,
    table: Mutex<HashMap<String, ProcEntry>>,
}

impl ProcessManager {
    pub fn new(command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            base_args,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live children
    pub async fn active_count(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Pid of the child running `job_id`, if any
    pub async fn pid_of(&self, job_id: &str) -> Option<u32> {
        self.table.lock().await.get(job_id).map(|e| e.pid)
    }

    fn build_command(&self, job: &LlmJob) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.base_args);
        if let Some(model) = &job.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_tokens) = job.max_tokens {
            cmd.arg("--max-tokens").arg(max_tokens.to_string());
        }
        if let Some(system_prompt) = &job.system_prompt {
            cmd.arg("--system").arg(system_prompt);
        }
        if let Some(dir) = &job.working_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the job's child to completion
    ///
    /// The prompt is fed on stdin. The future resolves when the child exits,
    /// the deadline fires, or cancellation lands; the table entry lives for
    /// exactly the duration of this call (plus re-registered zombies).
    /// `on_spawn` receives the pid so the caller can persist it before the
    /// child runs for long.
    pub async fn execute<F>(&self, job: &LlmJob, on_spawn: F) -> Result<ProcessOutcome, JobError>
    where
        F: FnOnce(u32),
    {
        let job_id = job.meta.id.as_str().to_string();
        let mut cmd = self.build_command(job);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                JobError::user(
                    ErrorCode::CliUnavailable,
                    format!("assistant executable '{}' not found", self.command),
                )
            } else {
                JobError::transient(ErrorCode::SpawnFailed, e.to_string())
            }
        })?;

        let Some(pid) = child.id() else {
            return Err(JobError::transient(
                ErrorCode::SpawnFailed,
                "child exited before a pid was observed",
            ));
        };

        let cancel_requested = Arc::new(AtomicBool::new(false));
        {
            let mut table = self.table.lock().await;
            table.insert(
                job_id.clone(),
                ProcEntry {
                    pid,
                    started_at: Instant::now(),
                    cancel_requested: cancel_requested.clone(),
                },
            );
        }
        on_spawn(pid);
        debug!(%job_id, pid, "spawned assistant child");

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(job.prompt.as_bytes()).await {
                warn!(%job_id, pid, error = %e, "failed writing prompt to child stdin");
            }
            // Closing stdin signals end of prompt
            drop(stdin);
        }

        let deadline = Duration::from_millis(job.timeout_ms);
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let outcome = tokio::select! {
            result = &mut wait => {
                match result {
                    Ok(output) => {
                        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                        let exit_code = output.status.code().unwrap_or(-1);
                        if cancel_requested.load(Ordering::Relaxed) {
                            ProcessOutcome::Cancelled
                        } else if exit_code == 0 {
                            ProcessOutcome::Completed { stdout, stderr, exit_code }
                        } else {
                            ProcessOutcome::Failed { stdout, stderr, exit_code }
                        }
                    }
                    Err(e) => {
                        self.table.lock().await.remove(&job_id);
                        return Err(JobError::transient(ErrorCode::SpawnFailed, e.to_string()));
                    }
                }
            }
            _ = tokio::time::sleep(deadline) => {
                info!(%job_id, pid, timeout_ms = job.timeout_ms, "deadline fired, terminating child");
                signal_pid(pid, Signal::SIGTERM);
                if tokio::time::timeout(KILL_GRACE, &mut wait).await.is_err() {
                    signal_pid(pid, Signal::SIGKILL);
                    let _ = wait.await;
                }
                ProcessOutcome::TimedOut
            }
        };

        self.table.lock().await.remove(&job_id);
        Ok(outcome)
    }

    /// Cancel a running job's child
    ///
    /// SIGTERM first; if the child has not exited within the grace period,
    /// SIGKILL. Returns true iff a live child was found.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let pid = {
            let table = self.table.lock().await;
            match table.get(job_id) {
                Some(entry) => {
                    entry.cancel_requested.store(true, Ordering::Relaxed);
                    entry.pid
                }
                None => return false,
            }
        };

        info!(%job_id, pid, "cancelling assistant child");
        signal_pid(pid, Signal::SIGTERM);

        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            if !pid_alive(pid) {
                return true;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        warn!(%job_id, pid, "child ignored SIGTERM, escalating to SIGKILL");
        signal_pid(pid, Signal::SIGKILL);
        true
    }

    /// Shutdown barrier: wait for all children to exit, up to `timeout`
    ///
    /// Returns true if the table drained in time.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.table.lock().await.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                let remaining = self.table.lock().await.len();
                warn!(remaining, "shutdown timeout with children still running");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Startup reclamation of children persisted by a previous run
    ///
    /// Safe to run on any startup: dead pids produce `cancelled` terminal
    /// states; live pids re-register only when this very process owns them
    /// (pid guard), otherwise the orphan is terminated since its pipes died
    /// with the old daemon. An alive, correctly-owned process is never
    /// marked zombie.
    pub async fn reclaim_zombies(&self, store: &JobStore, bus: &ProgressBus) -> Result<ReclaimStats, JobError> {
        let mut stats = ReclaimStats::default();
        let own_pid = std::process::id();

        for mut job in store.llm_jobs_with_pids().await? {
            let job_id = job.meta.id.clone();
            let Some(pid) = job.pid else { continue };

            if pid_alive(pid) {
                if job.owner_pid == Some(own_pid) {
                    let mut table = self.table.lock().await;
                    table.entry(job_id.as_str().to_string()).or_insert(ProcEntry {
                        pid,
                        started_at: Instant::now(),
                        cancel_requested: Arc::new(AtomicBool::new(false)),
                    });
                    stats.reregistered += 1;
                    debug!(id = %job_id, pid, "re-registered live child");
                    continue;
                }

                info!(id = %job_id, pid, "terminating orphan from previous daemon");
                signal_pid(pid, Signal::SIGTERM);
                tokio::time::sleep(KILL_GRACE).await;
                if pid_alive(pid) {
                    signal_pid(pid, Signal::SIGKILL);
                }
                stats.terminated += 1;
            } else {
                debug!(id = %job_id, pid, "reaping record of dead child");
                stats.reaped += 1;
            }

            job.pid = None;
            if job.meta.set_status(JobStatus::Cancelled) {
                job.error = Some(JobFailure::new(
                    ErrorCode::SpawnFailed,
                    "daemon restarted while the job was running",
                ));
                store.put_llm(&job).await?;
                bus.emit(
                    job_id.as_str(),
                    JobEvent::failed(JobStatus::Cancelled, job.error.clone().unwrap_or_else(|| {
                        JobFailure::new(ErrorCode::SpawnFailed, "reclaimed")
                    })),
                );
            }
        }

        info!(?stats, "zombie reclamation finished");
        Ok(stats)
    }
}

fn signal_pid(pid: u32, signal: Signal) {
    // ESRCH means the process is already gone, which is fine
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, %signal, error = %e, "failed to signal child");
        }
    }
}

/// Probe liveness with a null signal
fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
