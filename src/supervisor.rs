// Copyright (C) 2025, Vivoh, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, is permitted only by Vivoh, Inc by License.
//

//! Ownership and termination of transcoder child processes.
//!
//! The supervisor keeps at most one [`ManagedProcess`] per [`Role`]. Two locks
//! are involved: `lifecycle` serialises whole start/stop sequences so that the
//! check-then-spawn in the launcher cannot race, while `table` is only held for
//! short lookups so that status polls never wait on a multi-second stop.

// ─── Standard Library ───────────────────────────────────────────────────────────
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

// ─── External Crates ────────────────────────────────────────────────────────────
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// ─── Internal Crate ─────────────────────────────────────────────────────────────
use crate::config::StopTimeouts;
use crate::VsrError;

const OUTPUT_TAIL_LINES: usize = 64;
const MAX_LINE_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Real-time UDP stream.
    Primary,
    /// HLS playlist and segments.
    Segmented,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Primary, Role::Segmented];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("UDP"),
            Role::Segmented => f.write_str("HLS"),
        }
    }
}

/// Last lines written by a child on one of its output streams.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: Arc<std::sync::Mutex<VecDeque<String>>>,
}

impl OutputTail {
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

// Drains a child pipe so the child never blocks on a full pipe buffer. Lines
// end at `\n` or `\r` (progress output only uses the latter) and are cut at
// MAX_LINE_BYTES.
fn spawn_tail_reader<R>(role: Role, stream: &'static str, pipe: R, tail: OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::with_capacity(MAX_LINE_BYTES);
        loop {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(%role, stream, "Pipe read error: {e}");
                    break;
                }
            };
            let consumed = chunk.len();
            for &byte in chunk {
                if byte == b'\n' || byte == b'\r' {
                    push_line(role, stream, &tail, &mut line);
                } else if line.len() < MAX_LINE_BYTES {
                    line.push(byte);
                }
            }
            reader.consume(consumed);
        }
        push_line(role, stream, &tail, &mut line);
    })
}

fn push_line(role: Role, stream: &'static str, tail: &OutputTail, line: &mut Vec<u8>) {
    let text = String::from_utf8_lossy(line).trim().to_string();
    line.clear();
    if !text.is_empty() {
        debug!(%role, stream, "{}", text);
        tail.push(text);
    }
}

/// A running transcoder child owned by the supervisor.
#[derive(Debug)]
pub struct ManagedProcess {
    role: Role,
    child: Child,
    pid: Option<u32>,
    started_at: SystemTime,
    stderr: OutputTail,
    readers: Vec<JoinHandle<()>>,
}

impl ManagedProcess {
    /// Spawn `command` with piped output, in its own process group.
    pub fn spawn(role: Role, mut command: Command) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stderr = OutputTail::default();
        let mut readers = Vec::with_capacity(2);

        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_tail_reader(role, "stderr", pipe, stderr.clone()));
        }
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_tail_reader(role, "stdout", pipe, OutputTail::default()));
        }

        info!(%role, pid = ?pid, "Spawned transcoder");

        Ok(Self {
            role,
            child,
            pid,
            started_at: SystemTime::now(),
            stderr,
            readers,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait up to `window` for the child to exit. `Ok(None)` means still alive.
    pub async fn wait_for_exit(&mut self, window: Duration) -> io::Result<Option<ExitStatus>> {
        match timeout(window, self.child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Stderr collected so far, after giving the readers `window` to hit EOF.
    pub async fn collect_stderr(&mut self, window: Duration) -> String {
        for reader in self.readers.drain(..) {
            let _ = timeout(window, reader).await;
        }
        self.stderr.snapshot()
    }

    pub fn stderr_snapshot(&self) -> String {
        self.stderr.snapshot()
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The child had exited on its own before the stop.
    AlreadyExited(ExitStatus),
    /// Exited after SIGTERM.
    Terminated(ExitStatus),
    /// Exited after SIGKILL.
    Killed(ExitStatus),
    /// The whole escalation ran without observing an exit.
    Unconfirmed,
}

/// Poll result for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Nothing tracked for the role.
    Stopped,
    Running,
    /// Tracked child has exited on its own.
    Exited { code: Option<i32>, stderr: String },
    /// The poll itself failed.
    Unknown(String),
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, group: bool, signal: nix::sys::signal::Signal) -> Result<(), String> {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    let target = Pid::from_raw(pid);
    let result = if group { killpg(target, signal) } else { kill(target, signal) };
    result.map_err(|e| e.to_string())
}

#[cfg(unix)]
fn request_graceful_exit(pid: u32) -> Result<(), String> {
    send_signal(pid, false, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> Result<(), String> {
    send_signal(pid, true, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn request_graceful_exit(_pid: u32) -> Result<(), String> {
    Err("graceful termination is not supported on this platform".into())
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> Result<(), String> {
    Err("process group kill is not supported on this platform".into())
}

/// Run the SIGTERM, SIGKILL, process-group SIGKILL escalation.
///
/// Every wait is bounded by `timeouts`; the function never blocks longer than
/// `graceful + 2 * forceful`.
pub async fn terminate(process: &mut ManagedProcess, timeouts: StopTimeouts) -> StopOutcome {
    let role = process.role;

    match process.try_wait() {
        Ok(Some(status)) => {
            info!(%role, "Transcoder had already exited: {status}");
            return StopOutcome::AlreadyExited(status);
        }
        Ok(None) => {}
        Err(e) => warn!(%role, "Could not poll transcoder before stop: {e}"),
    }

    let Some(pid) = process.pid else {
        warn!(%role, "Transcoder has no pid, relying on kill");
        return force_kill(process, timeouts).await;
    };

    info!(%role, pid, "Attempting to terminate transcoder");
    match request_graceful_exit(pid) {
        Ok(()) => match process.wait_for_exit(timeouts.graceful).await {
            Ok(Some(status)) => {
                info!(%role, pid, "Transcoder terminated gracefully: {status}");
                return StopOutcome::Terminated(status);
            }
            Ok(None) => warn!(%role, pid, "Transcoder ignored SIGTERM, sending SIGKILL"),
            Err(e) => warn!(%role, pid, "Graceful wait failed: {e}"),
        },
        Err(e) => warn!(%role, pid, "Failed to send SIGTERM: {e}"),
    }

    force_kill(process, timeouts).await
}

async fn force_kill(process: &mut ManagedProcess, timeouts: StopTimeouts) -> StopOutcome {
    let role = process.role;

    if let Err(e) = process.child.start_kill() {
        warn!(%role, "Failed to send SIGKILL: {e}");
    }
    match process.wait_for_exit(timeouts.forceful).await {
        Ok(Some(status)) => {
            info!(%role, "Transcoder killed: {status}");
            return StopOutcome::Killed(status);
        }
        Ok(None) => {}
        Err(e) => warn!(%role, "Wait after SIGKILL failed: {e}"),
    }

    if let Some(pid) = process.pid {
        warn!(%role, pid, "Transcoder survived SIGKILL, killing its process group");
        if let Err(e) = kill_process_group(pid) {
            warn!(%role, pid, "Process group kill failed: {e}");
        }
        if let Ok(Some(status)) = process.wait_for_exit(timeouts.forceful).await {
            return StopOutcome::Killed(status);
        }
    }

    warn!(%role, pid = ?process.pid, "Transcoder may still be running after kill attempts");
    StopOutcome::Unconfirmed
}

/// Remove `dir` and everything below it. A missing directory is not an error.
pub async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    table: Mutex<HashMap<Role, ManagedProcess>>,
    lifecycle: Mutex<()>,
    timeouts: StopTimeouts,
    segment_dir: Option<PathBuf>,
}

impl ProcessSupervisor {
    pub fn new(timeouts: StopTimeouts, segment_dir: Option<PathBuf>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            timeouts,
            segment_dir,
        }
    }

    pub fn timeouts(&self) -> StopTimeouts {
        self.timeouts
    }

    /// Exclusive hold over start/stop sequences.
    pub(crate) async fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Whether `role` can be started. A tracked child that already exited on
    /// its own is reaped here and the role reported free.
    pub(crate) async fn vacate_if_exited(&self, role: Role) -> bool {
        let mut table = self.table.lock().await;
        let Some(process) = table.get_mut(&role) else {
            return true;
        };
        match process.try_wait() {
            Ok(Some(status)) => {
                info!(%role, "Reaping transcoder that exited earlier: {status}");
                table.remove(&role);
                true
            }
            _ => false,
        }
    }

    /// Track a launched child. Callers hold the lifecycle guard and have
    /// checked the role is free.
    pub(crate) async fn register(&self, process: ManagedProcess) {
        let role = process.role;
        let previous = self.table.lock().await.insert(role, process);
        if previous.is_some() {
            warn!(%role, "Replaced a tracked transcoder while registering");
        }
    }

    pub async fn is_tracked(&self, role: Role) -> bool {
        self.table.lock().await.contains_key(&role)
    }

    pub async fn tracked_roles(&self) -> Vec<Role> {
        let table = self.table.lock().await;
        Role::ALL.into_iter().filter(|r| table.contains_key(r)).collect()
    }

    pub async fn pid(&self, role: Role) -> Option<u32> {
        self.table.lock().await.get(&role).and_then(|p| p.pid())
    }

    /// Stop the child in `role`. The entry is cleared however the escalation ends.
    pub async fn stop(&self, role: Role) -> Result<StopOutcome, VsrError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_tracked(role).await
    }

    async fn stop_tracked(&self, role: Role) -> Result<StopOutcome, VsrError> {
        let process = self.table.lock().await.remove(&role);
        let Some(mut process) = process else {
            return Err(VsrError::NotRunning(role));
        };
        Ok(terminate(&mut process, self.timeouts).await)
    }

    /// Stop every tracked role, then remove the segment directory best-effort.
    pub async fn stop_all(&self) -> Vec<(Role, StopOutcome)> {
        let _guard = self.lifecycle.lock().await;
        let mut stopped = Vec::new();

        for role in Role::ALL {
            match self.stop_tracked(role).await {
                Ok(outcome) => stopped.push((role, outcome)),
                Err(VsrError::NotRunning(_)) => {}
                Err(e) => warn!(%role, "Stop failed: {e}"),
            }
        }

        if let Some(dir) = &self.segment_dir {
            if let Err(e) = remove_dir_if_exists(dir).await {
                warn!("Failed to clean segment directory {}: {e}", dir.display());
            }
        }

        stopped
    }

    /// Non-blocking liveness poll.
    pub async fn status(&self, role: Role) -> ProcessStatus {
        let mut table = self.table.lock().await;
        let Some(process) = table.get_mut(&role) else {
            return ProcessStatus::Stopped;
        };
        match process.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited {
                code: status.code(),
                stderr: process.stderr_snapshot(),
            },
            Err(e) => ProcessStatus::Unknown(e.to_string()),
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(StopTimeouts::default(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let tail = OutputTail::default();
        for i in 0..(OUTPUT_TAIL_LINES + 10) {
            tail.push(format!("line {i}"));
        }
        let snapshot = tail.snapshot();
        assert!(!snapshot.contains("line 9\n"));
        assert!(snapshot.starts_with("line 10"));
        assert!(snapshot.ends_with(&format!("line {}", OUTPUT_TAIL_LINES + 9)));
    }

    #[tokio::test]
    async fn tail_reader_splits_carriage_returns_and_caps_lines() {
        let mut output = Vec::new();
        for i in 0..5000 {
            output.extend_from_slice(format!("frame={i} fps=24 speed=1x \r").as_bytes());
        }
        output.extend_from_slice(&vec![b'x'; MAX_LINE_BYTES * 4]);
        output.extend_from_slice(b"\nconversion failed\n");
        let output: &'static [u8] = Box::leak(output.into_boxed_slice());

        let tail = OutputTail::default();
        spawn_tail_reader(Role::Primary, "stderr", output, tail.clone())
            .await
            .unwrap();

        let snapshot = tail.snapshot();
        let lines: Vec<&str> = snapshot.lines().collect();
        assert_eq!(lines.len(), OUTPUT_TAIL_LINES);
        assert_eq!(lines[OUTPUT_TAIL_LINES - 1], "conversion failed");
        assert_eq!(lines[OUTPUT_TAIL_LINES - 2].len(), MAX_LINE_BYTES);
        assert_eq!(lines[OUTPUT_TAIL_LINES - 3], "frame=4999 fps=24 speed=1x");
    }

    #[tokio::test]
    async fn stop_on_empty_table_is_not_running() {
        let supervisor = ProcessSupervisor::default();
        match supervisor.stop(Role::Primary).await {
            Err(VsrError::NotRunning(Role::Primary)) => {}
            other => panic!("unexpected stop result: {other:?}"),
        }
        assert_eq!(supervisor.status(Role::Primary).await, ProcessStatus::Stopped);
        assert!(supervisor.stop_all().await.is_empty());
    }

    #[tokio::test]
    async fn stop_all_removes_segment_dir() {
        let dir = tempfile::tempdir().unwrap();
        let segments = dir.path().join("hls");
        std::fs::create_dir_all(&segments).unwrap();
        std::fs::write(segments.join("segment_00001.ts"), b"x").unwrap();

        let supervisor = ProcessSupervisor::new(StopTimeouts::default(), Some(segments.clone()));
        supervisor.stop_all().await;
        assert!(!segments.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_running_child() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut process = ManagedProcess::spawn(Role::Primary, command).unwrap();
        assert_eq!(process.wait_for_exit(Duration::from_millis(100)).await.unwrap(), None);

        let outcome = terminate(&mut process, StopTimeouts::default()).await;
        assert!(matches!(outcome, StopOutcome::Terminated(_)), "{outcome:?}");
    }
}
