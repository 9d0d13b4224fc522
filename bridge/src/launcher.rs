//! Worker process supervision.
//!
//! Spawns the worker executable with the agreed CLI, drains its stdout
//! and stderr into capture buffers, polls for readiness, and walks the
//! graceful-then-forceful shutdown ladder. The process is always reaped
//! before the captured streams are handed out, so stream reads cannot
//! race process teardown.

use crate::client::WorkerDescriptor;
use anyhow::{Context, Result as Fallible};
use commons::codec::UNSUPPORTED_PROTOCOL_MARKER;
use commons::options::encode_options;
use commons::port::{self, BIND_FAILURE_MARKER};
use commons::BridgeError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::env;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Base name of the worker executable.
pub(crate) const WORKER_EXE: &str = if cfg!(windows) { "worker.exe" } else { "worker" };

const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REAP_POLL: Duration = Duration::from_millis(20);

/// A running (or just-exited) worker process with its stream captures.
pub(crate) struct WorkerProcess {
    child: Child,
    stdout: Capture,
    stderr: Capture,
}

struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Capture {
    fn attach<R: Read + Send + 'static>(mut source: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let reader = thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Capture {
            buffer,
            reader: Some(reader),
        }
    }

    /// Wait for the pipe to drain, then take the buffer. Only called
    /// after the child has been reaped, so the reader is at EOF.
    fn join(&mut self) -> Vec<u8> {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        std::mem::take(&mut *self.buffer.lock())
    }
}

impl WorkerProcess {
    /// Spawn the worker described by `descriptor` with stdio piped into
    /// capture buffers.
    pub(crate) fn spawn(descriptor: &WorkerDescriptor) -> Fallible<WorkerProcess> {
        let exe = resolve_executable(descriptor);
        let mut command = Command::new(&exe);
        command
            .arg("--host")
            .arg(&descriptor.host)
            .arg("--port")
            .arg(descriptor.port.to_string())
            .arg("--module")
            .arg(&descriptor.module)
            .arg("--protocol")
            .arg(descriptor.protocol.to_string());
        if !descriptor.sys_path.is_empty() {
            let joined = env::join_paths(&descriptor.sys_path)
                .context("could not join the module search path for argv")?;
            command.arg("--sys-path").arg(joined);
        }
        if !descriptor.env_path.is_empty() {
            let joined = env::join_paths(&descriptor.env_path)
                .context("could not join the library search path for argv")?;
            command.arg("--env-path").arg(joined);
        }
        if !descriptor.options.is_empty() {
            command.arg("--options").arg(encode_options(&descriptor.options));
        }
        if let Ok(cwd) = env::current_dir() {
            command.env("HOST_CWD", cwd);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            "starting worker {:?} for module '{}' on {}:{}",
            exe, descriptor.module, descriptor.host, descriptor.port
        );
        let mut child = command
            .spawn()
            .with_context(|| format!("could not spawn the worker executable {:?}", exe))?;
        let stdout = Capture::attach(child.stdout.take().context("worker stdout is not piped")?);
        let stderr = Capture::attach(child.stderr.take().context("worker stderr is not piped")?);
        Ok(WorkerProcess {
            child,
            stdout,
            stderr,
        })
    }

    /// Poll until the worker accepts TCP connections, it exits, or the
    /// readiness deadline elapses. The two failure cases kill and reap
    /// the process and surface captured stderr.
    pub(crate) fn wait_ready(&mut self, descriptor: &WorkerDescriptor) -> Result<(), BridgeError> {
        let started = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    return Err(self.start_failure(
                        format!("worker exited with {} before readiness", status),
                        descriptor.protocol,
                    ));
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(self.start_failure(
                        format!("could not poll the worker process: {}", err),
                        descriptor.protocol,
                    ));
                }
            }
            if port::is_in_use(&descriptor.host, descriptor.port, PROBE_TIMEOUT) {
                debug!(
                    "worker ready on {}:{} after {:?}",
                    descriptor.host,
                    descriptor.port,
                    started.elapsed()
                );
                return Ok(());
            }
            if started.elapsed() >= descriptor.readiness_deadline {
                return Err(self.start_failure(
                    format!(
                        "readiness deadline of {:?} elapsed",
                        descriptor.readiness_deadline
                    ),
                    descriptor.protocol,
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kill, reap, and convert a start failure into the matching error,
    /// carrying everything the worker wrote to stderr.
    pub(crate) fn start_failure(&mut self, reason: String, protocol: u16) -> BridgeError {
        let (_, stderr) = self.abort();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        warn!("worker start failed: {} (stderr: {} bytes)", reason, stderr.len());
        classify_start_failure(reason, stderr, protocol)
    }

    /// Hard-kill the process, reap it, and return both captured streams.
    pub(crate) fn abort(&mut self) -> (Vec<u8>, Vec<u8>) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        (self.stdout.join(), self.stderr.join())
    }

    /// Walk the shutdown ladder: wait up to `grace` for a voluntary
    /// exit, send a termination signal and wait up to `kill`, then
    /// hard-kill. Reaps the process and records its exit status.
    pub(crate) fn terminate(&mut self, grace: Duration, kill: Duration) -> Fallible<ExitStatus> {
        if !self.wait_with_deadline(grace)? {
            debug!("worker still running after {:?}; sending termination signal", grace);
            self.signal_terminate();
            if !self.wait_with_deadline(kill)? {
                warn!("worker ignored the termination signal; killing it");
                let _ = self.child.kill();
            }
        }
        self.child
            .wait()
            .context("could not reap the worker process")
    }

    /// Take both captured streams. Call only after the process has been
    /// reaped.
    pub(crate) fn take_streams(&mut self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout.join(), self.stderr.join())
    }

    fn wait_with_deadline(&mut self, deadline: Duration) -> Fallible<bool> {
        let started = Instant::now();
        loop {
            if self
                .child
                .try_wait()
                .context("could not poll the worker process")?
                .is_some()
            {
                return Ok(true);
            }
            if started.elapsed() >= deadline {
                return Ok(false);
            }
            thread::sleep(REAP_POLL);
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        let _ = self.child.kill();
    }
}

/// True for start failures caused by the worker losing the port-reserve
/// race; the facade relaunches once with a fresh port on these.
pub(crate) fn is_bind_failure(err: &BridgeError) -> bool {
    match err {
        BridgeError::WorkerStartFailed { stderr, .. } => stderr.contains(BIND_FAILURE_MARKER),
        _ => false,
    }
}

fn classify_start_failure(reason: String, stderr: String, protocol: u16) -> BridgeError {
    if stderr.contains(UNSUPPORTED_PROTOCOL_MARKER) {
        let supported = stderr
            .lines()
            .find(|line| line.contains(UNSUPPORTED_PROTOCOL_MARKER))
            .and_then(|line| line.split("supported: ").nth(1))
            .map(|tail| tail.trim().trim_end_matches(')').to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return BridgeError::ProtocolVersionMismatch {
            requested: protocol,
            supported,
        };
    }
    BridgeError::WorkerStartFailed { reason, stderr }
}

fn resolve_executable(descriptor: &WorkerDescriptor) -> PathBuf {
    if let Some(exe) = &descriptor.worker_exe {
        return exe.clone();
    }
    if let Some(dir) = &descriptor.worker_dir {
        return dir.join(WORKER_EXE);
    }
    // Look next to the host executable (and one level up, which covers
    // test binaries living in a deps/ subdirectory), else fall back to a
    // bare name resolved through PATH.
    if let Ok(me) = env::current_exe() {
        for dir in me.ancestors().skip(1).take(2) {
            let candidate = dir.join(WORKER_EXE);
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(WORKER_EXE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_failures_are_recognised() {
        let err = BridgeError::WorkerStartFailed {
            reason: "worker exited with exit status: 2 before readiness".to_string(),
            stderr: format!("error: {} 127.0.0.1:5000: in use", BIND_FAILURE_MARKER),
        };
        assert!(is_bind_failure(&err));
        assert!(!is_bind_failure(&BridgeError::WorkerStopped));
    }

    #[test]
    fn protocol_refusals_become_mismatch_errors() {
        let stderr = format!("error: {} 9 (supported: [1])\n", UNSUPPORTED_PROTOCOL_MARKER);
        let err = classify_start_failure("worker exited".to_string(), stderr, 9);
        match err {
            BridgeError::ProtocolVersionMismatch {
                requested,
                supported,
            } => {
                assert_eq!(requested, 9);
                assert_eq!(supported, "[1]");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn other_failures_keep_their_stderr() {
        let err = classify_start_failure(
            "readiness deadline of 10s elapsed".to_string(),
            "some noise".to_string(),
            1,
        );
        match err {
            BridgeError::WorkerStartFailed { reason, stderr } => {
                assert!(reason.contains("deadline"));
                assert_eq!(stderr, "some noise");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
