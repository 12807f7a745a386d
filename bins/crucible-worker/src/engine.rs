/// Execution Engine - Sandboxed Process Runner
///
/// **Core Responsibility:**
/// Run one untrusted test suite against one untrusted implementation as a
/// child process and capture its raw output.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (interpreter, temp files, deadline, kill)
/// - Engine does NOT parse test reports
/// - Engine does NOT score anything
/// - Engine returns raw outputs for the Evaluator to judge
///
/// **Isolation Model:**
/// Process boundary + wall-clock deadline + headless display variables.
/// No syscall filtering and no container; candidates are trusted not to
/// escape the process, only not to terminate.

use crate::config::RuntimeConfig;
use anyhow::{bail, Context, Result};
use crucible_common::types::ExecutionResult;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Safety limit to keep pathological candidates off the disk
const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB

/// How long to wait for output pipes after the child has been killed.
/// A grandchild that inherited a pipe can keep it open indefinitely.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Diagnostic text returned in place of output when the deadline elapses
pub const TIMEOUT_SENTINEL: &str = "[Execution timed out]";

const IMPLEMENTATION_STEM: &str = "implementation";
const TEST_SUITE_STEM: &str = "test_suite";

/// Rewrite the `while running:` game-loop idiom into a bounded loop.
///
/// Best-effort textual substitution: a candidate whose loop is spelled any
/// other way is left untouched and falls back to the hard deadline.
pub fn bound_event_loop(code: &str, iterations: u32) -> String {
    code.replace("while running:", &format!("for _ in range({}):", iterations))
}

/// Local process engine
///
/// **Execution Rules:**
/// 1. Fresh temporary directory per call, removed when the call returns
/// 2. Implementation and test suite written as distinct files inside it
/// 3. Child runs `<command> <args..> <test-file> <implementation-file>`
///    with the temp directory as working directory and stdin closed
/// 4. stdout/stderr drained concurrently, capped at `max_output_bytes`
/// 5. Deadline enforced by the parent; on expiry the child's whole process
///    group is SIGKILLed and the child reaped
pub struct ProcessEngine {
    runtime: RuntimeConfig,
}

impl ProcessEngine {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    fn file_name(&self, stem: &str) -> String {
        let ext = self.runtime.file_extension.trim_start_matches('.');
        if ext.is_empty() {
            stem.to_string()
        } else {
            format!("{}.{}", stem, ext)
        }
    }

    /// Execute a test suite against an implementation under a hard deadline
    ///
    /// Returns `Err` only for infrastructure failures (temp dir, spawn).
    /// Candidate failures of any kind come back as an `ExecutionResult`.
    #[instrument(skip(self, implementation, tests), fields(execution_id = %uuid::Uuid::new_v4()))]
    pub async fn execute(
        &self,
        implementation: &str,
        tests: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        // GUARDRAIL: Validate input sizes
        if implementation.len() > MAX_SOURCE_CODE_BYTES {
            bail!("Implementation exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES);
        }
        if tests.len() > MAX_SOURCE_CODE_BYTES {
            bail!("Test suite exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES);
        }

        // Dropped at the end of this call, taking both files with it
        let workdir = tempfile::Builder::new()
            .prefix("crucible-")
            .tempdir()
            .context("Failed to create execution directory")?;

        let implementation_path = workdir.path().join(self.file_name(IMPLEMENTATION_STEM));
        let test_path = workdir.path().join(self.file_name(TEST_SUITE_STEM));

        tokio::fs::write(&implementation_path, implementation)
            .await
            .context("Failed to write implementation file")?;
        tokio::fs::write(&test_path, tests)
            .await
            .context("Failed to write test suite file")?;

        self.run_in(workdir.path(), &[test_path.as_path(), implementation_path.as_path()], timeout)
            .await
    }

    /// Run a single program on its own with the event loop bounded
    ///
    /// Used to check that a candidate at least starts and exits before it is
    /// scored against anything.
    #[instrument(skip(self, program))]
    pub async fn sanity_check(&self, program: &str, timeout: Duration) -> Result<ExecutionResult> {
        if program.len() > MAX_SOURCE_CODE_BYTES {
            bail!("Program exceeds maximum size of {} bytes", MAX_SOURCE_CODE_BYTES);
        }

        let bounded = bound_event_loop(program, self.runtime.sanity_iterations);

        let workdir = tempfile::Builder::new()
            .prefix("crucible-sanity-")
            .tempdir()
            .context("Failed to create execution directory")?;
        let program_path = workdir.path().join(self.file_name(IMPLEMENTATION_STEM));
        tokio::fs::write(&program_path, bounded)
            .await
            .context("Failed to write program file")?;

        self.run_in(workdir.path(), &[program_path.as_path()], timeout).await
    }

    async fn run_in(&self, workdir: &Path, files: &[&Path], timeout: Duration) -> Result<ExecutionResult> {
        let mut std_command = std::process::Command::new(&self.runtime.command);
        std_command
            .args(&self.runtime.args)
            .args(files)
            .current_dir(workdir)
            .envs(self.runtime.child_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so a timeout takes down anything the child forked
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        let start_time = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.runtime.command))?;
        let pid = child.id();

        let limit = self.runtime.max_output_bytes;
        let mut stdout_reader = child.stdout.take().map(|out| tokio::spawn(read_capped(out, limit)));
        let mut stderr_reader = child.stderr.take().map(|err| tokio::spawn(read_capped(err, limit)));

        // HARD TIMEOUT: the wait is cancelled by the deadline, not by the child
        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                terminate(&mut child, pid).await;
                return Err(e).context("Failed waiting for child process");
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Execution timed out - killing process group");
                terminate(&mut child, pid).await;
                None
            }
        };

        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        let Some(status) = status else {
            let partial = collect(&mut stderr_reader).await;
            collect(&mut stdout_reader).await;
            debug!(partial_stderr_bytes = partial.len(), "Discarding partial output of timed-out run");

            return Ok(ExecutionResult {
                stdout: String::new(),
                stderr: TIMEOUT_SENTINEL.to_string(),
                timed_out: true,
                exit_code: None,
                execution_time_ms,
            });
        };

        // Stragglers the candidate left in the background die with it
        kill_process_group(pid);

        let stdout = collect(&mut stdout_reader).await;
        let mut stderr = collect(&mut stderr_reader).await;

        let exit_code = status.code();
        if exit_code.is_none() {
            // Killed by a signal from elsewhere (OOM killer, segfault)
            stderr.push_str(&format!("\n[Process terminated abnormally: {}]", status));
        }

        debug!(
            exit_code = ?exit_code,
            execution_ms = execution_time_ms,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Process exited"
        );

        Ok(ExecutionResult {
            stdout,
            stderr,
            timed_out: false,
            exit_code,
            execution_time_ms,
        })
    }
}

/// Kill the child (and its process group) and reap it
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_process_group(pid);

    if let Err(e) = child.kill().await {
        // Already reaped after a group kill is the common case here
        debug!(error = %e, "Child kill returned an error");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    // ESRCH just means the group is already gone
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(error = %e, pgid = pid, "killpg did not deliver");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Read a pipe to EOF keeping at most `limit` bytes; the rest is drained
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut buf = Vec::new();
    if let Err(e) = (&mut reader).take(limit as u64).read_to_end(&mut buf).await {
        debug!(error = %e, "Output pipe read failed");
    }
    // Keep draining so the child never blocks on a full pipe
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Await a reader task for at most the grace period
async fn collect(reader: &mut Option<JoinHandle<String>>) -> String {
    let Some(handle) = reader.as_mut() else {
        return String::new();
    };

    match tokio::time::timeout(OUTPUT_GRACE, &mut *handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            debug!("Output pipe held open past grace period; abandoning reader");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_event_loop_rewrites_idiom() {
        let code = "running = True\nwhile running:\n    step()\n";
        let bounded = bound_event_loop(code, 300);
        assert_eq!(bounded, "running = True\nfor _ in range(300):\n    step()\n");
    }

    #[test]
    fn test_bound_event_loop_rewrites_every_occurrence() {
        let code = "while running:\n    a()\nwhile running:\n    b()\n";
        assert_eq!(bound_event_loop(code, 5).matches("for _ in range(5):").count(), 2);
    }

    #[test]
    fn test_bound_event_loop_leaves_other_loops_alone() {
        let code = "while self.running:\n    step()\nwhile True:\n    pass\n";
        assert_eq!(bound_event_loop(code, 300), code);
    }

    #[test]
    fn test_file_name_uses_extension() {
        let engine = ProcessEngine::new(RuntimeConfig::default());
        assert_eq!(engine.file_name(TEST_SUITE_STEM), "test_suite.py");

        let engine = ProcessEngine::new(RuntimeConfig {
            file_extension: String::new(),
            ..RuntimeConfig::default()
        });
        assert_eq!(engine.file_name(IMPLEMENTATION_STEM), "implementation");
    }
}
