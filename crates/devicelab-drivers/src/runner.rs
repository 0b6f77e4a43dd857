//! External command execution
//!
//! Every subprocess the drivers start goes through a [`ProcessRunner`], so
//! tests swap the whole external-tool surface for a scripted double. The
//! production [`TokioRunner`] captures output with a hard deadline; spawned
//! children get a dedicated wait task that records the real exit code.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use devicelab_core::driver::ManagedProcess;
use devicelab_core::prelude::*;

/// Default deadline for one-shot shell commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured output of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Abstraction over subprocess execution
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion, enforcing the deadline.
    ///
    /// Fails with `SpawnFailed` when the binary cannot start, `NonZeroExit`
    /// when it exits non-zero. Stderr alongside a zero exit is preserved on
    /// the output for the caller to treat as a warning.
    async fn run(
        &self,
        argv: &[String],
        env: &[(String, String)],
        deadline: Duration,
    ) -> Result<CommandOutput>;

    /// Start a long-lived child and return its tracked handle
    async fn spawn(
        &self,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<Arc<dyn ManagedProcess>>;
}

/// Production runner backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioRunner;

impl TokioRunner {
    pub fn new() -> Self {
        TokioRunner
    }

    fn build_command(argv: &[String], env: &[(String, String)]) -> Result<Command> {
        let program = argv
            .first()
            .ok_or_else(|| Error::argument("argv must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..])
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl ProcessRunner for TokioRunner {
    async fn run(
        &self,
        argv: &[String],
        env: &[(String, String)],
        deadline: Duration,
    ) -> Result<CommandOutput> {
        let cmdline = argv.join(" ");
        debug!("running `{}`", cmdline);

        let mut cmd = Self::build_command(argv, env)?;
        let output = timeout(deadline, cmd.output())
            .await
            .map_err(|_| Error::process(format!("`{}` timed out after {:?}", cmdline, deadline)))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::spawn_failed(format!("{} not found", argv[0]))
                } else {
                    Error::spawn_failed(e.to_string())
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !stderr.is_empty() {
            debug!("`{}` stderr: {}", cmdline, stderr.trim_end());
        }

        if !output.status.success() {
            return Err(Error::non_zero_exit(cmdline, output.status.code(), stderr));
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: output.status.code(),
        })
    }

    async fn spawn(
        &self,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<Arc<dyn ManagedProcess>> {
        let cmdline = argv.join(" ");
        info!("spawning `{}`", cmdline);

        let mut cmd = Self::build_command(argv, env)?;
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::spawn_failed(format!("{} not found", argv[0]))
            } else {
                Error::spawn_failed(e.to_string())
            }
        })?;

        Ok(Arc::new(SpawnedProcess::track(child)))
    }
}

/// A spawned child with a dedicated wait task.
///
/// The `Child` is moved into the wait task so the real exit code is captured
/// exactly once; the handle keeps an atomic exited flag, the recorded code,
/// and a `Notify` for waiters. A kill channel requests force-termination.
pub struct SpawnedProcess {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
    exit_notify: Arc<Notify>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SpawnedProcess {
    fn track(child: Child) -> Self {
        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(Mutex::new(None));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            kill_rx,
            Arc::clone(&exited),
            Arc::clone(&exit_code),
            Arc::clone(&exit_notify),
        ));

        SpawnedProcess {
            pid,
            exited,
            exit_code,
            exit_notify,
            kill_tx: Mutex::new(Some(kill_tx)),
        }
    }

    /// Background task: owns `child`, waits for it, records the exit code.
    async fn wait_for_exit(
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        exited: Arc<AtomicBool>,
        exit_code: Arc<Mutex<Option<i32>>>,
        exit_notify: Arc<Notify>,
    ) {
        let code: Option<i32> = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("error waiting for child: {}", e);
                    None
                }
            },
            _ = kill_rx => {
                if let Err(e) = child.kill().await {
                    error!("failed to kill child: {}", e);
                }
                child.wait().await.ok().and_then(|s| s.code())
            }
        };

        if let Ok(mut slot) = exit_code.lock() {
            *slot = code;
        }
        // Flag first, then wake waiters, so has_exited() is true before any
        // waiter observes the notification.
        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();
    }

    /// Force-kill via the wait task; used when SIGINT is unavailable
    pub fn force_kill(&self) {
        if let Ok(mut tx) = self.kill_tx.lock() {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn recorded_exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|slot| *slot)
    }
}

#[async_trait]
impl ManagedProcess for SpawnedProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn interrupt(&self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                let rc = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                if rc != 0 {
                    return Err(Error::process(format!("SIGINT to pid {} failed", pid)));
                }
                return Ok(());
            }
        }
        // No pid (or non-unix): fall back to the kill channel
        self.force_kill();
        Ok(())
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    async fn wait_exit(&self) -> Option<i32> {
        // Create the notified future before the flag check so a wakeup
        // between check and await cannot be missed.
        let notified = self.exit_notify.notified();
        if self.has_exited() {
            return self.recorded_exit_code();
        }
        notified.await;
        self.recorded_exit_code()
    }
}

impl Drop for SpawnedProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            // kill_on_drop on the Child is the final safety net if the wait
            // task has not handled the kill yet.
            self.force_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let runner = TokioRunner::new();
        let output = runner
            .run(&argv(&["echo", "hello"]), &[], DEFAULT_COMMAND_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_run_applies_env() {
        let runner = TokioRunner::new();
        let output = runner
            .run(
                &argv(&["sh", "-c", "echo $DEVICELAB_TEST_VAR"]),
                &[("DEVICELAB_TEST_VAR".to_string(), "on".to_string())],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "on");
    }

    #[tokio::test]
    async fn test_run_missing_binary_is_spawn_failed() {
        let runner = TokioRunner::new();
        let err = runner
            .run(
                &argv(&["definitely-not-a-real-binary-42"]),
                &[],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_run_non_zero_exit() {
        let runner = TokioRunner::new();
        let err = runner
            .run(
                &argv(&["sh", "-c", "echo oops >&2; exit 3"]),
                &[],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await
            .unwrap_err();
        match err {
            Error::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected NonZeroExit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_stderr_with_zero_exit_is_a_warning_not_an_error() {
        let runner = TokioRunner::new();
        let output = runner
            .run(
                &argv(&["sh", "-c", "echo fine; echo careful >&2"]),
                &[],
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "fine");
        assert_eq!(output.stderr.trim(), "careful");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let runner = TokioRunner::new();
        let err = runner
            .run(&argv(&["sleep", "5"]), &[], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_empty_argv_rejected() {
        let runner = TokioRunner::new();
        let err = runner.run(&[], &[], DEFAULT_COMMAND_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Argument { .. }));
    }

    #[tokio::test]
    async fn test_spawn_records_exit_code() {
        let runner = TokioRunner::new();
        let handle = runner
            .spawn(&argv(&["sh", "-c", "exit 7"]), &[])
            .await
            .unwrap();

        let code = handle.wait_exit().await;
        assert_eq!(code, Some(7));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_spawn_interrupt_terminates_child() {
        let runner = TokioRunner::new();
        let handle = runner.spawn(&argv(&["sleep", "30"]), &[]).await.unwrap();

        assert!(!handle.has_exited());
        handle.interrupt().unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), handle.wait_exit())
            .await
            .expect("child should exit after SIGINT");
        // SIGINT death reports no exit code
        assert_eq!(code, None);
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_interrupt_after_exit_is_noop() {
        let runner = TokioRunner::new();
        let handle = runner.spawn(&argv(&["true"]), &[]).await.unwrap();
        handle.wait_exit().await;
        handle.interrupt().unwrap();
    }
}
