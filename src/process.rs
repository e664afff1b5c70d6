//! Bounded execution of external commands

use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

/// Errors from running an external command
#[derive(Debug, Error)]
pub(crate) enum RunError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not exit within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Runs `argv` to completion and returns its exit code (`None` when killed by
/// a signal).
///
/// The child gets its own process group. If it outlives `timeout` the whole
/// group is killed and the child is reaped before returning. If the returned
/// future is dropped first, the group is killed on drop.
pub(crate) async fn run_bounded(argv: &[String], timeout: Duration) -> Result<Option<i32>, RunError> {
    let (program, args) = argv.split_first().ok_or(RunError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;
    let mut group = GroupGuard::new(&child);

    let outcome = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(status.code()),
        Ok(Err(source)) => Err(RunError::Wait {
            program: program.clone(),
            source,
        }),
        Err(_) => {
            terminate(&mut child).await;
            Err(RunError::Timeout {
                program: program.clone(),
                timeout,
            })
        }
    };
    group.disarm();
    outcome
}

/// Kills the child's process group when dropped while still armed.
/// `kill_on_drop` only reaches the direct child.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Err(err) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                slog::debug!(slog_scope::logger(), "killpg on drop failed";
                    "pgid" => pgid,
                    "error" => %err
                );
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            slog::debug!(slog_scope::logger(), "killpg failed";
                "pid" => pid,
                "error" => %err
            );
        }
    }

    let _ = child.start_kill();
    if let Err(err) = child.wait().await {
        slog::warn!(slog_scope::logger(), "failed to reap timed out command";
            "error" => %err
        );
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::path::Path;

    /// Alive means present in /proc and not a zombie.
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(Path::new("/proc").join(pid).join("stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z"),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_dropped_run_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        let script = format!(
            "sleep 30 & echo $! > {}.tmp; mv {0}.tmp {0}; wait",
            pid_file.display()
        );
        let argv = vec!["sh".to_string(), "-c".to_string(), script];

        let run = tokio::spawn(async move { run_bounded(&argv, Duration::from_secs(60)).await });

        let mut pid = None;
        for _ in 0..100 {
            if let Ok(contents) = std::fs::read_to_string(&pid_file) {
                pid = Some(contents.trim().to_string());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.expect("background sleep never started");
        assert!(is_running(&pid));

        run.abort();
        let _ = run.await;

        let mut gone = false;
        for _ in 0..100 {
            if !is_running(&pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "background child {} outlived the aborted run", pid);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let err = run_bounded(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RunError::EmptyCommand));
    }
}
