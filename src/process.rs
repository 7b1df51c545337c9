//! Child-process execution with captured output.
//!
//! Every command the runner starts (git plumbing, bazel builds) goes through
//! [`run_command`]: stdout and stderr are pumped into a caller-provided sink
//! and the child's exit code stays inspectable on the returned error.

use std::collections::HashMap;
use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Destination for a child's merged stdout/stderr bytes.
pub trait OutputSink: Send + Sync {
    fn write_output(&self, bytes: &[u8]);
}

/// Sink that forwards child output straight to this process's stderr,
/// best-effort. Used for plumbing commands that run before any invocation
/// log exists.
pub struct StderrSink;

impl OutputSink for StderrSink {
    fn write_output(&self, bytes: &[u8]) {
        let _ = std::io::stderr().write_all(bytes);
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to start {executable}: {source}")]
    Spawn {
        executable: String,
        source: std::io::Error,
    },

    #[error("failed to wait for {executable}: {source}")]
    Wait {
        executable: String,
        source: std::io::Error,
    },

    #[error("command exited with code {code}")]
    NonZeroExit { executable: String, code: i32 },

    /// The child was killed by a signal and left no numeric exit code.
    #[error("{executable} terminated without an exit code")]
    NoExitCode { executable: String },

    #[error("{executable} cancelled before completion")]
    Cancelled { executable: String },
}

impl CommandError {
    /// The child's numeric exit code, when it produced one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Run `executable` with `args`, layering `env` over the parent environment
/// and writing both output streams to `sink`. Cancelling `cancel` kills the
/// child.
pub async fn run_command(
    cancel: &CancellationToken,
    executable: &str,
    args: &[String],
    env: &HashMap<String, String>,
    sink: Arc<dyn OutputSink>,
) -> Result<(), CommandError> {
    let mut child = Command::new(executable)
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            executable: executable.to_owned(),
            source,
        })?;

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_output(stdout, sink.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_output(stderr, sink.clone())));
    }

    let status = tokio::select! {
        status = child.wait() => status.map_err(|source| CommandError::Wait {
            executable: executable.to_owned(),
            source,
        })?,
        () = cancel.cancelled() => {
            debug!(executable, "cancelled; killing child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            for pump in pumps {
                let _ = pump.await;
            }
            return Err(CommandError::Cancelled {
                executable: executable.to_owned(),
            });
        }
    };

    // Drain whatever the child wrote before it exited.
    for pump in pumps {
        let _ = pump.await;
    }

    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(CommandError::NonZeroExit {
            executable: executable.to_owned(),
            code,
        }),
        None => Err(CommandError::NoExitCode {
            executable: executable.to_owned(),
        }),
    }
}

async fn pump_output<R>(mut reader: R, sink: Arc<dyn OutputSink>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.write_output(&buf[..n]),
            Err(err) => {
                debug!(error = %err, "output pump stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct BufferSink(Mutex<Vec<u8>>);

    impl BufferSink {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl OutputSink for BufferSink {
        fn write_output(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(bytes);
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn captures_both_output_streams() {
        let sink = Arc::new(BufferSink::default());
        run_command(
            &CancellationToken::new(),
            "sh",
            &args(&["-c", "echo to-stdout; echo to-stderr >&2"]),
            &HashMap::new(),
            sink.clone(),
        )
        .await
        .unwrap();
        let out = sink.contents();
        assert!(out.contains("to-stdout"), "missing stdout in {out:?}");
        assert!(out.contains("to-stderr"), "missing stderr in {out:?}");
    }

    #[tokio::test]
    async fn non_zero_exit_code_is_inspectable() {
        let err = run_command(
            &CancellationToken::new(),
            "sh",
            &args(&["-c", "exit 3"]),
            &HashMap::new(),
            Arc::new(BufferSink::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn env_is_merged_over_parent_environment() {
        let sink = Arc::new(BufferSink::default());
        let env = HashMap::from([("CI_RUNNER_TEST_VAR".to_owned(), "merged".to_owned())]);
        run_command(
            &CancellationToken::new(),
            "sh",
            &args(&["-c", "echo value=$CI_RUNNER_TEST_VAR path=$PATH"]),
            &env,
            sink.clone(),
        )
        .await
        .unwrap();
        let out = sink.contents();
        assert!(out.contains("value=merged"));
        // The parent environment is still visible.
        assert!(!out.contains("path=\n"));
    }

    #[tokio::test]
    async fn missing_executable_reports_spawn_error() {
        let err = run_command(
            &CancellationToken::new(),
            "./definitely-not-a-real-binary",
            &[],
            &HashMap::new(),
            Arc::new(BufferSink::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_command(
            &cancel,
            "sleep",
            &args(&["30"]),
            &HashMap::new(),
            Arc::new(BufferSink::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }
}
