//! Action runner: turns one workflow action into one build-event stream.
//!
//! Each triggered action gets its own stream identity, publisher and
//! invocation log. The emitted events mimic a real bazel invocation closely
//! enough that the backend's existing parsers accept them: Started declares
//! Progress-0, WorkspaceStatus and BuildFinished as children; captured
//! command output flows out as a chain of Progress events; BuildFinished and
//! a terminal BuildToolLogs close the stream.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use colored::Colorize as _;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bep::proto::bes;
use crate::bep::{BesTransport, BuildEventPublisher, PublishError, StreamId};
use crate::error::{RunnerError, RETRYABLE_EXIT_CODE};
use crate::invocation_log::InvocationLog;
use crate::process::{run_command, OutputSink};
use crate::shell;
use crate::workflow::{matches_any_trigger, Action, WorkflowConfig};

/// How often buffered log output is flushed into a Progress event.
pub const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Buffered size that forces an immediate flush, ahead of the interval.
pub const PROGRESS_FLUSH_THRESHOLD_BYTES: usize = 1_000;

/// Launcher used to run the configured bazel commands.
pub const BAZELISK: &str = "bazelisk";

/// Immutable per-invocation inputs shared by every action.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub repo_url: String,
    pub commit_sha: String,
    pub trigger_event: String,
    pub trigger_branch: String,
    pub bes_results_url: String,
    pub username: String,
    pub hostname: String,
    /// Launcher binary for bazel commands; [`BAZELISK`] in production.
    pub bazel_executable: String,
}

/// Runner for a single action.
pub struct ActionRunner {
    action: Action,
    ctx: InvocationContext,
    log: Arc<InvocationLog>,
    bep: Arc<BuildEventPublisher>,
    /// Progress chain counter. The lock is held across consume-and-publish
    /// so concurrent flushes keep numbering and wire order aligned.
    progress_count: Mutex<i32>,
}

impl ActionRunner {
    pub fn new(
        action: Action,
        ctx: InvocationContext,
        log: Arc<InvocationLog>,
        bep: Arc<BuildEventPublisher>,
    ) -> Self {
        Self {
            action,
            ctx,
            log,
            bep,
            progress_count: Mutex::new(0),
        }
    }

    /// Run the action's commands, streaming lifecycle and progress events.
    ///
    /// Publish failures return `Ok(())` on purpose: the caller surfaces them
    /// exactly once through `BuildEventPublisher::wait`.
    pub async fn run(self: Arc<Self>, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let invocation_id = &self.bep.stream_id().invocation_id;
        self.log
            .write_line(format!("Action:          {}", self.action.name));
        self.log.write_line(format!(
            "Triggered by:    {} to branch {:?}",
            self.ctx.trigger_event, self.ctx.trigger_branch
        ));
        self.log
            .write_line(format!("Invocation ID:   {invocation_id}"));
        self.log.write_line(format!(
            "Invocation URL:  {}",
            invocation_url(&self.ctx.bes_results_url, invocation_id)
        ));

        if self.bep.publish(self.started_event()).await.is_err() {
            return Ok(());
        }
        if self.flush_progress().await.is_err() {
            return Ok(());
        }
        if self
            .bep
            .publish(self.workspace_status_event())
            .await
            .is_err()
        {
            return Ok(());
        }

        // From here on, command output drives Progress events: the listener
        // nudges the flusher when the buffer grows past the threshold, and
        // the flusher also fires on a fixed interval.
        let flush_needed = Arc::new(Notify::new());
        {
            let flush_needed = flush_needed.clone();
            self.log.set_write_listener(move |buffered| {
                if buffered >= PROGRESS_FLUSH_THRESHOLD_BYTES {
                    flush_needed.notify_one();
                }
            });
        }
        let stop = CancellationToken::new();
        let flusher = self.clone().spawn_progress_flusher(stop.clone(), flush_needed);

        let result = self.run_commands(cancel).await;

        stop.cancel();
        let _ = flusher.await;
        result
    }

    async fn run_commands(&self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        for bazel_command in &self.action.bazel_commands {
            let args = shell::bazel_args(bazel_command)?;
            self.print_command_line(&args);
            let result = run_command(
                cancel,
                &self.ctx.bazel_executable,
                &args,
                &HashMap::new(),
                self.log.clone() as Arc<dyn OutputSink>,
            )
            .await;
            let code = match &result {
                Ok(()) => Some(0),
                Err(err) => err.exit_code(),
            };
            if let Some(code) = code {
                // Raw escape: the invocation UI's renderer only understands
                // basic SGR sequences.
                self.log
                    .write_line(format!("\x1b[90m(command exited with code {code})\x1b[0m"));
            }
            // Report the command's output before bailing on a failure.
            if self.flush_progress().await.is_err() {
                return Ok(());
            }
            result.map_err(RunnerError::from)?;
        }
        Ok(())
    }

    fn spawn_progress_flusher(
        self: Arc<Self>,
        stop: CancellationToken,
        flush_needed: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let first_tick = tokio::time::Instant::now() + PROGRESS_FLUSH_INTERVAL;
            let mut ticker = tokio::time::interval_at(first_tick, PROGRESS_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.flush_progress().await;
                    }
                    () = flush_needed.notified() => {
                        let _ = self.flush_progress().await;
                    }
                }
            }
        })
    }

    /// Write the synthetic prompt line for a command about to run.
    fn print_command_line(&self, args: &[String]) {
        let ps1_end = if self.ctx.username == "root" { "#" } else { "$" };
        let launcher = Path::new(&self.ctx.bazel_executable)
            .file_name()
            .map_or_else(
                || self.ctx.bazel_executable.clone(),
                |name| name.to_string_lossy().into_owned(),
            );
        let mut command = launcher;
        for arg in args {
            command.push(' ');
            command.push_str(&shell::quote_token(arg));
        }
        let user_at_host = format!("{}@{}", self.ctx.username, self.ctx.hostname);
        self.log
            .write_line(format!("\n{}{ps1_end} {command}", user_at_host.cyan()));
    }

    /// Consume buffered log output into the next Progress event. A no-op on
    /// an empty buffer, so racing flush paths at worst skip a turn.
    pub async fn flush_progress(&self) -> Result<(), PublishError> {
        let mut count = self.progress_count.lock().await;
        let buffered = self.log.consume();
        if buffered.is_empty() {
            return Ok(());
        }
        let n = *count;
        *count += 1;
        self.bep.publish(progress_event(n, &buffered)).await
    }

    fn started_event(&self) -> bes::BuildEvent {
        bes::BuildEvent {
            id: Some(started_id()),
            children: vec![progress_id(0), workspace_status_id(), build_finished_id()],
            last_message: false,
            payload: Some(bes::build_event::Payload::Started(bes::BuildStarted {
                uuid: self.bep.stream_id().invocation_id.clone(),
                start_time_millis: Utc::now().timestamp_millis(),
            })),
        }
    }

    fn workspace_status_event(&self) -> bes::BuildEvent {
        let item = |key: &str, value: &str| bes::workspace_status::Item {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        bes::BuildEvent {
            id: Some(workspace_status_id()),
            children: vec![],
            last_message: false,
            payload: Some(bes::build_event::Payload::WorkspaceStatus(
                bes::WorkspaceStatus {
                    item: vec![
                        item("BUILD_USER", &self.ctx.username),
                        item("BUILD_HOST", &self.ctx.hostname),
                        item("REPO_URL", &self.ctx.repo_url),
                        item("COMMIT_SHA", &self.ctx.commit_sha),
                        item("GIT_TREE_STATUS", "Clean"),
                        // GIT_BRANCH is deliberately absent: in the
                        // pull_request case trigger_branch names the merge
                        // target, not the checked-out branch.
                    ],
                },
            )),
        }
    }
}

/// Run one action end to end against an already-started publisher and
/// return the exit code to report for it.
pub async fn run_action(
    cancel: &CancellationToken,
    action: &Action,
    ctx: &InvocationContext,
    bep: &Arc<BuildEventPublisher>,
) -> i32 {
    let start = Instant::now();
    let log = Arc::new(InvocationLog::new());
    let runner = Arc::new(ActionRunner::new(
        action.clone(),
        ctx.clone(),
        log.clone(),
        bep.clone(),
    ));
    let mut exit_code = 0;
    if let Err(err) = runner.clone().run(cancel).await {
        log.write_line(format!("\n{}", format!("Action failed: {err}").red()));
        exit_code = match &err {
            RunnerError::Command(command_err) => command_err.exit_code().unwrap_or(1),
            _ => 1,
        };
    }
    // Closing handshake, regardless of outcome. Failures here surface
    // through wait().
    let _ = runner.flush_progress().await;
    let _ = bep.publish(finished_event(exit_code)).await;
    let _ = bep.publish(build_tool_logs_event(start.elapsed())).await;
    exit_code
}

/// Run every triggered action in config order, each with its own stream.
///
/// A failed action does not stop later actions; the first non-zero action
/// exit code becomes the return value. A stream that cannot be delivered
/// aborts the run with [`RETRYABLE_EXIT_CODE`]: the backend likely never
/// learned the outcome, so the executor should run the whole thing again.
pub async fn run_all_actions<F>(
    cancel: &CancellationToken,
    config: &WorkflowConfig,
    ctx: &InvocationContext,
    make_transport: F,
) -> i32
where
    F: Fn() -> Arc<dyn BesTransport>,
{
    let mut final_exit_code = 0;
    for action in &config.actions {
        if !matches_any_trigger(action, &ctx.trigger_event, &ctx.trigger_branch) {
            info!(
                action = %action.name,
                event = %ctx.trigger_event,
                branch = %ctx.trigger_branch,
                "no triggers matched; skipping action\n{}",
                action.debug_yaml()
            );
            continue;
        }
        let bep = Arc::new(BuildEventPublisher::new(
            StreamId::random(),
            make_transport(),
        ));
        bep.start(cancel);
        let exit_code = run_action(cancel, action, ctx, &bep).await;
        if let Err(err) = bep.wait().await {
            warn!(action = %action.name, error = %err, "failed to publish build event stream");
            return RETRYABLE_EXIT_CODE;
        }
        if final_exit_code == 0 {
            final_exit_code = exit_code;
        }
    }
    final_exit_code
}

/// Join the results URL prefix and an invocation id with exactly one slash.
pub fn invocation_url(results_url_prefix: &str, invocation_id: &str) -> String {
    if results_url_prefix.ends_with('/') {
        format!("{results_url_prefix}{invocation_id}")
    } else {
        format!("{results_url_prefix}/{invocation_id}")
    }
}

fn progress_id(opaque_count: i32) -> bes::BuildEventId {
    bes::BuildEventId {
        id: Some(bes::build_event_id::Id::Progress(
            bes::build_event_id::ProgressId { opaque_count },
        )),
    }
}

fn started_id() -> bes::BuildEventId {
    bes::BuildEventId {
        id: Some(bes::build_event_id::Id::Started(
            bes::build_event_id::BuildStartedId {},
        )),
    }
}

fn workspace_status_id() -> bes::BuildEventId {
    bes::BuildEventId {
        id: Some(bes::build_event_id::Id::WorkspaceStatus(
            bes::build_event_id::WorkspaceStatusId {},
        )),
    }
}

fn build_finished_id() -> bes::BuildEventId {
    bes::BuildEventId {
        id: Some(bes::build_event_id::Id::BuildFinished(
            bes::build_event_id::BuildFinishedId {},
        )),
    }
}

fn build_tool_logs_id() -> bes::BuildEventId {
    bes::BuildEventId {
        id: Some(bes::build_event_id::Id::BuildToolLogs(
            bes::build_event_id::BuildToolLogsId {},
        )),
    }
}

fn progress_event(opaque_count: i32, output: &[u8]) -> bes::BuildEvent {
    bes::BuildEvent {
        id: Some(progress_id(opaque_count)),
        children: vec![progress_id(opaque_count + 1)],
        last_message: false,
        payload: Some(bes::build_event::Payload::Progress(bes::Progress {
            stdout: String::new(),
            // Like bazel, all captured output is reported as stderr.
            stderr: String::from_utf8_lossy(output).into_owned(),
        })),
    }
}

/// The BuildFinished event closing an action, carrying its exit code.
pub fn finished_event(exit_code: i32) -> bes::BuildEvent {
    bes::BuildEvent {
        id: Some(build_finished_id()),
        children: vec![build_tool_logs_id()],
        last_message: false,
        payload: Some(bes::build_event::Payload::Finished(bes::BuildFinished {
            overall_success: exit_code == 0,
            finish_time_millis: Utc::now().timestamp_millis(),
            exit_code: Some(bes::build_finished::ExitCode {
                name: String::new(),
                code: exit_code,
            }),
        })),
    }
}

/// The terminal BuildToolLogs event with the elapsed-time log file.
pub fn build_tool_logs_event(elapsed: Duration) -> bes::BuildEvent {
    bes::BuildEvent {
        id: Some(build_tool_logs_id()),
        children: vec![],
        last_message: true,
        payload: Some(bes::build_event::Payload::BuildToolLogs(
            bes::BuildToolLogs {
                log: vec![bes::File {
                    name: "elapsed time".to_owned(),
                    file: Some(bes::file::File::Contents(
                        format!("{:.6}", elapsed.as_secs_f64()).into_bytes(),
                    )),
                }],
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_url_joins_with_exactly_one_slash() {
        assert_eq!(
            invocation_url("https://app.example.com/invocation", "abc"),
            "https://app.example.com/invocation/abc"
        );
        assert_eq!(
            invocation_url("https://app.example.com/invocation/", "abc"),
            "https://app.example.com/invocation/abc"
        );
    }

    #[test]
    fn finished_event_carries_exit_code_and_declares_tool_logs() {
        let event = finished_event(7);
        let Some(bes::build_event::Payload::Finished(finished)) = &event.payload else {
            panic!("wrong payload");
        };
        assert_eq!(finished.exit_code.as_ref().unwrap().code, 7);
        assert!(!finished.overall_success);
        assert_eq!(event.children, vec![build_tool_logs_id()]);
        assert!(!event.last_message);
    }

    #[test]
    fn build_tool_logs_is_terminal_and_reports_elapsed_seconds() {
        let event = build_tool_logs_event(Duration::from_millis(1_500));
        assert!(event.last_message);
        let Some(bes::build_event::Payload::BuildToolLogs(logs)) = &event.payload else {
            panic!("wrong payload");
        };
        assert_eq!(logs.log.len(), 1);
        assert_eq!(logs.log[0].name, "elapsed time");
        let Some(bes::file::File::Contents(contents)) = &logs.log[0].file else {
            panic!("wrong file payload");
        };
        assert_eq!(std::str::from_utf8(contents).unwrap(), "1.500000");
    }

    #[test]
    fn progress_events_chain_their_successor() {
        let event = progress_event(4, b"output");
        assert_eq!(event.id.as_ref().unwrap(), &progress_id(4));
        assert_eq!(event.children, vec![progress_id(5)]);
    }
}
