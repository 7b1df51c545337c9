//! CI action runner binary.
//!
//! Invoked once per run by the remote executor. Exit codes are the contract
//! with the executor: 0 for success, the retryable code for transient
//! failures worth re-queueing, the failing command's own code otherwise.

use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use ci_runner::bep::{BesTransport, GrpcBesTransport};
use ci_runner::git;
use ci_runner::runner::{run_all_actions, InvocationContext, BAZELISK};
use ci_runner::workflow::{WorkflowConfig, WORKFLOW_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(
    name = "ci_runner",
    about = "Runs the workflow actions of one repository revision, streaming build events to the results backend"
)]
struct Flags {
    /// URL of the Git repo to check out.
    #[arg(long = "repo_url")]
    repo_url: String,

    /// SHA of the commit to check out.
    #[arg(long = "commit_sha")]
    commit_sha: String,

    /// Webhook event that triggered this run (push, pull_request).
    #[arg(long = "trigger_event")]
    trigger_event: String,

    /// Branch to check action triggers against.
    #[arg(long = "trigger_branch")]
    trigger_branch: String,

    /// Endpoint of the build-event backend; a grpc:// scheme means
    /// plaintext.
    #[arg(long = "bes_backend")]
    bes_backend: String,

    /// URL prefix for the invocation links printed into the log.
    #[arg(long = "bes_results_url")]
    bes_results_url: String,
}

impl Flags {
    fn validate(&self) -> Result<(), String> {
        let required = [
            ("--repo_url", &self.repo_url),
            ("--commit_sha", &self.commit_sha),
            ("--trigger_event", &self.trigger_event),
            ("--trigger_branch", &self.trigger_branch),
            ("--bes_backend", &self.bes_backend),
            ("--bes_results_url", &self.bes_results_url),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(format!("{name} must not be empty"));
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let flags = match Flags::try_parse() {
        Ok(flags) => flags,
        Err(err) => {
            let _ = err.print();
            // Usage errors are fatal but not retryable.
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    // The invocation log is rendered by the results UI, not a terminal, so
    // colour output must not be auto-disabled.
    colored::control::set_override(true);

    std::process::exit(run(flags).await);
}

async fn run(flags: Flags) -> i32 {
    if let Err(err) = flags.validate() {
        error!("{err}");
        return 1;
    }

    let cancel = CancellationToken::new();
    spawn_signal_watcher(cancel.clone());

    if let Err(err) = git::clone_repo(&cancel, &flags.repo_url, &flags.commit_sha).await {
        error!(error = %err, "failed to fetch repository");
        return err.exit_code();
    }
    // Relative to the checkout: clone_repo left us chdir'd into it.
    let config = match WorkflowConfig::load_file(WORKFLOW_CONFIG_PATH) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to read workflow config");
            return err.exit_code();
        }
    };

    let ctx = invocation_context(&flags);
    let bes_backend = flags.bes_backend.clone();
    run_all_actions(&cancel, &config, &ctx, move || {
        Arc::new(GrpcBesTransport::new(bes_backend.clone())) as Arc<dyn BesTransport>
    })
    .await
}

fn invocation_context(flags: &Flags) -> InvocationContext {
    let username = whoami::fallible::username().unwrap_or_else(|err| {
        warn!(error = %err, "failed to determine username");
        String::new()
    });
    let hostname = whoami::fallible::hostname().unwrap_or_else(|err| {
        warn!(error = %err, "failed to determine hostname");
        String::new()
    });
    InvocationContext {
        repo_url: flags.repo_url.clone(),
        commit_sha: flags.commit_sha.clone(),
        trigger_event: flags.trigger_event.clone(),
        trigger_branch: flags.trigger_branch.clone(),
        bes_results_url: flags.bes_results_url.clone(),
        username,
        hostname,
        bazel_executable: BAZELISK.to_owned(),
    }
}

/// Executor-imposed shutdown arrives as a signal; it cancels the run's
/// context, which kills child processes and terminates the event stream.
fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
        warn!("received shutdown signal; cancelling run");
        cancel.cancel();
    });
}
