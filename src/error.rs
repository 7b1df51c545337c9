//! Error types and the process exit-code contract.
//!
//! The runner distinguishes failures the invoking executor may retry
//! (transient network or backend trouble) from failures that are final for
//! this revision (bad flags, malformed workflow config, a build command that
//! legitimately failed). The distinction is carried in the process exit code.

use thiserror::Error;

use crate::bep::PublishError;
use crate::process::CommandError;

/// Exit code telling the executor the run may be re-attempted because the
/// failure was likely transient.
pub const RETRYABLE_EXIT_CODE: i32 = 21;

/// Top-level error type for a runner invocation.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Required input is missing or malformed (workflow config, repo URL).
    /// Fatal and non-retryable.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Likely-transient failure; the executor should re-queue the run.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A child command failed. The child's exit code stays inspectable so
    /// the driver can propagate it.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The build-event stream failed. Always retryable: the backend may not
    /// have learned the outcome of the run.
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        RunnerError::Io {
            context: context.into(),
            source,
        }
    }

    /// Map this error onto the process exit-code contract: retryable
    /// failures get [`RETRYABLE_EXIT_CODE`], a failed command propagates its
    /// own exit code, everything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::Unavailable(_) | RunnerError::Publish(_) => RETRYABLE_EXIT_CODE,
            RunnerError::Command(err) => err.exit_code().unwrap_or(1),
            RunnerError::FailedPrecondition(_) | RunnerError::Io { .. } => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(
            RunnerError::Unavailable("fetch failed".into()).exit_code(),
            RETRYABLE_EXIT_CODE
        );
        assert_eq!(
            RunnerError::Publish(PublishError::Dial("refused".into())).exit_code(),
            RETRYABLE_EXIT_CODE
        );
        assert_eq!(
            RunnerError::FailedPrecondition("no config".into()).exit_code(),
            1
        );
        assert_eq!(
            RunnerError::Command(CommandError::NonZeroExit {
                executable: "bazelisk".into(),
                code: 7,
            })
            .exit_code(),
            7
        );
        // A child killed by a signal has no numeric code; fall back to 1.
        assert_eq!(
            RunnerError::Command(CommandError::NoExitCode {
                executable: "bazelisk".into(),
            })
            .exit_code(),
            1
        );
    }
}
