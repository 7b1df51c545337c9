//! CI action runner.
//!
//! A single-shot library + binary invoked by the remote executor: it fetches
//! one revision of a Git repository, reads the workflow config that revision
//! declares, and executes every action matching the triggering event while
//! streaming a synthetic bazel-style build-event stream to the results
//! backend.

pub mod bep;
pub mod error;
pub mod git;
pub mod invocation_log;
pub mod process;
pub mod runner;
pub mod shell;
pub mod workflow;

pub use error::{RunnerError, RETRYABLE_EXIT_CODE};
