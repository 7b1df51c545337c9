//! Workflow configuration parsing and trigger matching.
//!
//! The checked-out repository declares its CI actions in a `buildbuddy.yaml`
//! at the repo root: an ordered list of named actions, each with the bazel
//! commands to run and the (event, branch) pairs that fire it.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Path of the workflow config, relative to the checked-out repo root.
pub const WORKFLOW_CONFIG_PATH: &str = "buildbuddy.yaml";

pub const PUSH_EVENT_NAME: &str = "push";
pub const PULL_REQUEST_EVENT_NAME: &str = "pull_request";

/// The parsed workflow document. Read once per run, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub actions: Vec<Action>,
}

/// One named sequence of bazel commands with optional trigger conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub bazel_commands: Vec<String>,
    #[serde(default)]
    pub triggers: Option<Triggers>,
}

/// Trigger conditions for an action. An absent sub-record means that event
/// type never fires the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default)]
    pub push: Option<PushTrigger>,
    #[serde(default)]
    pub pull_request: Option<PullRequestTrigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTrigger {
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestTrigger {
    #[serde(default)]
    pub branches: Vec<String>,
}

impl WorkflowConfig {
    /// Parse a workflow config document. Unknown fields are ignored so older
    /// runners keep working when the config schema grows.
    pub fn load(reader: impl Read) -> Result<Self, RunnerError> {
        serde_yaml::from_reader(reader).map_err(|err| {
            RunnerError::FailedPrecondition(format!("malformed workflow config: {err}"))
        })
    }

    /// Load the workflow config from a file. A missing file is a failed
    /// precondition: there is nothing to run for this repository.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|err| {
            RunnerError::FailedPrecondition(format!("open {}: {err}", path.display()))
        })?;
        Self::load(file)
    }
}

impl Action {
    /// YAML rendering of the action for skip diagnostics.
    pub fn debug_yaml(&self) -> String {
        serde_yaml::to_string(self)
            .unwrap_or_else(|err| format!("<failed to render action: {err}>"))
    }
}

/// Decide whether `action` fires for the given webhook event and branch.
///
/// An action with no `triggers` record never fires, and neither does any
/// event name other than `push` or `pull_request`.
pub fn matches_any_trigger(action: &Action, event: &str, branch: &str) -> bool {
    let Some(triggers) = &action.triggers else {
        return false;
    };
    if event == PUSH_EVENT_NAME {
        if let Some(push) = &triggers.push {
            return push.branches.iter().any(|b| b == branch);
        }
    }
    if event == PULL_REQUEST_EVENT_NAME {
        if let Some(pull_request) = &triggers.pull_request {
            return pull_request.branches.iter().any(|b| b == branch);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> WorkflowConfig {
        WorkflowConfig::load(yaml.as_bytes()).unwrap()
    }

    #[test]
    fn parses_full_config() {
        let cfg = parse(
            r#"
actions:
  - name: Build and test
    triggers:
      push:
        branches:
          - main
      pull_request:
        branches:
          - main
          - release
    bazel_commands:
      - bazel build //...
      - bazel test //...
"#,
        );
        assert_eq!(cfg.actions.len(), 1);
        let action = &cfg.actions[0];
        assert_eq!(action.name, "Build and test");
        assert_eq!(action.bazel_commands.len(), 2);
        let triggers = action.triggers.as_ref().unwrap();
        assert_eq!(triggers.push.as_ref().unwrap().branches, vec!["main"]);
        assert_eq!(
            triggers.pull_request.as_ref().unwrap().branches,
            vec!["main", "release"]
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let cfg = parse(
            r#"
actions:
  - name: build
    bazel_commands: ["bazel build //..."]
    os: linux
retention: 30d
"#,
        );
        assert_eq!(cfg.actions[0].name, "build");
    }

    #[test]
    fn malformed_config_is_a_failed_precondition() {
        let err = WorkflowConfig::load("actions: {not: [a, list".as_bytes()).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    fn action_with_push_on_main() -> Action {
        Action {
            name: "build".into(),
            bazel_commands: vec!["bazel build //...".into()],
            triggers: Some(Triggers {
                push: Some(PushTrigger {
                    branches: vec!["main".into()],
                }),
                pull_request: None,
            }),
        }
    }

    #[test]
    fn push_trigger_matches_listed_branch_only() {
        let action = action_with_push_on_main();
        assert!(matches_any_trigger(&action, "push", "main"));
        assert!(!matches_any_trigger(&action, "push", "dev"));
        // No pull_request sub-record: that event never fires.
        assert!(!matches_any_trigger(&action, "pull_request", "main"));
    }

    #[test]
    fn actions_without_triggers_never_fire() {
        let action = Action {
            name: "manual".into(),
            bazel_commands: vec![],
            triggers: None,
        };
        assert!(!matches_any_trigger(&action, "push", "main"));
        assert!(!matches_any_trigger(&action, "pull_request", "main"));
    }

    #[test]
    fn unknown_events_never_fire() {
        let action = action_with_push_on_main();
        assert!(!matches_any_trigger(&action, "tag", "main"));
        assert!(!matches_any_trigger(&action, "", "main"));
    }
}
