//! Shell-word helpers for the bazel command lines in the workflow config.
//!
//! Splitting follows POSIX word rules via `shell_words`; quoting is only for
//! rendering a synthetic prompt line into the invocation log and must never
//! be used to build an argument vector for execution.

use std::borrow::Cow;

use crate::error::RunnerError;

/// Split a configured bazel command into an argument vector, dropping a
/// leading `bazel` / `bazelisk` token so the runner can prepend its own
/// launcher.
pub fn bazel_args(command: &str) -> Result<Vec<String>, RunnerError> {
    let mut tokens = shell_words::split(command).map_err(|err| {
        RunnerError::FailedPrecondition(format!(
            "failed to parse bazel command {command:?}: {err}"
        ))
    })?;
    if matches!(tokens.first().map(String::as_str), Some("bazel" | "bazelisk")) {
        tokens.remove(0);
    }
    Ok(tokens)
}

/// Quote a token for display in a shell prompt line.
///
/// Tokens made of `[A-Za-z0-9_@%+=:,./-]` pass through unchanged; anything
/// else is wrapped in single quotes with embedded single quotes escaped as
/// `'"'"'`.
pub fn quote_token(token: &str) -> Cow<'_, str> {
    if token.bytes().all(is_safe_byte) {
        Cow::Borrowed(token)
    } else {
        Cow::Owned(format!("'{}'", token.replace('\'', r#"'"'"'"#)))
    }
}

fn is_safe_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"_@%+=:,./-".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_drops_launcher_token() {
        assert_eq!(
            bazel_args("bazel test //... --config=ci").unwrap(),
            vec!["test", "//...", "--config=ci"]
        );
        assert_eq!(bazel_args("bazelisk version").unwrap(), vec!["version"]);
        // A command that names no launcher runs as-is.
        assert_eq!(
            bazel_args("build //server").unwrap(),
            vec!["build", "//server"]
        );
        assert!(bazel_args("").unwrap().is_empty());
    }

    #[test]
    fn split_honors_quoting() {
        assert_eq!(
            bazel_args(r#"bazel run //tool -- --message 'hello world'"#).unwrap(),
            vec!["run", "//tool", "--", "--message", "hello world"]
        );
        assert!(bazel_args("bazel build 'unterminated").is_err());
    }

    #[test]
    fn safe_tokens_pass_through_unchanged() {
        for token in ["//server:all", "--config=ci", "a_b-c.d/e,f@g%h+i", ""] {
            assert_eq!(quote_token(token), token);
        }
    }

    #[test]
    fn unsafe_tokens_are_single_quoted() {
        assert_eq!(quote_token("hello world"), "'hello world'");
        assert_eq!(quote_token("a\"b"), "'a\"b'");
        assert_eq!(quote_token("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn embedded_single_quotes_round_trip() {
        assert_eq!(quote_token("it's"), r#"'it'"'"'s'"#);
    }
}
