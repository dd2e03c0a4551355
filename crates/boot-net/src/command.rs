use std::process::Command;

use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Format a human-readable display string for a command invocation.
///
/// Commands that run inside a specific namespace are prefixed with
/// `[netns <name>]` so log lines show where they executed.
pub(crate) fn format_command_display(program: &str, args: &[&str], netns: Option<&str>) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    let line = parts.join(" ");
    match netns {
        Some(ns) => format!("[netns {ns}] {line}"),
        None => line,
    }
}

/// Run a prepared command and capture its output.
///
/// Returns trimmed stdout on success, trimmed stderr as the error detail on
/// a non-zero exit.
pub(crate) fn run(mut command: Command, display: String) -> Result<String, CommandError> {
    let command_display = display.as_str();
    trace!(command = %command_display, "exec");

    let output = command.output().map_err(|e| CommandError {
        command: display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: display,
            detail: format!("{} ({stderr})", output.status),
        })
    }
}

/// Execute a program in the current namespace.
pub(crate) fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let mut command = Command::new(program);
    command.args(args);
    run(command, format_command_display(program, args, None))
}
