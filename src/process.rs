//! Subprocess invocation shared by every external collaborator.
//!
//! Commands run to completion with captured output. There is no timeout:
//! a stuck allocator or IaC call stalls the saga until it returns.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, _) => self.stderr.trim_end().to_string(),
        }
    }

    /// Last `lines` lines of the combined output, for error messages.
    pub fn tail(&self, lines: usize) -> String {
        let combined = self.combined();
        let all: Vec<&str> = combined.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// Short failure description: exit code plus the output tail.
    pub fn failure_summary(&self) -> String {
        let tail = self.tail(15);
        if tail.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            format!("exit code {}: {}", self.exit_code, tail)
        }
    }
}

/// Run `program args...` in `cwd` with extra environment, capturing output.
pub async fn run(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    envs: &[(String, String)],
) -> Result<CommandOutput> {
    let command_line = format!("{} {}", program, args.join(" "));
    tracing::debug!(command = %command_line, cwd = ?cwd, "spawning");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let start = Instant::now();
    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to spawn: {}", program))?;

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    tracing::debug!(
        command = %command_line,
        exit_code = result.exit_code,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "completed"
    );
    if !result.success() && !result.stderr.trim().is_empty() {
        tracing::debug!(stderr = %result.stderr.trim(), "command stderr");
    }

    Ok(result)
}

/// Split a configured command such as `python3 /opt/scripts/x.py` into
/// program and leading arguments.
pub fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .with_context(|| format!("Empty command '{}'", command))?;
    Ok((program, parts.collect()))
}

/// Run a configured command line with additional arguments.
pub async fn run_command_line(
    command: &str,
    extra_args: Vec<String>,
    cwd: Option<&Path>,
    envs: &[(String, String)],
) -> Result<CommandOutput> {
    let (program, mut args) = split_command(command)?;
    args.extend(extra_args);
    run(&program, &args, cwd, envs).await
}

/// Convenience for string-literal argument lists.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
