//! `run_command`: shell execution with a hard deadline.
//!
//! Ordinary commands run buffered through `/bin/sh -c`. Commands expected to
//! prompt (scaffolding tools, or an explicit `interactive` flag) run inside a
//! pseudo-terminal; their output is streamed to the UI as it arrives, prompts
//! included, and operator lines are forwarded to the process.

use std::io::{Read, Write};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::safety::strip_ansi;
use super::{lenient, ToolContext};
use crate::agent::AgentEvent;

const PTY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PTY_READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub interactive_patterns: Vec<String>,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            max_timeout_secs: 600,
            interactive_patterns: vec![
                "create-next-app".into(),
                "create-react-app".into(),
                "create-vite".into(),
                "npm init".into(),
                "npx create".into(),
            ],
        }
    }
}

impl ShellSettings {
    pub fn wants_pty(&self, args: &CommandArgs) -> bool {
        args.interactive.unwrap_or(false)
            || self
                .interactive_patterns
                .iter()
                .any(|p| args.command.contains(p.as_str()))
    }

    fn timeout_for(&self, args: &CommandArgs) -> u64 {
        match args.timeout {
            Some(secs) if secs > 0 => (secs as u64).min(self.max_timeout_secs),
            _ => self.default_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandArgs {
    #[serde(alias = "cmd")]
    pub command: String,
    #[serde(default, alias = "timeout_secs", deserialize_with = "lenient::opt_int")]
    pub timeout: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub interactive: Option<bool>,
}

pub async fn run_command(
    args: &CommandArgs,
    ctx: &ToolContext,
    cancel: &CancellationToken,
) -> Result<String> {
    if args.command.trim().is_empty() {
        return Ok("Error: `command` cannot be empty.".to_string());
    }
    let timeout_secs = ctx.shell.timeout_for(args);

    if ctx.shell.wants_pty(args) {
        tracing::info!("run_command (pty, {}s): {}", timeout_secs, args.command);
        let job = PtyJob {
            command: args.command.clone(),
            workspace: ctx.workspace.display().to_string(),
            timeout: Duration::from_secs(timeout_secs),
            cancel: cancel.clone(),
            events: ctx.events.clone(),
            input: ctx.operator_input.clone(),
        };
        return tokio::task::spawn_blocking(move || job.run())
            .await
            .context("pty task panicked")?;
    }

    tracing::info!("run_command ({}s): {}", timeout_secs, args.command);
    run_buffered(&args.command, ctx, timeout_secs, cancel).await
}

async fn run_buffered(
    command: &str,
    ctx: &ToolContext,
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<String> {
    let child = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(&ctx.workspace)
        .env("CI", "true")
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn `{}`", command))?;

    // Dropping the wait future drops the child, which kills it.
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Ok("Error: Command cancelled by operator.".to_string());
        }
        result = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()) => {
            match result {
                Ok(output) => output.context("Failed to collect command output")?,
                Err(_) => {
                    tracing::warn!("Command timed out after {}s: {}", timeout_secs, command);
                    return Ok(format!("Error: Command timed out after {} seconds.", timeout_secs));
                }
            }
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        text.push_str(&format!("\nSTDERR:\n{}", stderr));
    }
    let code = output.status.code().unwrap_or(-1);
    Ok(format_result(&strip_ansi(&text), code))
}

/// Non-zero exits carry the `Error:` marker so the loop treats them as failures.
fn format_result(output: &str, code: i32) -> String {
    let body = output.trim_end();
    match (body.trim().is_empty(), code == 0) {
        (true, true) => "Command completed successfully".to_string(),
        (true, false) => format!("Error: Command failed with exit code {}", code),
        (false, true) => body.to_string(),
        (false, false) => format!("Error: Command exited with code {}\n{}", code, body),
    }
}

struct PtyJob {
    command: String,
    workspace: String,
    timeout: Duration,
    cancel: CancellationToken,
    events: Option<flume::Sender<AgentEvent>>,
    input: Option<flume::Receiver<String>>,
}

impl PtyJob {
    fn run(self) -> Result<String> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open pseudo-terminal")?;

        let mut builder = CommandBuilder::new("/bin/sh");
        builder.arg("-c");
        builder.arg(&self.command);
        builder.cwd(&self.workspace);
        builder.env("TERM", "dumb");
        builder.env("CI", "false");

        let mut child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("Failed to spawn `{}`", self.command))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to read pseudo-terminal")?;
        let mut writer = pair
            .master
            .take_writer()
            .context("Failed to write pseudo-terminal")?;

        let (tx, rx) = flume::unbounded::<Vec<u8>>();
        std::thread::spawn(move || {
            let mut buf = [0u8; PTY_READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let deadline = Instant::now() + self.timeout;
        let mut output = PtyOutput::default();
        let status = loop {
            self.drain(&rx, &mut output);

            if let Some(input) = &self.input {
                while let Ok(line) = input.try_recv() {
                    if writer.write_all(format!("{}\n", line).as_bytes()).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            }

            if self.cancel.is_cancelled() {
                let _ = child.kill();
                return Ok("Error: Command cancelled by operator.".to_string());
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                tracing::warn!("Interactive command timed out: {}", self.command);
                return Ok(format!(
                    "Error: Command timed out after {} seconds.",
                    self.timeout.as_secs()
                ));
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(e).context("Failed to poll command"),
            }
            std::thread::sleep(PTY_POLL_INTERVAL);
        };

        // Pick up anything the reader forwarded after exit.
        std::thread::sleep(PTY_POLL_INTERVAL);
        self.drain(&rx, &mut output);
        let lines = output.finish();

        let code = status.exit_code() as i32;
        if lines.is_empty() {
            return Ok(if status.success() {
                format!("Exit code: {}", code)
            } else {
                format!("Error: Command failed with exit code {}", code)
            });
        }
        Ok(format_result(&lines.join("\n"), code))
    }

    fn drain(&self, rx: &flume::Receiver<Vec<u8>>, output: &mut PtyOutput) {
        let mut shown = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            shown.extend(output.push(&chunk));
        }
        shown.extend(output.flush_partial());
        if let Some(events) = &self.events {
            for line in shown {
                let _ = events.try_send(AgentEvent::CommandOutput { line });
            }
        }
    }
}

/// Reassembles raw pty chunks into lines.
///
/// A trailing line with no newline yet (typically a prompt) is shown as soon as
/// a poll finds nothing more behind it; when the line completes, only the part
/// not already shown goes to the UI, while the result keeps the whole line.
#[derive(Debug, Default)]
struct PtyOutput {
    pending: Vec<u8>,
    shown: usize,
    lines: Vec<String>,
}

impl PtyOutput {
    /// Returns the display text for each line the chunk completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut display = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let unseen = clean_chunk(&raw[self.shown.min(raw.len())..]);
            self.shown = 0;
            let line = clean_chunk(&raw);
            if line.trim().is_empty() {
                continue;
            }
            if !unseen.trim().is_empty() {
                display.push(unseen);
            }
            self.lines.push(line);
        }
        display
    }

    fn flush_partial(&mut self) -> Option<String> {
        if self.pending.len() <= self.shown {
            return None;
        }
        let text = clean_chunk(&self.pending[self.shown..]);
        self.shown = self.pending.len();
        (!text.trim().is_empty()).then_some(text)
    }

    fn finish(mut self) -> Vec<String> {
        let rest = clean_chunk(&self.pending);
        if !rest.trim().is_empty() {
            self.lines.push(rest);
        }
        self.lines
    }
}

fn clean_chunk(raw: &[u8]) -> String {
    strip_ansi(String::from_utf8_lossy(raw).trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_context;

    fn args(command: &str, timeout: Option<i64>) -> CommandArgs {
        CommandArgs {
            command: command.to_string(),
            timeout,
            interactive: None,
        }
    }

    #[tokio::test]
    async fn echo_is_captured() {
        let (_dir, ctx) = test_context();
        let out = run_command(&args("echo hello", None), &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn silent_success_and_failure_are_described() {
        let (_dir, ctx) = test_context();
        let cancel = CancellationToken::new();
        assert_eq!(
            run_command(&args("true", None), &ctx, &cancel).await.unwrap(),
            "Command completed successfully"
        );
        assert_eq!(
            run_command(&args("exit 3", None), &ctx, &cancel).await.unwrap(),
            "Error: Command failed with exit code 3"
        );
    }

    #[tokio::test]
    async fn stderr_is_appended() {
        let (_dir, ctx) = test_context();
        let out = run_command(&args("echo out; echo err >&2", None), &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "out\n\nSTDERR:\nerr");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let (_dir, ctx) = test_context();
        let started = Instant::now();
        let out = run_command(&args("sleep 5", Some(1)), &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "Error: Command timed out after 1 seconds.");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancellation_aborts_immediately() {
        let (_dir, ctx) = test_context();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let out = run_command(&args("sleep 5", None), &ctx, &cancel).await.unwrap();
        assert!(out.contains("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn commands_run_in_the_workspace() {
        let (dir, ctx) = test_context();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = run_command(&args("ls marker.txt", None), &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "marker.txt");
    }

    #[test]
    fn scaffolding_commands_use_a_pty() {
        let settings = ShellSettings::default();
        assert!(settings.wants_pty(&args("npx create-next-app my-app", None)));
        assert!(!settings.wants_pty(&args("cargo test", None)));
        let explicit = CommandArgs {
            interactive: Some(true),
            ..args("python3", None)
        };
        assert!(settings.wants_pty(&explicit));
    }

    #[test]
    fn prompts_without_newline_are_shown_before_input() {
        let mut output = PtyOutput::default();
        assert_eq!(output.push(b"Creating app\r\nPassword: "), vec!["Creating app"]);
        assert_eq!(output.flush_partial().as_deref(), Some("Password:"));
        assert_eq!(output.flush_partial(), None);

        assert_eq!(output.push(b"\r\nDone\r\n"), vec!["Done"]);
        assert_eq!(output.finish(), vec!["Creating app", "Password:", "Done"]);
    }

    #[test]
    fn completed_prompt_lines_show_only_the_new_part() {
        let mut output = PtyOutput::default();
        assert!(output.push(b"Project name? ").is_empty());
        assert_eq!(output.flush_partial().as_deref(), Some("Project name?"));
        assert_eq!(output.push(b"my-app\n\x1b[32mok\x1b[0m\n"), vec!["my-app", "ok"]);
        assert_eq!(output.finish(), vec!["Project name? my-app", "ok"]);
    }

    #[test]
    fn split_chunks_join_into_one_line() {
        let mut output = PtyOutput::default();
        assert!(output.push(b"hel").is_empty());
        assert_eq!(output.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(output.finish(), vec!["hello", "wor"]);
    }

    #[test]
    fn timeout_is_capped() {
        let settings = ShellSettings::default();
        assert_eq!(settings.timeout_for(&args("x", Some(10_000))), 600);
        assert_eq!(settings.timeout_for(&args("x", None)), 120);
        assert_eq!(settings.timeout_for(&args("x", Some(-4))), 120);
    }
}
