use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use zion_backend::agent::{AgentController, RunOutcome};
use zion_backend::versioning::RestoreTarget;

use crate::render;

const HISTORY_TASKS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Empty,
    Exit,
    Help,
    Reset,
    UndoTask,
    UndoFile,
    Restore(u64),
    History,
    Show(u64),
    Diff(u64),
    Paste,
    Focus(String),
    Unfocus(String),
    Stats,
    Tools,
    Instruction(String),
    Invalid(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ReplCommand::Empty;
        }
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        let index = |usage: &str| -> Result<u64, String> {
            rest.parse::<u64>()
                .map_err(|_| format!("Usage: {} N (N is a backup number)", usage))
        };

        match (head.to_ascii_lowercase().as_str(), rest) {
            ("exit" | "quit", "") => ReplCommand::Exit,
            ("help", "") => ReplCommand::Help,
            ("new" | "reset", "") => ReplCommand::Reset,
            ("undo", "") => ReplCommand::UndoTask,
            ("undo", "--file") => ReplCommand::UndoFile,
            ("undo", _) => index("undo").map_or_else(ReplCommand::Invalid, ReplCommand::Restore),
            ("history" | "log", "") => ReplCommand::History,
            ("show", _) => index("show").map_or_else(ReplCommand::Invalid, ReplCommand::Show),
            ("diff", _) => index("diff").map_or_else(ReplCommand::Invalid, ReplCommand::Diff),
            ("paste", "") => ReplCommand::Paste,
            ("focus", "") | ("unfocus", "") => {
                ReplCommand::Invalid(format!("Usage: {} PATH", head))
            }
            ("focus", path) => ReplCommand::Focus(path.to_string()),
            ("unfocus", path) => ReplCommand::Unfocus(path.to_string()),
            ("/stats", "") => ReplCommand::Stats,
            ("/tools", "") => ReplCommand::Tools,
            _ => ReplCommand::Instruction(line.to_string()),
        }
    }
}

/// Drives the controller from operator input lines.
pub struct Repl {
    controller: AgentController,
    input: flume::Receiver<String>,
    running: Arc<AtomicBool>,
}

impl Repl {
    pub fn new(
        controller: AgentController,
        input: flume::Receiver<String>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            controller,
            input,
            running,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            prompt("\nyou> ");
            let Ok(line) = self.input.recv_async().await else {
                break;
            };
            match ReplCommand::parse(&line) {
                ReplCommand::Empty => {}
                ReplCommand::Exit => break,
                ReplCommand::Help => render::help(),
                ReplCommand::Reset => {
                    self.controller.reset();
                    render::info("Conversation cleared.");
                }
                ReplCommand::UndoTask => match self.controller.versions().undo_task(None) {
                    Ok(entries) => render::restored(&entries),
                    Err(e) => render::error(&format!("{:#}", e)),
                },
                ReplCommand::UndoFile => match self.controller.versions().undo_last() {
                    Ok(entry) => render::restored(&[entry]),
                    Err(e) => render::error(&format!("{:#}", e)),
                },
                ReplCommand::Restore(index) => {
                    match self.controller.versions().restore(RestoreTarget::Index(index)) {
                        Ok(entry) => render::restored(&[entry]),
                        Err(e) => render::error(&format!("{:#}", e)),
                    }
                }
                ReplCommand::History => match self.controller.versions().history(HISTORY_TASKS) {
                    Ok(tasks) => render::history(&tasks),
                    Err(e) => render::error(&format!("{:#}", e)),
                },
                ReplCommand::Show(index) => match self.controller.versions().show_version(index) {
                    Ok(text) => render::info(&text),
                    Err(e) => render::error(&format!("{:#}", e)),
                },
                ReplCommand::Diff(index) => match self.controller.versions().diff(index) {
                    Ok(text) => render::diff(&text),
                    Err(e) => render::error(&format!("{:#}", e)),
                },
                ReplCommand::Paste => {
                    if let Some(text) = self.read_paste().await {
                        self.run_instruction(&text).await;
                    }
                }
                ReplCommand::Focus(path) => self.report(self.controller.focus(&path)),
                ReplCommand::Unfocus(path) => self.report(self.controller.unfocus(&path)),
                ReplCommand::Stats => {
                    let state = if self.controller.analytics_enabled() {
                        "enabled"
                    } else {
                        "disabled"
                    };
                    render::info(&format!("Run analytics {}.", state));
                }
                ReplCommand::Tools => render::tools(),
                ReplCommand::Instruction(text) => self.run_instruction(&text).await,
                ReplCommand::Invalid(usage) => render::error(&usage),
            }
        }
        render::info("Bye.");
        Ok(())
    }

    /// Submit, then keep asking for approval until the run settles.
    async fn run_instruction(&mut self, text: &str) {
        self.running.store(true, Ordering::SeqCst);
        let mut result = self.controller.submit(text).await;
        loop {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    render::error(&format!("{:#}", e));
                    break;
                }
            };
            render::outcome(&outcome);
            if !matches!(outcome, RunOutcome::AwaitingApproval { .. }) {
                break;
            }
            self.running.store(false, Ordering::SeqCst);
            let approved = self.ask_approval().await;
            self.running.store(true, Ordering::SeqCst);
            result = match approved {
                Some(true) => self.controller.approve().await,
                Some(false) => self.controller.reject().await,
                None => break,
            };
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// `None` when input is closed.
    async fn ask_approval(&self) -> Option<bool> {
        loop {
            prompt("Approve? (y/n) ");
            let line = self.input.recv_async().await.ok()?;
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Some(true),
                "n" | "no" => return Some(false),
                _ => render::info("Please answer y or n."),
            }
        }
    }

    async fn read_paste(&self) -> Option<String> {
        render::info("Paste your instruction. End with :q on its own line.");
        let mut lines = Vec::new();
        while let Ok(line) = self.input.recv_async().await {
            if line.trim() == ":q" {
                break;
            }
            lines.push(line);
        }
        let text = lines.join("\n");
        (!text.trim().is_empty()).then_some(text)
    }

    fn report(&self, result: Result<String>) {
        match result {
            Ok(text) if text.starts_with("Error:") => render::error(&text),
            Ok(text) => render::info(&text),
            Err(e) => render::error(&format!("{:#}", e)),
        }
    }
}

fn prompt(text: &str) {
    use std::io::Write;
    print!("{}", text);
    let _ = std::io::stdout().flush();
}
