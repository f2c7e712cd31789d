//! Terminal output. Printing is the product here, so this is the one place that
//! writes to stdout directly.

use zion_backend::agent::{AgentEvent, AgentStatus, RunOutcome};
use zion_backend::interpreter::ToolInvocation;
use zion_backend::tools::ActionKind;
use zion_backend::versioning::{BackupEntry, TaskSummary};

const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

const PREVIEW_LINES: usize = 12;

pub fn banner(workspace: &str, model: &str, analytics: bool) {
    println!("{BOLD}Zion{RESET} {DIM}({model}){RESET}");
    println!("{DIM}workspace: {workspace}{RESET}");
    if analytics {
        println!("{DIM}run analytics: on{RESET}");
    }
    println!("{DIM}Type an instruction, or `help` for commands.{RESET}");
}

pub fn help() {
    println!(
        "Commands:
  exit | quit        leave
  new | reset        clear the conversation
  undo               undo every change of the last task
  undo --file        restore the most recent backup only
  undo N             restore backup #N
  history | log      recent tasks
  show N             print backup #N
  diff N             diff backup #N against the current file
  paste              multi-line instruction, end with :q
  focus PATH         pin a file into every prompt
  unfocus PATH       unpin a file
  /stats             analytics status
  /tools             list the agent's actions
Anything else is sent to the agent as an instruction."
    );
}

pub fn event(event: &AgentEvent) {
    match event {
        AgentEvent::StatusChanged(AgentStatus::Thinking) => {}
        AgentEvent::StatusChanged(status) => tracing::debug!("status: {:?}", status),
        AgentEvent::Thinking { attempt } if *attempt > 1 => {
            println!("{YELLOW}retrying ({attempt})...{RESET}");
        }
        AgentEvent::Thinking { .. } => println!("{DIM}thinking...{RESET}"),
        AgentEvent::GuardFired { guard, attempt } => {
            println!("{YELLOW}! {guard} guard rejected attempt {attempt}, retrying{RESET}");
        }
        AgentEvent::LoopIntervention(message) => {
            println!("{YELLOW}! loop detected: {}{RESET}", first_line(message));
        }
        AgentEvent::AssistantMessage(text) => {
            println!("\n{CYAN}zion>{RESET} {}", text.trim());
        }
        AgentEvent::ToolStarted { tool, summary } => {
            println!("{BOLD}> {tool}{RESET} {DIM}{summary}{RESET}");
        }
        AgentEvent::FileDiff { path, diff } => {
            println!("{DIM}--- proposed change to {path} ---{RESET}");
            for line in diff.lines() {
                diff_line(line);
            }
        }
        AgentEvent::CommandOutput { line } => println!("{DIM}| {line}{RESET}"),
        AgentEvent::ToolFinished {
            tool,
            output,
            is_error,
        } => {
            let (color, mark) = if *is_error { (RED, "x") } else { (GREEN, "ok") };
            println!("{color}{mark} {tool}{RESET}");
            for line in output.lines().take(PREVIEW_LINES) {
                println!("  {DIM}{line}{RESET}");
            }
            let total = output.lines().count();
            if total > PREVIEW_LINES {
                println!("  {DIM}... ({} more lines){RESET}", total - PREVIEW_LINES);
            }
        }
        AgentEvent::Advisory(text) => println!("{DIM}hint: {text}{RESET}"),
        AgentEvent::Error(error) => println!("{RED}error: {error}{RESET}"),
    }
}

pub fn outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed { .. } => println!("{GREEN}done{RESET}"),
        RunOutcome::AwaitingApproval { invocation } => approval_request(invocation),
        RunOutcome::IterationLimit => {
            println!("{YELLOW}Stopped: iteration limit reached. Send another instruction to continue.{RESET}")
        }
        RunOutcome::Failed { error } => {
            println!("{RED}Failed: {error}{RESET}");
            println!("{DIM}Tip: simplify the request or check that the model backend is running.{RESET}");
        }
        RunOutcome::Cancelled => println!("{YELLOW}Task cancelled by user{RESET}"),
    }
}

fn approval_request(invocation: &ToolInvocation) {
    let args = serde_json::to_string_pretty(&invocation.args).unwrap_or_default();
    println!("\n{BOLD}{YELLOW}Approval needed:{RESET} {BOLD}{}{RESET}", invocation.tool);
    for line in args.lines().take(PREVIEW_LINES * 2) {
        println!("  {line}");
    }
}

pub fn tools() {
    for kind in ActionKind::ALL {
        println!(
            "{BOLD}{:<14}{RESET} {DIM}[{}]{RESET} {}",
            kind.name(),
            kind.category().as_str(),
            kind.description()
        );
    }
}

pub fn history(tasks: &[TaskSummary]) {
    if tasks.is_empty() {
        println!("No history yet.");
        return;
    }
    for task in tasks {
        println!(
            "{BOLD}#{}{RESET} {DIM}{}{RESET} {}",
            task.first_index, task.time_display, task.message
        );
        for file in &task.files {
            println!("    {DIM}{file}{RESET}");
        }
    }
}

pub fn restored(entries: &[BackupEntry]) {
    if entries.is_empty() {
        println!("Nothing to undo.");
        return;
    }
    for entry in entries {
        println!("{GREEN}restored{RESET} {} {DIM}(#{}){RESET}", entry.relative_path, entry.index);
    }
}

pub fn diff(text: &str) {
    for line in text.lines() {
        diff_line(line);
    }
}

pub fn info(text: &str) {
    println!("{text}");
}

pub fn error(text: &str) {
    println!("{RED}{text}{RESET}");
}

fn diff_line(line: &str) {
    if line.starts_with("+++") || line.starts_with("---") {
        println!("{BOLD}{line}{RESET}");
    } else if line.starts_with('+') {
        println!("{GREEN}{line}{RESET}");
    } else if line.starts_with('-') {
        println!("{RED}{line}{RESET}");
    } else if line.starts_with("@@") {
        println!("{CYAN}{line}{RESET}");
    } else {
        println!("{line}");
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
