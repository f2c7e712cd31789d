//! The control loop.
//!
//! `AgentController` owns the conversation, the focus set, the loop detector and
//! the action registry for one workspace. A run starts with [`AgentController::submit`]
//! and proceeds `thinking -> (waiting_approval) -> thinking ...` until the model
//! answers without a tool call, the iteration cap is hit, the gateway gives up,
//! or the operator interrupts. Observers receive [`AgentEvent`]s over a channel;
//! nothing they do feeds back into the loop.

pub mod prompt;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::analytics::{RunObservation, RunObserver};
use crate::config::AgentConfig;
use crate::conversation::Conversation;
use crate::focus::FocusSet;
use crate::gateway::{call_with_deadline, GatewayError, ModelGateway};
use crate::guards::{GuardPipeline, GuardViolation, LoopDetector};
use crate::interpreter::{interpret, ToolInvocation};
use crate::retry::{retry_with_corrections, Attempt, RetryOutcome};
use crate::tools::approval::{ApprovalDecision, ApprovalGate, ApprovalPolicy};
use crate::tools::context::{self as focus_tools, PathArgs};
use crate::tools::shell::ShellSettings;
use crate::tools::{Action, ActionRegistry, ToolContext, ToolResult};
use crate::versioning::diff::unified_diff;
use crate::versioning::VersionStore;

/// Responses shorter than this that mention a timeout are treated as one.
const TIMEOUT_PHRASE_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    WaitingApproval,
    /// Terminal until `reset()`.
    Error,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    StatusChanged(AgentStatus),
    Thinking { attempt: usize },
    GuardFired { guard: String, attempt: usize },
    LoopIntervention(String),
    ToolStarted { tool: String, summary: String },
    ToolFinished { tool: String, output: String, is_error: bool },
    FileDiff { path: String, diff: String },
    CommandOutput { line: String },
    AssistantMessage(String),
    Advisory(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { response: String },
    AwaitingApproval { invocation: ToolInvocation },
    IterationLimit,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub status: AgentStatus,
    pub pending_invocation: Option<ToolInvocation>,
    pub last_action: Option<String>,
    pub iterations: usize,
}

/// Cancels whichever run segment is currently active. Cheap to clone and safe to
/// use while the controller itself is busy.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        if let Ok(token) = self.current.lock() {
            tracing::info!("Operator interrupt");
            token.cancel();
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn renew(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        if let Ok(mut token) = self.current.lock() {
            *token = fresh.clone();
        }
        fresh
    }
}

struct PendingAction {
    invocation: ToolInvocation,
    action: Action,
}

enum Step {
    Invoke(ToolInvocation),
    Complete(String),
    Failed { error: String, fatal: bool },
    Cancelled,
}

pub struct AgentController {
    config: AgentConfig,
    workspace: PathBuf,
    gateway: Arc<dyn ModelGateway>,
    registry: ActionRegistry,
    versions: Arc<VersionStore>,
    focus: Arc<Mutex<FocusSet>>,
    conversation: Conversation,
    guards: GuardPipeline,
    loop_detector: LoopDetector,
    approval: ApprovalGate,
    master_prompt: String,
    status: AgentStatus,
    pending: Option<PendingAction>,
    last_action: Option<String>,
    iterations: usize,
    interrupt: InterruptHandle,
    cancel: CancellationToken,
    events: Option<flume::Sender<AgentEvent>>,
    observer: Option<Arc<dyn RunObserver>>,
    session_id: String,
    run: Option<RunObservation>,
}

impl AgentController {
    pub fn new(
        config: AgentConfig,
        workspace: impl Into<PathBuf>,
        gateway: Arc<dyn ModelGateway>,
    ) -> Result<Self> {
        let workspace = workspace.into();
        let workspace = workspace.canonicalize().unwrap_or(workspace);
        let versions = Arc::new(VersionStore::open(
            &workspace,
            &config.backup_dir_name,
            config.retained_tasks,
        )?);
        let focus = Arc::new(Mutex::new(FocusSet::new(config.focus_line_limit)));
        let shell = ShellSettings {
            default_timeout_secs: config.command_timeout_secs,
            max_timeout_secs: config.max_command_timeout_secs,
            interactive_patterns: config.interactive_patterns.clone(),
        };
        let registry = ActionRegistry::new(ToolContext::new(
            workspace.clone(),
            versions.clone(),
            focus.clone(),
            shell,
        ));
        let guards = GuardPipeline::new(registry.names(), &config.loop_detection);
        let loop_detector = LoopDetector::new(config.loop_detection.clone());
        let approval = ApprovalGate::new(config.safe_tools.iter().cloned(), config.auto_approve);

        tracing::info!(
            "Agent ready: workspace {}, model {}",
            workspace.display(),
            gateway.describe()
        );

        let interrupt = InterruptHandle::default();
        let cancel = interrupt.token();
        let mut controller = Self {
            config,
            workspace,
            gateway,
            registry,
            versions,
            focus,
            conversation: Conversation::new(),
            guards,
            loop_detector,
            approval,
            master_prompt: prompt::master_prompt(),
            status: AgentStatus::Idle,
            pending: None,
            last_action: None,
            iterations: 0,
            interrupt,
            cancel,
            events: None,
            observer: None,
            session_id: uuid::Uuid::new_v4().to_string(),
            run: None,
        };
        controller.prime_workspace();
        Ok(controller)
    }

    pub fn with_events(mut self, events: flume::Sender<AgentEvent>) -> Self {
        self.registry.context_mut().events = Some(events.clone());
        self.events = Some(events);
        self
    }

    /// Lines typed by the operator while an interactive command is running.
    pub fn with_operator_input(mut self, input: flume::Receiver<String>) -> Self {
        self.registry.context_mut().operator_input = Some(input);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    // ========================================================================
    // Operator surface
    // ========================================================================

    /// Start a run for a new instruction. Opens a version-store task first.
    pub async fn submit(&mut self, instruction: &str) -> Result<RunOutcome> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(anyhow!("Instruction is empty"));
        }
        if self.status == AgentStatus::Error {
            return Err(anyhow!("Agent is in the error state; reset before submitting"));
        }
        if let Some(dropped) = self.pending.take() {
            tracing::warn!(
                "Dropping pending {} call for a new instruction",
                dropped.invocation.tool
            );
        }
        self.finish_run(false, Some("superseded by a new instruction".to_string()));

        match self.versions.set_task(instruction) {
            Ok(task_id) => tracing::debug!("Opened task {}", task_id),
            Err(e) => tracing::warn!("Failed to open version task: {:#}", e),
        }
        self.conversation.add_user(instruction);
        self.loop_detector.clear();
        self.iterations = 0;
        self.run = Some(RunObservation::new(&self.session_id, instruction));
        self.cancel = self.interrupt.renew();
        Ok(self.drive().await)
    }

    pub async fn approve(&mut self) -> Result<RunOutcome> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("No tool call is awaiting approval"))?;
        tracing::info!("Operator approved {}", pending.action.summary());
        self.cancel = self.interrupt.renew();
        self.execute(pending).await;
        Ok(self.drive().await)
    }

    pub async fn reject(&mut self) -> Result<RunOutcome> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("No tool call is awaiting approval"))?;
        tracing::info!("Operator rejected {}", pending.action.summary());
        self.last_action = Some(format!("Rejected {}", pending.invocation.tool));
        self.conversation.add_user("Tool execution cancelled by user.");
        self.cancel = self.interrupt.renew();
        Ok(self.drive().await)
    }

    /// Clear the conversation and control state, then re-prime the workspace.
    /// The focus set and the version history survive.
    pub fn reset(&mut self) {
        self.finish_run(false, Some("reset by operator".to_string()));
        self.conversation.clear();
        self.loop_detector.clear();
        self.pending = None;
        self.last_action = None;
        self.iterations = 0;
        self.set_status(AgentStatus::Idle);
        self.prime_workspace();
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            status: self.status,
            pending_invocation: self.pending.as_ref().map(|p| p.invocation.clone()),
            last_action: self.last_action.clone(),
            iterations: self.iterations,
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn versions(&self) -> Arc<VersionStore> {
        self.versions.clone()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn model_label(&self) -> String {
        self.gateway.describe()
    }

    pub fn analytics_enabled(&self) -> bool {
        self.observer.is_some()
    }

    pub fn set_auto_approve(&mut self, enabled: bool) {
        self.approval.set_policy(if enabled {
            ApprovalPolicy::AlwaysAllow
        } else {
            ApprovalPolicy::SafeSetOnly
        });
    }

    pub fn focus(&self, path: &str) -> Result<String> {
        focus_tools::focus_file(&PathArgs { path: path.to_string() }, self.registry.context())
    }

    pub fn unfocus(&self, path: &str) -> Result<String> {
        focus_tools::unfocus_file(&PathArgs { path: path.to_string() }, self.registry.context())
    }

    pub fn focused_files(&self) -> Vec<PathBuf> {
        self.focus
            .lock()
            .map(|f| f.paths().cloned().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Loop
    // ========================================================================

    async fn drive(&mut self) -> RunOutcome {
        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }
            if self.iterations >= self.config.max_iterations {
                tracing::warn!("Iteration limit ({}) reached", self.config.max_iterations);
                self.set_status(AgentStatus::Idle);
                self.finish_run(false, Some("iteration limit reached".to_string()));
                return RunOutcome::IterationLimit;
            }
            self.iterations += 1;
            self.set_status(AgentStatus::Thinking);

            match self.think().await {
                Step::Cancelled => return self.cancelled(),
                Step::Failed { error, fatal } => {
                    tracing::error!("Run failed: {}", error);
                    self.conversation.add_assistant(format!("Error: {}", error));
                    self.emit(AgentEvent::Error(error.clone()));
                    self.last_action = Some(if fatal {
                        "Error (fatal)".to_string()
                    } else {
                        "Error (recoverable)".to_string()
                    });
                    self.set_status(if fatal {
                        AgentStatus::Error
                    } else {
                        AgentStatus::Idle
                    });
                    self.finish_run(false, Some(error.clone()));
                    return RunOutcome::Failed { error };
                }
                Step::Complete(response) => {
                    self.last_action = Some("Generated response".to_string());
                    self.set_status(AgentStatus::Idle);
                    self.finish_run(true, None);
                    return RunOutcome::Completed { response };
                }
                Step::Invoke(invocation) => {
                    let action = match Action::from_invocation(&invocation) {
                        Ok(action) => action,
                        Err(e) => {
                            tracing::warn!("Rejected invocation of {}: {}", invocation.tool, e);
                            self.loop_detector.record(&invocation);
                            let result =
                                ToolResult::new(invocation.tool.clone(), format!("Error: {}", e));
                            self.fold_result(&result, None);
                            continue;
                        }
                    };
                    match self.approval.check(action.kind().name(), &action.summary()) {
                        ApprovalDecision::Approved => {
                            self.execute(PendingAction { invocation, action }).await;
                        }
                        ApprovalDecision::NeedsApproval {
                            tool_name,
                            description,
                        } => {
                            tracing::info!("{} awaits approval: {}", tool_name, description);
                            self.pending = Some(PendingAction {
                                invocation: invocation.clone(),
                                action,
                            });
                            self.set_status(AgentStatus::WaitingApproval);
                            return RunOutcome::AwaitingApproval { invocation };
                        }
                    }
                }
            }
        }
    }

    /// One model step: call the gateway with bounded retries, screening each
    /// response through the guards. Corrections live only in the retried prompt.
    async fn think(&mut self) -> Step {
        let focus_block = match self.focus.lock() {
            Ok(focus) => focus.render(),
            Err(e) => {
                tracing::warn!("Focus set unavailable: {}", e);
                None
            }
        };
        let history = self.conversation.turns().to_vec();
        let master = self.master_prompt.as_str();
        let gateway = self.gateway.clone();
        let cancel = self.cancel.clone();
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let retries = self.config.gateway_retries.max(1);
        let guards = &self.guards;
        let events = self.events.clone();

        let outcome = retry_with_corrections(retries, |attempt, corrections| {
            let turns = prompt::assemble(master, focus_block.clone(), &history, &corrections);
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            let events = events.clone();
            async move {
                notify(&events, AgentEvent::Thinking { attempt: attempt + 1 });
                let text =
                    match call_with_deadline(gateway.as_ref(), &turns, timeout, &cancel).await {
                        Ok(text) => text,
                        Err(GatewayError::Cancelled) => {
                            return Attempt::Abort("cancelled by operator".to_string())
                        }
                        Err(e @ GatewayError::Api { status: 401 | 403, .. }) => {
                            return Attempt::Abort(e.to_string())
                        }
                        Err(e) => return Attempt::Fail(e.to_string()),
                    };
                if looks_like_timeout(&text) {
                    return Attempt::Fail("LLM request timed out".to_string());
                }
                match screen(guards, &text) {
                    Ok(invocation) => Attempt::Accept((text, invocation)),
                    Err(violation) => {
                        tracing::warn!(
                            "Guard {} fired on attempt {}",
                            violation.kind.as_str(),
                            attempt + 1
                        );
                        notify(
                            &events,
                            AgentEvent::GuardFired {
                                guard: violation.kind.as_str().to_string(),
                                attempt: attempt + 1,
                            },
                        );
                        Attempt::Correct {
                            reason: format!("{} guard", violation.kind.as_str()),
                            correction: violation.correction,
                        }
                    }
                }
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success((text, invocation))
            | RetryOutcome::Corrected {
                value: (text, invocation),
                ..
            } => {
                self.conversation.add_assistant(text.clone());
                self.emit(AgentEvent::AssistantMessage(text.clone()));
                if let Some(run) = self.run.as_mut() {
                    if run.plan_text.is_empty() {
                        run.plan_text = text.clone();
                    }
                }
                match invocation {
                    Some(invocation) => Step::Invoke(invocation),
                    None => Step::Complete(text),
                }
            }
            RetryOutcome::Exhausted { last_error, .. } => Step::Failed {
                error: format!("LLM failed after {} attempts: {}", retries, last_error),
                fatal: false,
            },
            RetryOutcome::Aborted(reason) => {
                if self.cancel.is_cancelled() {
                    Step::Cancelled
                } else {
                    Step::Failed {
                        error: reason,
                        fatal: true,
                    }
                }
            }
        }
    }

    async fn execute(&mut self, pending: PendingAction) {
        let PendingAction { invocation, action } = pending;
        let tool = action.kind().name().to_string();
        self.loop_detector.record(&invocation);
        self.set_status(AgentStatus::Thinking);
        self.emit(AgentEvent::ToolStarted {
            tool: tool.clone(),
            summary: action.summary(),
        });
        if let Some((path, diff)) = self.preview_diff(&action) {
            self.emit(AgentEvent::FileDiff { path, diff });
        }

        let result = self.registry.execute(&action, &self.cancel).await;

        self.emit(AgentEvent::ToolFinished {
            tool: tool.clone(),
            output: result.output.clone(),
            is_error: result.is_error,
        });
        self.last_action = Some(format!("Executed {}", tool));
        self.fold_result(&result, Some(&action));
    }

    /// Append a result turn, update the run record, then apply loop interventions.
    fn fold_result(&mut self, result: &ToolResult, action: Option<&Action>) {
        if let Some(run) = self.run.as_mut() {
            run.tool_call_count += 1;
            if result.is_error {
                run.error_texts.push(result.output.clone());
            } else if let Some(path) = action
                .filter(|a| a.mutates_files())
                .and_then(Action::target_path)
            {
                if !run.files_touched.iter().any(|p| p == path) {
                    run.files_touched.push(path.to_string());
                }
            }
        }
        self.conversation.add_user(result.to_turn_text());

        for intervention in self.loop_detector.check() {
            tracing::warn!("Loop intervention: {:?}", intervention.kind);
            self.emit(AgentEvent::LoopIntervention(intervention.message.clone()));
            self.conversation.add_user(intervention.message);
        }
    }

    /// Diff between the current file and what a write/edit would leave behind.
    fn preview_diff(&self, action: &Action) -> Option<(String, String)> {
        let (shown, proposed, current) = match action {
            Action::WriteFile(args) => {
                let path = self.registry.context().resolve(&args.path);
                let current = std::fs::read_to_string(path).unwrap_or_default();
                (args.path.clone(), args.content.clone(), current)
            }
            Action::EditFile(args) => {
                let path = self.registry.context().resolve(&args.path);
                let current = std::fs::read_to_string(path).ok()?;
                if args.target.is_empty() || current.matches(args.target.as_str()).count() != 1 {
                    return None;
                }
                let proposed = current.replacen(args.target.as_str(), &args.replacement, 1);
                (args.path.clone(), proposed, current)
            }
            _ => return None,
        };
        let diff = unified_diff(
            &current,
            &proposed,
            &format!("a/{}", shown),
            &format!("b/{}", shown),
        );
        (!diff.is_empty()).then_some((shown, diff))
    }

    fn cancelled(&mut self) -> RunOutcome {
        tracing::info!("Run cancelled");
        self.pending = None;
        self.last_action = Some("Cancelled".to_string());
        self.set_status(AgentStatus::Idle);
        self.finish_run(false, Some("cancelled by operator".to_string()));
        RunOutcome::Cancelled
    }

    fn prime_workspace(&mut self) {
        self.conversation
            .add_user(prompt::workspace_primer(&self.workspace));
        tracing::debug!("Loaded project context from {}", self.workspace.display());
    }

    /// Hand the finished run to the observer without waiting for it.
    fn finish_run(&mut self, completed: bool, error: Option<String>) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        run.completed = completed;
        if let Some(error) = error {
            run.error_texts.push(error);
        }
        let Some(observer) = self.observer.clone() else {
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            match observer.observe(run).await {
                Ok(advice) => {
                    for line in advice {
                        tracing::info!("Advisory: {}", line);
                        notify(&events, AgentEvent::Advisory(line));
                    }
                }
                Err(e) => tracing::debug!("Run observer failed: {:#}", e),
            }
        });
    }

    fn set_status(&mut self, status: AgentStatus) {
        if self.status != status {
            tracing::debug!("Status {:?} -> {:?}", self.status, status);
            self.status = status;
            self.emit(AgentEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: AgentEvent) {
        notify(&self.events, event);
    }
}

fn notify(events: &Option<flume::Sender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.try_send(event);
    }
}

/// Guards in order: repetition, then parse, then simulation / mention, then quality.
fn screen(guards: &GuardPipeline, text: &str) -> Result<Option<ToolInvocation>, GuardViolation> {
    if let Some(violation) = guards.check_raw(text) {
        return Err(violation);
    }
    let invocation = interpret(text);
    if let Some(violation) = guards.check_parsed(text, invocation.as_ref()) {
        return Err(violation);
    }
    if let Some(violation) = invocation.as_ref().and_then(|i| guards.check_quality(i)) {
        return Err(violation);
    }
    Ok(invocation)
}

fn looks_like_timeout(text: &str) -> bool {
    if text.len() > TIMEOUT_PHRASE_MAX_LEN {
        return false;
    }
    let lower = text.to_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ScriptedGateway, ScriptedReply};

    struct Harness {
        dir: tempfile::TempDir,
        gateway: Arc<ScriptedGateway>,
        controller: AgentController,
    }

    fn harness(replies: Vec<ScriptedReply>, tweak: impl FnOnce(&mut AgentConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        tweak(&mut config);
        let gateway = Arc::new(ScriptedGateway::new(replies));
        let controller =
            AgentController::new(config, dir.path(), gateway.clone() as Arc<dyn ModelGateway>)
                .unwrap();
        Harness {
            dir,
            gateway,
            controller,
        }
    }

    fn call(json: &str) -> ScriptedReply {
        ScriptedReply::Text(format!("```json\n{}\n```", json))
    }

    fn last_prompt_turn(gateway: &ScriptedGateway, call: usize) -> String {
        let prompts = gateway.prompts();
        prompts[call].last().unwrap().content.clone()
    }

    #[tokio::test]
    async fn plain_answer_completes_the_run() {
        let mut h = harness(vec!["All done, nothing to change.".into()], |_| {});
        let outcome = h.controller.submit("check the project").await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                response: "All done, nothing to change.".into()
            }
        );
        assert_eq!(h.controller.status(), AgentStatus::Idle);
        assert_eq!(h.controller.snapshot().iterations, 1);
    }

    #[tokio::test]
    async fn prompt_starts_with_master_and_primer() {
        let mut h = harness(vec!["ok".into()], |_| {});
        h.controller.submit("hi").await.unwrap();
        let prompt = &h.gateway.prompts()[0];
        assert!(prompt[0].content.contains("You are Zion"));
        assert!(prompt[1].content.starts_with("PROJECT CONTEXT"));
        assert_eq!(prompt.last().unwrap().content, "hi");
    }

    #[tokio::test]
    async fn safe_tool_runs_and_result_is_fed_back() {
        let mut h = harness(
            vec![
                call(r#"{"tool": "read_file", "args": {"path": "notes.txt"}}"#),
                "The file says hello.".into(),
            ],
            |_| {},
        );
        std::fs::write(h.dir.path().join("notes.txt"), "hello\n").unwrap();

        let outcome = h.controller.submit("what does notes.txt say?").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(
            last_prompt_turn(&h.gateway, 1),
            "Tool 'read_file' Output:\nhello\n"
        );
    }

    #[tokio::test]
    async fn mutating_tool_waits_for_approval() {
        let mut h = harness(
            vec![
                call(r#"{"tool": "write_file", "args": {"path": "new.txt", "content": "hello\nworld\n"}}"#),
                "Created.".into(),
            ],
            |_| {},
        );
        let outcome = h.controller.submit("create new.txt").await.unwrap();
        assert!(matches!(outcome, RunOutcome::AwaitingApproval { .. }));
        let snapshot = h.controller.snapshot();
        assert_eq!(snapshot.status, AgentStatus::WaitingApproval);
        assert_eq!(snapshot.pending_invocation.unwrap().tool, "write_file");
        assert!(!h.dir.path().join("new.txt").exists());

        let outcome = h.controller.approve().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { response: "Created.".into() });
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("new.txt")).unwrap(),
            "hello\nworld\n"
        );
        assert!(h.controller.versions().entries().is_empty());
    }

    #[tokio::test]
    async fn rejection_is_reported_to_the_model() {
        let mut h = harness(
            vec![
                call(r#"{"tool": "run_command", "args": {"command": "rm -rf build"}}"#),
                "Understood, leaving it.".into(),
            ],
            |_| {},
        );
        h.controller.submit("clean up").await.unwrap();
        let outcome = h.controller.reject().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(
            last_prompt_turn(&h.gateway, 1),
            "Tool execution cancelled by user."
        );
        assert!(h.controller.approve().await.is_err());
    }

    #[tokio::test]
    async fn guard_corrections_stay_out_of_the_conversation() {
        let mut h = harness(
            vec!["Here you go:\n```python\nprint('hi')\n```".into(), "Done.".into()],
            |_| {},
        );
        let outcome = h.controller.submit("write hello.py").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { response: "Done.".into() });
        assert!(last_prompt_turn(&h.gateway, 1).starts_with("VIOLATION: You wrote code"));
        assert!(h
            .controller
            .conversation()
            .turns()
            .iter()
            .all(|t| !t.content.contains("VIOLATION")));
        // Guard retries do not count as iterations.
        assert_eq!(h.controller.snapshot().iterations, 1);
    }

    #[tokio::test]
    async fn exhausted_gateway_is_recoverable() {
        let err = || ScriptedReply::Error(GatewayError::Transport("connection refused".into()));
        let mut h = harness(vec![err(), err(), err()], |_| {});
        let outcome = h.controller.submit("anything").await.unwrap();
        match outcome {
            RunOutcome::Failed { error } => assert!(error.contains("after 3 attempts")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.controller.status(), AgentStatus::Idle);
        assert_eq!(h.gateway.call_count(), 3);
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_until_reset() {
        let mut h = harness(
            vec![ScriptedReply::Error(GatewayError::Api {
                status: 401,
                body: "bad key".into(),
            })],
            |_| {},
        );
        let outcome = h.controller.submit("anything").await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(h.controller.status(), AgentStatus::Error);
        assert_eq!(h.gateway.call_count(), 1);
        assert!(h.controller.submit("again").await.is_err());

        h.controller.reset();
        assert_eq!(h.controller.status(), AgentStatus::Idle);
        assert_eq!(h.controller.conversation().len(), 1);
    }

    #[tokio::test]
    async fn gateway_timeout_is_retried() {
        let mut h = harness(vec![ScriptedReply::Hang, "Recovered.".into()], |c| {
            c.request_timeout_secs = 1;
        });
        let outcome = h.controller.submit("go").await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { response: "Recovered.".into() });
        assert_eq!(h.gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn iteration_cap_terminates_the_run() {
        let list = || call(r#"{"tool": "list_dir", "args": {"path": "."}}"#);
        let mut h = harness(vec![list(), list(), list()], |c| c.max_iterations = 2);
        let outcome = h.controller.submit("explore").await.unwrap();
        assert_eq!(outcome, RunOutcome::IterationLimit);
        assert_eq!(h.gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn repeated_calls_trigger_one_intervention() {
        let list = || call(r#"{"tool": "list_dir", "args": {"path": "."}}"#);
        let mut h = harness(vec![list(), list(), list(), "Done.".into()], |_| {});
        h.controller.submit("explore").await.unwrap();

        let fourth = &h.gateway.prompts()[3];
        let nudges = fourth
            .iter()
            .filter(|t| t.content.starts_with("LOOP DETECTED"))
            .count();
        assert_eq!(nudges, 1);
        assert!(fourth.last().unwrap().content.starts_with("LOOP DETECTED"));
    }

    #[tokio::test]
    async fn interrupt_cancels_a_hung_call() {
        let mut h = harness(vec![ScriptedReply::Hang], |_| {});
        let handle = h.controller.interrupt_handle();
        let submitted = tokio::spawn(async move {
            let outcome = h.controller.submit("wait forever").await.unwrap();
            (outcome, h.controller.status())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.interrupt();
        let (outcome, status) = submitted.await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn each_instruction_opens_a_task_for_group_undo() {
        let mut h = harness(
            vec![
                call(r#"{"tool": "edit_file", "args": {"path": "a.txt", "target": "one", "replacement": "two"}}"#),
                "Edited.".into(),
            ],
            |c| c.auto_approve = true,
        );
        std::fs::write(h.dir.path().join("a.txt"), "one\n").unwrap();
        let (tx, rx) = flume::unbounded();
        h.controller = h.controller.with_events(tx);

        h.controller.submit("change one to two").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("a.txt")).unwrap(),
            "two\n"
        );
        let events: Vec<AgentEvent> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::FileDiff { diff, .. } if diff.contains("+two"))));

        h.controller.versions().undo_task(None).unwrap();
        assert_eq!(
            std::fs::read_to_string(h.dir.path().join("a.txt")).unwrap(),
            "one\n"
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_folded_as_error_result() {
        let mut h = harness(
            vec![call(r#"{"tool": "teleport", "args": {}}"#), "Sorry.".into()],
            |_| {},
        );
        h.controller.submit("go").await.unwrap();
        assert_eq!(
            last_prompt_turn(&h.gateway, 1),
            "Tool 'teleport' Output:\nError: Tool 'teleport' not found."
        );
    }

    #[test]
    fn timeout_phrases_only_count_in_short_replies() {
        assert!(looks_like_timeout("Error: request timed out"));
        let long = format!("{} timeout handling is implemented.", "x".repeat(300));
        assert!(!looks_like_timeout(&long));
    }
}
