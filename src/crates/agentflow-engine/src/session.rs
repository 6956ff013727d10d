//! Agent sessions
//!
//! An [`AgentSession`] holds the conversation with one LLM persona for the
//! duration of one or more nodes. The LLM provider and the sandboxed code
//! executor are external collaborators reached through the [`AgentBackend`]
//! and [`CodeRunner`] traits; the session wraps every call in the configured
//! timeout and emits capture hooks synchronously, in call order, so event
//! parentage lines up with the actual nesting.
//!
//! Sessions report outcomes; they never decide node transitions. That is the
//! scheduler's job.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::FileArtifact;
use agentflow_core::model::TokenUsage;

use crate::capture::CapturePipeline;
use crate::extract::{
    capture_artifact, extract_imports, scan_code_for_paths, scan_text_for_paths, FileScanLimits,
};

/// One LLM persona: a name, a system prompt and an optional model override.
#[derive(Debug, Clone)]
pub struct AgentPersona {
    pub name: String,
    pub system_prompt: String,
    pub model: Option<String>,
}

impl AgentPersona {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
}

impl AgentMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool call the backend resolved during one round.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub output: Option<Value>,
}

/// A code block the agent asked to execute.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub language: String,
    pub source: String,
}

/// A request to pass the conversation to another persona.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub to_agent: String,
    pub reason: Option<String>,
}

/// One round of model output.
#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub code_blocks: Vec<CodeBlock>,
    pub handoff: Option<HandoffRequest>,
    pub usage: TokenUsage,
}

/// LLM provider boundary. Implementations live outside the engine.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Advance the conversation by one round.
    async fn complete(
        &self,
        persona: &AgentPersona,
        messages: &[AgentMessage],
    ) -> Result<AgentReply>;

    /// Best-effort cancellation of any in-flight call.
    async fn abort(&self) {}
}

/// Result of one sandboxed code execution.
#[derive(Debug, Clone)]
pub struct CodeOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: i64,
}

/// Sandboxed code executor boundary.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, code: &str, workdir: &Path, timeout: Duration) -> Result<CodeOutcome>;
}

/// Outcome of one [`AgentSession::step`].
#[derive(Debug, Clone)]
pub struct StepResult {
    pub content: String,
    pub usage: TokenUsage,
    pub files: Vec<FileArtifact>,
    pub handoff: Option<HandoffRequest>,
}

/// A conversational session bound to one node's capture scope.
pub struct AgentSession {
    persona: AgentPersona,
    messages: Vec<AgentMessage>,
    backend: Arc<dyn AgentBackend>,
    runner: Arc<dyn CodeRunner>,
    capture: CapturePipeline,
    node_id: String,
    workdir: PathBuf,
    call_timeout: Duration,
    scan_limits: FileScanLimits,
}

impl AgentSession {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        persona: AgentPersona,
        backend: Arc<dyn AgentBackend>,
        runner: Arc<dyn CodeRunner>,
        capture: CapturePipeline,
        node_id: impl Into<String>,
        workdir: PathBuf,
        call_timeout: Duration,
        scan_limits: FileScanLimits,
    ) -> Self {
        let messages = vec![AgentMessage::system(persona.system_prompt.clone())];
        Self {
            persona,
            messages,
            backend,
            runner,
            capture,
            node_id: node_id.into(),
            workdir,
            call_timeout,
            scan_limits,
        }
    }

    pub fn persona_name(&self) -> &str {
        &self.persona.name
    }

    /// Advance the conversation by one round: call the model, execute any
    /// code blocks, record every hook in call order, and harvest file
    /// artifacts from code, tool output and message text.
    pub async fn step(&mut self, input: &str) -> Result<StepResult> {
        self.messages.push(AgentMessage::user(input));
        let started = Instant::now();

        let start_event = self
            .capture
            .agent_call_start(&self.node_id, &self.persona.name, input)
            .await?;

        let reply = match tokio::time::timeout(
            self.call_timeout,
            self.backend.complete(&self.persona, &self.messages),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.finish_call(&start_event.id, "", &TokenUsage::default(), &started, Some(&e))
                    .await;
                return Err(e);
            }
            Err(_) => {
                let e = FlowError::transient(format!(
                    "agent call timed out after {:?}",
                    self.call_timeout
                ));
                self.finish_call(&start_event.id, "", &TokenUsage::default(), &started, Some(&e))
                    .await;
                return Err(e);
            }
        };

        let mut harvested: BTreeSet<String> = BTreeSet::new();
        let mut files = Vec::new();

        for block in &reply.code_blocks {
            if let Err(e) = self
                .execute_code_block(block, &mut harvested, &mut files)
                .await
            {
                self.finish_call(&start_event.id, &reply.content, &reply.usage, &started, Some(&e))
                    .await;
                return Err(e);
            }
        }

        for tool in &reply.tool_calls {
            let tool_event = self
                .capture
                .tool_call(
                    &self.node_id,
                    &self.persona.name,
                    &tool.name,
                    tool.arguments.clone(),
                    tool.output.clone(),
                )
                .await?;
            let output_text = tool
                .output
                .as_ref()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            self.harvest_paths(
                scan_text_for_paths(&output_text),
                Some(&tool_event.id),
                &mut harvested,
                &mut files,
            )
            .await?;
        }

        if let Some(handoff) = &reply.handoff {
            self.capture
                .handoff(
                    &self.node_id,
                    &self.persona.name,
                    &handoff.to_agent,
                    handoff.reason.clone(),
                )
                .await?;
        }

        self.harvest_paths(
            scan_text_for_paths(&reply.content),
            None,
            &mut harvested,
            &mut files,
        )
        .await?;

        self.messages.push(AgentMessage::assistant(reply.content.clone()));
        self.capture
            .agent_call_complete(
                &start_event.id,
                &self.node_id,
                &self.persona.name,
                &reply.content,
                &reply.usage,
                started.elapsed().as_millis() as i64,
                None,
            )
            .await?;

        Ok(StepResult {
            content: reply.content,
            usage: reply.usage,
            files,
            handoff: reply.handoff,
        })
    }

    async fn execute_code_block(
        &mut self,
        block: &CodeBlock,
        harvested: &mut BTreeSet<String>,
        files: &mut Vec<FileArtifact>,
    ) -> Result<()> {
        let outcome = match tokio::time::timeout(
            self.call_timeout,
            self.runner.run(&block.source, &self.workdir, self.call_timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(FlowError::transient(format!(
                    "code execution timed out after {:?}",
                    self.call_timeout
                )))
            }
        };

        let imports = extract_imports(&block.source);
        let code_event = self
            .capture
            .code_exec(
                &self.node_id,
                &self.persona.name,
                &block.source,
                &outcome.stdout,
                &outcome.stderr,
                outcome.exit_code,
                imports,
                outcome.duration_ms,
            )
            .await?;

        if outcome.exit_code != 0 {
            // Agent-authored code that fails is a logic error: the adaptive
            // retry path feeds the stderr back into the prompt.
            return Err(FlowError::Logic(format!(
                "code execution failed with exit code {}: {}",
                outcome.exit_code,
                outcome.stderr.trim()
            )));
        }

        let mut paths = scan_code_for_paths(&block.source);
        paths.extend(scan_text_for_paths(&outcome.stdout));
        self.harvest_paths(paths, Some(&code_event.id), harvested, files)
            .await
    }

    async fn harvest_paths(
        &self,
        paths: Vec<String>,
        triggering_event_id: Option<&str>,
        harvested: &mut BTreeSet<String>,
        files: &mut Vec<FileArtifact>,
    ) -> Result<()> {
        for path in paths {
            if !harvested.insert(path.clone()) {
                continue;
            }
            let artifact = capture_artifact(&self.workdir, &path, self.scan_limits);
            self.capture
                .file_gen(
                    &self.node_id,
                    &self.persona.name,
                    artifact.clone(),
                    triggering_event_id,
                )
                .await?;
            files.push(artifact);
        }
        Ok(())
    }

    /// Record the call as failed and close the open start event. Capture
    /// failures here are logged and swallowed: the original error wins.
    async fn finish_call(
        &self,
        start_event_id: &str,
        content: &str,
        usage: &TokenUsage,
        started: &Instant,
        error: Option<&FlowError>,
    ) {
        let result = self
            .capture
            .agent_call_complete(
                start_event_id,
                &self.node_id,
                &self.persona.name,
                content,
                usage,
                started.elapsed().as_millis() as i64,
                error.map(|e| e.to_string()).as_deref(),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(node_id = %self.node_id, error = %e, "failed to record call completion");
        }
    }

    /// Best-effort cancellation of the in-flight round.
    pub async fn abort(&self) {
        self.backend.abort().await;
    }
}
