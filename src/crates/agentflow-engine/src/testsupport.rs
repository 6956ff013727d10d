//! Scripted stand-ins for the external collaborators
//!
//! The engine's scenario tests drive real schedulers, stores and
//! broadcasters against these stubs: a programmable [`StubBackend`] in place
//! of the LLM provider and a [`StubRunner`] that interprets a tiny subset of
//! Python-ish code so file side effects actually land on disk.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Semaphore;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::model::TokenUsage;

use crate::session::{
    AgentBackend, AgentMessage, AgentPersona, AgentReply, CodeBlock, CodeOutcome, CodeRunner,
};

type Handler =
    dyn Fn(u32, &AgentPersona, &[AgentMessage]) -> Result<AgentReply> + Send + Sync + 'static;

/// Programmable agent backend. The handler receives the zero-based call
/// index (across all personas) plus the persona and transcript, and decides
/// the reply. An optional gate makes calls wait for explicit test permits.
pub struct StubBackend {
    handler: Box<Handler>,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
}

impl StubBackend {
    pub fn new(
        handler: impl Fn(u32, &AgentPersona, &[AgentMessage]) -> Result<AgentReply>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
            gate: None,
        })
    }

    /// Like [`StubBackend::new`], but each call first waits for one permit
    /// on the returned semaphore. Lets tests freeze workers mid-run.
    pub fn gated(
        handler: impl Fn(u32, &AgentPersona, &[AgentMessage]) -> Result<AgentReply>
            + Send
            + Sync
            + 'static,
    ) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
            gate: Some(gate.clone()),
        });
        (backend, gate)
    }

    /// Replies with fixed text on every call.
    pub fn always(content: &str) -> Arc<Self> {
        let content = content.to_string();
        Self::new(move |_, _, _| Ok(reply_with(&content)))
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for StubBackend {
    async fn complete(
        &self,
        persona: &AgentPersona,
        messages: &[AgentMessage],
    ) -> Result<AgentReply> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| FlowError::transient("backend gate closed"))?
                .forget();
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(call, persona, messages)
    }
}

/// Build a plain text reply with nominal usage so cost accounting has
/// something to add up.
pub fn reply_with(content: &str) -> AgentReply {
    AgentReply {
        content: content.to_string(),
        usage: TokenUsage::new(100, 20, 0.001),
        ..Default::default()
    }
}

/// A reply whose single code block will be run by the [`StubRunner`].
pub fn reply_with_code(content: &str, code: &str) -> AgentReply {
    AgentReply {
        content: content.to_string(),
        code_blocks: vec![CodeBlock {
            language: "python".to_string(),
            source: code.to_string(),
        }],
        usage: TokenUsage::new(100, 20, 0.001),
        ..Default::default()
    }
}

/// Interprets `open('path', 'w').write('content')` and `print('text')`
/// statements, writing real files into the workdir so the capture pipeline's
/// file extraction has something to find.
pub struct StubRunner;

#[async_trait]
impl CodeRunner for StubRunner {
    async fn run(&self, code: &str, workdir: &Path, _timeout: Duration) -> Result<CodeOutcome> {
        let write =
            Regex::new(r#"open\(\s*'([^']+)'\s*,\s*'w'\s*\)\s*\.write\(\s*'([^']*)'\s*\)"#)
                .map_err(|e| FlowError::fatal(e.to_string()))?;
        for capture in write.captures_iter(code) {
            let path = workdir.join(&capture[1]);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FlowError::transient(e.to_string()))?;
            }
            std::fs::write(&path, &capture[2])
                .map_err(|e| FlowError::transient(e.to_string()))?;
        }

        let print = Regex::new(r#"print\(\s*'([^']*)'\s*\)"#)
            .map_err(|e| FlowError::fatal(e.to_string()))?;
        let stdout: String = print
            .captures_iter(code)
            .map(|capture| format!("{}\n", &capture[1]))
            .collect();

        Ok(CodeOutcome {
            stdout,
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
        })
    }
}

/// A runner that always fails, for exercising the retry pipeline.
pub struct FailingRunner;

#[async_trait]
impl CodeRunner for FailingRunner {
    async fn run(&self, _code: &str, _workdir: &Path, _timeout: Duration) -> Result<CodeOutcome> {
        Err(FlowError::transient("sandbox unavailable"))
    }
}
