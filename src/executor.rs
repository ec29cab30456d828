//! Executor sessions — the seam to the model pipeline.
//!
//! The daemon does not know how instructions get carried out. It hands an
//! instruction to an [`AgentExecutor`] and consumes the event stream that
//! comes back: tool activity, generated output, then exactly one final event.

use std::collections::VecDeque;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ExecutorError;

/// Lines of command output kept for the final event of a shell session.
const TAIL_LINES: usize = 20;

/// One event from a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    /// Tool or command activity.
    Tool { text: String },
    /// A block of generated output.
    Block { text: String },
    /// End of session. Nothing follows.
    Final { text: String, is_error: bool },
}

impl ExecutorEvent {
    pub fn final_ok(text: impl Into<String>) -> Self {
        Self::Final {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn final_err(text: impl Into<String>) -> Self {
        Self::Final {
            text: text.into(),
            is_error: true,
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = ExecutorEvent> + Send>>;

/// Something that can run an instruction and stream its progress.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Start one session. The stream ends after the first `Final` event.
    async fn execute(&self, instruction: &str) -> Result<EventStream, ExecutorError>;
}

/// Default executor: runs the instruction as a shell command. Stdout lines
/// arrive as `Block` events (the work product), stderr lines as `Tool`
/// events, and the exit status decides the final event.
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, instruction: &str) -> Result<EventStream, ExecutorError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(instruction)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::SpawnFailed {
            reason: "no stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ExecutorError::SpawnFailed {
            reason: "no stderr pipe".to_string(),
        })?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut tail: VecDeque<String> = VecDeque::new();
            let mut out_done = false;
            let mut err_done = false;

            while !(out_done && err_done) {
                tokio::select! {
                    line = out_lines.next_line(), if !out_done => match line {
                        Ok(Some(text)) => {
                            push_tail(&mut tail, &text);
                            let _ = tx.send(ExecutorEvent::Block { text });
                        }
                        _ => out_done = true,
                    },
                    line = err_lines.next_line(), if !err_done => match line {
                        Ok(Some(text)) => {
                            push_tail(&mut tail, &text);
                            let _ = tx.send(ExecutorEvent::Tool { text });
                        }
                        _ => err_done = true,
                    },
                }
            }

            let final_event = match child.wait().await {
                Ok(status) if status.success() => {
                    let summary = if tail.is_empty() {
                        "command completed".to_string()
                    } else {
                        tail.iter().cloned().collect::<Vec<_>>().join("\n")
                    };
                    ExecutorEvent::final_ok(summary)
                }
                Ok(status) => ExecutorEvent::final_err(format!(
                    "exit status {}: {}",
                    status.code().unwrap_or(-1),
                    tail.iter().cloned().collect::<Vec<_>>().join("\n")
                )),
                Err(e) => ExecutorEvent::final_err(format!("wait failed: {e}")),
            };
            let _ = tx.send(final_event);
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

/// Deterministic executor for tests and protocol rehearsal. Each call to
/// `execute` pops the next scripted session; once the script runs out every
/// session completes with a plain success.
pub struct ScriptedExecutor {
    sessions: Mutex<VecDeque<Vec<ExecutorEvent>>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue the events of the next session.
    pub fn push_session(&self, events: Vec<ExecutorEvent>) {
        self.sessions.lock().unwrap().push_back(events);
    }

    /// Instructions received so far, in call order.
    pub fn instructions(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, instruction: &str) -> Result<EventStream, ExecutorError> {
        self.seen.lock().unwrap().push(instruction.to_string());
        let events = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![ExecutorEvent::final_ok("done")]);
        Ok(Box::pin(futures::stream::iter(events)))
    }
}
