//! Dispatch protocol — assignment, acknowledgement, session, result.
//!
//! The dispatching side creates the task record and the TASK_DISPATCH
//! message; the receiving side acknowledges before doing any work, runs an
//! executor session, and reports exactly one result. Both halves live here
//! because every agent can play either role.

pub mod classify;

pub use classify::classify_error;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::fs;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{DispatchError, Error, Result, StoreError, TaskError};
use crate::executor::{AgentExecutor, ExecutorEvent};
use crate::store::message::{dm_channel, meta};
use crate::store::{
    AgentStatus, AgentStore, ChannelKind, ChannelStore, Message, MessageContent, MessageKind,
    NasLayout, ProgressEntry, Task, TaskErrorKind, TaskEvent, TaskStatus, TaskStore,
};

/// Characters of event text kept per progress entry.
const PROGRESS_DETAIL_LEN: usize = 200;

/// Both halves of the dispatch protocol, acting as one agent.
#[derive(Clone)]
pub struct Dispatcher {
    config: RuntimeConfig,
    layout: NasLayout,
    channels: Arc<ChannelStore>,
    tasks: Arc<TaskStore>,
    agents: Arc<AgentStore>,
    executor: Arc<dyn AgentExecutor>,
}

impl Dispatcher {
    pub fn new(
        config: RuntimeConfig,
        layout: NasLayout,
        channels: Arc<ChannelStore>,
        tasks: Arc<TaskStore>,
        agents: Arc<AgentStore>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            config,
            layout,
            channels,
            tasks,
            agents,
            executor,
        }
    }

    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    // ── dispatching side ────────────────────────────────────────────────

    /// Assign work to another agent: durable task record first, then the
    /// TASK_DISPATCH message that triggers delivery.
    pub async fn dispatch(&self, to: &str, instruction: &str) -> Result<Task> {
        let channel_id = dm_channel(to);
        self.channels
            .ensure_channel(
                &channel_id,
                ChannelKind::Dm,
                &[self.agent_id().to_string(), to.to_string()],
            )
            .await?;

        let mut task = Task::new(self.agent_id(), to, &channel_id, instruction);
        task.ack_timeout_ms = self.config.ack_timeout.as_millis() as u64;
        task.task_timeout_ms = self.config.task_timeout.as_millis() as u64;
        task.max_retries = self.config.max_retries;

        let output_dir = self.layout.task_assets_dir(to, task.task_id);
        fs::create_dir_all(&output_dir)
            .await
            .map_err(StoreError::from)?;
        task.output_dir = Some(output_dir.to_string_lossy().to_string());

        self.tasks.write(&task).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task.task_id));
        metadata.insert(meta::PRIORITY.into(), json!("urgent"));
        metadata.insert(meta::OUTPUT_DIR.into(), json!(task.output_dir));
        metadata.insert(meta::TASK_TIMEOUT_MS.into(), json!(task.task_timeout_ms));

        self.channels
            .append_message(
                &channel_id,
                MessageKind::TaskDispatch,
                MessageContent::text(instruction).with_mentions(vec![to.to_string()]),
                None,
                metadata,
            )
            .await?;

        tracing::info!(task_id = %task.task_id, to, "dispatched task");
        Ok(task)
    }

    /// Withdraw a non-terminal task. Cooperative: a session already running
    /// keeps running, but its result will be refused by the state machine.
    pub async fn cancel(&self, task_id: Uuid, reason: &str) -> Result<Task> {
        let task = self
            .tasks
            .transition(task_id, TaskEvent::Cancel, serde_json::Value::Null)
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task_id));
        metadata.insert(meta::STATUS.into(), json!(TaskStatus::Cancelled));
        self.channels
            .append_message(
                &task.channel_id,
                MessageKind::System,
                MessageContent::text(format!(
                    "Task {task_id} cancelled by {}: {reason}",
                    self.agent_id()
                )),
                None,
                metadata,
            )
            .await?;

        // Free the assignee if this was the task it was working on.
        if let Some(record) = self.agents.read(&task.to).await?
            && record.current_task == Some(task_id)
        {
            self.agents
                .set_status(&task.to, AgentStatus::Idle, None)
                .await?;
        }

        tracing::info!(task_id = %task_id, reason, "cancelled task");
        Ok(task)
    }

    // ── receiving side ──────────────────────────────────────────────────

    /// Handle an incoming TASK_DISPATCH: acknowledge before any work, then
    /// run the session in the background. Redelivery of a dispatch that was
    /// already acknowledged is a no-op.
    pub async fn handle_dispatch(&self, message: &Message) -> Result<()> {
        let task_id =
            message
                .meta_uuid(meta::TASK_ID)
                .ok_or_else(|| DispatchError::MalformedDispatch {
                    task_id: Uuid::nil(),
                    field: meta::TASK_ID.to_string(),
                })?;

        let task = match self.tasks.read(task_id).await? {
            Some(task) => task,
            // The message outran the task record (or the record was lost);
            // rebuild it from the dispatch itself.
            None => {
                let mut task = Task::new(
                    &message.from,
                    self.agent_id(),
                    &message.channel_id,
                    &message.content.text,
                );
                task.task_id = task_id;
                task.ack_timeout_ms = self.config.ack_timeout.as_millis() as u64;
                task.task_timeout_ms = message
                    .metadata
                    .get(meta::TASK_TIMEOUT_MS)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(self.config.task_timeout.as_millis() as u64);
                task.max_retries = self.config.max_retries;
                task.output_dir = message.meta_str(meta::OUTPUT_DIR).map(str::to_string);
                self.tasks.write(&task).await?;
                tracing::warn!(task_id = %task_id, "task record missing, rebuilt from dispatch");
                task
            }
        };

        if !matches!(task.status, TaskStatus::Dispatched | TaskStatus::Timeout) {
            tracing::debug!(task_id = %task_id, status = %task.status, "ignoring duplicate dispatch");
            return Ok(());
        }

        // ACK first so the dispatcher sees delivery within one poll.
        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task_id));
        self.channels
            .append_message(
                &task.channel_id,
                MessageKind::TaskAck,
                MessageContent::text(format!("Acknowledged task {task_id}")),
                Some(message.message_id),
                metadata,
            )
            .await?;

        match self
            .tasks
            .transition(task_id, TaskEvent::AckReceived, serde_json::Value::Null)
            .await
        {
            Ok(_) => {}
            // Lost the race with another delivery of the same dispatch.
            Err(Error::Task(TaskError::InvalidTransition { .. })) => return Ok(()),
            Err(e) => return Err(e),
        }

        self.agents
            .set_status(self.agent_id(), AgentStatus::Working, Some(task_id))
            .await?;
        let task = self
            .tasks
            .transition(task_id, TaskEvent::SessionStarted, serde_json::Value::Null)
            .await?;

        let this = self.clone();
        tokio::spawn(async move {
            this.run_session(task).await;
        });
        Ok(())
    }

    /// Drive one executor session to its single completion.
    pub(crate) async fn run_session(&self, task: Task) {
        let task_id = task.task_id;
        tracing::info!(task_id = %task_id, executor = self.executor.name(), "session started");

        let mut stream = match self.executor.execute(&task.instruction).await {
            Ok(stream) => stream,
            Err(e) => {
                self.complete_error(&task, &format!("Failed to start session: {e}"))
                    .await;
                return;
            }
        };

        let mut progress: Vec<ProgressEntry> = task.progress_log.clone();
        let mut outcome: Option<(String, bool)> = None;

        while let Some(event) = stream.next().await {
            let (phase, detail) = match event {
                ExecutorEvent::Tool { text } => ("tool", text),
                ExecutorEvent::Block { text } => ("generating", text),
                ExecutorEvent::Final { text, is_error } => {
                    // First final wins; anything after it is ignored.
                    outcome = Some((text, is_error));
                    break;
                }
            };
            progress.push(ProgressEntry {
                timestamp: chrono::Utc::now(),
                phase: phase.to_string(),
                detail: truncate(&detail, PROGRESS_DETAIL_LEN),
            });
            if let Err(e) = self
                .tasks
                .patch(
                    task_id,
                    json!({
                        "progress_log": progress,
                        "current_phase": phase,
                    }),
                )
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "failed to record progress");
            }
        }

        // Parking ends the session on purpose; the parked task reports later.
        match self.tasks.read(task_id).await {
            Ok(Some(current)) if current.status == TaskStatus::Parked => {
                tracing::info!(task_id = %task_id, "session ended while parked, no report");
                return;
            }
            Ok(Some(current)) if current.status.is_terminal() => {
                tracing::debug!(task_id = %task_id, status = %current.status, "task ended mid-session, no report");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "failed to re-read task at completion");
            }
        }

        match outcome {
            Some((text, false)) => self.complete_success(&task, &text).await,
            Some((text, true)) => self.complete_error(&task, &text).await,
            None => {
                self.complete_error(&task, "session stream ended without a final event")
                    .await
            }
        }
    }

    async fn complete_success(&self, task: &Task, summary: &str) {
        let asset_paths = match &task.output_dir {
            Some(dir) => scan_assets(std::path::Path::new(dir)).await,
            None => Vec::new(),
        };

        let result = self
            .tasks
            .transition(
                task.task_id,
                TaskEvent::ResultSuccess,
                json!({
                    "result_summary": summary,
                    "asset_paths": asset_paths,
                    "current_phase": "done",
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(task_id = %task.task_id, error = %e, "result refused, dropping");
            return;
        }

        self.report(task, TaskStatus::Done, summary, asset_paths)
            .await;
        tracing::info!(task_id = %task.task_id, "task done");
    }

    async fn complete_error(&self, task: &Task, detail: &str) {
        let kind = classify_error(detail);
        let result = self
            .tasks
            .transition(
                task.task_id,
                TaskEvent::ResultError,
                json!({
                    "error_type": kind,
                    "error_detail": detail,
                    "current_phase": "failed",
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(task_id = %task.task_id, error = %e, "failure report refused, dropping");
            return;
        }

        self.report(task, TaskStatus::Failed, detail, Vec::new())
            .await;
        tracing::warn!(task_id = %task.task_id, error_type = %kind, "task failed");
    }

    /// Append the RESULT_REPORT and return this agent to idle. Failures here
    /// are logged, not propagated: the task record already holds the truth
    /// and the dispatcher's monitor covers a lost report.
    async fn report(&self, task: &Task, status: TaskStatus, text: &str, assets: Vec<String>) {
        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task.task_id));
        metadata.insert(meta::STATUS.into(), json!(status));

        let mut content = MessageContent::text(text);
        content.attachments = assets;

        if let Err(e) = self
            .channels
            .append_message(
                &task.channel_id,
                MessageKind::ResultReport,
                content,
                None,
                metadata,
            )
            .await
        {
            tracing::warn!(task_id = %task.task_id, error = %e, "failed to append result report");
        }

        if let Err(e) = self
            .agents
            .set_status(self.agent_id(), AgentStatus::Idle, None)
            .await
        {
            tracing::warn!(error = %e, "failed to reset agent status");
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

/// Collect every file under `dir`, depth-first, as absolute path strings.
async fn scan_assets(dir: &std::path::Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(mut read_dir) = fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(t) if t.is_dir() => stack.push(path),
                Ok(t) if t.is_file() => found.push(path.to_string_lossy().to_string()),
                _ => {}
            }
        }
    }
    found.sort();
    found
}
