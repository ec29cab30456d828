//! Task records and the task lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use uuid::Uuid;

use crate::error::{Result, StoreError, TaskError};
use crate::store::paths::NasLayout;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Assigned, no receipt yet.
    Dispatched,
    /// Receipt confirmed by the assignee.
    Acked,
    /// An executor session is working on it.
    Processing,
    /// Waiting on an external condition; no live session.
    Parked,
    /// Finished successfully.
    Done,
    /// Finished unsuccessfully.
    Failed,
    /// A dispatch attempt went unacknowledged; a retry is pending.
    Timeout,
    /// Scheduled for re-dispatch after a rate-limit backoff.
    Retrying,
    /// All dispatch attempts exhausted.
    Abandoned,
    /// Withdrawn by the dispatcher.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again, except that a rate-limited
    /// failure may be revived by `RetryScheduled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::Abandoned | Self::Cancelled
        )
    }

    /// Single transition function for the lifecycle. Returns `None` for an
    /// event the current state does not accept; callers treat that as either
    /// an error or a duplicate delivery, never as a state change.
    pub fn apply(self, event: TaskEvent) -> Option<TaskStatus> {
        use TaskEvent::*;
        use TaskStatus::*;

        let next = match (self, event) {
            // Dispatch handshake. An ACK after a timeout retry is still valid.
            (Dispatched | Timeout, AckReceived) => Acked,
            (Acked, SessionStarted) => Processing,

            // Session outcomes.
            (Processing, ResultSuccess) => Done,
            (Processing, ResultError) => Failed,

            // Monitor-driven timeouts. AckTimedOut loops Timeout onto itself
            // once per retry slot.
            (Dispatched | Timeout, AckTimedOut) => Timeout,
            (Acked | Processing, TaskTimedOut) => Failed,
            (Dispatched | Timeout | Retrying, RetriesExhausted) => Abandoned,

            // Parking.
            (Processing, ParkStarted) => Parked,
            (Parked, ParkResolved) => Processing,
            (Parked, ParkRejected | ParkExpired) => Failed,

            // Rate-limit revival.
            (Failed, RetryScheduled) => Retrying,
            (Retrying, RetryDispatched) => Dispatched,

            (state, Cancel) if !state.is_terminal() => Cancelled,

            _ => return None,
        };
        Some(next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Dispatched => "DISPATCHED",
            Self::Acked => "ACKED",
            Self::Processing => "PROCESSING",
            Self::Parked => "PARKED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Retrying => "RETRYING",
            Self::Abandoned => "ABANDONED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Everything that can move a task between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    AckReceived,
    SessionStarted,
    ResultSuccess,
    ResultError,
    AckTimedOut,
    TaskTimedOut,
    RetriesExhausted,
    ParkStarted,
    ParkResolved,
    ParkRejected,
    ParkExpired,
    RetryScheduled,
    RetryDispatched,
    Cancel,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Classified cause of a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorKind {
    /// The instruction plus context no longer fits the model window.
    ContextOverflow,
    /// Provider throttling; retried automatically after a backoff.
    RateLimited,
    /// A tool or command invoked by the session failed.
    ToolError,
    /// Anything else, including wall-clock timeouts.
    LlmError,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ContextOverflow => "CONTEXT_OVERFLOW",
            Self::RateLimited => "RATE_LIMITED",
            Self::ToolError => "TOOL_ERROR",
            Self::LlmError => "LLM_ERROR",
        };
        write!(f, "{s}")
    }
}

/// One line of a task's progress log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub detail: String,
}

/// Durable task record, one JSON file per task.
///
/// The dispatching agent owns timeout and retry decisions; the assignee
/// writes progress and results. The two sides touch disjoint fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub from: String,
    pub to: String,
    pub channel_id: String,
    pub status: TaskStatus,
    pub instruction: String,
    pub dispatched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_paths: Vec<String>,
    pub retries: u32,
    pub max_retries: u32,
    pub ack_timeout_ms: u64,
    pub task_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<TaskErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress_log: Vec<ProgressEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

impl Task {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        channel_id: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            channel_id: channel_id.into(),
            status: TaskStatus::Dispatched,
            instruction: instruction.into(),
            dispatched_at: Utc::now(),
            acked_at: None,
            started_at: None,
            completed_at: None,
            result_summary: None,
            asset_paths: Vec::new(),
            retries: 0,
            max_retries: 2,
            ack_timeout_ms: 60_000,
            task_timeout_ms: 1_800_000,
            error_type: None,
            error_detail: None,
            progress_log: Vec::new(),
            current_phase: None,
            output_dir: None,
        }
    }
}

/// File-backed task registry. No cross-task locking; concurrent patches to
/// one record are last-writer-wins, which the disjoint-field split above
/// makes safe in every protocol path.
#[derive(Debug, Clone)]
pub struct TaskStore {
    layout: NasLayout,
}

impl TaskStore {
    pub fn new(layout: NasLayout) -> Self {
        Self { layout }
    }

    /// Write a full record, creating or replacing it.
    pub async fn write(&self, task: &Task) -> Result<()> {
        let path = self.layout.task_record(task.task_id);
        super::write_record(&path, task).await?;
        Ok(())
    }

    pub async fn read(&self, task_id: Uuid) -> Result<Option<Task>> {
        let path = self.layout.task_record(task_id);
        Ok(super::read_record(&path).await?)
    }

    /// Merge `patch` into the stored record. Object fields merge recursively,
    /// everything else (arrays included) is replaced, and explicit nulls
    /// overwrite so optional fields can be cleared. Fields this crate does
    /// not know about survive the rewrite.
    pub async fn patch(&self, task_id: Uuid, patch: Value) -> Result<Task> {
        let path = self.layout.task_record(task_id);
        let mut value: Value = super::read_record(&path)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;
        merge_value(&mut value, patch);
        super::write_record(&path, &value).await?;
        let task = serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })?;
        Ok(task)
    }

    /// Apply a lifecycle event plus an extra field patch in one write.
    ///
    /// Lifecycle timestamps are stamped automatically: first ACK, first
    /// session start, and terminal completion. An event the current state
    /// does not accept returns `TaskError::InvalidTransition` and writes
    /// nothing, which is how duplicate deliveries die.
    pub async fn transition(&self, task_id: Uuid, event: TaskEvent, extra: Value) -> Result<Task> {
        let task = self
            .read(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        let next = task
            .status
            .apply(event)
            .ok_or_else(|| TaskError::InvalidTransition {
                id: task_id,
                state: task.status.to_string(),
                event: event.to_string(),
            })?;

        let mut patch = serde_json::Map::new();
        patch.insert("status".into(), serde_json::to_value(next).map_err(StoreError::from)?);

        let now = Utc::now();
        match event {
            TaskEvent::AckReceived if task.acked_at.is_none() => {
                patch.insert("acked_at".into(), timestamp_value(now));
            }
            TaskEvent::SessionStarted if task.started_at.is_none() => {
                patch.insert("started_at".into(), timestamp_value(now));
            }
            _ => {}
        }
        if next.is_terminal() {
            patch.insert("completed_at".into(), timestamp_value(now));
        }

        // Caller-supplied fields win over the automatic stamps.
        if let Value::Object(extra) = extra {
            for (key, value) in extra {
                patch.insert(key, value);
            }
        }
        self.patch(task_id, Value::Object(patch)).await
    }

    /// All tasks currently in one of `statuses`. Unparseable records are
    /// logged and skipped so one bad file cannot stall a monitor sweep.
    pub async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let dir = self.layout.tasks_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await.map_err(StoreError::from)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(StoreError::from)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let body = match fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task record");
                    continue;
                }
            };
            match serde_json::from_str::<Task>(&body) {
                Ok(task) if statuses.contains(&task.status) => tasks.push(task),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt task record");
                }
            }
        }
        tasks.sort_by_key(|t| t.dispatched_at);
        Ok(tasks)
    }
}

fn timestamp_value(at: DateTime<Utc>) -> Value {
    serde_json::to_value(at).unwrap_or(Value::Null)
}

/// Recursive merge: objects merge key-by-key, everything else replaces.
fn merge_value(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_val) in patch_map {
                match base_map.get_mut(&key) {
                    Some(base_val) => merge_value(base_val, patch_val),
                    None => {
                        base_map.insert(key, patch_val);
                    }
                }
            }
        }
        (base_slot, patch_val) => *base_slot = patch_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TaskStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (TaskStore::new(NasLayout::new(dir.path())), dir)
    }

    #[test]
    fn legal_transitions() {
        use TaskEvent::*;
        use TaskStatus::*;

        assert_eq!(Dispatched.apply(AckReceived), Some(Acked));
        assert_eq!(Timeout.apply(AckReceived), Some(Acked));
        assert_eq!(Acked.apply(SessionStarted), Some(Processing));
        assert_eq!(Processing.apply(ResultSuccess), Some(Done));
        assert_eq!(Processing.apply(ResultError), Some(Failed));
        assert_eq!(Dispatched.apply(AckTimedOut), Some(Timeout));
        assert_eq!(Timeout.apply(AckTimedOut), Some(Timeout));
        assert_eq!(Timeout.apply(RetriesExhausted), Some(Abandoned));
        assert_eq!(Processing.apply(ParkStarted), Some(Parked));
        assert_eq!(Parked.apply(ParkResolved), Some(Processing));
        assert_eq!(Parked.apply(ParkRejected), Some(Failed));
        assert_eq!(Parked.apply(ParkExpired), Some(Failed));
        assert_eq!(Failed.apply(RetryScheduled), Some(Retrying));
        assert_eq!(Retrying.apply(RetryDispatched), Some(Dispatched));
        assert_eq!(Processing.apply(Cancel), Some(Cancelled));
        assert_eq!(Parked.apply(Cancel), Some(Cancelled));
    }

    #[test]
    fn illegal_transitions() {
        use TaskEvent::*;
        use TaskStatus::*;

        // Duplicate ACK after work began.
        assert_eq!(Processing.apply(AckReceived), None);
        assert_eq!(Done.apply(AckReceived), None);
        // Late results.
        assert_eq!(Done.apply(ResultError), None);
        assert_eq!(Abandoned.apply(ResultSuccess), None);
        // No cancelling finished work.
        assert_eq!(Done.apply(Cancel), None);
        assert_eq!(Cancelled.apply(Cancel), None);
        // Only failures revive.
        assert_eq!(Done.apply(RetryScheduled), None);
        assert_eq!(Abandoned.apply(RetryDispatched), None);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Abandoned.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Dispatched.is_terminal());
        assert!(!TaskStatus::Parked.is_terminal());
        assert!(!TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_string(&TaskStatus::Dispatched).unwrap();
        assert_eq!(json, "\"DISPATCHED\"");
        let parsed: TaskStatus = serde_json::from_str("\"ABANDONED\"").unwrap();
        assert_eq!(parsed, TaskStatus::Abandoned);
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let (store, _dir) = store();
        let task = Task::new("lead", "codey", "dm_codey", "write the report");
        store.write(&task).await.unwrap();

        let loaded = store.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_id, task.task_id);
        assert_eq!(loaded.status, TaskStatus::Dispatched);
        assert_eq!(loaded.instruction, "write the report");
    }

    #[tokio::test]
    async fn read_missing_returns_none() {
        let (store, _dir) = store();
        assert!(store.read(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patch_preserves_unknown_fields() {
        let (store, dir) = store();
        let task = Task::new("lead", "codey", "dm_codey", "x");
        store.write(&task).await.unwrap();

        // Another tool annotates the record with a field we do not model.
        let path = NasLayout::new(dir.path()).task_record(task.task_id);
        let mut raw: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["reviewer_notes"] = Value::String("looks fine".into());
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        store
            .patch(task.task_id, serde_json::json!({"current_phase": "tool"}))
            .await
            .unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["reviewer_notes"], "looks fine");
        assert_eq!(raw["current_phase"], "tool");
    }

    #[tokio::test]
    async fn patch_null_clears_optional_field() {
        let (store, _dir) = store();
        let mut task = Task::new("lead", "codey", "dm_codey", "x");
        task.error_type = Some(TaskErrorKind::ToolError);
        store.write(&task).await.unwrap();

        let patched = store
            .patch(task.task_id, serde_json::json!({"error_type": null}))
            .await
            .unwrap();
        assert!(patched.error_type.is_none());
    }

    #[tokio::test]
    async fn transition_stamps_timestamps() {
        let (store, _dir) = store();
        let task = Task::new("lead", "codey", "dm_codey", "x");
        store.write(&task).await.unwrap();

        let acked = store
            .transition(task.task_id, TaskEvent::AckReceived, Value::Null)
            .await
            .unwrap();
        assert_eq!(acked.status, TaskStatus::Acked);
        assert!(acked.acked_at.is_some());
        assert!(acked.completed_at.is_none());

        let processing = store
            .transition(task.task_id, TaskEvent::SessionStarted, Value::Null)
            .await
            .unwrap();
        assert!(processing.started_at.is_some());

        let done = store
            .transition(
                task.task_id,
                TaskEvent::ResultSuccess,
                serde_json::json!({"result_summary": "ok"}),
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.completed_at.is_some());
        assert_eq!(done.result_summary.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn transition_rejects_duplicate_ack() {
        let (store, _dir) = store();
        let task = Task::new("lead", "codey", "dm_codey", "x");
        store.write(&task).await.unwrap();

        store
            .transition(task.task_id, TaskEvent::AckReceived, Value::Null)
            .await
            .unwrap();
        store
            .transition(task.task_id, TaskEvent::SessionStarted, Value::Null)
            .await
            .unwrap();

        let dup = store
            .transition(task.task_id, TaskEvent::AckReceived, Value::Null)
            .await;
        assert!(dup.is_err());

        let current = store.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let (store, _dir) = store();
        let a = Task::new("lead", "codey", "dm_codey", "a");
        let mut b = Task::new("lead", "artie", "dm_artie", "b");
        b.status = TaskStatus::Done;
        store.write(&a).await.unwrap();
        store.write(&b).await.unwrap();

        let open = store
            .list_by_status(&[TaskStatus::Dispatched, TaskStatus::Timeout])
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].task_id, a.task_id);
    }
}
