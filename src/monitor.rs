//! Dispatcher-side supervision.
//!
//! A fixed-interval sweep over the tasks this agent dispatched: unacked
//! dispatches are retried and eventually abandoned, running tasks are
//! failed on wall-clock timeout, rate-limited failures are re-dispatched
//! after a backoff, and other failures get exactly one SYSTEM notice.
//! The monitor also owns the result path: screening RESULT_REPORTs for
//! sensitive operations and forwarding (or withholding) them on the
//! pipeline channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::permission::{
    PermissionOrigin, PermissionRecord, PermissionStatus, PermissionStore, ScreenHit, screen_text,
};
use crate::store::message::{meta, well_known};
use crate::store::{
    ChannelStore, Message, MessageContent, MessageKind, Notification, Priority, Task,
    TaskErrorKind, TaskEvent, TaskStatus, TaskStore,
};

/// Characters of result text carried in a pipeline announcement.
const FORWARD_LEN: usize = 500;

pub struct Monitor {
    config: RuntimeConfig,
    tasks: Arc<TaskStore>,
    channels: Arc<ChannelStore>,
    permissions: Arc<PermissionStore>,
}

impl Monitor {
    pub fn new(
        config: RuntimeConfig,
        tasks: Arc<TaskStore>,
        channels: Arc<ChannelStore>,
        permissions: Arc<PermissionStore>,
    ) -> Self {
        Self {
            config,
            tasks,
            channels,
            permissions,
        }
    }

    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// One supervision pass. Each phase swallows and logs its own errors so
    /// a bad record never stalls the others.
    pub async fn sweep(&self) {
        self.check_pending_acks().await;
        self.check_running_tasks().await;
        self.check_failed_tasks().await;
        self.check_retrying_tasks().await;
        self.resolve_screened_permissions().await;
    }

    // ── ack timeouts ────────────────────────────────────────────────────

    async fn check_pending_acks(&self) {
        let open = match self
            .tasks
            .list_by_status(&[TaskStatus::Dispatched, TaskStatus::Timeout])
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to list dispatched tasks");
                return;
            }
        };

        let now = Utc::now();
        for task in open {
            if task.from != self.agent_id() {
                continue;
            }
            let waited = now
                .signed_duration_since(task.dispatched_at)
                .to_std()
                .unwrap_or_default();
            if waited < Duration::from_millis(task.ack_timeout_ms) {
                continue;
            }
            if let Err(e) = self.retry_or_abandon(&task).await {
                warn!(task_id = %task.task_id, error = %e, "ack timeout handling failed");
            }
        }
    }

    async fn retry_or_abandon(&self, task: &Task) -> Result<()> {
        let task_id = task.task_id;
        if task.retries < task.max_retries {
            let retried = self
                .tasks
                .transition(
                    task_id,
                    TaskEvent::AckTimedOut,
                    json!({
                        "retries": task.retries + 1,
                        "dispatched_at": Utc::now(),
                    }),
                )
                .await?;

            // The dispatch message is still in the channel; the assignee only
            // lost the pointer. Push a fresh notification that re-synthesizes
            // the dispatch if the message file is unreadable too.
            let mut task_metadata = serde_json::Map::new();
            task_metadata.insert(meta::PRIORITY.into(), json!("urgent"));
            task_metadata.insert(meta::TASK_TIMEOUT_MS.into(), json!(retried.task_timeout_ms));
            if let Some(dir) = &retried.output_dir {
                task_metadata.insert(meta::OUTPUT_DIR.into(), json!(dir));
            }
            self.channels
                .push_notification(
                    &task.to,
                    &Notification {
                        notification_id: Uuid::new_v4(),
                        channel_id: task.channel_id.clone(),
                        message_seq: 0,
                        from: self.agent_id().to_string(),
                        preview: preview(&task.instruction),
                        priority: Priority::High,
                        mentioned: true,
                        created_at: Utc::now(),
                        retry_for_task: Some(task_id),
                        task_metadata: Some(task_metadata),
                    },
                )
                .await?;

            info!(
                task_id = %task_id,
                attempt = retried.retries + 1,
                of = retried.max_retries + 1,
                "no ack, re-delivering dispatch"
            );
        } else {
            let attempts = task.retries + 1;
            self.tasks
                .transition(
                    task_id,
                    TaskEvent::RetriesExhausted,
                    json!({
                        "error_detail": format!("no acknowledgement after {attempts} dispatch attempts"),
                    }),
                )
                .await?;
            self.notice(
                &task.channel_id,
                task_id,
                TaskStatus::Abandoned,
                format!(
                    "Task {task_id} abandoned: {} never acknowledged it ({attempts} attempts)",
                    task.to
                ),
            )
            .await?;
            warn!(task_id = %task_id, to = %task.to, attempts, "task abandoned");
        }
        Ok(())
    }

    // ── wall-clock timeouts ─────────────────────────────────────────────

    async fn check_running_tasks(&self) {
        let running = match self
            .tasks
            .list_by_status(&[TaskStatus::Acked, TaskStatus::Processing])
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to list running tasks");
                return;
            }
        };

        let now = Utc::now();
        for task in running {
            if task.from != self.agent_id() {
                continue;
            }
            let elapsed = now
                .signed_duration_since(task.dispatched_at)
                .to_std()
                .unwrap_or_default();
            if elapsed < Duration::from_millis(task.task_timeout_ms) {
                continue;
            }
            // The failure notice phase below posts the SYSTEM message.
            let result = self
                .tasks
                .transition(
                    task.task_id,
                    TaskEvent::TaskTimedOut,
                    json!({
                        "error_type": TaskErrorKind::LlmError,
                        "error_detail": format!(
                            "no result after {}ms (wall clock)",
                            task.task_timeout_ms
                        ),
                    }),
                )
                .await;
            match result {
                Ok(_) => warn!(task_id = %task.task_id, "task timed out"),
                Err(e) => warn!(task_id = %task.task_id, error = %e, "timeout transition failed"),
            }
        }
    }

    // ── failure notices and rate-limit revival ──────────────────────────

    async fn check_failed_tasks(&self) {
        let failed = match self.tasks.list_by_status(&[TaskStatus::Failed]).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to list failed tasks");
                return;
            }
        };

        for task in failed {
            if task.from != self.agent_id() {
                continue;
            }
            let result = match task.error_type {
                Some(TaskErrorKind::RateLimited) => self.schedule_retry(&task).await,
                Some(kind) => self.announce_failure(&task, kind).await,
                // Already announced, or a permission rejection the parker
                // announced itself.
                None => Ok(()),
            };
            if let Err(e) = result {
                warn!(task_id = %task.task_id, error = %e, "failure handling failed");
            }
        }
    }

    async fn schedule_retry(&self, task: &Task) -> Result<()> {
        self.tasks
            .transition(
                task.task_id,
                TaskEvent::RetryScheduled,
                json!({"current_phase": "retry_scheduled"}),
            )
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task.task_id));
        metadata.insert(meta::STATUS.into(), json!(TaskStatus::Retrying));
        self.channels
            .append_message(
                &task.channel_id,
                MessageKind::StatusUpdate,
                MessageContent::text(format!(
                    "Task {} hit a rate limit; retrying after {}ms",
                    task.task_id,
                    self.config.retry_backoff.as_millis()
                )),
                None,
                metadata,
            )
            .await?;

        info!(task_id = %task.task_id, "rate-limited task scheduled for retry");
        Ok(())
    }

    /// One SYSTEM notice per failure: announcing clears `error_type`, so the
    /// next sweep skips the task. `error_detail` stays on the record.
    async fn announce_failure(&self, task: &Task, kind: TaskErrorKind) -> Result<()> {
        let detail = task.error_detail.as_deref().unwrap_or("no detail");
        self.notice(
            well_known::PIPELINE,
            task.task_id,
            TaskStatus::Failed,
            format!(
                "Task {} ({}) failed with {kind}: {detail}",
                task.task_id, task.to
            ),
        )
        .await?;
        self.tasks
            .patch(task.task_id, json!({"error_type": null}))
            .await?;
        Ok(())
    }

    async fn check_retrying_tasks(&self) {
        let retrying = match self.tasks.list_by_status(&[TaskStatus::Retrying]).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "failed to list retrying tasks");
                return;
            }
        };

        let now = Utc::now();
        for task in retrying {
            if task.from != self.agent_id() {
                continue;
            }
            // Backoff counts from the failure, not from RetryScheduled.
            let failed_at = task.completed_at.unwrap_or(task.dispatched_at);
            let since = now.signed_duration_since(failed_at).to_std().unwrap_or_default();
            if since < self.config.retry_backoff {
                continue;
            }
            let result = if task.retries < task.max_retries {
                self.redispatch(&task).await
            } else {
                self.abandon_retrying(&task).await
            };
            if let Err(e) = result {
                warn!(task_id = %task.task_id, error = %e, "retry handling failed");
            }
        }
    }

    async fn redispatch(&self, task: &Task) -> Result<()> {
        let retried = self
            .tasks
            .transition(
                task.task_id,
                TaskEvent::RetryDispatched,
                json!({
                    "retries": task.retries + 1,
                    "dispatched_at": Utc::now(),
                    "error_type": null,
                    "error_detail": null,
                    "current_phase": "redispatched",
                }),
            )
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task.task_id));
        metadata.insert(meta::PRIORITY.into(), json!("urgent"));
        metadata.insert(meta::OUTPUT_DIR.into(), json!(retried.output_dir));
        metadata.insert(meta::TASK_TIMEOUT_MS.into(), json!(retried.task_timeout_ms));
        self.channels
            .append_message(
                &task.channel_id,
                MessageKind::TaskDispatch,
                MessageContent::text(task.instruction.clone())
                    .with_mentions(vec![task.to.clone()]),
                None,
                metadata,
            )
            .await?;

        info!(
            task_id = %task.task_id,
            attempt = retried.retries + 1,
            "re-dispatched after rate-limit backoff"
        );
        Ok(())
    }

    async fn abandon_retrying(&self, task: &Task) -> Result<()> {
        self.tasks
            .transition(
                task.task_id,
                TaskEvent::RetriesExhausted,
                json!({
                    "error_detail": format!(
                        "rate limited and out of retries ({} attempts)",
                        task.retries + 1
                    ),
                }),
            )
            .await?;
        self.notice(
            &task.channel_id,
            task.task_id,
            TaskStatus::Abandoned,
            format!(
                "Task {} abandoned: still rate limited after {} attempts",
                task.task_id,
                task.retries + 1
            ),
        )
        .await?;
        warn!(task_id = %task.task_id, "retrying task abandoned");
        Ok(())
    }

    // ── result path ─────────────────────────────────────────────────────

    /// Screen an incoming RESULT_REPORT and forward it to the pipeline
    /// channel, or hold it behind a retroactive permission record if it
    /// mentions an unallowlisted sensitive operation.
    pub async fn handle_result_report(&self, message: &Message) -> Result<()> {
        let Some(task_id) = message.meta_uuid(meta::TASK_ID) else {
            warn!(from = %message.from, "result report without a task id, ignoring");
            return Ok(());
        };
        let Some(task) = self.tasks.read(task_id).await? else {
            warn!(task_id = %task_id, "result report for unknown task, ignoring");
            return Ok(());
        };

        // Redelivered report for a result that is already held: keep holding.
        let held = self
            .permissions
            .list()
            .await?
            .into_iter()
            .any(|r| r.task_id == task_id && r.origin == PermissionOrigin::Screened);
        if held {
            return Ok(());
        }

        for hit in screen_text(&message.content.text) {
            if self.permissions.allowlist_match(&hit.operation).await?.is_some() {
                continue;
            }
            return self.hold_result(&task, &message.from, hit).await;
        }

        self.forward_result(&task, task.status, &message.content.text)
            .await
    }

    async fn hold_result(&self, task: &Task, reporter: &str, hit: ScreenHit) -> Result<()> {
        let record = PermissionRecord {
            permission_id: Uuid::new_v4(),
            task_id: task.task_id,
            agent_id: reporter.to_string(),
            channel_id: task.channel_id.clone(),
            status: PermissionStatus::Pending,
            operation: hit.operation,
            pattern: Some(hit.rule.to_string()),
            summary: hit.context,
            context_snapshot: None,
            origin: PermissionOrigin::Screened,
            requested_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            decision_reason: None,
            announced_at: None,
        };
        self.permissions.write(&record).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::PERMISSION_ID.into(), json!(record.permission_id));
        metadata.insert(meta::TASK_ID.into(), json!(task.task_id));
        self.channels
            .append_message(
                well_known::PERMISSION,
                MessageKind::PermissionRequest,
                MessageContent::text(format!(
                    "Result of task {} from {reporter} mentions {}; holding it for review",
                    task.task_id, record.operation
                )),
                None,
                metadata,
            )
            .await?;

        warn!(
            task_id = %task.task_id,
            rule = record.pattern.as_deref().unwrap_or(""),
            operation = %record.operation,
            "result held for review"
        );
        Ok(())
    }

    async fn forward_result(&self, task: &Task, status: TaskStatus, text: &str) -> Result<()> {
        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task.task_id));
        metadata.insert(meta::STATUS.into(), json!(status));
        self.channels
            .append_message(
                well_known::PIPELINE,
                MessageKind::System,
                MessageContent::text(format!(
                    "[{status}] task {} from {}: {}",
                    task.task_id,
                    task.to,
                    truncate(text, FORWARD_LEN)
                )),
                None,
                metadata,
            )
            .await?;
        Ok(())
    }

    /// Announce decisions on screened records, exactly once each.
    async fn resolve_screened_permissions(&self) {
        let records = match self.permissions.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to list permission records");
                return;
            }
        };

        for record in records {
            if record.origin != PermissionOrigin::Screened || record.announced_at.is_some() {
                continue;
            }
            let result = match record.status {
                PermissionStatus::Approved => self.release_result(&record).await,
                PermissionStatus::Rejected => self.suppress_result(&record).await,
                _ => continue,
            };
            if let Err(e) = result {
                warn!(permission_id = %record.permission_id, error = %e, "screened resolution failed");
            }
        }
    }

    async fn release_result(&self, record: &PermissionRecord) -> Result<()> {
        if let Some(task) = self.tasks.read(record.task_id).await? {
            let summary = task
                .result_summary
                .clone()
                .unwrap_or_else(|| "(no summary on record)".to_string());
            self.forward_result(&task, task.status, &summary).await?;
        } else {
            warn!(task_id = %record.task_id, "approved screened record has no task");
        }
        self.permissions.mark_announced(record.permission_id).await?;
        info!(permission_id = %record.permission_id, task_id = %record.task_id, "held result released");
        Ok(())
    }

    async fn suppress_result(&self, record: &PermissionRecord) -> Result<()> {
        let by = record.decided_by.as_deref().unwrap_or("admin");
        self.notice(
            well_known::PIPELINE,
            record.task_id,
            TaskStatus::Failed,
            format!(
                "Result of task {} from {} withheld: {} rejected by {by}",
                record.task_id, record.agent_id, record.operation
            ),
        )
        .await?;
        self.permissions.mark_announced(record.permission_id).await?;
        info!(permission_id = %record.permission_id, task_id = %record.task_id, "held result suppressed");
        Ok(())
    }

    async fn notice(
        &self,
        channel_id: &str,
        task_id: Uuid,
        status: TaskStatus,
        text: String,
    ) -> Result<()> {
        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task_id));
        metadata.insert(meta::STATUS.into(), json!(status));
        self.channels
            .append_message(
                channel_id,
                MessageKind::System,
                MessageContent::text(text),
                None,
                metadata,
            )
            .await?;
        Ok(())
    }
}

fn preview(text: &str) -> String {
    text.chars().take(160).collect()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

/// Spawn the supervision background loop. Orchestrator-side only.
pub fn spawn_monitor_loop(monitor: Arc<Monitor>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Task monitor started (interval: {}ms)", every.as_millis());

        let mut tick = tokio::time::interval(every);

        // First tick fires immediately
        loop {
            tick.tick().await;
            monitor.sweep().await;
        }
    })
}
