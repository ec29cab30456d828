//! Task parking — waiting on the outside world without a live session.
//!
//! A session that needs to wait (for a CI run, a file drop, a human
//! decision) ends instead of blocking an executor. The task record moves
//! to PARKED, a ParkedTaskInfo file describes what to watch, and the park
//! monitor resumes the task with a fresh session once the condition holds.

pub mod watch;

pub use watch::{WatchConfig, WatchOutcome, evaluate};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, StoreError, TaskError};
use crate::permission::PermissionStore;
use crate::store::message::meta;
use crate::store::paths::NasLayout;
use crate::store::{
    AgentStatus, AgentStore, ChannelStore, MessageContent, MessageKind, Task, TaskEvent,
    TaskStatus, TaskStore,
};

/// A task waiting on an external condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedTaskInfo {
    pub task_id: Uuid,
    pub agent_id: String,
    pub channel_id: String,
    pub original_instruction: String,
    pub resume_prompt: String,
    pub watch: WatchConfig,
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
    pub parked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub poll_count: u64,
}

/// File-backed parked-task records, one per task.
#[derive(Debug, Clone)]
pub struct ParkStore {
    layout: NasLayout,
}

impl ParkStore {
    pub fn new(layout: NasLayout) -> Self {
        Self { layout }
    }

    pub async fn write(&self, info: &ParkedTaskInfo) -> Result<()> {
        let path = self.layout.parked_record(info.task_id);
        crate::store::write_record(&path, info).await?;
        Ok(())
    }

    pub async fn read(&self, task_id: Uuid) -> Result<Option<ParkedTaskInfo>> {
        let path = self.layout.parked_record(task_id);
        Ok(crate::store::read_record(&path).await?)
    }

    /// Removing a record that is already gone is fine; two monitors racing
    /// on the same resolution both succeed here.
    pub async fn remove(&self, task_id: Uuid) -> Result<()> {
        let path = self.layout.parked_record(task_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::from(e).into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<ParkedTaskInfo>> {
        let dir = self.layout.parked_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await.map_err(StoreError::from)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(StoreError::from)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match crate::store::read_record::<ParkedTaskInfo>(&path).await {
                Ok(Some(info)) => records.push(info),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable parked record");
                }
            }
        }
        records.sort_by_key(|r| r.parked_at);
        Ok(records)
    }
}

/// Parks tasks and resumes them when their watch condition resolves.
pub struct Parker {
    config: RuntimeConfig,
    store: ParkStore,
    tasks: Arc<TaskStore>,
    agents: Arc<AgentStore>,
    channels: Arc<ChannelStore>,
    permissions: Arc<PermissionStore>,
    dispatcher: Arc<Dispatcher>,
    http: reqwest::Client,
}

impl Parker {
    pub fn new(
        config: RuntimeConfig,
        layout: NasLayout,
        tasks: Arc<TaskStore>,
        agents: Arc<AgentStore>,
        channels: Arc<ChannelStore>,
        permissions: Arc<PermissionStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config,
            store: ParkStore::new(layout),
            tasks,
            agents,
            channels,
            permissions,
            dispatcher,
            http: reqwest::Client::new(),
        }
    }

    pub(crate) async fn task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.tasks.read(task_id).await
    }

    /// Park a PROCESSING task on a watch condition. The live session is
    /// expected to end right after this; it will see PARKED and report
    /// nothing.
    pub async fn park(
        &self,
        task_id: Uuid,
        watch: WatchConfig,
        resume_prompt: &str,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<ParkedTaskInfo> {
        let task = self
            .tasks
            .read(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        let info = ParkedTaskInfo {
            task_id,
            agent_id: self.config.agent_id.clone(),
            channel_id: task.channel_id.clone(),
            original_instruction: task.instruction.clone(),
            resume_prompt: resume_prompt.to_string(),
            watch,
            poll_interval_ms: poll_interval.as_millis() as u64,
            max_wait_ms: max_wait.as_millis() as u64,
            parked_at: Utc::now(),
            last_poll_at: None,
            poll_count: 0,
        };

        // Record first: a PARKED task with no record would wait forever.
        self.store.write(&info).await?;
        if let Err(e) = self
            .tasks
            .transition(task_id, TaskEvent::ParkStarted, json!({"current_phase": "parked"}))
            .await
        {
            if let Err(cleanup) = self.store.remove(task_id).await {
                warn!(task_id = %task_id, error = %cleanup, "failed to drop parked record");
            }
            return Err(e);
        }

        self.agents
            .set_status(&self.config.agent_id, AgentStatus::Waiting, Some(task_id))
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task_id));
        metadata.insert(meta::STATUS.into(), json!(TaskStatus::Parked));
        self.channels
            .append_message(
                &info.channel_id,
                MessageKind::StatusUpdate,
                MessageContent::text(format!(
                    "Task {task_id} parked: waiting on {}",
                    info.watch.describe()
                )),
                None,
                metadata,
            )
            .await?;

        info!(task_id = %task_id, watch = %info.watch.describe(), "task parked");
        Ok(info)
    }

    /// One monitor pass over this agent's parked tasks.
    pub async fn sweep(&self) {
        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to list parked tasks");
                return;
            }
        };
        for info in records {
            if info.agent_id != self.config.agent_id {
                continue;
            }
            let task_id = info.task_id;
            if let Err(e) = self.check_one(info).await {
                warn!(task_id = %task_id, error = %e, "park check failed");
            }
        }
    }

    async fn check_one(&self, mut info: ParkedTaskInfo) -> Result<()> {
        let task_id = info.task_id;
        let task = match self.tasks.read(task_id).await? {
            Some(task) => task,
            None => {
                warn!(task_id = %task_id, "parked record without a task, dropping");
                return self.store.remove(task_id).await;
            }
        };
        if task.status != TaskStatus::Parked {
            // Cancelled or otherwise moved on while parked; the record is stale.
            debug!(task_id = %task_id, status = %task.status, "parked record is stale, dropping");
            return self.store.remove(task_id).await;
        }

        let now = Utc::now();
        let waited = now
            .signed_duration_since(info.parked_at)
            .to_std()
            .unwrap_or_default();
        if waited >= Duration::from_millis(info.max_wait_ms) {
            return self.expire(&info, waited).await;
        }

        let baseline = info.last_poll_at.unwrap_or(info.parked_at);
        let since_poll = now
            .signed_duration_since(baseline)
            .to_std()
            .unwrap_or_default();
        if since_poll < Duration::from_millis(info.poll_interval_ms) {
            return Ok(());
        }

        info.last_poll_at = Some(now);
        info.poll_count += 1;
        match evaluate(&info.watch, &self.http, &self.permissions).await {
            WatchOutcome::NotMet => self.store.write(&info).await,
            WatchOutcome::Met { observation } => self.resume(info, &observation).await,
            WatchOutcome::Rejected { reason } => self.reject(info, &reason).await,
        }
    }

    async fn expire(&self, info: &ParkedTaskInfo, waited: Duration) -> Result<()> {
        let task_id = info.task_id;
        self.tasks
            .transition(
                task_id,
                TaskEvent::ParkExpired,
                json!({
                    "error_type": crate::store::TaskErrorKind::LlmError,
                    "error_detail": format!(
                        "park timeout: waited {}ms on {}",
                        waited.as_millis(),
                        info.watch.describe()
                    ),
                }),
            )
            .await?;
        self.store.remove(task_id).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task_id));
        metadata.insert(meta::STATUS.into(), json!(TaskStatus::Failed));
        self.channels
            .append_message(
                &info.channel_id,
                MessageKind::System,
                MessageContent::text(format!(
                    "Task {task_id} gave up waiting on {}",
                    info.watch.describe()
                )),
                None,
                metadata,
            )
            .await?;

        self.release_agent(task_id).await;
        warn!(task_id = %task_id, waited_ms = waited.as_millis() as u64, "parked task expired");
        Ok(())
    }

    /// Resume exactly once: the ParkResolved transition is the claim, so a
    /// racing monitor gets InvalidTransition instead of a second session.
    async fn resume(&self, info: ParkedTaskInfo, observation: &str) -> Result<()> {
        let task_id = info.task_id;
        let task = self
            .tasks
            .transition(task_id, TaskEvent::ParkResolved, json!({"current_phase": "resuming"}))
            .await?;
        self.store.remove(task_id).await?;
        self.agents
            .set_status(&self.config.agent_id, AgentStatus::Working, Some(task_id))
            .await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task_id));
        metadata.insert(meta::STATUS.into(), json!(TaskStatus::Processing));
        self.channels
            .append_message(
                &info.channel_id,
                MessageKind::StatusUpdate,
                MessageContent::text(format!("Task {task_id} resumed: {}", info.watch.describe())),
                None,
                metadata,
            )
            .await?;

        info!(task_id = %task_id, polls = info.poll_count, "parked task resumed");

        // The resumed session carries the original instruction, the resume
        // prompt, and what was observed; the stored record keeps only the
        // original instruction.
        let mut session_task = task;
        session_task.instruction = resume_instruction(&info, observation);
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            dispatcher.run_session(session_task).await;
        });
        Ok(())
    }

    async fn reject(&self, info: ParkedTaskInfo, reason: &str) -> Result<()> {
        let task_id = info.task_id;
        self.tasks
            .transition(
                task_id,
                TaskEvent::ParkRejected,
                json!({
                    "error_detail": format!("Permission denied: {reason}"),
                    "current_phase": "failed",
                }),
            )
            .await?;
        self.store.remove(task_id).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(meta::TASK_ID.into(), json!(task_id));
        metadata.insert(meta::STATUS.into(), json!(TaskStatus::Failed));
        self.channels
            .append_message(
                &info.channel_id,
                MessageKind::System,
                MessageContent::text(format!("Task {task_id} failed: Permission denied: {reason}")),
                None,
                metadata,
            )
            .await?;

        self.release_agent(task_id).await;
        warn!(task_id = %task_id, reason, "parked task rejected");
        Ok(())
    }

    async fn release_agent(&self, task_id: Uuid) {
        let me = &self.config.agent_id;
        match self.agents.read(me).await {
            Ok(Some(record)) if record.current_task == Some(task_id) => {
                if let Err(e) = self.agents.set_status(me, AgentStatus::Idle, None).await {
                    warn!(error = %e, "failed to reset agent status");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read own agent record"),
        }
    }
}

fn resume_instruction(info: &ParkedTaskInfo, observation: &str) -> String {
    format!(
        "{}\n\n{}\n\nObserved condition: {observation}",
        info.original_instruction, info.resume_prompt
    )
}

/// Spawn the park monitor background loop.
pub fn spawn_park_monitor_loop(parker: Arc<Parker>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Park monitor started (interval: {}ms)", every.as_millis());

        let mut tick = tokio::time::interval(every);

        // First tick fires immediately
        loop {
            tick.tick().await;
            parker.sweep().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AgentExecutor, ScriptedExecutor};
    use crate::permission::{Operation, PermissionOrigin, PermissionRecord, PermissionStatus};
    use crate::store::ChannelKind;
    use tempfile::TempDir;

    struct Rig {
        parker: Parker,
        worker_exec: Arc<ScriptedExecutor>,
        tasks: Arc<TaskStore>,
        channels: Arc<ChannelStore>,
        permissions: Arc<PermissionStore>,
        dir: TempDir,
    }

    async fn rig() -> Rig {
        let dir = TempDir::new().unwrap();
        let layout = NasLayout::new(dir.path());
        layout.ensure_base_dirs().await.unwrap();

        let mut config = RuntimeConfig::default();
        config.agent_id = "codey".to_string();
        config.nas_root = dir.path().to_path_buf();

        let tasks = Arc::new(TaskStore::new(layout.clone()));
        let agents = Arc::new(AgentStore::new(layout.clone()));
        let channels = Arc::new(ChannelStore::new(
            layout.clone(),
            "codey",
            Duration::from_secs(30),
            3,
        ));
        let permissions = Arc::new(PermissionStore::new(layout.clone()));
        let worker_exec = Arc::new(ScriptedExecutor::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            layout.clone(),
            Arc::clone(&channels),
            Arc::clone(&tasks),
            Arc::clone(&agents),
            Arc::clone(&worker_exec) as Arc<dyn AgentExecutor>,
        ));
        agents.register("codey", "Codey").await.unwrap();

        let parker = Parker::new(
            config,
            layout,
            Arc::clone(&tasks),
            agents,
            Arc::clone(&channels),
            Arc::clone(&permissions),
            dispatcher,
        );
        Rig {
            parker,
            worker_exec,
            tasks,
            channels,
            permissions,
            dir,
        }
    }

    /// A task already in PROCESSING, as it would be mid-session.
    async fn processing_task(rig: &Rig, instruction: &str) -> Task {
        rig.channels
            .ensure_channel("dm_codey", ChannelKind::Dm, &["lead".into(), "codey".into()])
            .await
            .unwrap();
        let mut task = Task::new("lead", "codey", "dm_codey", instruction);
        task.max_retries = 2;
        rig.tasks.write(&task).await.unwrap();
        rig.tasks
            .transition(task.task_id, TaskEvent::AckReceived, serde_json::Value::Null)
            .await
            .unwrap();
        rig.tasks
            .transition(task.task_id, TaskEvent::SessionStarted, serde_json::Value::Null)
            .await
            .unwrap()
    }

    async fn wait_for_status(tasks: &TaskStore, id: Uuid, status: TaskStatus) -> Task {
        for _ in 0..200 {
            if let Some(task) = tasks.read(id).await.unwrap()
                && task.status == status
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached {status}");
    }

    #[tokio::test]
    async fn park_writes_record_and_moves_task() {
        let rig = rig().await;
        let task = processing_task(&rig, "wait for the build").await;

        let info = rig
            .parker
            .park(
                task.task_id,
                WatchConfig::File { path: rig.dir.path().join("flag") },
                "The build finished.",
                Duration::from_millis(0),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(info.original_instruction, "wait for the build");

        let current = rig.tasks.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Parked);
        assert!(rig.parker.store.read(task.task_id).await.unwrap().is_some());

        let agent = rig.parker.agents.read("codey").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Waiting);
        assert_eq!(agent.current_task, Some(task.task_id));
    }

    #[tokio::test]
    async fn park_refuses_non_processing_task() {
        let rig = rig().await;
        let task = Task::new("lead", "codey", "dm_codey", "never started");
        rig.tasks.write(&task).await.unwrap();

        let result = rig
            .parker
            .park(
                task.task_id,
                WatchConfig::File { path: rig.dir.path().join("flag") },
                "resume",
                Duration::from_millis(0),
                Duration::from_secs(60),
            )
            .await;
        assert!(result.is_err());
        // The record must not linger either.
        assert!(rig.parker.store.read(task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_resumes_once_when_condition_met() {
        let rig = rig().await;
        let task = processing_task(&rig, "report when the flag drops").await;
        let flag = rig.dir.path().join("flag");

        rig.parker
            .park(
                task.task_id,
                WatchConfig::File { path: flag.clone() },
                "The flag file is there now; summarize it.",
                Duration::from_millis(0),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        // Condition not met yet: still parked, poll recorded.
        rig.parker.sweep().await;
        let info = rig.parker.store.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(info.poll_count, 1);
        assert!(info.last_poll_at.is_some());

        tokio::fs::write(&flag, b"done").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        rig.parker.sweep().await;

        let done = wait_for_status(&rig.tasks, task.task_id, TaskStatus::Done).await;
        assert!(done.completed_at.is_some());
        assert!(rig.parker.store.read(task.task_id).await.unwrap().is_none());

        // The resumed session saw original + resume prompt + observation.
        let seen = rig.worker_exec.instructions();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("report when the flag drops"));
        assert!(seen[0].contains("The flag file is there now"));
        assert!(seen[0].contains("Observed condition"));

        // Nothing left to resume; no second session.
        rig.parker.sweep().await;
        assert_eq!(rig.worker_exec.instructions().len(), 1);
    }

    #[tokio::test]
    async fn sweep_expires_past_max_wait() {
        let rig = rig().await;
        let task = processing_task(&rig, "wait forever").await;

        rig.parker
            .park(
                task.task_id,
                WatchConfig::Shell { command: "exit 1".into() },
                "resume",
                Duration::from_millis(0),
                Duration::from_millis(1),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.parker.sweep().await;

        let failed = rig.tasks.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error_detail.as_deref().unwrap_or("").contains("park timeout"));
        assert!(rig.parker.store.read(task.task_id).await.unwrap().is_none());

        let agent = rig.parker.agents.read("codey").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn rejected_permission_fails_task() {
        let rig = rig().await;
        let task = processing_task(&rig, "push the release").await;

        let record = PermissionRecord {
            permission_id: Uuid::new_v4(),
            task_id: task.task_id,
            agent_id: "codey".into(),
            channel_id: "dm_codey".into(),
            status: PermissionStatus::Pending,
            operation: Operation::Shell { command: "git push --force".into() },
            pattern: None,
            summary: "force push".into(),
            context_snapshot: None,
            origin: PermissionOrigin::Requested,
            requested_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            decision_reason: None,
            announced_at: None,
        };
        rig.permissions.write(&record).await.unwrap();

        rig.parker
            .park(
                task.task_id,
                WatchConfig::Permission { permission_id: record.permission_id },
                "resume",
                Duration::from_millis(0),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        rig.permissions
            .decide(record.permission_id, false, "harvey", Some("not today".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        rig.parker.sweep().await;

        let failed = rig.tasks.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(
            failed
                .error_detail
                .as_deref()
                .unwrap_or("")
                .contains("Permission denied: not today")
        );
        assert!(rig.worker_exec.instructions().is_empty());
    }

    #[tokio::test]
    async fn sweep_skips_records_of_other_agents() {
        let rig = rig().await;
        let task = processing_task(&rig, "someone else's wait").await;
        let mut info = rig
            .parker
            .park(
                task.task_id,
                WatchConfig::Shell { command: "true".into() },
                "resume",
                Duration::from_millis(0),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        info.agent_id = "robo".to_string();
        rig.parker.store.write(&info).await.unwrap();

        rig.parker.sweep().await;
        let untouched = rig.parker.store.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(untouched.poll_count, 0);
        assert_eq!(
            rig.tasks.read(task.task_id).await.unwrap().unwrap().status,
            TaskStatus::Parked
        );
    }

    #[tokio::test]
    async fn stale_record_for_finished_task_is_dropped() {
        let rig = rig().await;
        let task = processing_task(&rig, "cancelled while parked").await;
        rig.parker
            .park(
                task.task_id,
                WatchConfig::Shell { command: "true".into() },
                "resume",
                Duration::from_millis(0),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        rig.tasks
            .transition(task.task_id, TaskEvent::Cancel, serde_json::Value::Null)
            .await
            .unwrap();

        rig.parker.sweep().await;
        assert!(rig.parker.store.read(task.task_id).await.unwrap().is_none());
        assert!(rig.worker_exec.instructions().is_empty());
    }
}
