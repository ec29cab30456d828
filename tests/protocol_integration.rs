//! Integration tests for the dispatch protocol over a shared tree.
//!
//! Each test lays out a fresh NAS in a tempdir, builds both sides of the
//! protocol from library parts the way the daemon does, and drives the real
//! file traffic: dispatch messages, inbox drains, monitor sweeps, park
//! resolutions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::time::timeout;

use crewlink::config::{AgentRole, RuntimeConfig};
use crewlink::dispatch::Dispatcher;
use crewlink::error::ExecutorError;
use crewlink::executor::{AgentExecutor, EventStream, ExecutorEvent, ScriptedExecutor};
use crewlink::monitor::Monitor;
use crewlink::park::{Parker, WatchConfig};
use crewlink::permission::{Operation, PermissionGate, PermissionOutcome, PermissionStore};
use crewlink::store::message::well_known;
use crewlink::store::{
    AgentStatus, AgentStore, ChannelKind, ChannelStore, Message, MessageKind, NasLayout, Task,
    TaskErrorKind, TaskStatus, TaskStore,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One agent process built from library parts, sharing the NAS with its
/// peers through the filesystem alone.
struct Peer {
    config: RuntimeConfig,
    layout: NasLayout,
    agents: Arc<AgentStore>,
    channels: Arc<ChannelStore>,
    tasks: Arc<TaskStore>,
    permissions: Arc<PermissionStore>,
    dispatcher: Arc<Dispatcher>,
    parker: Arc<Parker>,
    gate: Arc<PermissionGate>,
    monitor: Arc<Monitor>,
}

async fn peer(dir: &TempDir, agent_id: &str, role: AgentRole, exec: Arc<dyn AgentExecutor>) -> Peer {
    let mut config = RuntimeConfig::default();
    config.agent_id = agent_id.to_string();
    config.display_name = agent_id.to_string();
    config.nas_root = dir.path().to_path_buf();
    config.role = role;
    config.ack_timeout = Duration::from_millis(40);
    config.task_timeout = Duration::from_secs(30);
    config.retry_backoff = Duration::from_millis(40);
    // Permission parks poll at this cadence; zero means every sweep.
    config.park_interval = Duration::ZERO;

    let layout = NasLayout::new(dir.path());
    layout.ensure_base_dirs().await.unwrap();

    let agents = Arc::new(AgentStore::new(layout.clone()));
    let tasks = Arc::new(TaskStore::new(layout.clone()));
    let channels = Arc::new(ChannelStore::new(
        layout.clone(),
        agent_id,
        config.lock_stale_after,
        config.lock_retries,
    ));
    let permissions = Arc::new(PermissionStore::new(layout.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        layout.clone(),
        Arc::clone(&channels),
        Arc::clone(&tasks),
        Arc::clone(&agents),
        exec,
    ));
    let parker = Arc::new(Parker::new(
        config.clone(),
        layout.clone(),
        Arc::clone(&tasks),
        Arc::clone(&agents),
        Arc::clone(&channels),
        Arc::clone(&permissions),
        Arc::clone(&dispatcher),
    ));
    let gate = Arc::new(PermissionGate::new(
        config.clone(),
        Arc::clone(&permissions),
        Arc::clone(&channels),
        Arc::clone(&parker),
    ));
    let monitor = Arc::new(Monitor::new(
        config.clone(),
        Arc::clone(&tasks),
        Arc::clone(&channels),
        Arc::clone(&permissions),
    ));

    for channel_id in [well_known::PIPELINE, well_known::PERMISSION] {
        channels
            .ensure_channel(channel_id, ChannelKind::Group, &[agent_id.to_string()])
            .await
            .unwrap();
    }
    agents.register(agent_id, agent_id).await.unwrap();

    Peer {
        config,
        layout,
        agents,
        channels,
        tasks,
        permissions,
        dispatcher,
        parker,
        gate,
        monitor,
    }
}

/// Drain the peer's inbox once, routing messages the way the daemon does.
async fn deliver(peer: &Peer) {
    for message in peer.channels.read_inbox().await.unwrap() {
        match message.kind {
            MessageKind::TaskDispatch => {
                peer.dispatcher.handle_dispatch(&message).await.unwrap();
            }
            MessageKind::ResultReport if peer.config.role == AgentRole::Orchestrator => {
                peer.monitor.handle_result_report(&message).await.unwrap();
            }
            _ => {}
        }
    }
}

async fn wait_status(peer: &Peer, task_id: uuid::Uuid, want: TaskStatus) -> Task {
    for _ in 0..400 {
        let task = peer.tasks.read(task_id).await.unwrap().unwrap();
        if task.status == want {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let task = peer.tasks.read(task_id).await.unwrap().unwrap();
    panic!("task stuck in {} while waiting for {want}", task.status);
}

async fn wait_agent(peer: &Peer, agent_id: &str, want: AgentStatus) {
    for _ in 0..400 {
        let record = peer.agents.read(agent_id).await.unwrap().unwrap();
        if record.status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let record = peer.agents.read(agent_id).await.unwrap().unwrap();
    panic!("agent {agent_id} stuck in {:?} while waiting for {want:?}", record.status);
}

async fn channel_messages(peer: &Peer, channel_id: &str) -> Vec<Message> {
    let dir = peer.layout.messages_dir(channel_id);
    let mut paths: Vec<_> = match std::fs::read_dir(&dir) {
        Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
        Err(_) => return Vec::new(),
    };
    paths.sort();
    let mut messages = Vec::new();
    for path in paths {
        let body = std::fs::read_to_string(&path).unwrap();
        messages.push(serde_json::from_str(&body).unwrap());
    }
    messages
}

/// Stub executor whose first session emits one tool event and then hangs,
/// leaving the task in PROCESSING; later sessions complete normally. Lets a
/// test park a task while its session is still live.
struct HangThenFinish {
    calls: AtomicUsize,
    final_text: String,
}

impl HangThenFinish {
    fn new(final_text: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            final_text: final_text.to_string(),
        }
    }
}

#[async_trait]
impl AgentExecutor for HangThenFinish {
    fn name(&self) -> &str {
        "hang-then-finish"
    }

    async fn execute(&self, _instruction: &str) -> Result<EventStream, ExecutorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let opening = futures_util::stream::iter(vec![ExecutorEvent::Tool {
                text: "working".to_string(),
            }]);
            Ok(Box::pin(opening.chain(futures_util::stream::pending())))
        } else {
            Ok(Box::pin(futures_util::stream::iter(vec![
                ExecutorEvent::final_ok(self.final_text.clone()),
            ])))
        }
    }
}

// ── Dispatch round trip ──────────────────────────────────────────────

#[tokio::test]
async fn dispatch_runs_to_done_and_reports_to_pipeline() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.push_session(vec![
            ExecutorEvent::Tool {
                text: "outlining".into(),
            },
            ExecutorEvent::final_ok("Report finished, see report.md"),
        ]);
        let lead = peer(&dir, "lead", AgentRole::Orchestrator, Arc::new(ScriptedExecutor::new())).await;
        let codey = peer(&dir, "codey", AgentRole::Worker, exec).await;

        let task = lead
            .dispatcher
            .dispatch("codey", "write the quarterly report")
            .await
            .unwrap();

        // The work product appears in the task's output directory.
        let output_dir = task.output_dir.clone().unwrap();
        std::fs::write(format!("{output_dir}/report.md"), "q3 numbers").unwrap();

        deliver(&codey).await;
        let done = wait_status(&lead, task.task_id, TaskStatus::Done).await;
        assert!(done.acked_at.is_some());
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(done.result_summary.as_deref(), Some("Report finished, see report.md"));
        assert!(done.asset_paths.iter().any(|p| p.ends_with("report.md")));

        // The worker flips back to idle only after its report is on disk.
        wait_agent(&codey, "codey", AgentStatus::Idle).await;

        // The dm channel holds the whole exchange.
        let dm = channel_messages(&lead, "dm_codey").await;
        assert!(dm.iter().any(|m| m.kind == MessageKind::TaskDispatch));
        assert!(dm.iter().any(|m| m.kind == MessageKind::TaskAck));
        let report = dm
            .iter()
            .find(|m| m.kind == MessageKind::ResultReport)
            .expect("no result report in dm channel");
        assert!(report.content.attachments.iter().any(|p| p.ends_with("report.md")));

        // The orchestrator forwards the clean result to the pipeline channel.
        deliver(&lead).await;
        let pipeline = channel_messages(&lead, well_known::PIPELINE).await;
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline[0].content.text.contains("Report finished"));
    })
    .await
    .expect("test timed out");
}

// ── Retries and abandonment ──────────────────────────────────────────

#[tokio::test]
async fn silent_assignee_gets_three_attempts_then_abandonment() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let lead = peer(&dir, "lead", AgentRole::Orchestrator, Arc::new(ScriptedExecutor::new())).await;

        // "ghost" never polls its inbox.
        let task = lead.dispatcher.dispatch("ghost", "are you there").await.unwrap();

        for attempt in 1..=2u32 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            lead.monitor.sweep().await;
            let current = lead.tasks.read(task.task_id).await.unwrap().unwrap();
            assert_eq!(current.status, TaskStatus::Timeout);
            assert_eq!(current.retries, attempt);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        lead.monitor.sweep().await;
        let current = lead.tasks.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(current.status, TaskStatus::Abandoned);
        assert_eq!(current.retries, 2);

        // One original delivery plus two retries sit in the ghost's inbox,
        // and every one of them resolves to the same dispatch.
        let ghost_channels = ChannelStore::new(
            lead.layout.clone(),
            "ghost",
            lead.config.lock_stale_after,
            lead.config.lock_retries,
        );
        let inbox = ghost_channels.read_inbox().await.unwrap();
        let dispatches: Vec<&Message> = inbox
            .iter()
            .filter(|m| m.kind == MessageKind::TaskDispatch)
            .collect();
        assert_eq!(dispatches.len(), 3);

        let dm = channel_messages(&lead, "dm_ghost").await;
        assert!(
            dm.iter()
                .any(|m| m.kind == MessageKind::System && m.content.text.contains("abandoned"))
        );
    })
    .await
    .expect("test timed out");
}

// ── Rate-limit revival ───────────────────────────────────────────────

#[tokio::test]
async fn rate_limited_failure_revives_unattended() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        exec.push_session(vec![ExecutorEvent::final_err("HTTP 429 too many requests")]);
        exec.push_session(vec![ExecutorEvent::final_ok("second try worked")]);
        let lead = peer(&dir, "lead", AgentRole::Orchestrator, Arc::new(ScriptedExecutor::new())).await;
        let codey = peer(&dir, "codey", AgentRole::Worker, exec).await;

        let task = lead.dispatcher.dispatch("codey", "fetch the rates").await.unwrap();
        deliver(&codey).await;

        let failed = wait_status(&lead, task.task_id, TaskStatus::Failed).await;
        assert_eq!(failed.error_type, Some(TaskErrorKind::RateLimited));

        // First sweep schedules the retry, second one re-dispatches after
        // the backoff.
        lead.monitor.sweep().await;
        assert_eq!(
            lead.tasks.read(task.task_id).await.unwrap().unwrap().status,
            TaskStatus::Retrying
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        lead.monitor.sweep().await;
        let redispatched = lead.tasks.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(redispatched.status, TaskStatus::Dispatched);
        assert_eq!(redispatched.retries, 1);

        deliver(&codey).await;
        let done = wait_status(&lead, task.task_id, TaskStatus::Done).await;
        assert_eq!(done.result_summary.as_deref(), Some("second try worked"));

        // The monitor never announced the rate limit; revival is silent.
        let pipeline = channel_messages(&lead, well_known::PIPELINE).await;
        assert!(pipeline.is_empty());
    })
    .await
    .expect("test timed out");
}

// ── Parking ──────────────────────────────────────────────────────────

#[tokio::test]
async fn parked_task_resumes_when_watched_file_appears() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let lead = peer(&dir, "lead", AgentRole::Orchestrator, Arc::new(ScriptedExecutor::new())).await;
        let codey = peer(
            &dir,
            "codey",
            AgentRole::Worker,
            Arc::new(HangThenFinish::new("deployment verified")),
        )
        .await;

        let task = lead
            .dispatcher
            .dispatch("codey", "verify the deployment")
            .await
            .unwrap();
        deliver(&codey).await;
        wait_status(&codey, task.task_id, TaskStatus::Processing).await;

        let flag = dir.path().join("deploy.done");
        codey
            .parker
            .park(
                task.task_id,
                WatchConfig::File { path: flag.clone() },
                "The deploy marker exists now; confirm the service is healthy.",
                Duration::ZERO,
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(
            codey.tasks.read(task.task_id).await.unwrap().unwrap().status,
            TaskStatus::Parked
        );
        assert_eq!(
            codey.agents.read("codey").await.unwrap().unwrap().status,
            AgentStatus::Waiting
        );

        // Condition not met yet: still parked after a sweep.
        codey.parker.sweep().await;
        assert_eq!(
            codey.tasks.read(task.task_id).await.unwrap().unwrap().status,
            TaskStatus::Parked
        );

        std::fs::write(&flag, "ok").unwrap();
        codey.parker.sweep().await;
        let done = wait_status(&codey, task.task_id, TaskStatus::Done).await;
        assert_eq!(done.result_summary.as_deref(), Some("deployment verified"));

        let dm = channel_messages(&codey, "dm_codey").await;
        assert!(dm.iter().any(|m| m.content.text.contains("parked")));
        assert!(dm.iter().any(|m| m.content.text.contains("resumed")));
    })
    .await
    .expect("test timed out");
}

// ── Permission gate ──────────────────────────────────────────────────

#[tokio::test]
async fn rejected_permission_fails_the_task_with_denial() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let lead = peer(&dir, "lead", AgentRole::Orchestrator, Arc::new(ScriptedExecutor::new())).await;
        let codey = peer(
            &dir,
            "codey",
            AgentRole::Worker,
            Arc::new(HangThenFinish::new("unused")),
        )
        .await;

        let task = lead.dispatcher.dispatch("codey", "clean the cache").await.unwrap();
        deliver(&codey).await;
        wait_status(&codey, task.task_id, TaskStatus::Processing).await;

        let outcome = codey
            .gate
            .request_permission(
                task.task_id,
                Operation::Shell {
                    command: "rm -rf /srv/cache".to_string(),
                },
                "the cache directory must be recreated from scratch",
                "Permission granted; run the cleanup.",
            )
            .await
            .unwrap();
        let record = match outcome {
            PermissionOutcome::Parked(record) => record,
            other => panic!("expected a parked outcome, got {other:?}"),
        };
        assert_eq!(
            codey.tasks.read(task.task_id).await.unwrap().unwrap().status,
            TaskStatus::Parked
        );
        let asks = channel_messages(&codey, well_known::PERMISSION).await;
        assert!(asks.iter().any(|m| m.kind == MessageKind::PermissionRequest));

        codey
            .permissions
            .decide(record.permission_id, false, "harvey", Some("not on prod".into()))
            .await
            .unwrap();
        codey.parker.sweep().await;

        let failed = codey.tasks.read(task.task_id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(
            failed
                .error_detail
                .as_deref()
                .unwrap()
                .contains("Permission denied: not on prod")
        );
        assert_eq!(
            codey.agents.read("codey").await.unwrap().unwrap().status,
            AgentStatus::Idle
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn allowlisted_operation_approves_without_parking() {
    timeout(TEST_TIMEOUT, async {
        let dir = TempDir::new().unwrap();
        let lead = peer(&dir, "lead", AgentRole::Orchestrator, Arc::new(ScriptedExecutor::new())).await;
        let codey = peer(
            &dir,
            "codey",
            AgentRole::Worker,
            Arc::new(HangThenFinish::new("pushed")),
        )
        .await;
        codey
            .permissions
            .add_allowlist_pattern("shell(git push)", "harvey")
            .await
            .unwrap();

        let task = lead.dispatcher.dispatch("codey", "push the branch").await.unwrap();
        deliver(&codey).await;
        wait_status(&codey, task.task_id, TaskStatus::Processing).await;

        let outcome = codey
            .gate
            .request_permission(
                task.task_id,
                Operation::Shell {
                    command: "git push origin main".to_string(),
                },
                "publish the release branch",
                "unused",
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PermissionOutcome::AutoApproved(_)));

        // No park: the session keeps running.
        assert_eq!(
            codey.tasks.read(task.task_id).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
        let records = codey.permissions.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decided_by.as_deref(), Some("allowlist"));
    })
    .await
    .expect("test timed out");
}
