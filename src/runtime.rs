//! Process runtime — wiring, background loops, and the inbox poll.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AgentRole, RuntimeConfig};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::executor::AgentExecutor;
use crate::monitor::{Monitor, spawn_monitor_loop};
use crate::park::{Parker, spawn_park_monitor_loop};
use crate::permission::{PermissionGate, PermissionStore};
use crate::store::message::{dm_channel, well_known};
use crate::store::{
    AgentStatus, AgentStore, ChannelKind, ChannelStore, Message, MessageKind, NasLayout, TaskStore,
};

/// One agent process over the shared tree: stores, both halves of the
/// dispatch protocol, the parking and supervision loops, and the inbox poll
/// that drives everything.
pub struct AgentRuntime {
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

impl AgentRuntime {
    pub fn new(config: RuntimeConfig, executor: Arc<dyn AgentExecutor>) -> Self {
        let layout = NasLayout::new(&config.nas_root);
        let agents = Arc::new(AgentStore::new(layout.clone()));
        let tasks = Arc::new(TaskStore::new(layout.clone()));
        let channels = Arc::new(ChannelStore::new(
            layout.clone(),
            config.agent_id.clone(),
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
            executor,
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

        Self {
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

    // ── Convenience accessors ───────────────────────────────────────────

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn permission_gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn channels(&self) -> &Arc<ChannelStore> {
        &self.channels
    }

    pub fn agents(&self) -> &Arc<AgentStore> {
        &self.agents
    }

    // ── Startup ─────────────────────────────────────────────────────────

    /// Create the shared tree, join the well-known channels, and register
    /// this agent. Safe to run on every boot.
    async fn bootstrap(&self) -> Result<()> {
        self.layout.ensure_base_dirs().await?;

        let me = self.config.agent_id.clone();
        for channel_id in [
            well_known::GENERAL,
            well_known::PIPELINE,
            well_known::PERMISSION,
            well_known::UPGRADE,
        ] {
            self.channels
                .ensure_channel(channel_id, ChannelKind::Group, std::slice::from_ref(&me))
                .await?;
        }
        self.channels
            .ensure_channel(&dm_channel(&me), ChannelKind::Dm, std::slice::from_ref(&me))
            .await?;

        self.agents.register(&me, &self.config.display_name).await?;
        info!(
            agent_id = %me,
            role = self.config.role.as_str(),
            nas = %self.config.nas_root.display(),
            "agent registered"
        );
        Ok(())
    }

    // ── Main loop ───────────────────────────────────────────────────────

    /// Run until Ctrl+C: background loops plus the inbox poll.
    pub async fn run(self) -> Result<()> {
        self.bootstrap().await?;

        let heartbeat_handle = spawn_heartbeat_loop(
            Arc::clone(&self.agents),
            self.config.agent_id.clone(),
            self.config.heartbeat_interval,
        );
        let park_handle = spawn_park_monitor_loop(Arc::clone(&self.parker), self.config.park_interval);
        let monitor_handle = match self.config.role {
            AgentRole::Orchestrator => Some(spawn_monitor_loop(
                Arc::clone(&self.monitor),
                self.config.monitor_interval,
            )),
            AgentRole::Worker => None,
        };

        info!("Agent {} ready and polling", self.config.agent_id);

        let mut poll = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, shutting down...");
                    break;
                }
                _ = poll.tick() => {
                    self.poll_inbox().await;
                }
            }
        }

        info!("Agent shutting down...");
        heartbeat_handle.abort();
        park_handle.abort();
        if let Some(handle) = monitor_handle {
            handle.abort();
        }
        if let Err(e) = self
            .agents
            .set_status(&self.config.agent_id, AgentStatus::Offline, None)
            .await
        {
            warn!(error = %e, "failed to mark agent offline");
        }
        Ok(())
    }

    /// Drain the inbox once. Handler errors are logged per message so one
    /// bad message never blocks the rest of the drain.
    async fn poll_inbox(&self) {
        let messages = match self.channels.read_inbox().await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "inbox read failed");
                return;
            }
        };
        for message in messages {
            if let Err(e) = self.route(&message).await {
                warn!(
                    message_id = %message.message_id,
                    kind = %message.kind,
                    error = %e,
                    "message handling failed"
                );
            }
        }
    }

    async fn route(&self, message: &Message) -> Result<()> {
        match message.kind {
            MessageKind::TaskDispatch => self.dispatcher.handle_dispatch(message).await,
            MessageKind::ResultReport => match self.config.role {
                AgentRole::Orchestrator => self.monitor.handle_result_report(message).await,
                AgentRole::Worker => {
                    debug!(from = %message.from, "result report noted");
                    Ok(())
                }
            },
            MessageKind::PermissionRequest => {
                // Decisions come from outside the daemon; surface the ask.
                info!(
                    from = %message.from,
                    text = %message.content.text,
                    "permission request awaiting a decision"
                );
                Ok(())
            }
            MessageKind::TaskAck
            | MessageKind::System
            | MessageKind::StatusUpdate
            | MessageKind::Chat => {
                debug!(
                    channel = %message.channel_id,
                    from = %message.from,
                    kind = %message.kind,
                    "inbox message"
                );
                Ok(())
            }
        }
    }
}

/// Spawn the registry heartbeat background loop.
pub fn spawn_heartbeat_loop(
    agents: Arc<AgentStore>,
    agent_id: String,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Heartbeat started (interval: {}ms)", every.as_millis());

        let mut tick = tokio::time::interval(every);

        // First tick fires immediately
        loop {
            tick.tick().await;
            if let Err(e) = agents.heartbeat(&agent_id).await {
                warn!(error = %e, "heartbeat write failed");
            }
        }
    })
}
