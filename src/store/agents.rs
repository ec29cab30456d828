//! Agent registry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::paths::NasLayout;

/// What an agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Offline,
    Idle,
    Working,
    /// Parked on an external condition or a permission decision.
    Waiting,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Waiting => "waiting",
        };
        write!(f, "{s}")
    }
}

/// Presence record, one per agent, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub display_name: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// File-backed agent registry.
#[derive(Debug, Clone)]
pub struct AgentStore {
    layout: NasLayout,
}

impl AgentStore {
    pub fn new(layout: NasLayout) -> Self {
        Self { layout }
    }

    /// Create or refresh this agent's record. Re-registration after a restart
    /// keeps the original `registered_at` and comes back `idle`.
    pub async fn register(&self, agent_id: &str, display_name: &str) -> Result<AgentRecord> {
        let path = self.layout.agent_record(agent_id);
        let now = Utc::now();
        let record = match super::read_record::<AgentRecord>(&path).await? {
            Some(mut existing) => {
                existing.display_name = display_name.to_string();
                existing.status = AgentStatus::Idle;
                existing.current_task = None;
                existing.last_heartbeat = now;
                existing
            }
            None => AgentRecord {
                agent_id: agent_id.to_string(),
                display_name: display_name.to_string(),
                status: AgentStatus::Idle,
                current_task: None,
                last_heartbeat: now,
                registered_at: now,
            },
        };
        super::write_record(&path, &record).await?;
        Ok(record)
    }

    pub async fn read(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(super::read_record(&self.layout.agent_record(agent_id)).await?)
    }

    /// Stamp `last_heartbeat`. A missing record (wiped tree) is recreated so
    /// the agent never heartbeats into the void.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let path = self.layout.agent_record(agent_id);
        match super::read_record::<AgentRecord>(&path).await? {
            Some(mut record) => {
                record.last_heartbeat = Utc::now();
                super::write_record(&path, &record).await?;
            }
            None => {
                self.register(agent_id, agent_id).await?;
            }
        }
        Ok(())
    }

    pub async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        current_task: Option<Uuid>,
    ) -> Result<()> {
        let path = self.layout.agent_record(agent_id);
        let mut record = super::read_record::<AgentRecord>(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "agent".to_string(),
                id: agent_id.to_string(),
            })?;
        record.status = status;
        record.current_task = current_task;
        record.last_heartbeat = Utc::now();
        super::write_record(&path, &record).await?;
        Ok(())
    }

    /// All registered agents, unreadable records skipped.
    pub async fn list(&self) -> Result<Vec<AgentRecord>> {
        let dir = self.layout.registry_dir();
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
            match super::read_record::<AgentRecord>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable agent record");
                }
            }
        }
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }
}
