//! Permission gate — explicit requests, the admin allowlist, and decisions.
//!
//! Two doors into the same records: an agent asks before a sensitive
//! operation (`request_permission`), or the orchestrator's result screen
//! flags one after the fact (`screen`). Either way a human decides by
//! mutating the record file, which any process with NAS access can do.

pub mod screen;

pub use screen::{ScreenHit, screen_text};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{PermissionError, Result, StoreError};
use crate::park::{Parker, WatchConfig};
use crate::store::message::{meta, well_known};
use crate::store::paths::NasLayout;
use crate::store::{ChannelStore, MessageContent, MessageKind};

/// How long a task waits on a human decision before giving up.
const DEFAULT_DECISION_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// The operation kinds the gate understands. Screening rules and allowlist
/// patterns share this taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Shell,
    Path,
    Url,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Path => "path",
            Self::Url => "url",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "shell" => Some(Self::Shell),
            "path" => Some(Self::Path),
            "url" => Some(Self::Url),
            _ => None,
        }
    }
}

/// A concrete operation awaiting judgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Shell { command: String },
    Path { path: String },
    Url { url: String },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Shell { .. } => OperationKind::Shell,
            Self::Path { .. } => OperationKind::Path,
            Self::Url { .. } => OperationKind::Url,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Shell { command } => command,
            Self::Path { path } => path,
            Self::Url { url } => url,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind().as_str(), self.detail())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Pending,
    Approved,
    Rejected,
    /// Auto-approved by an allowlist pattern; kept for the audit trail.
    Allowlisted,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Allowlisted => "allowlisted",
        };
        write!(f, "{s}")
    }
}

/// How the record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOrigin {
    /// The agent asked before acting.
    Requested,
    /// The result screen flagged it after the fact.
    Screened,
}

/// Enough context to rebuild the session when the wait ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub original_instruction: String,
    pub resume_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub permission_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub channel_id: String,
    pub status: PermissionStatus,
    pub operation: Operation,
    /// Allowlist pattern or screen rule that matched, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<ContextSnapshot>,
    pub origin: PermissionOrigin,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<String>,
    /// Set once the post-decision announcement for a screened record has
    /// gone out, so it goes out exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub pattern: String,
    pub added_by: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allowlist {
    pub patterns: Vec<AllowlistEntry>,
}

/// File-backed permission records plus the allowlist.
#[derive(Debug, Clone)]
pub struct PermissionStore {
    layout: NasLayout,
}

impl PermissionStore {
    pub fn new(layout: NasLayout) -> Self {
        Self { layout }
    }

    pub async fn write(&self, record: &PermissionRecord) -> Result<()> {
        let path = self.layout.permission_record(record.permission_id);
        crate::store::write_record(&path, record).await?;
        Ok(())
    }

    pub async fn read(&self, permission_id: Uuid) -> Result<Option<PermissionRecord>> {
        let path = self.layout.permission_record(permission_id);
        Ok(crate::store::read_record(&path).await?)
    }

    pub async fn list(&self) -> Result<Vec<PermissionRecord>> {
        let dir = self.layout.permissions_dir();
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
            match crate::store::read_record::<PermissionRecord>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable permission record");
                }
            }
        }
        records.sort_by_key(|r| r.requested_at);
        Ok(records)
    }

    /// Record a human decision. Only pending records can be decided.
    pub async fn decide(
        &self,
        permission_id: Uuid,
        approve: bool,
        decided_by: &str,
        reason: Option<String>,
    ) -> Result<PermissionRecord> {
        let mut record = self
            .read(permission_id)
            .await?
            .ok_or(PermissionError::NotFound { id: permission_id })?;
        if record.status != PermissionStatus::Pending {
            return Err(PermissionError::AlreadyDecided {
                id: permission_id,
                status: record.status.to_string(),
            }
            .into());
        }

        record.status = if approve {
            PermissionStatus::Approved
        } else {
            PermissionStatus::Rejected
        };
        record.decided_at = Some(Utc::now());
        record.decided_by = Some(decided_by.to_string());
        record.decision_reason = reason;
        self.write(&record).await?;

        tracing::info!(
            permission_id = %permission_id,
            status = %record.status,
            decided_by,
            "permission decided"
        );
        Ok(record)
    }

    pub async fn mark_announced(&self, permission_id: Uuid) -> Result<()> {
        let mut record = self
            .read(permission_id)
            .await?
            .ok_or(PermissionError::NotFound { id: permission_id })?;
        record.announced_at = Some(Utc::now());
        self.write(&record).await?;
        Ok(())
    }

    // ── allowlist ───────────────────────────────────────────────────────

    pub async fn load_allowlist(&self) -> Result<Allowlist> {
        Ok(crate::store::read_record(&self.layout.allowlist_file())
            .await?
            .unwrap_or_default())
    }

    /// Append an allowlist pattern of the form `kind(detail)`, for example
    /// `shell(git push)` or `path(/srv/reports)`.
    pub async fn add_allowlist_pattern(&self, pattern: &str, added_by: &str) -> Result<()> {
        parse_pattern(pattern).ok_or_else(|| PermissionError::InvalidPattern {
            pattern: pattern.to_string(),
        })?;

        let mut allowlist = self.load_allowlist().await?;
        if allowlist.patterns.iter().any(|e| e.pattern == pattern) {
            return Ok(());
        }
        allowlist.patterns.push(AllowlistEntry {
            pattern: pattern.to_string(),
            added_by: added_by.to_string(),
            added_at: Utc::now(),
        });
        crate::store::write_record(&self.layout.allowlist_file(), &allowlist).await?;
        tracing::info!(pattern, added_by, "allowlist pattern added");
        Ok(())
    }

    /// First allowlist pattern covering `operation`, if any.
    pub async fn allowlist_match(&self, operation: &Operation) -> Result<Option<String>> {
        let allowlist = self.load_allowlist().await?;
        for entry in &allowlist.patterns {
            if pattern_covers(&entry.pattern, operation) {
                return Ok(Some(entry.pattern.clone()));
            }
        }
        Ok(None)
    }
}

/// Split `kind(detail)` into its parts.
fn parse_pattern(pattern: &str) -> Option<(OperationKind, &str)> {
    let open = pattern.find('(')?;
    if !pattern.ends_with(')') {
        return None;
    }
    let kind = OperationKind::parse(&pattern[..open])?;
    let detail = &pattern[open + 1..pattern.len() - 1];
    if detail.is_empty() {
        return None;
    }
    Some((kind, detail))
}

/// Matching is deliberately prefix-based, not glob: shell patterns must be a
/// leading whole-token match, path and url patterns a leading string match.
fn pattern_covers(pattern: &str, operation: &Operation) -> bool {
    let Some((kind, detail)) = parse_pattern(pattern) else {
        return false;
    };
    if kind != operation.kind() {
        return false;
    }
    match operation {
        Operation::Shell { command } => {
            let want: Vec<&str> = detail.split_whitespace().collect();
            let have: Vec<&str> = command.split_whitespace().collect();
            !want.is_empty()
                && have.len() >= want.len()
                && want.iter().zip(have.iter()).all(|(w, h)| w == h)
        }
        Operation::Path { path } => path.starts_with(detail),
        Operation::Url { url } => url.starts_with(detail),
    }
}

/// Outcome of an explicit permission request.
#[derive(Debug)]
pub enum PermissionOutcome {
    /// Allowlisted: go ahead now, audit record written.
    AutoApproved(PermissionRecord),
    /// Pending a human decision; the task is parked on the record.
    Parked(PermissionRecord),
}

/// The asking side of the gate, run by the agent that owns the session.
pub struct PermissionGate {
    config: RuntimeConfig,
    store: Arc<PermissionStore>,
    channels: Arc<ChannelStore>,
    parker: Arc<Parker>,
}

impl PermissionGate {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<PermissionStore>,
        channels: Arc<ChannelStore>,
        parker: Arc<Parker>,
    ) -> Self {
        Self {
            config,
            store,
            channels,
            parker,
        }
    }

    /// Ask before a sensitive operation. Allowlisted operations come back
    /// approved immediately with no pending record; anything else writes a
    /// pending record, posts to the permission channel, and parks the task
    /// until someone decides.
    pub async fn request_permission(
        &self,
        task_id: Uuid,
        operation: Operation,
        reason: &str,
        resume_prompt: &str,
    ) -> Result<PermissionOutcome> {
        let task = self
            .parker
            .task(task_id)
            .await?
            .ok_or(crate::error::TaskError::NotFound { id: task_id })?;

        if let Some(pattern) = self.store.allowlist_match(&operation).await? {
            let record = PermissionRecord {
                permission_id: Uuid::new_v4(),
                task_id,
                agent_id: self.config.agent_id.clone(),
                channel_id: task.channel_id.clone(),
                status: PermissionStatus::Allowlisted,
                operation,
                pattern: Some(pattern.clone()),
                summary: reason.to_string(),
                context_snapshot: None,
                origin: PermissionOrigin::Requested,
                requested_at: Utc::now(),
                decided_at: Some(Utc::now()),
                decided_by: Some("allowlist".to_string()),
                decision_reason: Some(format!("matched {pattern}")),
                announced_at: None,
            };
            self.store.write(&record).await?;
            tracing::info!(
                task_id = %task_id,
                operation = %record.operation,
                pattern,
                "operation allowlisted"
            );
            return Ok(PermissionOutcome::AutoApproved(record));
        }

        let record = PermissionRecord {
            permission_id: Uuid::new_v4(),
            task_id,
            agent_id: self.config.agent_id.clone(),
            channel_id: task.channel_id.clone(),
            status: PermissionStatus::Pending,
            operation,
            pattern: None,
            summary: reason.to_string(),
            context_snapshot: Some(ContextSnapshot {
                original_instruction: task.instruction.clone(),
                resume_prompt: resume_prompt.to_string(),
            }),
            origin: PermissionOrigin::Requested,
            requested_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            decision_reason: None,
            announced_at: None,
        };
        self.store.write(&record).await?;

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            meta::PERMISSION_ID.into(),
            serde_json::json!(record.permission_id),
        );
        metadata.insert(meta::TASK_ID.into(), serde_json::json!(task_id));
        self.channels
            .append_message(
                well_known::PERMISSION,
                MessageKind::PermissionRequest,
                MessageContent::text(format!(
                    "{} wants to run {}: {}",
                    self.config.agent_id, record.operation, reason
                )),
                None,
                metadata,
            )
            .await?;

        self.parker
            .park(
                task_id,
                WatchConfig::Permission {
                    permission_id: record.permission_id,
                },
                resume_prompt,
                self.config.park_interval,
                DEFAULT_DECISION_WAIT,
            )
            .await?;

        tracing::info!(
            task_id = %task_id,
            permission_id = %record.permission_id,
            operation = %record.operation,
            "permission requested, task parked"
        );
        Ok(PermissionOutcome::Parked(record))
    }
}
