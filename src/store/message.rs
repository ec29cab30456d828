//! Message, notification, and channel record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata keys used on protocol messages.
pub mod meta {
    pub const TASK_ID: &str = "task_id";
    pub const PRIORITY: &str = "priority";
    pub const OUTPUT_DIR: &str = "output_dir";
    pub const TASK_TIMEOUT_MS: &str = "task_timeout_ms";
    pub const STATUS: &str = "status";
    pub const PERMISSION_ID: &str = "permission_id";
}

/// Shared channels every deployment carries.
pub mod well_known {
    pub const GENERAL: &str = "general";
    pub const PIPELINE: &str = "pipeline";
    pub const PERMISSION: &str = "permission";
    pub const UPGRADE: &str = "upgrade";
}

/// Name of an agent's direct-message channel.
pub fn dm_channel(agent_id: &str) -> String {
    format!("dm_{agent_id}")
}

/// Kind of a channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Free-form conversation.
    Chat,
    /// Work assignment from one agent to another.
    TaskDispatch,
    /// Receipt acknowledgement for a dispatch.
    TaskAck,
    /// Final outcome of a task.
    ResultReport,
    /// Protocol-generated notices (timeouts, abandonment, cancellation).
    System,
    /// Non-final lifecycle notes (parked, retrying).
    StatusUpdate,
    /// Request for a human decision on a sensitive operation.
    PermissionRequest,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Chat => "CHAT",
            Self::TaskDispatch => "TASK_DISPATCH",
            Self::TaskAck => "TASK_ACK",
            Self::ResultReport => "RESULT_REPORT",
            Self::System => "SYSTEM",
            Self::StatusUpdate => "STATUS_UPDATE",
            Self::PermissionRequest => "PERMISSION_REQUEST",
        };
        write!(f, "{s}")
    }
}

/// Body of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mentions: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }
}

/// One immutable entry in a channel log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    /// Channel-scoped sequence number, assigned under the channel lock.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub channel_id: String,
    pub from: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    /// Metadata lookup as a string, for keys like `task_id` and `output_dir`.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Metadata lookup parsed as a UUID.
    pub fn meta_uuid(&self, key: &str) -> Option<Uuid> {
        self.meta_str(key).and_then(|s| s.parse().ok())
    }
}

/// Notification priority. High-priority entries sort first in an inbox drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
}

/// Per-recipient pointer into a channel log. Deleted on read; redelivery
/// after a crash is expected and handlers tolerate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: Uuid,
    pub channel_id: String,
    pub message_seq: u64,
    pub from: String,
    /// Truncated message text, enough to act on if the message file is gone.
    pub preview: String,
    pub priority: Priority,
    pub mentioned: bool,
    pub created_at: DateTime<Utc>,
    /// Set on monitor-generated retry notifications: the inbox read
    /// re-synthesizes a TASK_DISPATCH for this task when the original
    /// message cannot be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_for_task: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Channel flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Dm,
    Group,
}

/// Durable per-channel bookkeeping, updated under the channel lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMeta {
    pub channel_id: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub members: Vec<String>,
    /// Highest sequence ever assigned in this channel. Never reused.
    pub last_message_seq: u64,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

impl ChannelMeta {
    pub fn new(channel_id: impl Into<String>, kind: ChannelKind, members: Vec<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            kind,
            members,
            last_message_seq: 0,
            message_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// One row of `channels/_index.json`, a convenience listing rebuilt from the
/// per-channel meta files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub channel_id: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    pub members: Vec<String>,
    pub message_count: u64,
}
