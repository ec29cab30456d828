//! Shared log store — append-only channels plus per-agent inboxes.
//!
//! Appends are serialized by the channel's advisory lock so the durable
//! sequence counter in `meta.json` never skips or repeats. Delivery is a
//! notification file per recipient, deleted on read; the message files
//! themselves are never deleted, so the channel log doubles as history.

use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::lock;
use crate::store::message::{
    ChannelEntry, ChannelKind, ChannelMeta, Message, MessageContent, MessageKind, Notification,
    Priority, meta,
};
use crate::store::paths::{self, NasLayout};

/// Characters of message text carried on a notification.
const PREVIEW_LEN: usize = 160;

/// Channel and inbox operations, acting as one agent.
#[derive(Debug, Clone)]
pub struct ChannelStore {
    layout: NasLayout,
    agent_id: String,
    lock_stale_after: Duration,
    lock_retries: u32,
}

impl ChannelStore {
    pub fn new(
        layout: NasLayout,
        agent_id: impl Into<String>,
        lock_stale_after: Duration,
        lock_retries: u32,
    ) -> Self {
        Self {
            layout,
            agent_id: agent_id.into(),
            lock_stale_after,
            lock_retries,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Create the channel if it does not exist; merge `members` in if it
    /// does. Safe to call from every agent at every startup.
    pub async fn ensure_channel(
        &self,
        channel_id: &str,
        kind: ChannelKind,
        members: &[String],
    ) -> Result<ChannelMeta> {
        let meta_path = self.layout.channel_meta(channel_id);
        let (meta, changed) = match super::read_record::<ChannelMeta>(&meta_path).await? {
            Some(mut existing) => {
                let mut changed = false;
                for member in members {
                    if !existing.members.contains(member) {
                        existing.members.push(member.clone());
                        changed = true;
                    }
                }
                (existing, changed)
            }
            None => {
                tracing::info!(channel = channel_id, ?kind, "creating channel");
                (
                    ChannelMeta::new(channel_id, kind, members.to_vec()),
                    true,
                )
            }
        };

        if changed {
            super::write_record(&meta_path, &meta).await?;
            fs::create_dir_all(self.layout.messages_dir(channel_id))
                .await
                .map_err(StoreError::from)?;
            self.rebuild_index().await?;
        }
        Ok(meta)
    }

    /// Append a message and fan out notifications, all under the channel
    /// lock. Members other than the sender are notified; mentioned agents
    /// are notified even when they are not members, once.
    pub async fn append_message(
        &self,
        channel_id: &str,
        kind: MessageKind,
        content: MessageContent,
        reply_to: Option<Uuid>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Message> {
        let guard = lock::acquire(
            &self.layout.channel_lock(channel_id),
            &self.agent_id,
            self.lock_stale_after,
            self.lock_retries,
        )
        .await?;

        let meta_path = self.layout.channel_meta(channel_id);
        let mut channel_meta = super::read_record::<ChannelMeta>(&meta_path)
            .await?
            .ok_or_else(|| StoreError::UnknownChannel {
                channel_id: channel_id.to_string(),
            })?;

        let seq = channel_meta.last_message_seq + 1;
        let now = Utc::now();
        let message = Message {
            message_id: Uuid::new_v4(),
            seq,
            timestamp: now,
            channel_id: channel_id.to_string(),
            from: self.agent_id.clone(),
            kind,
            content,
            reply_to,
            metadata,
        };

        let message_path = self
            .layout
            .message_file(channel_id, seq, now, message.message_id);
        super::write_record(&message_path, &message).await?;

        channel_meta.last_message_seq = seq;
        channel_meta.message_count += 1;
        super::write_record(&meta_path, &channel_meta).await?;

        self.fan_out(&channel_meta, &message).await?;

        guard.release().await?;

        tracing::debug!(
            channel = channel_id,
            seq,
            kind = %message.kind,
            "appended message"
        );
        Ok(message)
    }

    async fn fan_out(&self, channel_meta: &ChannelMeta, message: &Message) -> Result<()> {
        let mut recipients: Vec<&String> = channel_meta
            .members
            .iter()
            .filter(|m| *m != &message.from)
            .collect();
        for mentioned in &message.content.mentions {
            if mentioned != &message.from && !recipients.contains(&mentioned) {
                recipients.push(mentioned);
            }
        }

        let priority = notification_priority(message);
        for recipient in recipients {
            let notification = Notification {
                notification_id: Uuid::new_v4(),
                channel_id: message.channel_id.clone(),
                message_seq: message.seq,
                from: message.from.clone(),
                preview: preview(&message.content.text),
                priority,
                mentioned: message.content.mentions.contains(recipient),
                created_at: message.timestamp,
                retry_for_task: None,
                task_metadata: None,
            };
            self.push_notification(recipient, &notification).await?;
        }
        Ok(())
    }

    /// Drop a notification file into an agent's inbox directly, without a
    /// new message append. The retry monitor uses this to re-deliver a
    /// dispatch that was never acknowledged.
    pub async fn push_notification(
        &self,
        recipient: &str,
        notification: &Notification,
    ) -> Result<()> {
        let path = self.layout.notification_file(
            recipient,
            notification.message_seq,
            notification.notification_id,
        );
        super::write_record(&path, notification).await?;
        Ok(())
    }

    /// Drain this agent's inbox: resolve every notification to its message,
    /// delete the notification, and return the messages in delivery order
    /// (high priority first, then sequence).
    ///
    /// A notification whose message file cannot be read does not block the
    /// drain; the message is reconstructed from the notification itself.
    pub async fn read_inbox(&self) -> Result<Vec<Message>> {
        let inbox = self.layout.inbox_dir(&self.agent_id);
        if !inbox.exists() {
            return Ok(Vec::new());
        }

        let mut pending: Vec<(Notification, std::path::PathBuf)> = Vec::new();
        let mut read_dir = fs::read_dir(&inbox).await.map_err(StoreError::from)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(StoreError::from)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match super::read_record::<Notification>(&path).await {
                Ok(Some(notification)) => pending.push((notification, path)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "dropping unreadable notification");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }

        pending.sort_by(|a, b| {
            a.0.priority
                .cmp(&b.0.priority)
                .then(a.0.message_seq.cmp(&b.0.message_seq))
        });

        let mut messages = Vec::with_capacity(pending.len());
        for (notification, path) in pending {
            let message = match self
                .resolve_message(&notification.channel_id, notification.message_seq)
                .await
            {
                Some(message) => message,
                None => synthesize_message(&notification),
            };
            messages.push(message);
            if let Err(e) = fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete notification");
            }
        }
        Ok(messages)
    }

    /// Find a message by channel and sequence via its filename prefix.
    pub async fn resolve_message(&self, channel_id: &str, seq: u64) -> Option<Message> {
        let dir = self.layout.messages_dir(channel_id);
        let prefix = format!("{}_", paths::seq_prefix(seq));
        let mut read_dir = fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                match super::read_record::<Message>(&entry.path()).await {
                    Ok(found) => return found,
                    Err(e) => {
                        tracing::warn!(
                            channel = channel_id,
                            seq,
                            error = %e,
                            "message file unreadable"
                        );
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Channels this agent belongs to, from the index.
    pub async fn list_channels(&self) -> Result<Vec<ChannelEntry>> {
        let entries: Vec<ChannelEntry> = super::read_record(&self.layout.channel_index())
            .await?
            .unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|e| e.members.iter().any(|m| m == &self.agent_id))
            .collect())
    }

    /// Rewrite `_index.json` from the per-channel meta files. The metas are
    /// the source of truth; a racing rewrite heals on the next call.
    async fn rebuild_index(&self) -> Result<()> {
        let channels_dir = self.layout.channels_dir();
        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&channels_dir).await.map_err(StoreError::from)?;
        while let Some(entry) = read_dir.next_entry().await.map_err(StoreError::from)? {
            if !entry.path().is_dir() {
                continue;
            }
            let meta_path = entry.path().join("meta.json");
            if let Ok(Some(channel_meta)) = super::read_record::<ChannelMeta>(&meta_path).await {
                entries.push(ChannelEntry {
                    channel_id: channel_meta.channel_id,
                    kind: channel_meta.kind,
                    members: channel_meta.members,
                    message_count: channel_meta.message_count,
                });
            }
        }
        entries.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        super::write_record(&self.layout.channel_index(), &entries).await?;
        Ok(())
    }
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_LEN).collect()
}

fn notification_priority(message: &Message) -> Priority {
    if matches!(
        message.kind,
        MessageKind::TaskDispatch | MessageKind::PermissionRequest
    ) {
        return Priority::High;
    }
    match message.meta_str(meta::PRIORITY) {
        Some("urgent") | Some("high") => Priority::High,
        _ => Priority::Normal,
    }
}

/// Rebuild a usable message from a notification whose message file is gone.
/// Retry notifications become full dispatches again; anything else surfaces
/// as chat carrying the preview text.
fn synthesize_message(notification: &Notification) -> Message {
    let (kind, metadata, mentions) = match notification.retry_for_task {
        Some(task_id) => {
            let mut metadata = notification.task_metadata.clone().unwrap_or_default();
            metadata
                .entry(meta::TASK_ID.to_string())
                .or_insert_with(|| serde_json::Value::String(task_id.to_string()));
            (MessageKind::TaskDispatch, metadata, Vec::new())
        }
        None => (MessageKind::Chat, serde_json::Map::new(), Vec::new()),
    };

    Message {
        message_id: Uuid::new_v4(),
        seq: notification.message_seq,
        timestamp: notification.created_at,
        channel_id: notification.channel_id.clone(),
        from: notification.from.clone(),
        kind,
        content: MessageContent {
            text: notification.preview.clone(),
            mentions,
            attachments: Vec::new(),
        },
        reply_to: None,
        metadata,
    }
}
