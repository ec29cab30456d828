//! On-disk layout of the shared coordination tree.
//!
//! Everything the protocol persists lives under `<nas>/chatroom/`:
//! - `registry/<agent_id>.json` — agent presence records
//! - `channels/_index.json` — channel directory
//! - `channels/<id>/meta.json` — members + durable sequence counter
//! - `channels/<id>/messages/<seq6>_<ts>_<uuid>.json` — append-only log
//! - `channels/<id>/.lock` — advisory append lock
//! - `inbox/<agent_id>/<seq6>_<uuid>.json` — per-recipient notifications
//! - `tasks/<task_id>.json` — task records
//! - `parked_tasks/<task_id>.json` — parked-task watch records
//! - `permissions/<permission_id>.json` — permission records
//! - `config/permission_allowlist.json` — admin-managed allowlist
//! - `assets/<agent_id>/[<task_id>/]` — work products
//!
//! Every path string is built here and nowhere else.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use uuid::Uuid;

use crate::error::StoreError;

/// Name of the coordination tree under the NAS root.
const CHATROOM: &str = "chatroom";

/// Zero-padded sequence prefix used in message and notification filenames.
/// Lexicographic filename order equals sequence order.
pub fn seq_prefix(seq: u64) -> String {
    format!("{seq:06}")
}

/// Compact timestamp for filenames (no separators that upset filesystems).
pub fn compact_ts(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// Path builder for the shared tree.
#[derive(Debug, Clone)]
pub struct NasLayout {
    root: PathBuf,
}

impl NasLayout {
    /// Create a layout rooted at `nas_root` (the tree goes under
    /// `nas_root/chatroom/`).
    pub fn new(nas_root: impl AsRef<Path>) -> Self {
        Self {
            root: nas_root.as_ref().join(CHATROOM),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── registry ────────────────────────────────────────────────────────

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn agent_record(&self, agent_id: &str) -> PathBuf {
        self.registry_dir().join(format!("{agent_id}.json"))
    }

    // ── channels ────────────────────────────────────────────────────────

    pub fn channels_dir(&self) -> PathBuf {
        self.root.join("channels")
    }

    pub fn channel_index(&self) -> PathBuf {
        self.channels_dir().join("_index.json")
    }

    pub fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.channels_dir().join(channel_id)
    }

    pub fn channel_meta(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join("meta.json")
    }

    pub fn channel_lock(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join(".lock")
    }

    pub fn messages_dir(&self, channel_id: &str) -> PathBuf {
        self.channel_dir(channel_id).join("messages")
    }

    pub fn message_file(
        &self,
        channel_id: &str,
        seq: u64,
        at: DateTime<Utc>,
        message_id: Uuid,
    ) -> PathBuf {
        self.messages_dir(channel_id).join(format!(
            "{}_{}_{}.json",
            seq_prefix(seq),
            compact_ts(at),
            message_id
        ))
    }

    // ── inboxes ─────────────────────────────────────────────────────────

    pub fn inbox_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join("inbox").join(agent_id)
    }

    pub fn notification_file(&self, agent_id: &str, seq: u64, notification_id: Uuid) -> PathBuf {
        self.inbox_dir(agent_id)
            .join(format!("{}_{}.json", seq_prefix(seq), notification_id))
    }

    // ── tasks ───────────────────────────────────────────────────────────

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn task_record(&self, task_id: Uuid) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.json"))
    }

    pub fn parked_dir(&self) -> PathBuf {
        self.root.join("parked_tasks")
    }

    pub fn parked_record(&self, task_id: Uuid) -> PathBuf {
        self.parked_dir().join(format!("{task_id}.json"))
    }

    // ── permissions ─────────────────────────────────────────────────────

    pub fn permissions_dir(&self) -> PathBuf {
        self.root.join("permissions")
    }

    pub fn permission_record(&self, permission_id: Uuid) -> PathBuf {
        self.permissions_dir().join(format!("{permission_id}.json"))
    }

    pub fn allowlist_file(&self) -> PathBuf {
        self.root.join("config").join("permission_allowlist.json")
    }

    // ── assets ──────────────────────────────────────────────────────────

    pub fn assets_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join("assets").join(agent_id)
    }

    pub fn task_assets_dir(&self, agent_id: &str, task_id: Uuid) -> PathBuf {
        self.assets_dir(agent_id).join(task_id.to_string())
    }

    // ── setup ───────────────────────────────────────────────────────────

    /// Create the fixed directories of the tree. Idempotent; per-agent and
    /// per-channel directories are created on first use.
    pub async fn ensure_base_dirs(&self) -> Result<(), StoreError> {
        for dir in [
            self.registry_dir(),
            self.channels_dir(),
            self.root.join("inbox"),
            self.tasks_dir(),
            self.parked_dir(),
            self.permissions_dir(),
            self.root.join("config"),
            self.root.join("assets"),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn seq_prefix_is_zero_padded() {
        assert_eq!(seq_prefix(1), "000001");
        assert_eq!(seq_prefix(42), "000042");
        assert_eq!(seq_prefix(123_456), "123456");
    }

    #[test]
    fn seq_prefix_sorts_lexicographically() {
        let mut names: Vec<String> = [9, 100, 2, 11].iter().map(|&s| seq_prefix(s)).collect();
        names.sort();
        assert_eq!(names, vec!["000002", "000009", "000011", "000100"]);
    }

    #[test]
    fn compact_ts_has_no_separators() {
        let ts = compact_ts(Utc::now());
        assert!(!ts.contains(':'));
        assert!(!ts.contains('-'));
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn paths_land_under_chatroom() {
        let layout = NasLayout::new("/mnt/nas");
        assert_eq!(
            layout.agent_record("codey"),
            PathBuf::from("/mnt/nas/chatroom/registry/codey.json")
        );
        assert_eq!(
            layout.channel_lock("dm_codey"),
            PathBuf::from("/mnt/nas/chatroom/channels/dm_codey/.lock")
        );
        let task_id = Uuid::new_v4();
        assert_eq!(
            layout.task_record(task_id),
            PathBuf::from(format!("/mnt/nas/chatroom/tasks/{task_id}.json"))
        );
    }

    #[tokio::test]
    async fn ensure_base_dirs_creates_tree() {
        let dir = TempDir::new().unwrap();
        let layout = NasLayout::new(dir.path());
        layout.ensure_base_dirs().await.unwrap();
        assert!(layout.registry_dir().exists());
        assert!(layout.channels_dir().exists());
        assert!(layout.tasks_dir().exists());
        assert!(layout.parked_dir().exists());
        assert!(layout.permissions_dir().exists());
    }
}
