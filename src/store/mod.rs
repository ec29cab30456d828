//! Persistence layer — file-backed stores over the shared coordination tree.

pub mod agents;
pub mod channels;
pub mod lock;
pub mod message;
pub mod paths;
pub mod tasks;

pub use agents::{AgentRecord, AgentStatus, AgentStore};
pub use channels::ChannelStore;
pub use message::{
    ChannelEntry, ChannelKind, ChannelMeta, Message, MessageContent, MessageKind, Notification,
    Priority,
};
pub use paths::NasLayout;
pub use tasks::{
    ProgressEntry, Task, TaskErrorKind, TaskEvent, TaskStatus, TaskStore,
};

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::StoreError;

/// Read a JSON record, `None` when the file does not exist.
pub(crate) async fn read_record<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(body) => {
            let record = serde_json::from_str(&body).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            Ok(Some(record))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Write a JSON record, creating parent directories as needed.
pub(crate) async fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(record)?;
    fs::write(path, body).await?;
    Ok(())
}
