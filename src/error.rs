//! Error types for crewlink.

use std::path::PathBuf;

use uuid::Uuid;

/// Top-level error type for the agent daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the shared-filesystem stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Channel {channel_id} does not exist")]
    UnknownChannel { channel_id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Advisory file-lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock at {path} held by {holder} after {attempts} attempts")]
    Contended {
        path: PathBuf,
        holder: String,
        attempts: u32,
    },

    #[error("IO error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} in state {state} cannot accept event {event}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        event: String,
    },
}

/// Dispatch protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatch message for task {task_id} is missing {field}")]
    MalformedDispatch { task_id: Uuid, field: String },
}

/// Permission gate errors.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Permission record {id} not found")]
    NotFound { id: Uuid },

    #[error("Permission {id} already decided ({status})")]
    AlreadyDecided { id: Uuid, status: String },

    #[error("Invalid allowlist pattern: {pattern}")]
    InvalidPattern { pattern: String },
}

/// Executor session errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to start session: {reason}")]
    SpawnFailed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the daemon.
pub type Result<T> = std::result::Result<T, Error>;
