//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Which side of the dispatch protocol this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// Dispatches tasks, runs the timeout/retry monitor, screens results.
    Orchestrator,
    /// Receives dispatches and runs executor sessions.
    Worker,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Worker => "worker",
        }
    }
}

/// Runtime configuration for one agent process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root of the shared filesystem (the `chatroom/` tree lives underneath).
    pub nas_root: PathBuf,
    /// Stable identifier of this agent, used in paths and message envelopes.
    pub agent_id: String,
    /// Human-facing name shown in chat renderings.
    pub display_name: String,
    /// Orchestrator or worker.
    pub role: AgentRole,
    /// Inbox poll cadence.
    pub poll_interval: Duration,
    /// Registry heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Timeout/retry sweep cadence (orchestrator only).
    pub monitor_interval: Duration,
    /// Parked-task sweep cadence.
    pub park_interval: Duration,
    /// How long a dispatch may sit without a TASK_ACK before a retry.
    pub ack_timeout: Duration,
    /// Wall-clock budget for an accepted task.
    pub task_timeout: Duration,
    /// Retries after the first dispatch attempt before ABANDONED.
    pub max_retries: u32,
    /// Delay before re-dispatching a rate-limited task.
    pub retry_backoff: Duration,
    /// Age after which a channel lock is considered abandoned.
    pub lock_stale_after: Duration,
    /// Attempts to acquire a contended channel lock before giving up.
    pub lock_retries: u32,
    /// Optional directory for the rolling daemon log file.
    pub log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nas_root: PathBuf::from("./nas"),
            agent_id: "agent".to_string(),
            display_name: "Agent".to_string(),
            role: AgentRole::Worker,
            poll_interval: Duration::from_millis(3_000),
            heartbeat_interval: Duration::from_millis(30_000),
            monitor_interval: Duration::from_millis(10_000),
            park_interval: Duration::from_millis(15_000),
            ack_timeout: Duration::from_millis(60_000), // 1 minute
            task_timeout: Duration::from_millis(1_800_000), // 30 minutes
            max_retries: 2,
            retry_backoff: Duration::from_millis(120_000), // 2 minutes
            lock_stale_after: Duration::from_secs(30),
            lock_retries: 50,
            log_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Builds the configuration from `CREWLINK_*` environment variables.
    ///
    /// `CREWLINK_NAS_ROOT` and `CREWLINK_AGENT_ID` are required; everything
    /// else falls back to the defaults above.
    pub fn from_env() -> Result<Self, ConfigError> {
        let nas_root = std::env::var("CREWLINK_NAS_ROOT")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingEnvVar("CREWLINK_NAS_ROOT".to_string()))?;

        let agent_id = std::env::var("CREWLINK_AGENT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("CREWLINK_AGENT_ID".to_string()))?;

        let display_name =
            std::env::var("CREWLINK_DISPLAY_NAME").unwrap_or_else(|_| agent_id.clone());

        let role = match std::env::var("CREWLINK_ROLE")
            .unwrap_or_else(|_| "worker".to_string())
            .to_lowercase()
            .as_str()
        {
            "orchestrator" => AgentRole::Orchestrator,
            "worker" => AgentRole::Worker,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "CREWLINK_ROLE".to_string(),
                    message: format!("expected orchestrator or worker, got {other:?}"),
                });
            }
        };

        let defaults = Self::default();

        let log_dir = std::env::var("CREWLINK_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            nas_root,
            agent_id,
            display_name,
            role,
            poll_interval: env_millis("CREWLINK_POLL_INTERVAL_MS", defaults.poll_interval),
            heartbeat_interval: env_millis(
                "CREWLINK_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            monitor_interval: env_millis("CREWLINK_MONITOR_INTERVAL_MS", defaults.monitor_interval),
            park_interval: env_millis("CREWLINK_PARK_INTERVAL_MS", defaults.park_interval),
            ack_timeout: env_millis("CREWLINK_ACK_TIMEOUT_MS", defaults.ack_timeout),
            task_timeout: env_millis("CREWLINK_TASK_TIMEOUT_MS", defaults.task_timeout),
            max_retries: std::env::var("CREWLINK_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_backoff: env_millis("CREWLINK_RETRY_BACKOFF_MS", defaults.retry_backoff),
            lock_stale_after: std::env::var("CREWLINK_LOCK_STALE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_stale_after),
            lock_retries: std::env::var("CREWLINK_LOCK_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lock_retries),
            log_dir,
        })
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.role, AgentRole::Worker);
        assert_eq!(config.max_retries, 2);
        assert!(config.ack_timeout < config.task_timeout);
        assert!(config.poll_interval < config.heartbeat_interval);
    }

    #[test]
    fn role_names() {
        assert_eq!(AgentRole::Orchestrator.as_str(), "orchestrator");
        assert_eq!(AgentRole::Worker.as_str(), "worker");
    }
}
