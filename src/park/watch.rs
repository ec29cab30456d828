//! Watch conditions a parked task waits on.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::warn;
use uuid::Uuid;

use crate::permission::{PermissionStatus, PermissionStore};

/// Probe commands get this long before they are killed.
const SHELL_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters of probe output carried into the resume prompt.
const OBSERVATION_LEN: usize = 400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "watch_type", rename_all = "snake_case")]
pub enum WatchConfig {
    /// Met when the command exits zero.
    Shell { command: String },
    /// Met when the path exists.
    File { path: PathBuf },
    /// Met when the URL answers with the expected status (200 by default).
    PollUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_status: Option<u16>,
    },
    /// Met when the referenced permission record is approved or allowlisted.
    /// A rejection fails the task instead of resuming it.
    Permission { permission_id: Uuid },
}

impl WatchConfig {
    pub fn describe(&self) -> String {
        match self {
            Self::Shell { command } => format!("shell probe `{command}`"),
            Self::File { path } => format!("file {}", path.display()),
            Self::PollUrl { url, expected_status } => {
                format!("poll {url} for status {}", expected_status.unwrap_or(200))
            }
            Self::Permission { permission_id } => format!("permission {permission_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    /// Condition holds; the observation feeds the resume prompt.
    Met { observation: String },
    NotMet,
    /// The wait itself was turned down; the task fails rather than resumes.
    Rejected { reason: String },
}

/// One probe of a watch condition.
///
/// Probe failures (spawn errors, network errors, missing records) count as
/// not met; the next tick tries again and `max_wait_ms` bounds the damage.
pub async fn evaluate(
    watch: &WatchConfig,
    http: &reqwest::Client,
    permissions: &PermissionStore,
) -> WatchOutcome {
    match watch {
        WatchConfig::Shell { command } => probe_shell(command).await,
        WatchConfig::File { path } => {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                WatchOutcome::Met {
                    observation: format!("{} exists", path.display()),
                }
            } else {
                WatchOutcome::NotMet
            }
        }
        WatchConfig::PollUrl { url, expected_status } => {
            let want = expected_status.unwrap_or(200);
            match http.get(url).send().await {
                Ok(response) => {
                    let got = response.status().as_u16();
                    if got == want {
                        WatchOutcome::Met {
                            observation: format!("GET {url} returned {got}"),
                        }
                    } else {
                        WatchOutcome::NotMet
                    }
                }
                Err(e) => {
                    warn!(url, error = %e, "url probe failed");
                    WatchOutcome::NotMet
                }
            }
        }
        WatchConfig::Permission { permission_id } => {
            probe_permission(*permission_id, permissions).await
        }
    }
}

async fn probe_shell(command: &str) -> WatchOutcome {
    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(SHELL_PROBE_TIMEOUT, spawned).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(command, error = %e, "shell probe failed to spawn");
            return WatchOutcome::NotMet;
        }
        Err(_) => {
            warn!(command, "shell probe timed out");
            return WatchOutcome::NotMet;
        }
    };
    if !output.status.success() {
        return WatchOutcome::NotMet;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    let observation = if trimmed.is_empty() {
        format!("`{command}` exited 0")
    } else if trimmed.chars().count() > OBSERVATION_LEN {
        trimmed.chars().take(OBSERVATION_LEN).collect()
    } else {
        trimmed.to_string()
    };
    WatchOutcome::Met { observation }
}

async fn probe_permission(permission_id: Uuid, permissions: &PermissionStore) -> WatchOutcome {
    let record = match permissions.read(permission_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(permission_id = %permission_id, "watched permission record is missing");
            return WatchOutcome::NotMet;
        }
        Err(e) => {
            warn!(permission_id = %permission_id, error = %e, "failed to read permission record");
            return WatchOutcome::NotMet;
        }
    };
    match record.status {
        PermissionStatus::Approved | PermissionStatus::Allowlisted => {
            let by = record.decided_by.as_deref().unwrap_or("allowlist");
            WatchOutcome::Met {
                observation: format!("permission {} granted by {by}", record.operation),
            }
        }
        PermissionStatus::Rejected => {
            let reason = record
                .decision_reason
                .clone()
                .unwrap_or_else(|| format!("{} was rejected", record.operation));
            WatchOutcome::Rejected { reason }
        }
        PermissionStatus::Pending => WatchOutcome::NotMet,
    }
}
