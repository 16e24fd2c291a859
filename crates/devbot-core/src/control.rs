//! Status and health payloads for an outer control surface (HTTP, chat
//! commands). Both always return a payload; internal faults degrade to an
//! error-shaped one.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    session::ConnectionInfo,
    state::LifecycleState,
    supervisor::{Phase, Supervisor},
};

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub state: LifecycleState,
    pub since: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactive_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: &'static str,
    pub phase: Phase,
    pub recovering: bool,
    pub connection_info: ConnectionInfo,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum StatusPayload {
    Report(Box<StatusReport>),
    Degraded {
        status: &'static str,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthDetails {
    pub has_identity: bool,
    pub workspace_count: usize,
    pub ready: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_state: Option<LifecycleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusPayload {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "status": "error", "error": e.to_string() })
        })
    }
}

impl Supervisor {
    /// Best-effort snapshot of the lifecycle plus connection facts.
    pub async fn status(&self) -> StatusPayload {
        let timestamp = Utc::now();
        let details = match self.store().status_details() {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("status unavailable: {e}");
                return StatusPayload::Degraded {
                    status: "error",
                    error: e.to_string(),
                    timestamp,
                };
            }
        };

        StatusPayload::Report(Box::new(StatusReport {
            state: details.state,
            since: details.since,
            inactive_reason: details.inactive_reason,
            last_error: details.last_error,
            reconnect_attempts: details.reconnect_attempts,
            max_reconnect_attempts: "No limit",
            phase: self.phase(),
            recovering: self.is_recovering(),
            connection_info: self.connection_info().await,
            timestamp,
        }))
    }

    /// UP when the live session passes the health probe.
    pub async fn health(&self) -> HealthReport {
        let time = Utc::now();
        let details = match self.store().status_details() {
            Ok(d) => d,
            Err(e) => {
                return HealthReport {
                    status: HealthStatus::Error,
                    time,
                    bot_state: None,
                    details: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let info = self.connection_info().await;
        let status = if self.probe().await {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };
        HealthReport {
            status,
            time,
            bot_state: Some(details.state),
            details: Some(HealthDetails {
                has_identity: info.user_id.is_some(),
                workspace_count: info.workspace_count,
                ready: info.ready,
            }),
            error: None,
        }
    }
}
