//! Deployment lifecycle state machine
//!
//! Container deployments move forward along PROVISIONING -> RUNNING ->
//! PRODUCTION, with FAILED and TERMINATED reachable from any non-terminal
//! state. Transitions never regress; stale or reordered webhook reports are
//! rejected rather than silently applied.

use serde::{Deserialize, Serialize};

/// Whether a project serves static objects or a scheduled container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectType {
    Static,
    Dynamic,
}

impl std::fmt::Display for ProjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectType::Static => write!(f, "STATIC"),
            ProjectType::Dynamic => write!(f, "DYNAMIC"),
        }
    }
}

impl std::str::FromStr for ProjectType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "STATIC" => Ok(ProjectType::Static),
            "DYNAMIC" => Ok(ProjectType::Dynamic),
            _ => anyhow::bail!("Unknown project type: {}", s),
        }
    }
}

/// Persisted status of a container deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Provisioning,
    Running,
    Production,
    Failed,
    Terminated,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Terminated)
    }

    /// Position along the forward path; terminal states compare above all
    fn rank(&self) -> u8 {
        match self {
            DeploymentStatus::Provisioning => 0,
            DeploymentStatus::Running => 1,
            DeploymentStatus::Production => 2,
            DeploymentStatus::Failed | DeploymentStatus::Terminated => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Provisioning => "PROVISIONING",
            DeploymentStatus::Running => "RUNNING",
            DeploymentStatus::Production => "PRODUCTION",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::Terminated => "TERMINATED",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "PROVISIONING" => Ok(DeploymentStatus::Provisioning),
            "RUNNING" => Ok(DeploymentStatus::Running),
            "PRODUCTION" => Ok(DeploymentStatus::Production),
            "FAILED" => Ok(DeploymentStatus::Failed),
            "TERMINATED" => Ok(DeploymentStatus::Terminated),
            _ => anyhow::bail!("Unknown deployment status: {}", s),
        }
    }
}

/// Check whether a reported status may replace the current one.
///
/// Re-reporting the current status is allowed (webhook delivery is
/// at-least-once), moving backward is not, and terminal states accept
/// nothing further.
pub fn transition_allowed(current: DeploymentStatus, next: DeploymentStatus) -> bool {
    if current == next {
        return true;
    }
    if current.is_terminal() {
        return false;
    }
    next.rank() > current.rank()
}

/// Action a lifecycle webhook token authorizes the holder to report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookAction {
    Provisioning,
    Running,
    Production,
    Failed,
    Terminated,
    /// Traffic-observed signal; updates `last_ingressed_at` only, never status
    Ingressed,
}

impl WebhookAction {
    /// The status this action reports, or None for the ingress signal
    pub fn as_status(&self) -> Option<DeploymentStatus> {
        match self {
            WebhookAction::Provisioning => Some(DeploymentStatus::Provisioning),
            WebhookAction::Running => Some(DeploymentStatus::Running),
            WebhookAction::Production => Some(DeploymentStatus::Production),
            WebhookAction::Failed => Some(DeploymentStatus::Failed),
            WebhookAction::Terminated => Some(DeploymentStatus::Terminated),
            WebhookAction::Ingressed => None,
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, WebhookAction::Ingressed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookAction::Provisioning => "PROVISIONING",
            WebhookAction::Running => "RUNNING",
            WebhookAction::Production => "PRODUCTION",
            WebhookAction::Failed => "FAILED",
            WebhookAction::Terminated => "TERMINATED",
            WebhookAction::Ingressed => "INGRESSED",
        }
    }

    pub const ALL: [WebhookAction; 6] = [
        WebhookAction::Provisioning,
        WebhookAction::Running,
        WebhookAction::Production,
        WebhookAction::Failed,
        WebhookAction::Terminated,
        WebhookAction::Ingressed,
    ];
}

impl std::fmt::Display for WebhookAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers derived once per scheduling attempt, traceable to the
/// originating deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingIds {
    pub container_id: String,
    pub build_id: String,
    pub runtime_id: String,
}

impl SchedulingIds {
    pub fn derive(deployment_id: &str, scheduled_at: i64) -> Self {
        Self {
            container_id: format!("ctr-{}-{}", deployment_id, scheduled_at),
            build_id: format!("bld-{}-{}", deployment_id, scheduled_at),
            runtime_id: format!("rt-{}-{}", deployment_id, scheduled_at),
        }
    }
}
