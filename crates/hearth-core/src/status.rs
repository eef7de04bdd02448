use std::fmt;
use std::str::FromStr;

/// Lifecycle of a game server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    PendingPorts,
    Pending,
    Provisioning,
    Running,
    Stopped,
    Error,
    Deleting,
}

impl ServerStatus {
    pub const ALL: [ServerStatus; 7] = [
        ServerStatus::PendingPorts,
        ServerStatus::Pending,
        ServerStatus::Provisioning,
        ServerStatus::Running,
        ServerStatus::Stopped,
        ServerStatus::Error,
        ServerStatus::Deleting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::PendingPorts => "pending_ports",
            ServerStatus::Pending => "pending",
            ServerStatus::Provisioning => "provisioning",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
            ServerStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerStatus::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("server status", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Queued or Running: counts against the one-active-job-per-server rule.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant::new("job status", other)),
        }
    }
}

/// Abstract operation a job performs against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobAction {
    Provision,
    Start,
    Stop,
    Backup,
    Update,
    Deprovision,
    Delete,
    InstallMods,
    SetupSftp,
    DisableSftp,
    ResetSftpPassword,
}

impl JobAction {
    pub const ALL: [JobAction; 11] = [
        JobAction::Provision,
        JobAction::Start,
        JobAction::Stop,
        JobAction::Backup,
        JobAction::Update,
        JobAction::Deprovision,
        JobAction::Delete,
        JobAction::InstallMods,
        JobAction::SetupSftp,
        JobAction::DisableSftp,
        JobAction::ResetSftpPassword,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::Provision => "provision",
            JobAction::Start => "start",
            JobAction::Stop => "stop",
            JobAction::Backup => "backup",
            JobAction::Update => "update",
            JobAction::Deprovision => "deprovision",
            JobAction::Delete => "delete",
            JobAction::InstallMods => "install-mods",
            JobAction::SetupSftp => "setup-sftp",
            JobAction::DisableSftp => "disable-sftp",
            JobAction::ResetSftpPassword => "reset-sftp-password",
        }
    }

    /// Statuses a server must be in before this action may be queued.
    pub fn allowed_from(self) -> &'static [ServerStatus] {
        use ServerStatus::*;
        match self {
            JobAction::Provision => &[Pending, Error],
            JobAction::Start => &[Stopped, Error],
            JobAction::Stop => &[Running, Error],
            JobAction::Backup => &[Running, Stopped],
            JobAction::Update => &[Stopped, Running],
            JobAction::Deprovision => &[Stopped, Error],
            JobAction::InstallMods
            | JobAction::SetupSftp
            | JobAction::DisableSftp
            | JobAction::ResetSftpPassword => &[Stopped, Running],
            // A delete that stopped before the soft-delete may be retried.
            JobAction::Delete => &[
                PendingPorts,
                Pending,
                Provisioning,
                Running,
                Stopped,
                Error,
                Deleting,
            ],
        }
    }

    /// Status written after the job completes successfully, if any.
    pub fn status_on_success(self) -> Option<ServerStatus> {
        match self {
            JobAction::Provision => Some(ServerStatus::Stopped),
            JobAction::Start => Some(ServerStatus::Running),
            JobAction::Stop => Some(ServerStatus::Stopped),
            JobAction::Deprovision => Some(ServerStatus::Pending),
            _ => None,
        }
    }

    /// Status written after the job fails. A deleted record is no longer
    /// visible to normal lookups, so nothing is written for `delete`.
    pub fn status_on_failure(self) -> Option<ServerStatus> {
        match self {
            JobAction::Delete => None,
            _ => Some(ServerStatus::Error),
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        JobAction::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| UnknownVariant::new("job action", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Rejection raised before a job row exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} a server in status {status}")]
pub struct ValidationError {
    pub action: JobAction,
    pub status: ServerStatus,
}

pub fn validate_action(status: ServerStatus, action: JobAction) -> Result<(), ValidationError> {
    if action.allowed_from().contains(&status) {
        Ok(())
    } else {
        Err(ValidationError { action, status })
    }
}
