//! Persistence seam for servers, jobs, port allocations and SFTP grants.
//!
//! [`DbStore`](crate::store_db::DbStore) is the production implementation;
//! [`MemoryStore`](crate::store_memory::MemoryStore) backs the tests.

use chrono::{DateTime, Utc};
use hearth_core::{Job, JobStatus, PortAllocation, ServerRecord, ServerStatus};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub status: Option<ServerStatus>,
    pub owner_id: Option<String>,
    pub group_id: Option<String>,
}

impl ServerFilter {
    pub fn status(status: ServerStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, server: &ServerRecord) -> bool {
        self.status.is_none_or(|s| s == server.status)
            && self
                .owner_id
                .as_deref()
                .is_none_or(|o| o == server.owner_id)
            && self
                .group_id
                .as_deref()
                .is_none_or(|g| server.group_id.as_deref() == Some(g))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpGrant {
    pub server_id: Uuid,
    pub username: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Soft-deleted servers are invisible here.
    async fn get_server(&self, id: Uuid) -> StoreResult<Option<ServerRecord>>;
    async fn list_servers(&self, filter: &ServerFilter) -> StoreResult<Vec<ServerRecord>>;
    async fn insert_server(&self, server: &ServerRecord) -> StoreResult<()>;
    /// Full overwrite of a live record; bumps `updated_at`.
    async fn save_server(&self, server: &ServerRecord) -> StoreResult<()>;
    async fn update_server_status(&self, id: Uuid, status: ServerStatus) -> StoreResult<()>;
    async fn soft_delete_server(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    /// Inserts `job` unless the server already has a queued or running job.
    async fn insert_job_if_idle(&self, job: &Job) -> StoreResult<()>;
    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>>;
    /// Oldest first.
    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> StoreResult<Vec<Job>>;
    async fn active_job_for_server(&self, server_id: Uuid) -> StoreResult<Option<Job>>;
    /// Queued -> Running. Returns false if the job was no longer queued.
    async fn claim_job(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;
    /// Running -> Completed/Failed.
    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn append_job_log(&self, id: Uuid, line: &str) -> StoreResult<()>;
    async fn job_logs(&self, id: Uuid) -> StoreResult<Vec<String>>;

    async fn list_port_allocations(&self, pool: &str) -> StoreResult<Vec<PortAllocation>>;
    /// All-or-nothing; a taken `(pool, port)` yields `Conflict`.
    async fn reserve_ports(&self, rows: &[PortAllocation]) -> StoreResult<()>;
    /// Every pool. Returns the number of rows removed.
    async fn release_ports(&self, server_id: Uuid) -> StoreResult<u64>;

    async fn get_sftp_grant(&self, server_id: Uuid) -> StoreResult<Option<SftpGrant>>;
    async fn upsert_sftp_grant(&self, grant: &SftpGrant) -> StoreResult<()>;
    async fn delete_sftp_grant(&self, server_id: Uuid) -> StoreResult<bool>;
}
