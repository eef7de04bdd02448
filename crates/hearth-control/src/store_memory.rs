use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hearth_core::{Job, JobStatus, PortAllocation, ServerRecord, ServerStatus};
use uuid::Uuid;

use crate::store::{ServerFilter, SftpGrant, Store, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    servers: HashMap<Uuid, ServerRecord>,
    // Insertion order doubles as creation order.
    jobs: Vec<Job>,
    logs: HashMap<Uuid, Vec<String>>,
    ports: Vec<PortAllocation>,
    grants: HashMap<Uuid, SftpGrant>,
}

/// Process-local store. Every operation holds one lock, so each call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Includes soft-deleted rows; for audits and tests.
    pub fn raw_server(&self, id: Uuid) -> Option<ServerRecord> {
        self.with(|t| t.servers.get(&id).cloned())
    }

    pub fn all_jobs(&self) -> Vec<Job> {
        self.with(|t| t.jobs.clone())
    }
}

fn live(server: &ServerRecord) -> bool {
    !server.is_deleted()
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_server(&self, id: Uuid) -> StoreResult<Option<ServerRecord>> {
        Ok(self.with(|t| t.servers.get(&id).filter(|s| live(s)).cloned()))
    }

    async fn list_servers(&self, filter: &ServerFilter) -> StoreResult<Vec<ServerRecord>> {
        let mut out: Vec<ServerRecord> = self.with(|t| {
            t.servers
                .values()
                .filter(|s| live(s) && filter.matches(s))
                .cloned()
                .collect()
        });
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn insert_server(&self, server: &ServerRecord) -> StoreResult<()> {
        self.with(|t| {
            if t.servers.contains_key(&server.id) {
                return Err(StoreError::Conflict(format!("server {}", server.id)));
            }
            t.servers.insert(server.id, server.clone());
            Ok(())
        })
    }

    async fn save_server(&self, server: &ServerRecord) -> StoreResult<()> {
        self.with(|t| match t.servers.get_mut(&server.id) {
            Some(existing) if live(existing) => {
                *existing = server.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("server {}", server.id))),
        })
    }

    async fn update_server_status(&self, id: Uuid, status: ServerStatus) -> StoreResult<()> {
        self.with(|t| match t.servers.get_mut(&id) {
            Some(existing) if live(existing) => {
                existing.status = status;
                existing.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("server {id}"))),
        })
    }

    async fn soft_delete_server(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.with(|t| match t.servers.get_mut(&id) {
            Some(existing) if live(existing) => {
                existing.deleted_at = Some(at);
                existing.updated_at = at;
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("server {id}"))),
        })
    }

    async fn insert_job_if_idle(&self, job: &Job) -> StoreResult<()> {
        self.with(|t| {
            if t
                .jobs
                .iter()
                .any(|j| j.server_id == job.server_id && j.status.is_active())
            {
                return Err(StoreError::Conflict(format!(
                    "server {} already has an active job",
                    job.server_id
                )));
            }
            t.jobs.push(job.clone());
            Ok(())
        })
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.with(|t| t.jobs.iter().find(|j| j.id == id).cloned()))
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> StoreResult<Vec<Job>> {
        Ok(self.with(|t| {
            t.jobs
                .iter()
                .filter(|j| j.status == status)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn active_job_for_server(&self, server_id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.with(|t| {
            t.jobs
                .iter()
                .find(|j| j.server_id == server_id && j.status.is_active())
                .cloned()
        }))
    }

    async fn claim_job(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        Ok(self.with(|t| {
            match t
                .jobs
                .iter_mut()
                .find(|j| j.id == id && j.status == JobStatus::Queued)
            {
                Some(job) => {
                    job.status = JobStatus::Running;
                    job.started_at = Some(at);
                    true
                }
                None => false,
            }
        }))
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with(|t| {
            let job = t
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
            if job.status != JobStatus::Running {
                return Err(StoreError::Conflict(format!(
                    "job {id} is {} not running",
                    job.status
                )));
            }
            job.status = status;
            job.error = error;
            job.completed_at = Some(at);
            Ok(())
        })
    }

    async fn append_job_log(&self, id: Uuid, line: &str) -> StoreResult<()> {
        self.with(|t| t.logs.entry(id).or_default().push(line.to_string()));
        Ok(())
    }

    async fn job_logs(&self, id: Uuid) -> StoreResult<Vec<String>> {
        Ok(self.with(|t| t.logs.get(&id).cloned().unwrap_or_default()))
    }

    async fn list_port_allocations(&self, pool: &str) -> StoreResult<Vec<PortAllocation>> {
        let rows = self.with(|t| {
            t.ports
                .iter()
                .filter(|p| p.pool == pool)
                .cloned()
                .collect::<Vec<_>>()
        });
        // Let concurrent callers interleave between read and reserve.
        tokio::task::yield_now().await;
        Ok(rows)
    }

    async fn reserve_ports(&self, rows: &[PortAllocation]) -> StoreResult<()> {
        self.with(|t| {
            let taken: HashSet<(&str, u16)> =
                t.ports.iter().map(|p| (p.pool.as_str(), p.port)).collect();
            let mut seen = HashSet::new();
            for row in rows {
                let key = (row.pool.as_str(), row.port);
                if taken.contains(&key) || !seen.insert(key) {
                    return Err(StoreError::Conflict(format!(
                        "port {} already allocated in pool {}",
                        row.port, row.pool
                    )));
                }
            }
            t.ports.extend(rows.iter().cloned());
            Ok(())
        })
    }

    async fn release_ports(&self, server_id: Uuid) -> StoreResult<u64> {
        Ok(self.with(|t| {
            let before = t.ports.len();
            t.ports.retain(|p| p.server_id != server_id);
            (before - t.ports.len()) as u64
        }))
    }

    async fn get_sftp_grant(&self, server_id: Uuid) -> StoreResult<Option<SftpGrant>> {
        Ok(self.with(|t| t.grants.get(&server_id).cloned()))
    }

    async fn upsert_sftp_grant(&self, grant: &SftpGrant) -> StoreResult<()> {
        self.with(|t| t.grants.insert(grant.server_id, grant.clone()));
        Ok(())
    }

    async fn delete_sftp_grant(&self, server_id: Uuid) -> StoreResult<bool> {
        Ok(self.with(|t| t.grants.remove(&server_id).is_some()))
    }
}
