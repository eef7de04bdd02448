use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hearth_core::{
    ConfigMap, Job, JobAction, JobStatus, ModEntry, NotifyTarget, PortAllocation, ServerRecord,
    ServerStatus,
};
use hearth_db::entities::{job_log_lines, jobs, port_allocations, servers, sftp_grants};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use uuid::Uuid;

use crate::store::{ServerFilter, SftpGrant, Store, StoreError, StoreResult};

#[derive(Clone)]
pub struct DbStore {
    db: Arc<DatabaseConnection>,
}

impl DbStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg)) => StoreError::Conflict(msg),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {err}"))
}

fn ts(at: DateTime<Utc>) -> sea_orm::prelude::DateTimeWithTimeZone {
    at.into()
}

fn server_from_model(m: servers::Model) -> StoreResult<ServerRecord> {
    let status: ServerStatus = m.status.parse().map_err(|e| corrupt("servers.status", e))?;
    let config: ConfigMap =
        serde_json::from_value(m.config).map_err(|e| corrupt("servers.config", e))?;
    let ports: BTreeMap<String, u16> =
        serde_json::from_value(m.ports).map_err(|e| corrupt("servers.ports", e))?;
    let mods: Vec<ModEntry> = match m.mods {
        Some(v) => serde_json::from_value(v).map_err(|e| corrupt("servers.mods", e))?,
        None => Vec::new(),
    };
    let instance_id = m
        .instance_id
        .map(u32::try_from)
        .transpose()
        .map_err(|e| corrupt("servers.instance_id", e))?;

    Ok(ServerRecord {
        id: m.id,
        game_id: m.game_id,
        name: m.name,
        status,
        config,
        ports,
        internal_address: m.internal_address,
        instance_id,
        instance_node: m.instance_node,
        owner_id: m.owner_id,
        group_id: m.group_id,
        mods,
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
        deleted_at: m.deleted_at.map(|d| d.with_timezone(&Utc)),
    })
}

fn server_to_active(s: &ServerRecord) -> StoreResult<servers::ActiveModel> {
    let to_json = |what: &str, v: serde_json::Result<serde_json::Value>| {
        v.map_err(|e| corrupt(what, e))
    };
    Ok(servers::ActiveModel {
        id: Set(s.id),
        game_id: Set(s.game_id.clone()),
        name: Set(s.name.clone()),
        status: Set(s.status.as_str().to_string()),
        config: Set(to_json("servers.config", serde_json::to_value(&s.config))?),
        ports: Set(to_json("servers.ports", serde_json::to_value(&s.ports))?),
        internal_address: Set(s.internal_address.clone()),
        instance_id: Set(s.instance_id.map(i64::from)),
        instance_node: Set(s.instance_node.clone()),
        owner_id: Set(s.owner_id.clone()),
        group_id: Set(s.group_id.clone()),
        mods: Set(if s.mods.is_empty() {
            None
        } else {
            Some(to_json("servers.mods", serde_json::to_value(&s.mods))?)
        }),
        created_at: Set(ts(s.created_at)),
        updated_at: Set(ts(s.updated_at)),
        deleted_at: Set(s.deleted_at.map(ts)),
    })
}

fn job_from_model(m: jobs::Model) -> StoreResult<Job> {
    let action: JobAction = m.action.parse().map_err(|e| corrupt("jobs.action", e))?;
    let status: JobStatus = m.status.parse().map_err(|e| corrupt("jobs.status", e))?;
    Ok(Job {
        id: m.id,
        server_id: m.server_id,
        action,
        status,
        error: m.error,
        notify: m.notify_channel.map(|channel| NotifyTarget {
            channel,
            user: m.notify_user,
        }),
        created_at: m.created_at.with_timezone(&Utc),
        started_at: m.started_at.map(|d| d.with_timezone(&Utc)),
        completed_at: m.completed_at.map(|d| d.with_timezone(&Utc)),
    })
}

fn live_servers() -> sea_orm::Select<servers::Entity> {
    servers::Entity::find().filter(servers::Column::DeletedAt.is_null())
}

#[async_trait::async_trait]
impl Store for DbStore {
    async fn get_server(&self, id: Uuid) -> StoreResult<Option<ServerRecord>> {
        live_servers()
            .filter(servers::Column::Id.eq(id))
            .one(&*self.db)
            .await?
            .map(server_from_model)
            .transpose()
    }

    async fn list_servers(&self, filter: &ServerFilter) -> StoreResult<Vec<ServerRecord>> {
        let mut q = live_servers();
        if let Some(status) = filter.status {
            q = q.filter(servers::Column::Status.eq(status.as_str()));
        }
        if let Some(owner) = &filter.owner_id {
            q = q.filter(servers::Column::OwnerId.eq(owner.as_str()));
        }
        if let Some(group) = &filter.group_id {
            q = q.filter(servers::Column::GroupId.eq(group.as_str()));
        }
        q.order_by_asc(servers::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(server_from_model)
            .collect()
    }

    async fn insert_server(&self, server: &ServerRecord) -> StoreResult<()> {
        server_to_active(server)?.insert(&*self.db).await?;
        Ok(())
    }

    async fn save_server(&self, server: &ServerRecord) -> StoreResult<()> {
        let mut model = server_to_active(server)?;
        model.updated_at = Set(ts(Utc::now()));
        // Never resurrect or touch a soft-deleted row.
        model.deleted_at = sea_orm::ActiveValue::NotSet;
        model.created_at = sea_orm::ActiveValue::NotSet;
        let res = servers::Entity::update_many()
            .set(model)
            .filter(servers::Column::Id.eq(server.id))
            .filter(servers::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound(format!("server {}", server.id)));
        }
        Ok(())
    }

    async fn update_server_status(&self, id: Uuid, status: ServerStatus) -> StoreResult<()> {
        let res = servers::Entity::update_many()
            .col_expr(servers::Column::Status, Expr::value(status.as_str()))
            .col_expr(servers::Column::UpdatedAt, Expr::value(ts(Utc::now())))
            .filter(servers::Column::Id.eq(id))
            .filter(servers::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound(format!("server {id}")));
        }
        Ok(())
    }

    async fn soft_delete_server(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let res = servers::Entity::update_many()
            .col_expr(servers::Column::DeletedAt, Expr::value(ts(at)))
            .col_expr(servers::Column::UpdatedAt, Expr::value(ts(at)))
            .filter(servers::Column::Id.eq(id))
            .filter(servers::Column::DeletedAt.is_null())
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(StoreError::NotFound(format!("server {id}")));
        }
        Ok(())
    }

    async fn insert_job_if_idle(&self, job: &Job) -> StoreResult<()> {
        // The partial unique index on jobs(server_id) closes the window between
        // this check and the insert; a loser surfaces as a unique violation.
        let txn = self.db.begin().await?;
        let active = jobs::Entity::find()
            .filter(jobs::Column::ServerId.eq(job.server_id))
            .filter(
                jobs::Column::Status
                    .is_in([JobStatus::Queued.as_str(), JobStatus::Running.as_str()]),
            )
            .count(&txn)
            .await?;
        if active > 0 {
            return Err(StoreError::Conflict(format!(
                "server {} already has an active job",
                job.server_id
            )));
        }
        jobs::ActiveModel {
            id: Set(job.id),
            server_id: Set(job.server_id),
            action: Set(job.action.as_str().to_string()),
            status: Set(job.status.as_str().to_string()),
            error: Set(job.error.clone()),
            notify_channel: Set(job.notify.as_ref().map(|n| n.channel.clone())),
            notify_user: Set(job.notify.as_ref().and_then(|n| n.user.clone())),
            created_at: Set(ts(job.created_at)),
            started_at: Set(job.started_at.map(ts)),
            completed_at: Set(job.completed_at.map(ts)),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        jobs::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(job_from_model)
            .transpose()
    }

    async fn list_jobs_by_status(&self, status: JobStatus, limit: usize) -> StoreResult<Vec<Job>> {
        jobs::Entity::find()
            .filter(jobs::Column::Status.eq(status.as_str()))
            .order_by_asc(jobs::Column::CreatedAt)
            .limit(limit as u64)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(job_from_model)
            .collect()
    }

    async fn active_job_for_server(&self, server_id: Uuid) -> StoreResult<Option<Job>> {
        jobs::Entity::find()
            .filter(jobs::Column::ServerId.eq(server_id))
            .filter(
                jobs::Column::Status
                    .is_in([JobStatus::Queued.as_str(), JobStatus::Running.as_str()]),
            )
            .one(&*self.db)
            .await?
            .map(job_from_model)
            .transpose()
    }

    async fn claim_job(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let res = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(jobs::Column::StartedAt, Expr::value(ts(at)))
            .filter(jobs::Column::Id.eq(id))
            .filter(jobs::Column::Status.eq(JobStatus::Queued.as_str()))
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected == 1)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let res = jobs::Entity::update_many()
            .col_expr(jobs::Column::Status, Expr::value(status.as_str()))
            .col_expr(jobs::Column::Error, Expr::value(error))
            .col_expr(jobs::Column::CompletedAt, Expr::value(ts(at)))
            .filter(jobs::Column::Id.eq(id))
            .filter(jobs::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&*self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(StoreError::Conflict(format!("job {id} is not running")));
        }
        Ok(())
    }

    async fn append_job_log(&self, id: Uuid, line: &str) -> StoreResult<()> {
        job_log_lines::ActiveModel {
            job_id: Set(id),
            line: Set(line.to_string()),
            created_at: Set(ts(Utc::now())),
            ..Default::default()
        }
        .insert(&*self.db)
        .await?;
        Ok(())
    }

    async fn job_logs(&self, id: Uuid) -> StoreResult<Vec<String>> {
        Ok(job_log_lines::Entity::find()
            .filter(job_log_lines::Column::JobId.eq(id))
            .order_by_asc(job_log_lines::Column::Id)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|m| m.line)
            .collect())
    }

    async fn list_port_allocations(&self, pool: &str) -> StoreResult<Vec<PortAllocation>> {
        port_allocations::Entity::find()
            .filter(port_allocations::Column::Pool.eq(pool))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|m| {
                Ok(PortAllocation {
                    port: u16::try_from(m.port).map_err(|e| corrupt("port_allocations.port", e))?,
                    pool: m.pool,
                    server_id: m.server_id,
                    purpose: m.purpose,
                })
            })
            .collect()
    }

    async fn reserve_ports(&self, rows: &[PortAllocation]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = ts(Utc::now());
        let models = rows.iter().map(|r| port_allocations::ActiveModel {
            id: Set(Uuid::new_v4()),
            pool: Set(r.pool.clone()),
            port: Set(i32::from(r.port)),
            server_id: Set(r.server_id),
            purpose: Set(r.purpose.clone()),
            created_at: Set(now),
        });
        let txn = self.db.begin().await?;
        port_allocations::Entity::insert_many(models)
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn release_ports(&self, server_id: Uuid) -> StoreResult<u64> {
        let res = port_allocations::Entity::delete_many()
            .filter(port_allocations::Column::ServerId.eq(server_id))
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected)
    }

    async fn get_sftp_grant(&self, server_id: Uuid) -> StoreResult<Option<SftpGrant>> {
        sftp_grants::Entity::find_by_id(server_id)
            .one(&*self.db)
            .await?
            .map(|m| {
                Ok(SftpGrant {
                    server_id: m.server_id,
                    username: m.username,
                    port: u16::try_from(m.port).map_err(|e| corrupt("sftp_grants.port", e))?,
                    created_at: m.created_at.with_timezone(&Utc),
                })
            })
            .transpose()
    }

    async fn upsert_sftp_grant(&self, grant: &SftpGrant) -> StoreResult<()> {
        sftp_grants::Entity::insert(sftp_grants::ActiveModel {
            server_id: Set(grant.server_id),
            username: Set(grant.username.clone()),
            port: Set(i32::from(grant.port)),
            created_at: Set(ts(grant.created_at)),
        })
        .on_conflict(
            OnConflict::column(sftp_grants::Column::ServerId)
                .update_columns([sftp_grants::Column::Username, sftp_grants::Column::Port])
                .to_owned(),
        )
        .exec(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_sftp_grant(&self, server_id: Uuid) -> StoreResult<bool> {
        let res = sftp_grants::Entity::delete_by_id(server_id)
            .exec(&*self.db)
            .await?;
        Ok(res.rows_affected > 0)
    }
}
