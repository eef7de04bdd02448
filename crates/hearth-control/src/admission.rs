//! Server creation and job admission.
//!
//! Everything that must be rejected before a job row exists is rejected here:
//! unknown games, invalid config, actions the server's status does not allow,
//! and a second job for a server that already has one queued or running.

use hearth_core::{
    ConfigMap, Job, JobAction, NotifyTarget, ServerRecord, ServerStatus, ValidationError,
    validate_action,
};
use uuid::Uuid;

use crate::{
    games::{ConfigErrors, resolve_config},
    ports::PortAllocationError,
    state::EngineContext,
    store::StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("unknown game: {0}")]
    UnknownGame(String),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("server {0} not found")]
    ServerNotFound(Uuid),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("server {0} already has a queued or running job")]
    Busy(Uuid),
    #[error(transparent)]
    Ports(PortAllocationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub game_id: String,
    pub name: String,
    pub owner_id: String,
    pub group_id: Option<String>,
    pub config: ConfigMap,
}

#[derive(Debug, Clone)]
pub struct Admitted {
    pub server: ServerRecord,
    /// Set only when the server got its ports and auto-provisioning was asked for.
    pub job: Option<Job>,
}

#[derive(Clone)]
pub struct Admission {
    ctx: EngineContext,
}

impl Admission {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// A server whose ports cannot be allocated yet is still created, in
    /// `PendingPorts`, and gets no job.
    pub async fn create_server(
        &self,
        new: NewServer,
        auto_provision: bool,
    ) -> Result<Admitted, AdmissionError> {
        let game = self
            .ctx
            .games
            .get(&new.game_id)
            .await
            .ok_or_else(|| AdmissionError::UnknownGame(new.game_id.clone()))?;
        let config = resolve_config(&game.config_schema, &new.config)?;

        let mut server = ServerRecord::new(&game.id, new.name, new.owner_id);
        server.group_id = new.group_id;
        server.config = config;

        match self
            .ctx
            .ports
            .allocate(&game.port_pool, server.id, &game.port_names())
            .await
        {
            Ok(ports) => {
                server.ports = ports;
                server.status = ServerStatus::Pending;
            }
            Err(PortAllocationError::Exhausted { pool, required }) => {
                tracing::info!(server_id = %server.id, %pool, required, "no ports available, server waits for ports");
                server.status = ServerStatus::PendingPorts;
            }
            Err(err) => return Err(AdmissionError::Ports(err)),
        }

        if let Err(err) = self.ctx.store.insert_server(&server).await {
            if let Err(release) = self.ctx.ports.release(server.id).await {
                tracing::warn!(server_id = %server.id, err = %release, "failed to release ports of a rejected server");
            }
            return Err(err.into());
        }
        tracing::info!(server_id = %server.id, game = %game.id, status = %server.status, "server created");

        let job = if auto_provision && server.status == ServerStatus::Pending {
            Some(self.enqueue_job(server.id, JobAction::Provision, None).await?)
        } else {
            None
        };
        Ok(Admitted { server, job })
    }

    pub async fn enqueue_job(
        &self,
        server_id: Uuid,
        action: JobAction,
        notify: Option<NotifyTarget>,
    ) -> Result<Job, AdmissionError> {
        let server = self
            .ctx
            .store
            .get_server(server_id)
            .await?
            .ok_or(AdmissionError::ServerNotFound(server_id))?;
        validate_action(server.status, action)?;

        let job = Job::queued(server_id, action).with_notify(notify);
        match self.ctx.store.insert_job_if_idle(&job).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Err(AdmissionError::Busy(server_id)),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(job_id = %job.id, %server_id, %action, "job queued");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use hearth_core::{ConfigValue, JobStatus, PortAllocation};

    use super::*;
    use crate::ports::PortRange;
    use crate::store::{ServerFilter, Store};
    use crate::testing::Harness;

    fn new_server(game: &str) -> NewServer {
        NewServer {
            game_id: game.into(),
            name: "alpha".into(),
            owner_id: "owner-1".into(),
            group_id: Some("guild-7".into()),
            config: ConfigMap::new(),
        }
    }

    #[tokio::test]
    async fn ports_are_allocated_and_provision_is_queued() {
        let h = Harness::new().await;
        let admission = Admission::new(h.ctx.clone());

        let admitted = admission
            .create_server(new_server("valheim"), true)
            .await
            .unwrap();
        let server = &admitted.server;
        assert_eq!(server.status, ServerStatus::Pending);
        assert_eq!(server.ports["game"], 27000);
        assert_eq!(server.ports["query"], 27001);
        assert_eq!(server.config["max_players"], ConfigValue::Integer(10));

        let job = admitted.job.unwrap();
        assert_eq!(job.action, JobAction::Provision);
        assert_eq!(job.status, JobStatus::Queued);
        let active = h.store.active_job_for_server(server.id).await.unwrap();
        assert_eq!(active.map(|j| j.id), Some(job.id));
    }

    #[tokio::test]
    async fn exhausted_pool_parks_the_server_without_a_job() {
        let mut pools = BTreeMap::new();
        pools.insert("game".to_string(), PortRange::new(27000, 27001));
        let h = Harness::with_pools(pools);
        h.store
            .reserve_ports(&[PortAllocation {
                pool: "game".into(),
                port: 27000,
                server_id: Uuid::new_v4(),
                purpose: "game".into(),
            }])
            .await
            .unwrap();
        let admission = Admission::new(h.ctx.clone());

        let admitted = admission
            .create_server(new_server("valheim"), true)
            .await
            .unwrap();
        assert_eq!(admitted.server.status, ServerStatus::PendingPorts);
        assert!(admitted.server.ports.is_empty());
        assert!(admitted.job.is_none());
        assert!(h.store.all_jobs().is_empty());
        assert_eq!(h.store.list_port_allocations("game").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn auto_provision_is_opt_in() {
        let h = Harness::new().await;
        let admitted = Admission::new(h.ctx.clone())
            .create_server(new_server("valheim"), false)
            .await
            .unwrap();
        assert_eq!(admitted.server.status, ServerStatus::Pending);
        assert!(admitted.job.is_none());
    }

    #[tokio::test]
    async fn bad_input_creates_nothing() {
        let h = Harness::new().await;
        let admission = Admission::new(h.ctx.clone());

        let err = admission
            .create_server(new_server("minecraft"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownGame(ref g) if g == "minecraft"));

        let mut bad = new_server("valheim");
        bad.config.insert("max_players".into(), ConfigValue::Integer(500));
        let err = admission.create_server(bad, true).await.unwrap_err();
        assert!(err.to_string().contains("max_players"), "{err}");

        let listed = h.store.list_servers(&ServerFilter::default()).await.unwrap();
        assert!(listed.is_empty());
        assert!(h.store.list_port_allocations("game").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_is_rejected_while_provisioning() {
        let h = Harness::new().await;
        let server = h.server("valheim", ServerStatus::Provisioning).await;

        let err = Admission::new(h.ctx.clone())
            .enqueue_job(server.id, JobAction::Start, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot start a server in status provisioning"
        );
        assert!(h.store.all_jobs().is_empty());
        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Provisioning);
    }

    #[tokio::test]
    async fn one_active_job_per_server() {
        let h = Harness::new().await;
        let server = h.server("valheim", ServerStatus::Running).await;
        let admission = Admission::new(h.ctx.clone());

        let first = admission
            .enqueue_job(server.id, JobAction::Backup, None)
            .await
            .unwrap();
        let err = admission
            .enqueue_job(server.id, JobAction::Stop, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Busy(id) if id == server.id));

        h.store.claim_job(first.id, Utc::now()).await.unwrap();
        h.store
            .finish_job(first.id, JobStatus::Completed, None, Utc::now())
            .await
            .unwrap();
        admission
            .enqueue_job(server.id, JobAction::Stop, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn an_interrupted_delete_can_be_retried() {
        let h = Harness::new().await;
        let server = h.server("valheim", ServerStatus::Deleting).await;
        let admission = Admission::new(h.ctx.clone());

        let err = admission
            .enqueue_job(server.id, JobAction::Start, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
        let job = admission
            .enqueue_job(server.id, JobAction::Delete, None)
            .await
            .unwrap();
        assert_eq!(job.action, JobAction::Delete);
    }

    #[tokio::test]
    async fn deleted_servers_cannot_get_jobs() {
        let h = Harness::new().await;
        let server = h.server("valheim", ServerStatus::Stopped).await;
        h.store.soft_delete_server(server.id, Utc::now()).await.unwrap();

        let err = Admission::new(h.ctx.clone())
            .enqueue_job(server.id, JobAction::Delete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::ServerNotFound(_)));
    }
}
