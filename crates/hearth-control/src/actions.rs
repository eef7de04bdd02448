//! One handler per [`JobAction`].
//!
//! Handlers return `Result<(), ActionError>`; [`ActionPipeline::execute`]
//! turns that, or a panic, into an [`ActionOutcome`]. Multi-step teardown
//! (deprovision, delete) records every step so partial failures stay visible.

use std::{future::Future, panic::AssertUnwindSafe};

use chrono::Utc;
use futures_util::FutureExt;
use hearth_core::{Job, JobAction, ServerRecord, ServerStatus, keys};
use uuid::Uuid;

use crate::{
    games::{ConfigErrors, GameDefinition, resolve_config},
    gateway::{rule_name, rule_prefix},
    joblog::JobLog,
    playbook_vars::PlaybookVars,
    ports::PortAllocationError,
    provisioner::ProvisioningError,
    runner::{RunError, RunRequest},
    state::EngineContext,
    store::{SftpGrant, StoreError},
};

pub const SFTP_POOL: &str = "sftp";
pub const SFTP_PORT_NAME: &str = "sftp";

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown game: {0}")]
    UnknownGame(String),
    #[error("game {game} has no {action} playbook")]
    MissingPlaybook { game: String, action: JobAction },
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("server has no internal address")]
    NoAddress,
    #[error("server has no internal address and no virtualization backend is configured")]
    NoBackend,
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error("{0}")]
    Execution(String),
    #[error("playbook runner: {0}")]
    Runner(#[from] RunError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ports(#[from] PortAllocationError),
    #[error("game {0} does not support mods")]
    NoModSupport(String),
    #[error("no temporary sftp password is stashed on the server")]
    MissingSecret,
    #[error("forwarding: {0}")]
    Forwarding(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: &'static str,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub steps: Vec<StepOutcome>,
}

impl ActionOutcome {
    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name)
    }
}

#[derive(Default)]
struct Steps(Vec<StepOutcome>);

impl Steps {
    /// Failure is logged and recorded, never propagated.
    async fn best_effort<T>(
        &mut self,
        name: &'static str,
        log: &JobLog,
        fut: impl Future<Output = Result<T, ActionError>>,
    ) -> Option<T> {
        match fut.await {
            Ok(v) => {
                self.0.push(StepOutcome {
                    name,
                    ok: true,
                    error: None,
                });
                Some(v)
            }
            Err(err) => {
                tracing::warn!(job_id = %log.job_id(), step = name, %err, "step failed, continuing");
                log.emit(format!("[hearth] {name} failed, continuing: {err}"))
                    .await;
                self.0.push(StepOutcome {
                    name,
                    ok: false,
                    error: Some(err.to_string()),
                });
                None
            }
        }
    }

    async fn required<T>(
        &mut self,
        name: &'static str,
        fut: impl Future<Output = Result<T, ActionError>>,
    ) -> Result<T, ActionError> {
        let res = fut.await;
        self.0.push(StepOutcome {
            name,
            ok: res.is_ok(),
            error: res.as_ref().err().map(|e| e.to_string()),
        });
        res
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn parse_rule_ids(server: &ServerRecord) -> Vec<String> {
    server
        .private_str(keys::FORWARD_RULE_IDS)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn default_sftp_username(server_id: Uuid) -> String {
    let id = server_id.simple().to_string();
    format!("srv-{}", &id[..8])
}

#[derive(Clone)]
pub struct ActionPipeline {
    ctx: EngineContext,
}

impl ActionPipeline {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Runs the handler for `job.action`. Never panics and never returns an
    /// error: every failure ends up in the outcome.
    pub async fn execute(&self, job: &Job, server: ServerRecord, log: &JobLog) -> ActionOutcome {
        let mut steps = Steps::default();
        let result = AssertUnwindSafe(self.dispatch(job, server, log, &mut steps))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ActionError::Panicked(panic_message(&*payload))));

        let error = match result {
            Ok(()) => None,
            Err(err) => {
                log.emit(format!("[hearth] {} failed: {err}", job.action))
                    .await;
                Some(err.to_string())
            }
        };
        ActionOutcome {
            success: error.is_none(),
            error,
            logs: log.lines().await,
            steps: steps.0,
        }
    }

    async fn dispatch(
        &self,
        job: &Job,
        server: ServerRecord,
        log: &JobLog,
        steps: &mut Steps,
    ) -> Result<(), ActionError> {
        let game = self.ctx.games.get(&server.game_id).await;
        let Some(game) = game.as_deref() else {
            if job.action == JobAction::Delete {
                return self.delete(server, None, log, steps).await;
            }
            return Err(ActionError::UnknownGame(server.game_id.clone()));
        };

        match job.action {
            JobAction::Provision => self.provision(server, game, log, steps).await,
            JobAction::Start | JobAction::Stop | JobAction::Update => {
                self.game_playbook(&server, Some(game), job.action, log)
                    .await
            }
            JobAction::Backup => self.backup(server, game, log).await,
            JobAction::Deprovision => self.deprovision(server, game, log, steps).await,
            JobAction::Delete => self.delete(server, Some(game), log, steps).await,
            JobAction::InstallMods => self.install_mods(server, game, log).await,
            JobAction::SetupSftp | JobAction::ResetSftpPassword => {
                self.setup_sftp(job.action, server, game, log).await
            }
            JobAction::DisableSftp => self.disable_sftp(server, game, log).await,
        }
    }

    fn vars(&self, server: &ServerRecord, game: &GameDefinition) -> Result<PlaybookVars, ActionError> {
        let config = resolve_config(&game.config_schema, &server.config)?;
        Ok(PlaybookVars::new(
            server,
            game,
            config,
            self.ctx.external_address.as_deref(),
        ))
    }

    async fn run_playbook(
        &self,
        server: &ServerRecord,
        game: &GameDefinition,
        action: JobAction,
        vars: PlaybookVars,
        log: &JobLog,
    ) -> Result<(), ActionError> {
        let playbook = game
            .playbooks
            .for_action(action)
            .ok_or_else(|| ActionError::MissingPlaybook {
                game: game.id.clone(),
                action,
            })?;
        let host = server
            .internal_address
            .clone()
            .ok_or(ActionError::NoAddress)?;
        let req = RunRequest {
            playbook: playbook.to_string(),
            host,
            vars: vars
                .to_json()
                .map_err(|err| ActionError::Execution(format!("encode playbook vars: {err}")))?,
        };
        let outcome = self.ctx.runner.run(&req, log).await?;
        match outcome.failure(playbook) {
            Some(msg) => Err(ActionError::Execution(msg)),
            None => Ok(()),
        }
    }

    /// Resolves config and runs the entry point for `action`. A missing game
    /// definition is an error here rather than up front so teardown can go on.
    async fn game_playbook(
        &self,
        server: &ServerRecord,
        game: Option<&GameDefinition>,
        action: JobAction,
        log: &JobLog,
    ) -> Result<(), ActionError> {
        let game = game.ok_or_else(|| ActionError::UnknownGame(server.game_id.clone()))?;
        let vars = self.vars(server, game)?;
        self.run_playbook(server, game, action, vars, log).await
    }

    async fn provision(
        &self,
        mut server: ServerRecord,
        game: &GameDefinition,
        log: &JobLog,
        steps: &mut Steps,
    ) -> Result<(), ActionError> {
        if server.internal_address.is_none() {
            let vms = self.ctx.vms.as_ref().ok_or(ActionError::NoBackend)?;
            let resources = vms.resources_for(&game.resources);
            let vm = steps
                .required(
                    "create-instance",
                    vms.provision(&game.id, server.id, &server.name, resources, log)
                        .map(|r| r.map_err(ActionError::from)),
                )
                .await?;
            server.instance_id = Some(vm.instance_id);
            server.instance_node = Some(vm.node);
            server.internal_address = Some(vm.ip);
            self.ctx.store.save_server(&server).await?;
        }

        if self.ctx.forwarding.is_some() {
            let created = steps
                .best_effort("forwarding-rules", log, self.forward_ports(&server, log))
                .await;
            if let Some(ids) = created.filter(|ids| !ids.is_empty()) {
                server.set_private(keys::FORWARD_RULE_IDS, ids.join(","));
                if let Err(err) = self.ctx.store.save_server(&server).await {
                    tracing::warn!(server_id = %server.id, %err, "failed to persist forwarding rule ids");
                }
            }
        }

        let vars = self.vars(&server, game)?;
        self.run_playbook(&server, game, JobAction::Provision, vars, log)
            .await
    }

    /// Ensures one rule per allocated port. Per-port failures are logged and
    /// skipped; the ids that did come back are returned.
    async fn forward_ports(&self, server: &ServerRecord, log: &JobLog) -> Result<Vec<String>, ActionError> {
        let Some(fwd) = &self.ctx.forwarding else {
            return Ok(Vec::new());
        };
        let address = server
            .internal_address
            .as_deref()
            .ok_or(ActionError::NoAddress)?;
        let game = self
            .ctx
            .games
            .get(&server.game_id)
            .await
            .ok_or_else(|| ActionError::UnknownGame(server.game_id.clone()))?;

        let mut ids = parse_rule_ids(server);
        let mut failures = Vec::new();
        for def in &game.ports {
            let Some(&port) = server.ports.get(&def.name) else {
                continue;
            };
            let name = rule_name(server.id, &def.name);
            match fwd.ensure(&name, port, address, port, def.protocol).await {
                Ok(id) => {
                    log.emit(format!("[hearth] forwarding {port}/{} -> {address}", def.protocol.as_str()))
                        .await;
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Err(err) => {
                    log.emit(format!("[hearth] forwarding rule {name} failed: {err}"))
                        .await;
                    failures.push(format!("{}: {err}", def.name));
                }
            }
        }
        if !failures.is_empty() && ids.is_empty() {
            return Err(ActionError::Forwarding(failures.join("; ")));
        }
        Ok(ids)
    }

    async fn remove_forwarding(&self, server: &ServerRecord, log: &JobLog) -> Result<(), ActionError> {
        let Some(fwd) = &self.ctx.forwarding else {
            return Ok(());
        };
        let mut report = fwd.remove_by_ids(&parse_rule_ids(server)).await;
        let swept = fwd.remove_by_name_prefix(&rule_prefix(server.id)).await;
        report.removed += swept.removed;
        report.missing += swept.missing;
        for (id, err) in swept.failed {
            if !report.failed.iter().any(|(seen, _)| *seen == id) {
                report.failed.push((id, err));
            }
        }
        log.emit(format!(
            "[hearth] removed {} forwarding rules ({} already gone)",
            report.removed, report.missing
        ))
        .await;
        if report.failed.is_empty() {
            Ok(())
        } else {
            let detail: Vec<String> = report
                .failed
                .iter()
                .map(|(id, err)| format!("{id}: {err}"))
                .collect();
            Err(ActionError::Forwarding(detail.join("; ")))
        }
    }

    async fn destroy_instance(&self, server: &ServerRecord, log: &JobLog) -> Result<(), ActionError> {
        let Some(instance_id) = server.instance_id else {
            return Ok(());
        };
        let vms = self.ctx.vms.as_ref().ok_or(ActionError::NoBackend)?;
        let node = server
            .instance_node
            .clone()
            .unwrap_or_else(|| vms.node().to_string());
        vms.destroy(instance_id, &node, log).await?;
        Ok(())
    }

    async fn backup(&self, server: ServerRecord, game: &GameDefinition, log: &JobLog) -> Result<(), ActionError> {
        let backup_id = format!("{}-{}", server.id, Utc::now().format("%Y%m%dT%H%M%SZ"));
        log.emit(format!("[hearth] backup id {backup_id}")).await;
        let vars = self.vars(&server, game)?.with("backup_id", backup_id);
        self.run_playbook(&server, game, JobAction::Backup, vars, log)
            .await
    }

    async fn deprovision(
        &self,
        mut server: ServerRecord,
        game: &GameDefinition,
        log: &JobLog,
        steps: &mut Steps,
    ) -> Result<(), ActionError> {
        steps
            .best_effort(
                "deprovision-playbook",
                log,
                self.game_playbook(&server, Some(game), JobAction::Deprovision, log),
            )
            .await;
        steps
            .best_effort("forwarding-rules", log, self.remove_forwarding(&server, log))
            .await;
        steps
            .required("destroy-instance", self.destroy_instance(&server, log))
            .await?;

        server.instance_id = None;
        server.instance_node = None;
        server.internal_address = None;
        server.remove_private(keys::FORWARD_RULE_IDS);
        steps
            .required(
                "clear-instance",
                self.ctx.store.save_server(&server).map(|r| r.map_err(ActionError::from)),
            )
            .await
    }

    async fn delete(
        &self,
        server: ServerRecord,
        game: Option<&GameDefinition>,
        log: &JobLog,
        steps: &mut Steps,
    ) -> Result<(), ActionError> {
        let was_running = server.status == ServerStatus::Running;
        let store = &self.ctx.store;

        steps
            .best_effort(
                "mark-deleting",
                log,
                store
                    .update_server_status(server.id, ServerStatus::Deleting)
                    .map(|r| r.map_err(ActionError::from)),
            )
            .await;

        if was_running {
            steps
                .best_effort(
                    "stop",
                    log,
                    self.game_playbook(&server, game, JobAction::Stop, log),
                )
                .await;
        }
        steps
            .best_effort(
                "deprovision-playbook",
                log,
                self.game_playbook(&server, game, JobAction::Deprovision, log),
            )
            .await;
        steps
            .best_effort("forwarding-rules", log, self.remove_forwarding(&server, log))
            .await;
        steps
            .best_effort("destroy-instance", log, self.destroy_instance(&server, log))
            .await;
        steps
            .best_effort(
                "release-ports",
                log,
                self.ctx
                    .ports
                    .release(server.id)
                    .map(|r| r.map_err(ActionError::from)),
            )
            .await;
        steps
            .best_effort(
                "sftp-grant",
                log,
                store
                    .delete_sftp_grant(server.id)
                    .map(|r| r.map_err(ActionError::from)),
            )
            .await;

        steps
            .required(
                "soft-delete",
                store
                    .soft_delete_server(server.id, Utc::now())
                    .map(|r| r.map_err(ActionError::from)),
            )
            .await?;
        log.emit(format!("[hearth] server {} deleted", server.id))
            .await;
        Ok(())
    }

    async fn install_mods(&self, server: ServerRecord, game: &GameDefinition, log: &JobLog) -> Result<(), ActionError> {
        if game.mods.is_none() {
            return Err(ActionError::NoModSupport(game.id.clone()));
        }
        if game.playbooks.for_action(JobAction::InstallMods).is_none() {
            return Err(ActionError::MissingPlaybook {
                game: game.id.clone(),
                action: JobAction::InstallMods,
            });
        }
        if server.mods.is_empty() {
            log.emit("[hearth] no mods configured, nothing to install")
                .await;
            return Ok(());
        }
        let enabled = server.mods.iter().filter(|m| m.enabled).count();
        log.emit(format!(
            "[hearth] installing {} mods ({enabled} enabled)",
            server.mods.len()
        ))
        .await;
        let vars = self.vars(&server, game)?;
        self.run_playbook(&server, game, JobAction::InstallMods, vars, log)
            .await
    }

    async fn setup_sftp(
        &self,
        action: JobAction,
        mut server: ServerRecord,
        game: &GameDefinition,
        log: &JobLog,
    ) -> Result<(), ActionError> {
        let password = server
            .private_str(keys::SFTP_PASSWORD)
            .ok_or(ActionError::MissingSecret)?
            .to_string();
        let existing = self.ctx.store.get_sftp_grant(server.id).await?;

        let username = server
            .private_str(keys::SFTP_USERNAME)
            .map(str::to_string)
            .or_else(|| existing.as_ref().map(|g| g.username.clone()))
            .unwrap_or_else(|| default_sftp_username(server.id));
        let port = match (existing.as_ref(), server.ports.get(SFTP_PORT_NAME)) {
            (_, Some(&port)) => port,
            (Some(grant), None) => grant.port,
            (None, None) => {
                let port = self
                    .ctx
                    .ports
                    .allocate_single(SFTP_POOL, server.id, SFTP_PORT_NAME)
                    .await?;
                server.ports.insert(SFTP_PORT_NAME.to_string(), port);
                self.ctx.store.save_server(&server).await?;
                log.emit(format!("[hearth] allocated sftp port {port}")).await;
                port
            }
        };

        let vars = self
            .vars(&server, game)?
            .with("sftp_username", username.clone())
            .with("sftp_password", password)
            .with("sftp_port", port);
        self.run_playbook(&server, game, action, vars, log).await?;

        server.remove_private(keys::SFTP_PASSWORD);
        self.ctx.store.save_server(&server).await?;
        self.ctx
            .store
            .upsert_sftp_grant(&SftpGrant {
                server_id: server.id,
                username: username.clone(),
                port,
                created_at: existing.map(|g| g.created_at).unwrap_or_else(Utc::now),
            })
            .await?;
        log.emit(format!("[hearth] sftp ready for {username} on port {port}"))
            .await;
        Ok(())
    }

    async fn disable_sftp(&self, server: ServerRecord, game: &GameDefinition, log: &JobLog) -> Result<(), ActionError> {
        let grant = self.ctx.store.get_sftp_grant(server.id).await?;
        let mut vars = self.vars(&server, game)?;
        if let Some(grant) = &grant {
            vars = vars
                .with("sftp_username", grant.username.clone())
                .with("sftp_port", grant.port);
        }
        self.run_playbook(&server, game, JobAction::DisableSftp, vars, log)
            .await?;
        if self.ctx.store.delete_sftp_grant(server.id).await? {
            log.emit("[hearth] sftp access removed").await;
        }
        Ok(())
    }
}
