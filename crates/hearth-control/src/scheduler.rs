//! Job-poll and port-retry loops.
//!
//! The poll loop claims queued jobs up to the concurrency limit and hands each
//! one to its own task; it never waits for a job to finish. The retry loop
//! gives `PendingPorts` servers another allocation attempt and promotes them
//! to `Pending` on success. It never enqueues work on their behalf.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use hearth_core::{Job, JobAction, JobStatus, ServerRecord, ServerStatus};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    actions::ActionPipeline,
    config::SchedulerConfig,
    joblog::JobLog,
    notify::JobNotification,
    ports::PortAllocationError,
    state::EngineContext,
    store::{ServerFilter, StoreError},
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct JobScheduler {
    pipeline: ActionPipeline,
    cfg: SchedulerConfig,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// Decrements the in-flight counter when a job task ends, panics included.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobScheduler {
    pub fn new(ctx: EngineContext, cfg: SchedulerConfig) -> Self {
        Self {
            pipeline: ActionPipeline::new(ctx),
            cfg,
            active: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    fn ctx(&self) -> &EngineContext {
        self.pipeline.context()
    }

    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Starts both loops. Each ticks once immediately.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let polls = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.cfg.job_poll_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = tick.tick() => {
                            if let Err(err) = this.poll_once().await {
                                tracing::warn!(%err, "job poll failed");
                            }
                        }
                    }
                }
                tracing::debug!("job poll loop stopped");
            })
        };
        let retries = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(this.cfg.port_retry_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = tick.tick() => {
                            if let Err(err) = this.retry_pending_ports_once().await {
                                tracing::warn!(%err, "port retry pass failed");
                            }
                        }
                    }
                }
                tracing::debug!("port retry loop stopped");
            })
        };
        vec![polls, retries]
    }

    /// Claims up to the free capacity and launches each job. Returns how many
    /// were launched.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let capacity = self
            .cfg
            .max_concurrent_jobs
            .saturating_sub(self.active_jobs());
        if capacity == 0 {
            return Ok(0);
        }

        let store = &self.ctx().store;
        let queued = store.list_jobs_by_status(JobStatus::Queued, capacity).await?;
        let mut launched = 0;
        for mut job in queued {
            let now = Utc::now();
            if !store.claim_job(job.id, now).await? {
                tracing::debug!(job_id = %job.id, "job already claimed, skipping");
                continue;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(now);

            self.active.fetch_add(1, Ordering::SeqCst);
            let guard = InFlight(self.active.clone());
            let this = self.clone();
            let span = tracing::info_span!(
                "job",
                job_id = %job.id,
                server_id = %job.server_id,
                action = %job.action,
            );
            tokio::spawn(
                async move {
                    let _guard = guard;
                    this.run_job(job).await;
                }
                .instrument(span),
            );
            launched += 1;
        }
        Ok(launched)
    }

    async fn run_job(&self, job: Job) {
        let store = self.ctx().store.clone();
        let log = JobLog::new(job.id, store.clone());

        let mut server = match store.get_server(job.server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => {
                let error = format!("server {} no longer exists", job.server_id);
                self.finish(&job, None, JobStatus::Failed, Some(error)).await;
                return;
            }
            Err(err) => {
                self.finish(&job, None, JobStatus::Failed, Some(err.to_string()))
                    .await;
                return;
            }
        };

        if job.action == JobAction::Provision {
            match store
                .update_server_status(server.id, ServerStatus::Provisioning)
                .await
            {
                Ok(()) => server.status = ServerStatus::Provisioning,
                Err(err) => tracing::warn!(%err, "failed to mark server provisioning"),
            }
        }

        tracing::info!("job started");
        let outcome = self.pipeline.execute(&job, server.clone(), &log).await;
        let status = if outcome.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.finish(&job, Some(&server), status, outcome.error).await;
    }

    async fn finish(
        &self,
        job: &Job,
        server: Option<&ServerRecord>,
        status: JobStatus,
        error: Option<String>,
    ) {
        let store = &self.ctx().store;
        match &error {
            Some(error) => tracing::warn!(%error, "job failed"),
            None => tracing::info!("job completed"),
        }
        if let Err(err) = store
            .finish_job(job.id, status, error.clone(), Utc::now())
            .await
        {
            tracing::error!(%err, "failed to persist job outcome");
        }

        let next = match status {
            JobStatus::Completed => job.action.status_on_success(),
            _ => job.action.status_on_failure(),
        };
        if let (Some(next), Some(server)) = (next, server)
            && let Err(err) = store.update_server_status(server.id, next).await
        {
            tracing::warn!(%err, status = %next, "failed to update server status");
        }

        if let Some(target) = &job.notify {
            let event = JobNotification {
                job_id: job.id,
                server_id: job.server_id,
                server_name: server.map(|s| s.name.clone()).unwrap_or_default(),
                action: job.action,
                outcome: status,
                error,
                channel: target.channel.clone(),
                user: target.user.clone(),
            };
            let notifier = self.ctx().notifier.clone();
            tokio::spawn(async move {
                if let Err(err) = notifier.notify(&event).await {
                    tracing::warn!(job_id = %event.job_id, err = %format!("{err:#}"), "job notification failed");
                }
            });
        }
    }

    /// One allocation attempt for every `PendingPorts` server. Returns how
    /// many were promoted to `Pending`.
    pub async fn retry_pending_ports_once(&self) -> Result<usize, StoreError> {
        let ctx = self.ctx();
        let waiting = ctx
            .store
            .list_servers(&ServerFilter::status(ServerStatus::PendingPorts))
            .await?;

        let mut promoted = 0;
        for mut server in waiting {
            let Some(game) = ctx.games.get(&server.game_id).await else {
                tracing::warn!(server_id = %server.id, game = %server.game_id, "pending server references an unknown game");
                continue;
            };
            let ports = match ctx
                .ports
                .allocate(&game.port_pool, server.id, &game.port_names())
                .await
            {
                Ok(ports) => ports,
                Err(PortAllocationError::Exhausted { pool, required }) => {
                    tracing::debug!(server_id = %server.id, %pool, required, "ports still unavailable");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(server_id = %server.id, %err, "port retry failed");
                    continue;
                }
            };

            server.ports.extend(ports);
            server.status = ServerStatus::Pending;
            if let Err(err) = ctx.store.save_server(&server).await {
                tracing::warn!(server_id = %server.id, %err, "failed to persist retried ports");
                if let Err(err) = ctx.ports.release(server.id).await {
                    tracing::warn!(server_id = %server.id, %err, "failed to release retried ports");
                }
                continue;
            }
            tracing::info!(server_id = %server.id, "ports allocated, server is pending");
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Stops both loops, then waits for in-flight jobs. Returns false if jobs
    /// were still running when `grace` ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let active = self.active_jobs();
            if active == 0 {
                tracing::info!("all jobs drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active, "shutdown grace elapsed with jobs still running");
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use hearth_core::{NotifyTarget, PortAllocation};

    use super::*;
    use crate::ports::PortRange;
    use crate::store::Store;
    use crate::testing::Harness;

    fn config(max: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs: max,
            job_poll_interval: Duration::from_secs(5),
            port_retry_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(60),
        }
    }

    async fn ready_server(h: &Harness, status: ServerStatus) -> ServerRecord {
        let mut server = h.server("valheim", status).await;
        server.internal_address = Some("10.20.0.15".into());
        server.ports.insert("game".into(), 27000);
        server.ports.insert("query".into(), 27001);
        h.store.save_server(&server).await.unwrap();
        server
    }

    async fn enqueue(h: &Harness, server: &ServerRecord, action: JobAction) -> Job {
        let job = Job::queued(server.id, action);
        h.store.insert_job_if_idle(&job).await.unwrap();
        job
    }

    async fn wait_idle(s: &JobScheduler) {
        for _ in 0..100_000 {
            if s.active_jobs() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("jobs never drained");
    }

    async fn job_status(h: &Harness, job: &Job) -> JobStatus {
        h.store.get_job(job.id).await.unwrap().unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn second_job_waits_for_capacity() {
        let h = Harness::new().await;
        let gate = h.runner.gate();
        let a = ready_server(&h, ServerStatus::Stopped).await;
        let b = ready_server(&h, ServerStatus::Stopped).await;
        let first = enqueue(&h, &a, JobAction::Start).await;
        let second = enqueue(&h, &b, JobAction::Start).await;

        let s = JobScheduler::new(h.ctx.clone(), config(1));
        assert_eq!(s.poll_once().await.unwrap(), 1);
        while h.runner.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(job_status(&h, &first).await, JobStatus::Running);
        assert_eq!(job_status(&h, &second).await, JobStatus::Queued);

        assert_eq!(s.poll_once().await.unwrap(), 0);
        assert_eq!(s.active_jobs(), 1);
        assert_eq!(job_status(&h, &second).await, JobStatus::Queued);

        gate.add_permits(1);
        wait_idle(&s).await;
        assert_eq!(job_status(&h, &first).await, JobStatus::Completed);
        assert_eq!(job_status(&h, &second).await, JobStatus::Queued);

        assert_eq!(s.poll_once().await.unwrap(), 1);
        assert!(s.active_jobs() <= 1);
        gate.add_permits(1);
        wait_idle(&s).await;
        assert_eq!(job_status(&h, &second).await, JobStatus::Completed);
        assert_eq!(h.runner.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_jobs_apply_the_status_policy() {
        let h = Harness::new().await;
        let server = ready_server(&h, ServerStatus::Stopped).await;
        let s = JobScheduler::new(h.ctx.clone(), config(3));

        let job = enqueue(&h, &server, JobAction::Start).await;
        s.poll_once().await.unwrap();
        wait_idle(&s).await;
        let done = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.started_at.is_some() && done.completed_at.is_some());
        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Running);

        enqueue(&h, &server, JobAction::Backup).await;
        s.poll_once().await.unwrap();
        wait_idle(&s).await;
        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_mark_the_server_as_error() {
        let h = Harness::new().await;
        h.runner.exit_with("valheim/start.yml", 2);
        let server = ready_server(&h, ServerStatus::Stopped).await;
        let job = enqueue(&h, &server, JobAction::Start).await;

        let s = JobScheduler::new(h.ctx.clone(), config(3));
        s.poll_once().await.unwrap();
        wait_idle(&s).await;

        let done = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(
            done.error.as_deref(),
            Some("playbook valheim/start.yml exited with code 2")
        );
        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn provision_marks_the_server_while_running() {
        let h = Harness::new().await;
        let gate = h.runner.gate();
        let server = ready_server(&h, ServerStatus::Pending).await;
        let job = enqueue(&h, &server, JobAction::Provision).await;

        let s = JobScheduler::new(h.ctx.clone(), config(3));
        s.poll_once().await.unwrap();
        while h.runner.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mid = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(mid.status, ServerStatus::Provisioning);

        gate.add_permits(1);
        wait_idle(&s).await;
        assert_eq!(job_status(&h, &job).await, JobStatus::Completed);
        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_agent_timeout_fails_the_job_and_leaves_the_instance() {
        let h = Harness::new().await;
        let server = h.server("valheim", ServerStatus::Pending).await;
        let job = enqueue(&h, &server, JobAction::Provision).await;

        let s = JobScheduler::new(h.ctx.clone(), config(3));
        s.poll_once().await.unwrap();
        wait_idle(&s).await;

        let done = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        let error = done.error.unwrap();
        assert!(error.contains("guest-agent") && error.contains("timed out"), "{error}");

        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Error);
        assert_eq!(h.virt.power(100), Some(crate::proxmox::PowerState::Running));
        assert!(!h.virt.calls().iter().any(|c| c.starts_with("delete")));
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_for_vanished_servers_fail() {
        let h = Harness::new().await;
        let server = ready_server(&h, ServerStatus::Stopped).await;
        let job = enqueue(&h, &server, JobAction::Start).await;
        h.store.soft_delete_server(server.id, Utc::now()).await.unwrap();

        let s = JobScheduler::new(h.ctx.clone(), config(3));
        s.poll_once().await.unwrap();
        wait_idle(&s).await;
        let done = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("no longer exists"));
        assert!(h.runner.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_sent_and_their_failures_ignored() {
        let h = Harness::new().await;
        h.notifier.fail();
        let server = ready_server(&h, ServerStatus::Stopped).await;
        let job = Job::queued(server.id, JobAction::Start).with_notify(Some(NotifyTarget {
            channel: "ops".into(),
            user: Some("u-42".into()),
        }));
        h.store.insert_job_if_idle(&job).await.unwrap();

        let s = JobScheduler::new(h.ctx.clone(), config(3));
        s.poll_once().await.unwrap();
        wait_idle(&s).await;
        while h.notifier.events().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let event = &h.notifier.events()[0];
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.server_name, "alpha");
        assert_eq!(event.outcome, JobStatus::Completed);
        assert_eq!(event.user.as_deref(), Some("u-42"));
        assert_eq!(job_status(&h, &job).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn port_retry_promotes_without_enqueueing() {
        let mut pools = std::collections::BTreeMap::new();
        pools.insert("game".to_string(), PortRange::new(27000, 27002));
        let h = Harness::with_pools(pools);

        let squatter = uuid::Uuid::new_v4();
        h.store
            .reserve_ports(&[PortAllocation {
                pool: "game".into(),
                port: 27001,
                server_id: squatter,
                purpose: "game".into(),
            }])
            .await
            .unwrap();
        let server = h.server("valheim", ServerStatus::PendingPorts).await;
        let s = JobScheduler::new(h.ctx.clone(), config(3));

        assert_eq!(s.retry_pending_ports_once().await.unwrap(), 0);
        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::PendingPorts);

        h.ctx.ports.release(squatter).await.unwrap();
        assert_eq!(s.retry_pending_ports_once().await.unwrap(), 1);
        let stored = h.store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Pending);
        assert_eq!(stored.ports["game"], 27000);
        assert_eq!(stored.ports["query"], 27001);
        assert!(h.store.active_job_for_server(server.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn loops_tick_immediately_and_shutdown_drains() {
        let h = Harness::new().await;
        let gate = h.runner.gate();
        let server = ready_server(&h, ServerStatus::Stopped).await;
        let job = enqueue(&h, &server, JobAction::Start).await;

        let s = JobScheduler::new(h.ctx.clone(), config(3));
        let handles = s.spawn();
        while h.runner.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!s.shutdown(Duration::from_secs(5)).await);
        assert_eq!(job_status(&h, &job).await, JobStatus::Running);

        gate.add_permits(1);
        assert!(s.shutdown(Duration::from_secs(5)).await);
        assert_eq!(job_status(&h, &job).await, JobStatus::Completed);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
