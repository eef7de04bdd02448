//! VM provisioning: clone, configure, start, then wait for the guest agent to
//! report an address.
//!
//! Every wait is a fixed-interval poll with its own bound. A failure at any
//! step aborts; nothing already created is rolled back, so a timed-out clone
//! can leave an instance behind that no record points at.

use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::{
    config::{ProxmoxConfig, VmResources},
    games::ResourceHints,
    joblog::JobLog,
    proxmox::{GuestInterface, PowerState, VirtApi, VirtError, VmSettings},
};

const BOOT_DISK: &str = "scsi0";
const DESTROY_STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    AllocateId,
    Clone,
    Configure,
    CloudInit,
    Start,
    GuestAgent,
    Stop,
    Delete,
}

impl ProvisionStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionStep::AllocateId => "allocate-id",
            ProvisionStep::Clone => "clone",
            ProvisionStep::Configure => "configure",
            ProvisionStep::CloudInit => "cloud-init",
            ProvisionStep::Start => "start",
            ProvisionStep::GuestAgent => "guest-agent",
            ProvisionStep::Stop => "stop",
            ProvisionStep::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("provisioning step {step} failed: {message}")]
pub struct ProvisioningError {
    pub step: ProvisionStep,
    pub message: String,
    /// Instance that was created before the failure, if any.
    pub instance_id: Option<u32>,
}

impl ProvisioningError {
    fn new(step: ProvisionStep, instance_id: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            instance_id,
        }
    }

    fn api(step: ProvisionStep, instance_id: Option<u32>, err: VirtError) -> Self {
        Self::new(step, instance_id, err.to_string())
    }

    fn timeout(step: ProvisionStep, instance_id: Option<u32>, bound: Duration) -> Self {
        Self::new(
            step,
            instance_id,
            format!("timed out after {}s", bound.as_secs()),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.message.contains("timed out")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVm {
    pub instance_id: u32,
    pub node: String,
    pub ip: String,
}

/// First non-loopback, non-link-local IPv4 address.
pub fn first_ipv4(ifaces: &[GuestInterface]) -> Option<String> {
    ifaces
        .iter()
        .filter(|i| i.name != "lo")
        .flat_map(|i| i.addresses.iter())
        .filter(|a| a.kind.eq_ignore_ascii_case("ipv4"))
        .map(|a| a.address.as_str())
        .find(|addr| {
            addr.parse::<std::net::Ipv4Addr>()
                .is_ok_and(|ip| !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified())
        })
        .map(str::to_string)
}

fn vm_name(game_id: &str, label: &str) -> String {
    let raw = format!("{game_id}-{label}").to_ascii_lowercase();
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while name.contains("--") {
        name = name.replace("--", "-");
    }
    let name = name.trim_matches('-');
    let name: String = name.chars().take(63).collect();
    let name = name.trim_end_matches('-');
    if name.is_empty() {
        "hearth-server".to_string()
    } else {
        name.to_string()
    }
}

#[derive(Clone)]
pub struct VmProvisioner {
    api: Arc<dyn VirtApi>,
    cfg: ProxmoxConfig,
}

impl VmProvisioner {
    pub fn new(api: Arc<dyn VirtApi>, cfg: ProxmoxConfig) -> Self {
        Self { api, cfg }
    }

    pub fn node(&self) -> &str {
        &self.cfg.node
    }

    /// Game hints win; anything unset falls back to the process defaults.
    pub fn resources_for(&self, hints: &ResourceHints) -> VmResources {
        let d = self.cfg.defaults;
        VmResources {
            cores: hints.cores.unwrap_or(d.cores),
            memory_mb: hints.memory_mb.unwrap_or(d.memory_mb),
            disk_gb: hints.disk_gb.unwrap_or(d.disk_gb),
        }
    }

    pub async fn provision(
        &self,
        game_id: &str,
        server_id: Uuid,
        label: &str,
        resources: VmResources,
        log: &JobLog,
    ) -> Result<ProvisionedVm, ProvisioningError> {
        let node = self.cfg.node.clone();
        let name = vm_name(game_id, label);

        let vmid = self
            .api
            .next_id()
            .await
            .map_err(|e| ProvisioningError::api(ProvisionStep::AllocateId, None, e))?;
        let id = Some(vmid);
        tracing::info!(%server_id, game_id, vmid, node = %node, "provisioning instance");
        log.emit(format!(
            "[hearth] cloning template {} to {vmid} ({name}) on {node}",
            self.cfg.template_vmid
        ))
        .await;

        let task = self
            .api
            .clone_vm(
                &node,
                self.cfg.template_vmid,
                vmid,
                &name,
                self.cfg.storage.as_deref(),
            )
            .await
            .map_err(|e| ProvisioningError::api(ProvisionStep::Clone, id, e))?;
        self.wait_task(ProvisionStep::Clone, &node, &task, vmid, self.cfg.clone_timeout)
            .await?;

        log.emit(format!(
            "[hearth] configuring {vmid}: {} cores, {} MiB",
            resources.cores, resources.memory_mb
        ))
        .await;
        let hardware = VmSettings {
            cores: Some(resources.cores),
            memory_mb: Some(resources.memory_mb),
            agent: Some(true),
            ..VmSettings::default()
        };
        self.api
            .configure(&node, vmid, &hardware)
            .await
            .map_err(|e| ProvisioningError::api(ProvisionStep::Configure, id, e))?;

        // A template that is already large enough rejects the resize.
        if let Err(err) = self
            .api
            .resize_disk(&node, vmid, BOOT_DISK, resources.disk_gb)
            .await
        {
            tracing::warn!(vmid, %err, "disk resize skipped");
            log.emit(format!("[hearth] disk resize skipped: {err}")).await;
        }

        let mut net0 = format!("virtio,bridge={}", self.cfg.bridge);
        if let Some(tag) = self.cfg.vlan {
            net0.push_str(&format!(",tag={tag}"));
        }
        let first_boot = VmSettings {
            ci_user: Some(self.cfg.ci_user.clone()),
            ci_password: self.cfg.ci_password.clone(),
            ssh_public_key: self.cfg.ssh_public_key.clone(),
            nameserver: self.cfg.nameserver.clone(),
            searchdomain: self.cfg.searchdomain.clone(),
            cicustom: self.cfg.cicustom.clone(),
            net0: Some(net0),
            ipconfig0: Some("ip=dhcp".to_string()),
            ..VmSettings::default()
        };
        self.api
            .configure(&node, vmid, &first_boot)
            .await
            .map_err(|e| ProvisioningError::api(ProvisionStep::CloudInit, id, e))?;

        log.emit(format!("[hearth] starting {vmid}")).await;
        let task = self
            .api
            .start(&node, vmid)
            .await
            .map_err(|e| ProvisioningError::api(ProvisionStep::Start, id, e))?;
        self.wait_task(ProvisionStep::Start, &node, &task, vmid, self.cfg.start_timeout)
            .await?;

        log.emit("[hearth] waiting for guest agent to report an address")
            .await;
        let ip = self.wait_for_ip(&node, vmid).await?;
        log.emit(format!("[hearth] instance {vmid} is up at {ip}"))
            .await;
        tracing::info!(%server_id, vmid, ip = %ip, "instance ready");

        Ok(ProvisionedVm {
            instance_id: vmid,
            node,
            ip,
        })
    }

    async fn wait_task(
        &self,
        step: ProvisionStep,
        node: &str,
        task: &str,
        vmid: u32,
        bound: Duration,
    ) -> Result<(), ProvisioningError> {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            let status = self
                .api
                .task_status(node, task)
                .await
                .map_err(|e| ProvisioningError::api(step, Some(vmid), e))?;
            if !status.running {
                if status.succeeded() {
                    return Ok(());
                }
                return Err(ProvisioningError::new(
                    step,
                    Some(vmid),
                    format!(
                        "task ended with {}",
                        status.exit_status.as_deref().unwrap_or("unknown status")
                    ),
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisioningError::timeout(step, Some(vmid), bound));
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    async fn wait_for_ip(&self, node: &str, vmid: u32) -> Result<String, ProvisioningError> {
        let bound = self.cfg.agent_timeout;
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            // The agent answers with errors until it has booted.
            match self.api.guest_interfaces(node, vmid).await {
                Ok(ifaces) => {
                    if let Some(ip) = first_ipv4(&ifaces) {
                        return Ok(ip);
                    }
                }
                Err(err) => tracing::debug!(vmid, %err, "guest agent not ready"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisioningError::timeout(
                    ProvisionStep::GuestAgent,
                    Some(vmid),
                    bound,
                ));
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    /// Stops the instance if it is running, then deletes it. An instance that
    /// is already gone counts as destroyed.
    pub async fn destroy(&self, instance_id: u32, node: &str, log: &JobLog) -> Result<(), ProvisioningError> {
        let id = Some(instance_id);
        match self.api.vm_status(node, instance_id).await {
            Ok(PowerState::Running) => {
                log.emit(format!("[hearth] stopping instance {instance_id}"))
                    .await;
                match self.api.stop(node, instance_id).await {
                    Ok(_) => self.wait_stopped(node, instance_id).await,
                    Err(err) => {
                        tracing::warn!(vmid = instance_id, %err, "stop request failed");
                    }
                }
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                log.emit(format!("[hearth] instance {instance_id} already gone"))
                    .await;
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(vmid = instance_id, %err, "status check failed, deleting anyway");
            }
        }

        log.emit(format!("[hearth] deleting instance {instance_id}"))
            .await;
        let task = match self.api.delete(node, instance_id).await {
            Ok(task) => task,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(ProvisioningError::api(ProvisionStep::Delete, id, err)),
        };
        self.wait_task(
            ProvisionStep::Delete,
            node,
            &task,
            instance_id,
            self.cfg.clone_timeout,
        )
        .await?;
        tracing::info!(vmid = instance_id, node, "instance destroyed");
        Ok(())
    }

    async fn wait_stopped(&self, node: &str, vmid: u32) {
        let deadline = tokio::time::Instant::now() + DESTROY_STOP_TIMEOUT;
        loop {
            match self.api.vm_status(node, vmid).await {
                Ok(PowerState::Running) => {}
                Ok(_) | Err(_) => return,
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(vmid, "instance still running after stop, deleting anyway");
                return;
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }
}
