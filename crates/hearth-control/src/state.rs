use std::sync::Arc;

use anyhow::Context;

use crate::{
    config::EngineConfig,
    games::GameCatalog,
    gateway::{ForwardingReconciler, OpnsenseClient},
    notify::{NoopNotifier, Notifier, WebhookNotifier},
    ports::PortAllocator,
    provisioner::VmProvisioner,
    proxmox::ProxmoxClient,
    runner::{AnsibleRunner, PlaybookRunner},
    store::Store,
};

/// Everything a job needs, built once at startup and shared by clone.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub games: GameCatalog,
    pub ports: PortAllocator,
    /// `None` when no virtualization backend is configured.
    pub vms: Option<VmProvisioner>,
    /// `None` when no gateway is configured.
    pub forwarding: Option<ForwardingReconciler>,
    pub runner: Arc<dyn PlaybookRunner>,
    pub notifier: Arc<dyn Notifier>,
    pub external_address: Option<String>,
}

impl EngineContext {
    pub fn from_config(
        cfg: &EngineConfig,
        store: Arc<dyn Store>,
        games: GameCatalog,
    ) -> anyhow::Result<Self> {
        let vms = match &cfg.proxmox {
            Some(pve) => {
                let client = ProxmoxClient::new(pve).context("proxmox client")?;
                tracing::info!(api = %pve.api_url, node = %pve.node, "virtualization backend enabled");
                Some(VmProvisioner::new(Arc::new(client), pve.clone()))
            }
            None => None,
        };
        let forwarding = match &cfg.gateway {
            Some(gw) => {
                let client = OpnsenseClient::new(gw).context("gateway client")?;
                tracing::info!(api = %gw.api_url, interface = %gw.interface, "gateway forwarding enabled");
                Some(ForwardingReconciler::new(Arc::new(client), gw.interface.clone()))
            }
            None => None,
        };
        let notifier: Arc<dyn Notifier> = match &cfg.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
            None => Arc::new(NoopNotifier),
        };

        Ok(Self {
            ports: PortAllocator::new(store.clone(), cfg.pools.clone()),
            store,
            games,
            vms,
            forwarding,
            runner: Arc::new(AnsibleRunner::new(cfg.runner.clone())),
            notifier,
            external_address: cfg.external_address.clone(),
        })
    }
}
