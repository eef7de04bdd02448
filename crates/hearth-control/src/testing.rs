//! Fakes for every external collaborator, shared by the unit tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use hearth_core::{ConfigValue, ServerRecord, ServerStatus};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::{
    actions::ActionPipeline,
    config::{ProxmoxConfig, VmResources},
    games::{
        FieldSchema, FieldType, GameCatalog, GameDefinition, ModSupport, Playbooks, PortSpec,
        Protocol, ResourceHints,
    },
    gateway::{ForwardRule, ForwardingReconciler, GatewayApi, GatewayError, RuleSummary},
    joblog::JobLog,
    notify::{JobNotification, Notifier},
    ports::{PortAllocator, PortRange},
    provisioner::VmProvisioner,
    proxmox::{GuestAddress, GuestInterface, PowerState, TaskStatus, VirtApi, VirtError, VmSettings},
    runner::{PlaybookRunner, RunError, RunOutcome, RunRequest},
    state::EngineContext,
    store::Store,
    store_memory::MemoryStore,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn proxmox_config() -> ProxmoxConfig {
    ProxmoxConfig {
        api_url: "https://pve.test:8006".into(),
        token_id: "hearth@pve!engine".into(),
        token_secret: "secret".into(),
        accept_invalid_certs: false,
        node: "pve1".into(),
        template_vmid: 9000,
        storage: Some("local-lvm".into()),
        bridge: "vmbr0".into(),
        vlan: Some(30),
        defaults: VmResources::default(),
        ci_user: "hearth".into(),
        ci_password: None,
        ssh_public_key: Some("ssh-ed25519 AAAA ops@hearth".into()),
        nameserver: None,
        searchdomain: None,
        cicustom: None,
        clone_timeout: Duration::from_secs(600),
        start_timeout: Duration::from_secs(120),
        agent_timeout: Duration::from_secs(300),
        poll_interval: Duration::from_secs(2),
    }
}

/// A mod-capable game with every entry point under `<id>/`.
pub fn game(id: &str, ports: &[&str]) -> GameDefinition {
    let pb = |name: &str| Some(format!("{id}/{name}.yml"));
    let mut schema = BTreeMap::new();
    schema.insert(
        "max_players".to_string(),
        FieldSchema {
            kind: FieldType::Integer,
            required: false,
            min: Some(1.0),
            max: Some(64.0),
            default: Some(ConfigValue::Integer(10)),
        },
    );
    GameDefinition {
        id: id.to_string(),
        name: id.to_uppercase(),
        port_pool: "game".into(),
        ports: ports
            .iter()
            .map(|p| PortSpec {
                name: p.to_string(),
                protocol: Protocol::Udp,
            })
            .collect(),
        resources: ResourceHints::default(),
        playbooks: Playbooks {
            provision: pb("provision"),
            start: pb("start"),
            stop: pb("stop"),
            backup: pb("backup"),
            update: pb("update"),
            deprovision: pb("deprovision"),
            install_mods: pb("mods"),
            setup_sftp: pb("sftp"),
            disable_sftp: pb("sftp-disable"),
            reset_sftp_password: pb("sftp"),
        },
        config_schema: schema,
        connection_template: None,
        mods: Some(ModSupport {
            source: "thunderstore".into(),
            install_path: "/opt/game/BepInEx/plugins".into(),
            format: Some("zip".into()),
            framework: Some("bepinex".into()),
        }),
    }
}

#[derive(Default)]
pub struct FakeVirtState {
    issued: u32,
    agent_polls: u32,
    pub vms: BTreeMap<u32, PowerState>,
    pub settings: BTreeMap<u32, Vec<VmSettings>>,
    pub calls: Vec<String>,
    /// Address the guest agent reports once the instance runs. `None` means
    /// it only ever reports loopback.
    pub guest_ip: Option<String>,
    pub agent_ready_after: u32,
    pub clone_exit: Option<String>,
    pub resize_error: Option<String>,
    pub delete_error: Option<String>,
}

#[derive(Default)]
pub struct FakeVirt {
    state: Mutex<FakeVirtState>,
}

impl FakeVirt {
    pub fn set(&self, f: impl FnOnce(&mut FakeVirtState)) {
        f(&mut lock(&self.state));
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn power(&self, vmid: u32) -> Option<PowerState> {
        lock(&self.state).vms.get(&vmid).cloned()
    }

    pub fn settings(&self, vmid: u32) -> Vec<VmSettings> {
        lock(&self.state)
            .settings
            .get(&vmid)
            .cloned()
            .unwrap_or_default()
    }

    fn missing(vmid: u32) -> VirtError {
        VirtError::NotFound(format!(
            "Configuration file 'nodes/pve1/qemu-server/{vmid}.conf' does not exist"
        ))
    }
}

fn api_error(message: &str) -> VirtError {
    VirtError::Api {
        status: 500,
        message: message.to_string(),
    }
}

#[async_trait::async_trait]
impl VirtApi for FakeVirt {
    async fn next_id(&self) -> Result<u32, VirtError> {
        let mut s = lock(&self.state);
        let id = 100 + s.issued;
        s.issued += 1;
        Ok(id)
    }

    async fn clone_vm(
        &self,
        _node: &str,
        _template: u32,
        new_id: u32,
        _name: &str,
        _storage: Option<&str>,
    ) -> Result<String, VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("clone {new_id}"));
        s.vms.insert(new_id, PowerState::Stopped);
        Ok(format!("UPID:clone:{new_id}"))
    }

    async fn task_status(&self, _node: &str, task: &str) -> Result<TaskStatus, VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("task {task}"));
        let exit = match &s.clone_exit {
            Some(exit) if task.starts_with("UPID:clone") => exit.clone(),
            _ => "OK".to_string(),
        };
        Ok(TaskStatus {
            running: false,
            exit_status: Some(exit),
        })
    }

    async fn configure(&self, _node: &str, vmid: u32, settings: &VmSettings) -> Result<(), VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("configure {vmid}"));
        if !s.vms.contains_key(&vmid) {
            return Err(Self::missing(vmid));
        }
        s.settings.entry(vmid).or_default().push(settings.clone());
        Ok(())
    }

    async fn resize_disk(&self, _node: &str, vmid: u32, _disk: &str, _size_gb: u32) -> Result<(), VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("resize {vmid}"));
        match &s.resize_error {
            Some(msg) => Err(api_error(msg)),
            None => Ok(()),
        }
    }

    async fn start(&self, _node: &str, vmid: u32) -> Result<String, VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("start {vmid}"));
        match s.vms.get_mut(&vmid) {
            Some(power) => {
                *power = PowerState::Running;
                Ok(format!("UPID:start:{vmid}"))
            }
            None => Err(Self::missing(vmid)),
        }
    }

    async fn stop(&self, _node: &str, vmid: u32) -> Result<String, VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("stop {vmid}"));
        match s.vms.get_mut(&vmid) {
            Some(power) => {
                *power = PowerState::Stopped;
                Ok(format!("UPID:stop:{vmid}"))
            }
            None => Err(Self::missing(vmid)),
        }
    }

    async fn delete(&self, _node: &str, vmid: u32) -> Result<String, VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("delete {vmid}"));
        if let Some(msg) = &s.delete_error {
            return Err(api_error(msg));
        }
        match s.vms.remove(&vmid) {
            Some(_) => Ok(format!("UPID:delete:{vmid}")),
            None => Err(Self::missing(vmid)),
        }
    }

    async fn vm_status(&self, _node: &str, vmid: u32) -> Result<PowerState, VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("status {vmid}"));
        s.vms.get(&vmid).cloned().ok_or_else(|| Self::missing(vmid))
    }

    async fn guest_interfaces(&self, _node: &str, vmid: u32) -> Result<Vec<GuestInterface>, VirtError> {
        let mut s = lock(&self.state);
        s.calls.push(format!("agent {vmid}"));
        match s.vms.get(&vmid) {
            None => return Err(Self::missing(vmid)),
            Some(PowerState::Running) => {}
            Some(_) => return Err(api_error("VM is not running")),
        }
        s.agent_polls += 1;
        if s.agent_polls <= s.agent_ready_after {
            return Err(api_error("QEMU guest agent is not running"));
        }
        let mut out = vec![GuestInterface {
            name: "lo".into(),
            addresses: vec![GuestAddress {
                kind: "ipv4".into(),
                address: "127.0.0.1".into(),
            }],
        }];
        if let Some(ip) = &s.guest_ip {
            out.push(GuestInterface {
                name: "eth0".into(),
                addresses: vec![GuestAddress {
                    kind: "ipv4".into(),
                    address: ip.clone(),
                }],
            });
        }
        Ok(out)
    }
}

#[derive(Default)]
struct GatewayState {
    rules: Vec<(String, ForwardRule)>,
    issued: u32,
    fail_creates: bool,
    fail_apply: bool,
    fail_delete: BTreeSet<String>,
    applies: usize,
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn rules(&self) -> Vec<ForwardRule> {
        lock(&self.state)
            .rules
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn fail_creates(&self) {
        lock(&self.state).fail_creates = true;
    }

    pub fn fail_apply(&self, fail: bool) {
        lock(&self.state).fail_apply = fail;
    }

    pub fn fail_delete(&self, id: &str) {
        lock(&self.state).fail_delete.insert(id.to_string());
    }

    pub fn applies(&self) -> usize {
        lock(&self.state).applies
    }
}

#[async_trait::async_trait]
impl GatewayApi for FakeGateway {
    async fn list_rules(&self) -> Result<Vec<RuleSummary>, GatewayError> {
        Ok(lock(&self.state)
            .rules
            .iter()
            .map(|(id, r)| RuleSummary {
                id: id.clone(),
                name: r.name.clone(),
            })
            .collect())
    }

    async fn create_rule(&self, rule: &ForwardRule) -> Result<String, GatewayError> {
        let mut s = lock(&self.state);
        if s.fail_creates {
            return Err(GatewayError::Rejected("interface is disabled".into()));
        }
        s.issued += 1;
        let id = format!("rule-{}", s.issued);
        s.rules.push((id.clone(), rule.clone()));
        Ok(id)
    }

    async fn delete_rule(&self, id: &str) -> Result<(), GatewayError> {
        let mut s = lock(&self.state);
        if s.fail_delete.contains(id) {
            return Err(GatewayError::Rejected(format!("rule {id} is locked")));
        }
        let before = s.rules.len();
        s.rules.retain(|(rid, _)| rid != id);
        if s.rules.len() == before {
            return Err(GatewayError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn apply(&self) -> Result<(), GatewayError> {
        let mut s = lock(&self.state);
        if s.fail_apply {
            return Err(GatewayError::Rejected("apply busy".into()));
        }
        s.applies += 1;
        Ok(())
    }
}

#[derive(Default)]
struct RunnerState {
    requests: Vec<RunRequest>,
    jobs: Vec<Uuid>,
    exits: HashMap<String, i32>,
    panic_on: Option<String>,
    gate: Option<Arc<Semaphore>>,
}

/// Succeeds unless told otherwise. With a gate installed, each run blocks
/// until the test hands out a permit.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<RunnerState>,
}

impl FakeRunner {
    pub fn requests(&self) -> Vec<RunRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn last_job(&self) -> Option<Uuid> {
        lock(&self.state).jobs.last().copied()
    }

    pub fn exit_with(&self, playbook: &str, code: i32) {
        lock(&self.state).exits.insert(playbook.to_string(), code);
    }

    pub fn panic_on(&self, playbook: &str) {
        lock(&self.state).panic_on = Some(playbook.to_string());
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        lock(&self.state).gate = Some(gate.clone());
        gate
    }
}

#[async_trait::async_trait]
impl PlaybookRunner for FakeRunner {
    async fn run(&self, req: &RunRequest, log: &JobLog) -> Result<RunOutcome, RunError> {
        let gate = lock(&self.state).gate.clone();
        if gate.is_some() {
            log.emit("[stdout] waiting at gate").await;
        }
        {
            let mut s = lock(&self.state);
            s.requests.push(req.clone());
            s.jobs.push(log.job_id());
        }
        if let Some(gate) = gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }

        let (explode, code) = {
            let s = lock(&self.state);
            (
                s.panic_on.as_deref() == Some(req.playbook.as_str()),
                s.exits.get(&req.playbook).copied().unwrap_or(0),
            )
        };
        if explode {
            panic!("runner exploded on {}", req.playbook);
        }
        log.emit(format!("[stdout] ran {}", req.playbook)).await;
        Ok(RunOutcome {
            success: code == 0,
            exit_code: Some(code),
            timed_out: false,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<JobNotification>>,
    fail: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<JobNotification> {
        lock(&self.events).clone()
    }

    pub fn fail(&self) {
        *lock(&self.fail) = true;
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &JobNotification) -> anyhow::Result<()> {
        lock(&self.events).push(event.clone());
        if *lock(&self.fail) {
            anyhow::bail!("chat webhook unreachable");
        }
        Ok(())
    }
}

pub fn test_pools() -> BTreeMap<String, PortRange> {
    let mut pools = BTreeMap::new();
    pools.insert("game".to_string(), PortRange::new(27000, 27499));
    pools.insert("sftp".to_string(), PortRange::new(2200, 2299));
    pools
}

/// An engine wired to fakes, with a `valheim` game (ports `game`, `query`).
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub virt: Arc<FakeVirt>,
    pub gateway: Arc<FakeGateway>,
    pub runner: Arc<FakeRunner>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: EngineContext,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(true, test_pools())
    }

    pub async fn without_backends() -> Self {
        Self::build(false, test_pools())
    }

    pub fn with_pools(pools: BTreeMap<String, PortRange>) -> Self {
        Self::build(true, pools)
    }

    fn build(backends: bool, pools: BTreeMap<String, PortRange>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let virt = Arc::new(FakeVirt::default());
        let gateway = Arc::new(FakeGateway::default());
        let runner = Arc::new(FakeRunner::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let dyn_store: Arc<dyn Store> = store.clone();

        let ctx = EngineContext {
            store: dyn_store.clone(),
            games: GameCatalog::from_definitions([game("valheim", &["game", "query"])]),
            ports: PortAllocator::new(dyn_store, pools),
            vms: backends.then(|| VmProvisioner::new(virt.clone(), proxmox_config())),
            forwarding: backends.then(|| ForwardingReconciler::new(gateway.clone(), "wan")),
            runner: runner.clone(),
            notifier: notifier.clone(),
            external_address: Some("play.example.net".into()),
        };
        Self {
            store,
            virt,
            gateway,
            runner,
            notifier,
            ctx,
        }
    }

    pub fn pipeline(&self) -> ActionPipeline {
        ActionPipeline::new(self.ctx.clone())
    }

    pub async fn add_game(&self, def: GameDefinition) {
        self.ctx.games.insert(def).await;
    }

    pub async fn server(&self, game_id: &str, status: ServerStatus) -> ServerRecord {
        let mut server = ServerRecord::new(game_id, "alpha", "owner-1");
        server.status = status;
        self.store
            .insert_server(&server)
            .await
            .expect("insert test server");
        server
    }
}
