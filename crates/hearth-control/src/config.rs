use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::ports::PortRange;

const DEFAULT_POOLS: &str = "game=27000-27499,sftp=2200-2299";

/// Everything the engine reads from its environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub http_addr: SocketAddr,
    pub games_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub pools: BTreeMap<String, PortRange>,
    pub runner: RunnerConfig,
    /// Public address handed to playbooks and connection templates.
    pub external_address: Option<String>,
    pub proxmox: Option<ProxmoxConfig>,
    pub gateway: Option<GatewayConfig>,
    pub notify_webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub job_poll_interval: Duration,
    pub port_retry_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            job_poll_interval: Duration::from_secs(5),
            port_retry_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub ansible_bin: String,
    pub playbook_dir: PathBuf,
    pub remote_user: Option<String>,
    pub private_key: Option<PathBuf>,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ansible_bin: "ansible-playbook".to_string(),
            playbook_dir: PathBuf::from("playbooks"),
            remote_user: None,
            private_key: None,
            timeout: Duration::from_secs(30 * 60),
            kill_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    pub api_url: String,
    pub token_id: String,
    pub token_secret: String,
    pub accept_invalid_certs: bool,
    pub node: String,
    pub template_vmid: u32,
    pub storage: Option<String>,
    pub bridge: String,
    pub vlan: Option<u16>,
    pub defaults: VmResources,
    pub ci_user: String,
    pub ci_password: Option<String>,
    pub ssh_public_key: Option<String>,
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    pub cicustom: Option<String>,
    pub clone_timeout: Duration,
    pub start_timeout: Duration,
    pub agent_timeout: Duration,
    pub poll_interval: Duration,
}

/// Per-instance hardware sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmResources {
    pub cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            cores: 2,
            memory_mb: 4096,
            disk_gb: 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub accept_invalid_certs: bool,
    pub interface: String,
}

fn truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str) -> anyhow::Result<Option<u64>> {
        self.string(name)
            .map(|v| v.parse::<u64>().with_context(|| format!("{name}: not an integer: {v}")))
            .transpose()
    }

    fn secs(&self, name: &str, default: Duration, min: u64, max: u64) -> anyhow::Result<Duration> {
        Ok(self
            .u64(name)?
            .map(|v| Duration::from_secs(v.clamp(min, max)))
            .unwrap_or(default))
    }

    fn millis(&self, name: &str, default: Duration, min: u64, max: u64) -> anyhow::Result<Duration> {
        Ok(self
            .u64(name)?
            .map(|v| Duration::from_millis(v.clamp(min, max)))
            .unwrap_or(default))
    }

    fn flag(&self, name: &str) -> bool {
        self.string(name).is_some_and(|v| truthy(&v))
    }

    fn required(&self, name: &str) -> anyhow::Result<String> {
        self.string(name)
            .ok_or_else(|| anyhow::anyhow!("{name} is required"))
    }
}

/// Parses `name=lo-hi[,name=lo-hi...]`.
pub fn parse_pools(raw: &str) -> anyhow::Result<BTreeMap<String, PortRange>> {
    let mut out = BTreeMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, range) = part
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid pool entry (want name=lo-hi): {part}"))?;
        let (lo, hi) = range
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("invalid pool range (want lo-hi): {range}"))?;
        let lo: u16 = lo.trim().parse().with_context(|| format!("pool {name}: bad start"))?;
        let hi: u16 = hi.trim().parse().with_context(|| format!("pool {name}: bad end"))?;
        if lo == 0 || lo > hi {
            anyhow::bail!("pool {name}: empty or invalid range {lo}-{hi}");
        }
        out.insert(name.trim().to_string(), PortRange::new(lo, hi));
    }
    if out.is_empty() {
        anyhow::bail!("no port pools configured");
    }
    Ok(out)
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env { lookup };

        let http_addr = env
            .string("HEARTH_HTTP_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("HEARTH_HTTP_ADDR")?;

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            max_concurrent_jobs: env
                .u64("HEARTH_MAX_CONCURRENT_JOBS")?
                .map(|v| v.clamp(1, 256) as usize)
                .unwrap_or(defaults.max_concurrent_jobs),
            job_poll_interval: env.millis(
                "HEARTH_JOB_POLL_MS",
                defaults.job_poll_interval,
                100,
                10 * 60 * 1000,
            )?,
            port_retry_interval: env.millis(
                "HEARTH_PORT_RETRY_MS",
                defaults.port_retry_interval,
                1000,
                60 * 60 * 1000,
            )?,
            shutdown_grace: env.secs(
                "HEARTH_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace,
                1,
                24 * 60 * 60,
            )?,
        };

        let pools = parse_pools(
            &env.string("HEARTH_PORT_POOLS")
                .unwrap_or_else(|| DEFAULT_POOLS.to_string()),
        )?;

        let runner_defaults = RunnerConfig::default();
        let runner = RunnerConfig {
            ansible_bin: env
                .string("HEARTH_ANSIBLE_BIN")
                .unwrap_or(runner_defaults.ansible_bin),
            playbook_dir: env
                .string("HEARTH_PLAYBOOK_DIR")
                .map(PathBuf::from)
                .unwrap_or(runner_defaults.playbook_dir),
            remote_user: env.string("HEARTH_ANSIBLE_USER"),
            private_key: env.string("HEARTH_ANSIBLE_PRIVATE_KEY").map(PathBuf::from),
            timeout: env.secs(
                "HEARTH_ANSIBLE_TIMEOUT_SECS",
                runner_defaults.timeout,
                10,
                6 * 60 * 60,
            )?,
            kill_grace: env.secs(
                "HEARTH_ANSIBLE_KILL_GRACE_SECS",
                runner_defaults.kill_grace,
                1,
                120,
            )?,
        };

        let proxmox = match env.string("HEARTH_PVE_URL") {
            None => None,
            Some(api_url) => {
                let defaults = VmResources::default();
                Some(ProxmoxConfig {
                    api_url,
                    token_id: env.required("HEARTH_PVE_TOKEN_ID")?,
                    token_secret: env.required("HEARTH_PVE_TOKEN_SECRET")?,
                    accept_invalid_certs: env.flag("HEARTH_PVE_INSECURE_TLS"),
                    node: env.required("HEARTH_PVE_NODE")?,
                    template_vmid: env
                        .required("HEARTH_PVE_TEMPLATE_VMID")?
                        .parse()
                        .context("HEARTH_PVE_TEMPLATE_VMID")?,
                    storage: env.string("HEARTH_PVE_STORAGE"),
                    bridge: env
                        .string("HEARTH_PVE_BRIDGE")
                        .unwrap_or_else(|| "vmbr0".to_string()),
                    vlan: env
                        .string("HEARTH_PVE_VLAN")
                        .map(|v| v.parse::<u16>())
                        .transpose()
                        .context("HEARTH_PVE_VLAN")?,
                    defaults: VmResources {
                        cores: env
                            .u64("HEARTH_PVE_CORES")?
                            .map(|v| v.clamp(1, 128) as u32)
                            .unwrap_or(defaults.cores),
                        memory_mb: env
                            .u64("HEARTH_PVE_MEMORY_MB")?
                            .map(|v| v.clamp(512, 1024 * 1024) as u32)
                            .unwrap_or(defaults.memory_mb),
                        disk_gb: env
                            .u64("HEARTH_PVE_DISK_GB")?
                            .map(|v| v.clamp(4, 64 * 1024) as u32)
                            .unwrap_or(defaults.disk_gb),
                    },
                    ci_user: env
                        .string("HEARTH_PVE_CI_USER")
                        .unwrap_or_else(|| "hearth".to_string()),
                    ci_password: env.string("HEARTH_PVE_CI_PASSWORD"),
                    ssh_public_key: env.string("HEARTH_PVE_SSH_PUBLIC_KEY"),
                    nameserver: env.string("HEARTH_PVE_NAMESERVER"),
                    searchdomain: env.string("HEARTH_PVE_SEARCHDOMAIN"),
                    cicustom: env.string("HEARTH_PVE_CICUSTOM"),
                    clone_timeout: env.secs(
                        "HEARTH_PVE_CLONE_TIMEOUT_SECS",
                        Duration::from_secs(600),
                        10,
                        6 * 60 * 60,
                    )?,
                    start_timeout: env.secs(
                        "HEARTH_PVE_START_TIMEOUT_SECS",
                        Duration::from_secs(120),
                        5,
                        60 * 60,
                    )?,
                    agent_timeout: env.secs(
                        "HEARTH_PVE_AGENT_TIMEOUT_SECS",
                        Duration::from_secs(300),
                        5,
                        60 * 60,
                    )?,
                    poll_interval: env.millis(
                        "HEARTH_PVE_POLL_MS",
                        Duration::from_secs(2),
                        100,
                        60_000,
                    )?,
                })
            }
        };

        let gateway = match env.string("HEARTH_GATEWAY_URL") {
            None => None,
            Some(api_url) => Some(GatewayConfig {
                api_url,
                api_key: env.required("HEARTH_GATEWAY_KEY")?,
                api_secret: env.required("HEARTH_GATEWAY_SECRET")?,
                accept_invalid_certs: env.flag("HEARTH_GATEWAY_INSECURE_TLS"),
                interface: env
                    .string("HEARTH_GATEWAY_INTERFACE")
                    .unwrap_or_else(|| "wan".to_string()),
            }),
        };

        Ok(Self {
            database_url: env.string("DATABASE_URL"),
            http_addr,
            games_dir: env
                .string("HEARTH_GAMES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("games")),
            scheduler,
            pools,
            runner,
            external_address: env.string("HEARTH_EXTERNAL_ADDRESS"),
            proxmox,
            gateway,
            notify_webhook_url: env.string("HEARTH_NOTIFY_WEBHOOK_URL"),
        })
    }
}
