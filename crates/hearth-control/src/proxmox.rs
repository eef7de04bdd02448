//! Virtualization control API.
//!
//! [`VirtApi`] is what the provisioner drives; [`ProxmoxClient`] speaks the
//! Proxmox VE REST API with an API token.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::config::ProxmoxConfig;

#[derive(Debug, thiserror::Error)]
pub enum VirtError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("virtualization api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("virtualization api request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl VirtError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VirtError::NotFound(_))
    }
}

/// Snapshot of an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub running: bool,
    /// Set once the task stopped; `"OK"` means success.
    pub exit_status: Option<String>,
}

impl TaskStatus {
    pub fn succeeded(&self) -> bool {
        !self.running && self.exit_status.as_deref() == Some("OK")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopped,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct GuestAddress {
    #[serde(rename = "ip-address-type")]
    pub kind: String,
    #[serde(rename = "ip-address")]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct GuestInterface {
    pub name: String,
    #[serde(default, rename = "ip-addresses")]
    pub addresses: Vec<GuestAddress>,
}

/// Instance settings. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmSettings {
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub ci_user: Option<String>,
    pub ci_password: Option<String>,
    pub ssh_public_key: Option<String>,
    pub nameserver: Option<String>,
    pub searchdomain: Option<String>,
    pub cicustom: Option<String>,
    pub net0: Option<String>,
    pub ipconfig0: Option<String>,
    pub agent: Option<bool>,
}

impl VmSettings {
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(v) = self.cores {
            out.push(("cores", v.to_string()));
        }
        if let Some(v) = self.memory_mb {
            out.push(("memory", v.to_string()));
        }
        if let Some(v) = &self.ci_user {
            out.push(("ciuser", v.clone()));
        }
        if let Some(v) = &self.ci_password {
            out.push(("cipassword", v.clone()));
        }
        if let Some(v) = &self.ssh_public_key {
            out.push(("sshkeys", encode_component(v)));
        }
        if let Some(v) = &self.nameserver {
            out.push(("nameserver", v.clone()));
        }
        if let Some(v) = &self.searchdomain {
            out.push(("searchdomain", v.clone()));
        }
        if let Some(v) = &self.cicustom {
            out.push(("cicustom", v.clone()));
        }
        if let Some(v) = &self.net0 {
            out.push(("net0", v.clone()));
        }
        if let Some(v) = &self.ipconfig0 {
            out.push(("ipconfig0", v.clone()));
        }
        if let Some(v) = self.agent {
            out.push(("agent", if v { "1" } else { "0" }.to_string()));
        }
        out
    }
}

/// Proxmox expects `sshkeys` URL-encoded a second time inside the form body,
/// with spaces as `%20`.
fn encode_component(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[async_trait::async_trait]
pub trait VirtApi: Send + Sync {
    async fn next_id(&self) -> Result<u32, VirtError>;
    /// Returns the clone task id.
    async fn clone_vm(
        &self,
        node: &str,
        template: u32,
        new_id: u32,
        name: &str,
        storage: Option<&str>,
    ) -> Result<String, VirtError>;
    async fn task_status(&self, node: &str, task: &str) -> Result<TaskStatus, VirtError>;
    async fn configure(&self, node: &str, vmid: u32, settings: &VmSettings) -> Result<(), VirtError>;
    async fn resize_disk(&self, node: &str, vmid: u32, disk: &str, size_gb: u32) -> Result<(), VirtError>;
    async fn start(&self, node: &str, vmid: u32) -> Result<String, VirtError>;
    async fn stop(&self, node: &str, vmid: u32) -> Result<String, VirtError>;
    async fn delete(&self, node: &str, vmid: u32) -> Result<String, VirtError>;
    async fn vm_status(&self, node: &str, vmid: u32) -> Result<PowerState, VirtError>;
    async fn guest_interfaces(&self, node: &str, vmid: u32) -> Result<Vec<GuestInterface>, VirtError>;
}

#[derive(serde::Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(serde::Deserialize)]
struct RawTaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(serde::Deserialize)]
struct RawVmStatus {
    status: String,
}

#[derive(serde::Deserialize)]
struct RawInterfaces {
    #[serde(default)]
    result: Vec<GuestInterface>,
}

/// Maps a non-2xx response to a typed error.
fn classify(status: StatusCode, body: &str) -> VirtError {
    let lower = body.to_ascii_lowercase();
    if status == StatusCode::NOT_FOUND || lower.contains("does not exist") {
        return VirtError::NotFound(body.trim().to_string());
    }
    VirtError::Api {
        status: status.as_u16(),
        message: body.trim().to_string(),
    }
}

pub struct ProxmoxClient {
    http: reqwest::Client,
    base: String,
    auth: String,
}

impl ProxmoxClient {
    pub fn new(cfg: &ProxmoxConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("hearth-control")
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .context("build proxmox http client")?;
        Ok(Self {
            http,
            base: format!("{}/api2/json", cfg.api_url.trim_end_matches('/')),
            auth: format!("PVEAPIToken={}={}", cfg.token_id, cfg.token_secret),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T, VirtError> {
        let url = format!("{}{path}", self.base);
        let mut req = self
            .http
            .request(method.clone(), url)
            .header("Authorization", &self.auth);
        if !form.is_empty() {
            req = if method == Method::GET || method == Method::DELETE {
                req.query(form)
            } else {
                req.form(form)
            };
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or_default().to_string()
            } else {
                body
            };
            tracing::debug!(%method, path, status = status.as_u16(), "proxmox call failed");
            return Err(classify(status, &body));
        }
        Ok(resp.json::<Envelope<T>>().await?.data)
    }
}

#[async_trait::async_trait]
impl VirtApi for ProxmoxClient {
    async fn next_id(&self) -> Result<u32, VirtError> {
        let raw: serde_json::Value = self.call(Method::GET, "/cluster/nextid", &[]).await?;
        let id = match &raw {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        id.ok_or_else(|| VirtError::Api {
            status: 200,
            message: format!("unexpected nextid payload: {raw}"),
        })
    }

    async fn clone_vm(
        &self,
        node: &str,
        template: u32,
        new_id: u32,
        name: &str,
        storage: Option<&str>,
    ) -> Result<String, VirtError> {
        let mut form = vec![
            ("newid", new_id.to_string()),
            ("name", name.to_string()),
            ("full", "1".to_string()),
        ];
        if let Some(storage) = storage {
            form.push(("storage", storage.to_string()));
        }
        self.call(
            Method::POST,
            &format!("/nodes/{node}/qemu/{template}/clone"),
            &form,
        )
        .await
    }

    async fn task_status(&self, node: &str, task: &str) -> Result<TaskStatus, VirtError> {
        let raw: RawTaskStatus = self
            .call(Method::GET, &format!("/nodes/{node}/tasks/{task}/status"), &[])
            .await?;
        Ok(TaskStatus {
            running: raw.status == "running",
            exit_status: raw.exitstatus,
        })
    }

    async fn configure(&self, node: &str, vmid: u32, settings: &VmSettings) -> Result<(), VirtError> {
        let form = settings.to_params();
        let _: serde_json::Value = self
            .call(Method::POST, &format!("/nodes/{node}/qemu/{vmid}/config"), &form)
            .await?;
        Ok(())
    }

    async fn resize_disk(&self, node: &str, vmid: u32, disk: &str, size_gb: u32) -> Result<(), VirtError> {
        let form = [("disk", disk.to_string()), ("size", format!("{size_gb}G"))];
        let _: serde_json::Value = self
            .call(Method::PUT, &format!("/nodes/{node}/qemu/{vmid}/resize"), &form)
            .await?;
        Ok(())
    }

    async fn start(&self, node: &str, vmid: u32) -> Result<String, VirtError> {
        self.call(
            Method::POST,
            &format!("/nodes/{node}/qemu/{vmid}/status/start"),
            &[],
        )
        .await
    }

    async fn stop(&self, node: &str, vmid: u32) -> Result<String, VirtError> {
        self.call(
            Method::POST,
            &format!("/nodes/{node}/qemu/{vmid}/status/stop"),
            &[],
        )
        .await
    }

    async fn delete(&self, node: &str, vmid: u32) -> Result<String, VirtError> {
        self.call(
            Method::DELETE,
            &format!("/nodes/{node}/qemu/{vmid}"),
            &[("purge", "1".to_string())],
        )
        .await
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> Result<PowerState, VirtError> {
        let raw: RawVmStatus = self
            .call(
                Method::GET,
                &format!("/nodes/{node}/qemu/{vmid}/status/current"),
                &[],
            )
            .await?;
        Ok(match raw.status.as_str() {
            "running" => PowerState::Running,
            "stopped" => PowerState::Stopped,
            _ => PowerState::Other(raw.status),
        })
    }

    async fn guest_interfaces(&self, node: &str, vmid: u32) -> Result<Vec<GuestInterface>, VirtError> {
        let raw: RawInterfaces = self
            .call(
                Method::GET,
                &format!("/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"),
                &[],
            )
            .await?;
        Ok(raw.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_instances_classify_as_not_found() {
        let err = classify(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Configuration file 'nodes/pve1/qemu-server/105.conf' does not exist",
        );
        assert!(err.is_not_found());
        assert!(classify(StatusCode::NOT_FOUND, "").is_not_found());

        let err = classify(StatusCode::FORBIDDEN, "permission denied");
        assert!(matches!(err, VirtError::Api { status: 403, .. }));
    }

    #[test]
    fn guest_agent_payload_parses() {
        let raw = r#"{"data":{"result":[
            {"name":"lo","ip-addresses":[{"ip-address-type":"ipv4","ip-address":"127.0.0.1","prefix":8}]},
            {"name":"eth0","hardware-address":"bc:24:11:00:00:01","ip-addresses":[
                {"ip-address-type":"ipv6","ip-address":"fe80::1","prefix":64},
                {"ip-address-type":"ipv4","ip-address":"10.20.0.15","prefix":24}]},
            {"name":"docker0"}
        ]}}"#;
        let env: Envelope<RawInterfaces> = serde_json::from_str(raw).unwrap();
        let ifaces = env.data.result;
        assert_eq!(ifaces.len(), 3);
        assert_eq!(ifaces[1].addresses[1].address, "10.20.0.15");
        assert!(ifaces[2].addresses.is_empty());
    }

    #[test]
    fn task_status_success_requires_ok_exit() {
        let done = TaskStatus {
            running: false,
            exit_status: Some("OK".into()),
        };
        let failed = TaskStatus {
            running: false,
            exit_status: Some("clone failed: no space left".into()),
        };
        let running = TaskStatus {
            running: true,
            exit_status: None,
        };
        assert!(done.succeeded());
        assert!(!failed.succeeded());
        assert!(!running.succeeded());
    }

    #[test]
    fn settings_only_emit_what_is_set() {
        let s = VmSettings {
            cores: Some(4),
            ssh_public_key: Some("ssh-ed25519 AAAA hearth@ops".into()),
            agent: Some(true),
            ..VmSettings::default()
        };
        let params = s.to_params();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0], ("cores", "4".to_string()));
        assert_eq!(
            params[1],
            ("sshkeys", "ssh-ed25519%20AAAA%20hearth%40ops".to_string())
        );
        assert_eq!(params[2], ("agent", "1".to_string()));
    }

    #[test]
    fn ssh_key_base64_characters_survive_encoding() {
        assert_eq!(
            encode_component("ssh-rsa AB+/c= k"),
            "ssh-rsa%20AB%2B%2Fc%3D%20k"
        );
    }
}
