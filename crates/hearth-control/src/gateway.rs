//! Port forwarding on the network gateway.
//!
//! Rules are keyed by name so that `ensure` can be repeated safely. Callers
//! treat every failure here as a warning.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use uuid::Uuid;

use crate::{config::GatewayConfig, games::Protocol};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub name: String,
    pub interface: String,
    pub protocol: Protocol,
    pub external_port: u16,
    pub target: String,
    pub target_port: u16,
}

#[async_trait::async_trait]
pub trait GatewayApi: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<RuleSummary>, GatewayError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<RuleSummary>, GatewayError> {
        Ok(self.list_rules().await?.into_iter().find(|r| r.name == name))
    }

    /// Returns the new rule's id.
    async fn create_rule(&self, rule: &ForwardRule) -> Result<String, GatewayError>;
    async fn delete_rule(&self, id: &str) -> Result<(), GatewayError>;
    /// Activates pending changes.
    async fn apply(&self) -> Result<(), GatewayError>;
}

pub fn rule_prefix(server_id: Uuid) -> String {
    format!("hearth-{server_id}-")
}

pub fn rule_name(server_id: Uuid, port_name: &str) -> String {
    format!("{}{port_name}", rule_prefix(server_id))
}

#[derive(Debug, Default)]
pub struct RemovalReport {
    pub removed: usize,
    pub missing: usize,
    pub failed: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct ForwardingReconciler {
    api: Arc<dyn GatewayApi>,
    interface: String,
}

impl ForwardingReconciler {
    pub fn new(api: Arc<dyn GatewayApi>, interface: impl Into<String>) -> Self {
        Self {
            api,
            interface: interface.into(),
        }
    }

    /// Finds the rule by name or creates it. Returns the rule id either way.
    /// A created rule keeps its id even when applying the change fails, so the
    /// caller can still remove it later.
    pub async fn ensure(
        &self,
        name: &str,
        external_port: u16,
        internal_address: &str,
        internal_port: u16,
        protocol: Protocol,
    ) -> Result<String, GatewayError> {
        if let Some(existing) = self.api.find_by_name(name).await? {
            tracing::debug!(rule = name, id = %existing.id, "forwarding rule already present");
            return Ok(existing.id);
        }
        let rule = ForwardRule {
            name: name.to_string(),
            interface: self.interface.clone(),
            protocol,
            external_port,
            target: internal_address.to_string(),
            target_port: internal_port,
        };
        let id = self.api.create_rule(&rule).await?;
        if let Err(err) = self.api.apply().await {
            tracing::warn!(rule = name, id = %id, %err, "created forwarding rule but applying failed");
        }
        tracing::info!(rule = name, id = %id, external_port, target = internal_address, "created forwarding rule");
        Ok(id)
    }

    pub async fn remove_by_ids(&self, ids: &[String]) -> RemovalReport {
        let mut report = RemovalReport::default();
        for id in ids.iter().filter(|id| !id.trim().is_empty()) {
            self.remove_one(id, &mut report).await;
        }
        self.apply_if_changed(&report).await;
        report
    }

    /// Catches rules whose ids were never recorded.
    pub async fn remove_by_name_prefix(&self, prefix: &str) -> RemovalReport {
        let mut report = RemovalReport::default();
        let rules = match self.api.list_rules().await {
            Ok(rules) => rules,
            Err(err) => {
                report.failed.push((prefix.to_string(), err.to_string()));
                return report;
            }
        };
        for rule in rules.iter().filter(|r| r.name.starts_with(prefix)) {
            self.remove_one(&rule.id, &mut report).await;
        }
        self.apply_if_changed(&report).await;
        report
    }

    async fn remove_one(&self, id: &str, report: &mut RemovalReport) {
        match self.api.delete_rule(id).await {
            Ok(()) => report.removed += 1,
            Err(GatewayError::NotFound(_)) => report.missing += 1,
            Err(err) => {
                tracing::warn!(id, %err, "failed to delete forwarding rule");
                report.failed.push((id.to_string(), err.to_string()));
            }
        }
    }

    async fn apply_if_changed(&self, report: &RemovalReport) {
        if report.removed == 0 {
            return;
        }
        if let Err(err) = self.api.apply().await {
            tracing::warn!(%err, "failed to apply gateway changes");
        }
    }
}

/// OPNsense destination-NAT API. The rule description carries the name.
pub struct OpnsenseClient {
    http: reqwest::Client,
    base: String,
    key: String,
    secret: String,
}

#[derive(serde::Deserialize)]
struct SearchResponse {
    #[serde(default)]
    rows: Vec<SearchRow>,
}

#[derive(serde::Deserialize)]
struct SearchRow {
    uuid: String,
    #[serde(default)]
    descr: String,
}

#[derive(serde::Deserialize)]
struct MutationResponse {
    #[serde(default)]
    result: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    validations: Option<serde_json::Value>,
}

impl OpnsenseClient {
    pub fn new(cfg: &GatewayConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("hearth-control")
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .context("build gateway http client")?;
        Ok(Self {
            http,
            base: format!("{}/api/firewall/d_nat", cfg.api_url.trim_end_matches('/')),
            key: cfg.api_key.clone(),
            secret: cfg.api_secret.clone(),
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, GatewayError> {
        let resp = self
            .http
            .post(format!("{}/{path}", self.base))
            .basic_auth(&self.key, Some(&self.secret))
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(path.to_string()));
        }
        Ok(resp.error_for_status()?.json::<T>().await?)
    }
}

fn rule_body(rule: &ForwardRule) -> serde_json::Value {
    serde_json::json!({
        "rule": {
            "interface": rule.interface,
            "protocol": rule.protocol.as_str(),
            "destination": {
                "network": format!("{}ip", rule.interface),
                "port": rule.external_port.to_string(),
            },
            "target": rule.target,
            "local-port": rule.target_port.to_string(),
            "descr": rule.name,
        }
    })
}

#[async_trait::async_trait]
impl GatewayApi for OpnsenseClient {
    async fn list_rules(&self) -> Result<Vec<RuleSummary>, GatewayError> {
        let resp: SearchResponse = self
            .post(
                "search_rule",
                serde_json::json!({ "current": 1, "rowCount": -1, "searchPhrase": "hearth-" }),
            )
            .await?;
        Ok(resp
            .rows
            .into_iter()
            .map(|r| RuleSummary {
                id: r.uuid,
                name: r.descr,
            })
            .collect())
    }

    async fn create_rule(&self, rule: &ForwardRule) -> Result<String, GatewayError> {
        let resp: MutationResponse = self.post("add_rule", rule_body(rule)).await?;
        match (resp.result.as_str(), resp.uuid) {
            ("saved", Some(uuid)) => Ok(uuid),
            _ => Err(GatewayError::Rejected(format!(
                "add_rule returned {:?} {}",
                resp.result,
                resp.validations.unwrap_or_default()
            ))),
        }
    }

    async fn delete_rule(&self, id: &str) -> Result<(), GatewayError> {
        let resp: MutationResponse = self
            .post(&format!("del_rule/{id}"), serde_json::json!({}))
            .await?;
        match resp.result.as_str() {
            "deleted" => Ok(()),
            "not found" => Err(GatewayError::NotFound(id.to_string())),
            other => Err(GatewayError::Rejected(format!("del_rule returned {other:?}"))),
        }
    }

    async fn apply(&self) -> Result<(), GatewayError> {
        let _: serde_json::Value = self.post("apply", serde_json::json!({})).await?;
        Ok(())
    }
}
