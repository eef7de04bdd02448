use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::status::{JobAction, JobStatus, ServerStatus};

/// Private config keys start with this prefix. They carry transient secrets and
/// cleanup bookkeeping and are never handed to playbooks as user config.
pub const PRIVATE_PREFIX: char = '_';

/// Well-known private keys.
pub mod keys {
    /// Plaintext SFTP secret stashed by the control plane until setup succeeds.
    pub const SFTP_PASSWORD: &str = "_sftp_password";
    pub const SFTP_USERNAME: &str = "_sftp_username";
    /// Comma-separated gateway rule ids created during provisioning.
    pub const FORWARD_RULE_IDS: &str = "_forward_rule_ids";
}

pub fn is_private_key(key: &str) -> bool {
    key.starts_with(PRIVATE_PREFIX)
}

/// Config values are deliberately limited to scalars.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Integer(v) => Some(*v as f64),
            ConfigValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Bool(v) => serde_json::Value::Bool(*v),
            ConfigValue::Integer(v) => serde_json::Value::from(*v),
            ConfigValue::Float(v) => serde_json::Value::from(*v),
            ConfigValue::Text(v) => serde_json::Value::String(v.clone()),
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Integer(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

pub type ConfigMap = BTreeMap<String, ConfigValue>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServerRecord {
    pub id: Uuid,
    pub game_id: String,
    pub name: String,
    pub status: ServerStatus,
    pub config: ConfigMap,
    /// Named port -> allocated number. The same number is used inside the
    /// guest and on the gateway.
    pub ports: BTreeMap<String, u16>,
    pub internal_address: Option<String>,
    pub instance_id: Option<u32>,
    pub instance_node: Option<String>,
    pub owner_id: String,
    pub group_id: Option<String>,
    pub mods: Vec<ModEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ServerRecord {
    pub fn new(game_id: impl Into<String>, name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            game_id: game_id.into(),
            name: name.into(),
            status: ServerStatus::Pending,
            config: ConfigMap::new(),
            ports: BTreeMap::new(),
            internal_address: None,
            instance_id: None,
            instance_node: None,
            owner_id: owner_id.into(),
            group_id: None,
            mods: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn private_str(&self, key: &str) -> Option<&str> {
        debug_assert!(is_private_key(key));
        self.config
            .get(key)
            .and_then(ConfigValue::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set_private(&mut self, key: &str, value: impl Into<ConfigValue>) {
        debug_assert!(is_private_key(key));
        self.config.insert(key.to_string(), value.into());
    }

    pub fn remove_private(&mut self, key: &str) -> Option<ConfigValue> {
        debug_assert!(is_private_key(key));
        self.config.remove(key)
    }

    /// User-facing config only.
    pub fn public_config(&self) -> ConfigMap {
        self.config
            .iter()
            .filter(|(k, _)| !is_private_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Where to announce a finished job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NotifyTarget {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub server_id: Uuid,
    pub action: JobAction,
    pub status: JobStatus,
    pub error: Option<String>,
    pub notify: Option<NotifyTarget>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn queued(server_id: Uuid, action: JobAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            action,
            status: JobStatus::Queued,
            error: None,
            notify: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_notify(mut self, notify: Option<NotifyTarget>) -> Self {
        self.notify = notify;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortAllocation {
    pub pool: String,
    pub port: u16,
    pub server_id: Uuid,
    pub purpose: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_values_keep_their_scalar_type() {
        let raw = r#"{"name":"alpha","slots":16,"ratio":0.5,"pvp":true}"#;
        let map: ConfigMap = serde_json::from_str(raw).unwrap();
        assert_eq!(map["name"], ConfigValue::Text("alpha".into()));
        assert_eq!(map["slots"], ConfigValue::Integer(16));
        assert_eq!(map["ratio"], ConfigValue::Float(0.5));
        assert_eq!(map["pvp"], ConfigValue::Bool(true));
    }

    #[test]
    fn public_config_hides_private_keys() {
        let mut rec = ServerRecord::new("valheim", "alpha", "owner-1");
        rec.config.insert("world".into(), "Midgard".into());
        rec.set_private(keys::SFTP_PASSWORD, "hunter2");
        let public = rec.public_config();
        assert_eq!(public.len(), 1);
        assert!(public.contains_key("world"));
        assert_eq!(rec.private_str(keys::SFTP_PASSWORD), Some("hunter2"));
    }

    #[test]
    fn empty_private_value_reads_as_absent() {
        let mut rec = ServerRecord::new("valheim", "alpha", "owner-1");
        rec.set_private(keys::SFTP_PASSWORD, "");
        assert_eq!(rec.private_str(keys::SFTP_PASSWORD), None);
    }

    #[test]
    fn mod_entries_default_to_enabled() {
        let m: ModEntry = serde_json::from_str(r#"{"id":"denikson-BepInExPack"}"#).unwrap();
        assert!(m.enabled);
        assert_eq!(m.version, None);
    }
}
