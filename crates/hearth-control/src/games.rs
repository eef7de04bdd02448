use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use hearth_core::{ConfigMap, ConfigValue, JobAction, ServerRecord, is_private_key};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Both => "tcp/udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceHints {
    pub cores: Option<u32>,
    pub memory_mb: Option<u32>,
    pub disk_gb: Option<u32>,
}

/// Entry points (playbook paths) per action.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Playbooks {
    pub provision: Option<String>,
    pub start: Option<String>,
    pub stop: Option<String>,
    pub backup: Option<String>,
    pub update: Option<String>,
    pub deprovision: Option<String>,
    pub install_mods: Option<String>,
    pub setup_sftp: Option<String>,
    pub disable_sftp: Option<String>,
    pub reset_sftp_password: Option<String>,
}

impl Playbooks {
    pub fn for_action(&self, action: JobAction) -> Option<&str> {
        let p = match action {
            JobAction::Provision => &self.provision,
            JobAction::Start => &self.start,
            JobAction::Stop => &self.stop,
            JobAction::Backup => &self.backup,
            JobAction::Update => &self.update,
            JobAction::Deprovision => &self.deprovision,
            JobAction::InstallMods => &self.install_mods,
            JobAction::SetupSftp => &self.setup_sftp,
            JobAction::DisableSftp => &self.disable_sftp,
            JobAction::ResetSftpPassword => &self.reset_sftp_password,
            JobAction::Delete => return None,
        };
        p.as_deref().filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub default: Option<ConfigValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModSupport {
    pub source: String,
    pub install_path: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
}

fn default_pool() -> String {
    "game".to_string()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GameDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_pool")]
    pub port_pool: String,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default)]
    pub playbooks: Playbooks,
    #[serde(default)]
    pub config_schema: BTreeMap<String, FieldSchema>,
    #[serde(default)]
    pub connection_template: Option<String>,
    #[serde(default)]
    pub mods: Option<ModSupport>,
}

impl GameDefinition {
    pub fn port_names(&self) -> Vec<String> {
        self.ports.iter().map(|p| p.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid config: {}", summarize(.0))]
pub struct ConfigErrors(pub BTreeMap<String, String>);

fn summarize(errors: &BTreeMap<String, String>) -> String {
    errors
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn coerce(kind: FieldType, value: &ConfigValue) -> Option<ConfigValue> {
    match (kind, value) {
        (FieldType::String, ConfigValue::Text(_)) => Some(value.clone()),
        (FieldType::String, other) => Some(ConfigValue::Text(other.to_string())),
        (FieldType::Integer, ConfigValue::Integer(_)) => Some(value.clone()),
        (FieldType::Integer, ConfigValue::Float(f)) if f.fract() == 0.0 => {
            Some(ConfigValue::Integer(*f as i64))
        }
        (FieldType::Integer, ConfigValue::Text(s)) => {
            s.trim().parse::<i64>().ok().map(ConfigValue::Integer)
        }
        (FieldType::Number, ConfigValue::Integer(_) | ConfigValue::Float(_)) => Some(value.clone()),
        (FieldType::Number, ConfigValue::Text(s)) => {
            s.trim().parse::<f64>().ok().map(ConfigValue::Float)
        }
        (FieldType::Boolean, ConfigValue::Bool(_)) => Some(value.clone()),
        (FieldType::Boolean, ConfigValue::Text(s)) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(ConfigValue::Bool(true)),
                "0" | "false" | "no" | "off" => Some(ConfigValue::Bool(false)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn type_hint(kind: FieldType) -> &'static str {
    match kind {
        FieldType::String => "Must be a string.",
        FieldType::Integer => "Must be an integer.",
        FieldType::Number => "Must be a number.",
        FieldType::Boolean => "Must be true or false.",
    }
}

/// Applies defaults and checks the schema. Private keys are dropped; keys the
/// schema does not mention pass through untouched.
pub fn resolve_config(
    schema: &BTreeMap<String, FieldSchema>,
    values: &ConfigMap,
) -> Result<ConfigMap, ConfigErrors> {
    let mut out: ConfigMap = values
        .iter()
        .filter(|(k, _)| !is_private_key(k) && !schema.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut field_errors = BTreeMap::<String, String>::new();

    for (key, field) in schema {
        let raw = values
            .get(key)
            .filter(|v| !matches!(v, ConfigValue::Text(s) if s.trim().is_empty()));
        let Some(raw) = raw.or(field.default.as_ref()) else {
            if field.required {
                field_errors.insert(key.clone(), "Required.".to_string());
            }
            continue;
        };

        let Some(value) = coerce(field.kind, raw) else {
            field_errors.insert(key.clone(), type_hint(field.kind).to_string());
            continue;
        };

        if let Some(n) = value.as_f64() {
            let below = field.min.is_some_and(|min| n < min);
            let above = field.max.is_some_and(|max| n > max);
            if below || above {
                let msg = match (field.min, field.max) {
                    (Some(min), Some(max)) => format!("Must be between {min} and {max}."),
                    (Some(min), None) => format!("Must be at least {min}."),
                    (None, Some(max)) => format!("Must be at most {max}."),
                    (None, None) => unreachable!(),
                };
                field_errors.insert(key.clone(), msg);
                continue;
            }
        }

        out.insert(key.clone(), value);
    }

    if !field_errors.is_empty() {
        return Err(ConfigErrors(field_errors));
    }
    Ok(out)
}

/// Fills `{address}`, `{external_address}`, `{name}`, `{ports.<n>}` and
/// `{config.<k>}`. Unknown placeholders are left as written.
pub fn render_connection_info(
    template: &str,
    server: &ServerRecord,
    config: &ConfigMap,
    external_address: Option<&str>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = &after[..close];
        let value = match key {
            "address" => server.internal_address.clone(),
            "external_address" => external_address
                .map(str::to_string)
                .or_else(|| server.internal_address.clone()),
            "name" => Some(server.name.clone()),
            _ => {
                if let Some(port) = key.strip_prefix("ports.") {
                    server.ports.get(port).map(|p| p.to_string())
                } else if let Some(k) = key.strip_prefix("config.") {
                    config.get(k).map(|v| v.to_string())
                } else {
                    None
                }
            }
        };
        match value {
            Some(v) => out.push_str(&v),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn parse_definition(path: &Path, raw: &str) -> anyhow::Result<GameDefinition> {
    let def: GameDefinition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(raw).context("parse toml")?,
        _ => serde_yaml::from_str(raw).context("parse yaml")?,
    };
    if def.id.trim().is_empty() {
        anyhow::bail!("game id must be non-empty");
    }
    let mut seen = std::collections::BTreeSet::new();
    for p in &def.ports {
        if !seen.insert(p.name.as_str()) {
            anyhow::bail!("duplicate port name: {}", p.name);
        }
    }
    Ok(def)
}

fn is_definition_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "toml")
    )
}

/// Reads every definition file in `dir`. Broken files are skipped with a
/// warning; the first definition of an id wins.
pub async fn load_dir(dir: &Path) -> anyhow::Result<BTreeMap<String, Arc<GameDefinition>>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read games dir {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_definition_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut out = BTreeMap::new();
    for path in paths {
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to read game definition");
                continue;
            }
        };
        match parse_definition(&path, &raw) {
            Ok(def) => {
                if out.contains_key(&def.id) {
                    tracing::warn!(path = %path.display(), game = %def.id, "duplicate game id, skipped");
                    continue;
                }
                out.insert(def.id.clone(), Arc::new(def));
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), err = %format!("{err:#}"), "invalid game definition");
            }
        }
    }
    Ok(out)
}

/// Loaded game definitions, swapped wholesale on reload.
#[derive(Clone, Default)]
pub struct GameCatalog {
    dir: Option<PathBuf>,
    games: Arc<RwLock<Arc<BTreeMap<String, Arc<GameDefinition>>>>>,
}

impl GameCatalog {
    pub fn from_definitions(defs: impl IntoIterator<Item = GameDefinition>) -> Self {
        let map = defs
            .into_iter()
            .map(|d| (d.id.clone(), Arc::new(d)))
            .collect();
        Self {
            dir: None,
            games: Arc::new(RwLock::new(Arc::new(map))),
        }
    }

    pub async fn load(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let map = load_dir(&dir).await?;
        tracing::info!(dir = %dir.display(), games = map.len(), "loaded game definitions");
        Ok(Self {
            dir: Some(dir),
            games: Arc::new(RwLock::new(Arc::new(map))),
        })
    }

    /// Re-reads the directory. On failure the previous catalog stays.
    pub async fn reload(&self) -> anyhow::Result<usize> {
        let Some(dir) = &self.dir else {
            anyhow::bail!("catalog was not loaded from a directory");
        };
        let map = load_dir(dir).await?;
        let n = map.len();
        *self.games.write().await = Arc::new(map);
        tracing::info!(dir = %dir.display(), games = n, "reloaded game definitions");
        Ok(n)
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, def: GameDefinition) {
        let mut guard = self.games.write().await;
        let mut map = (**guard).clone();
        map.insert(def.id.clone(), Arc::new(def));
        *guard = Arc::new(map);
    }

    pub async fn get(&self, game_id: &str) -> Option<Arc<GameDefinition>> {
        self.games.read().await.get(game_id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.games.read().await.keys().cloned().collect()
    }
}
