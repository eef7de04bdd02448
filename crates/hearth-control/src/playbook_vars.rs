//! Variables handed to every playbook as `--extra-vars`.

use std::collections::BTreeMap;

use hearth_core::{ConfigMap, ModEntry, ServerRecord};
use uuid::Uuid;

use crate::games::{GameDefinition, ModSupport, render_connection_info};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaybookVars {
    pub server_id: Uuid,
    pub game_id: String,
    pub server_name: String,
    pub ports: BTreeMap<String, u16>,
    /// Same numbers as `ports`; older playbooks read this name.
    pub external_ports: BTreeMap<String, u16>,
    pub config: ConfigMap,
    pub internal_address: Option<String>,
    pub external_address: Option<String>,
    pub owner_id: String,
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mods: Option<Vec<ModEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_support: Option<ModSupport>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PlaybookVars {
    /// `config` must already be resolved against the game's schema.
    pub fn new(
        server: &ServerRecord,
        game: &GameDefinition,
        config: ConfigMap,
        external_address: Option<&str>,
    ) -> Self {
        let connection_info = game
            .connection_template
            .as_deref()
            .map(|t| render_connection_info(t, server, &config, external_address));
        let (mods, mod_support) = match &game.mods {
            Some(support) => (Some(server.mods.clone()), Some(support.clone())),
            None => (None, None),
        };
        Self {
            server_id: server.id,
            game_id: server.game_id.clone(),
            server_name: server.name.clone(),
            ports: server.ports.clone(),
            external_ports: server.ports.clone(),
            config,
            internal_address: server.internal_address.clone(),
            external_address: external_address
                .map(str::to_string)
                .or_else(|| server.internal_address.clone()),
            owner_id: server.owner_id.clone(),
            group_id: server.group_id.clone(),
            connection_info,
            mods,
            mod_support,
            extra: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::game;

    #[test]
    fn bundle_carries_identity_ports_and_config() {
        let mut server = ServerRecord::new("valheim", "alpha", "owner-1");
        server.ports.insert("game".into(), 27000);
        server.ports.insert("query".into(), 27001);
        server.internal_address = Some("10.20.0.15".into());
        server.mods.push(ModEntry {
            id: "denikson-BepInExPack".into(),
            name: None,
            version: Some("5.4.2202".into()),
            enabled: false,
        });
        let mut config = ConfigMap::new();
        config.insert("world".into(), "Midgard".into());

        let mut def = game("valheim", &["game", "query"]);
        def.connection_template = Some("{external_address}:{ports.game}".into());

        let v = PlaybookVars::new(&server, &def, config, Some("play.example.net"))
            .with("backup_id", "valheim-20261019T120000Z")
            .to_json()
            .unwrap();

        assert_eq!(v["server_name"], "alpha");
        assert_eq!(v["ports"]["query"], 27001);
        assert_eq!(v["external_ports"], v["ports"]);
        assert_eq!(v["config"]["world"], "Midgard");
        assert_eq!(v["internal_address"], "10.20.0.15");
        assert_eq!(v["external_address"], "play.example.net");
        assert_eq!(v["connection_info"], "play.example.net:27000");
        assert_eq!(v["backup_id"], "valheim-20261019T120000Z");
        assert_eq!(v["mods"][0]["enabled"], false);
        assert_eq!(v["mod_support"]["framework"], "bepinex");
    }

    #[test]
    fn games_without_mod_support_get_no_mod_keys() {
        let server = ServerRecord::new("factorio", "beta", "owner-1");
        let mut def = game("factorio", &["game"]);
        def.mods = None;
        let v = PlaybookVars::new(&server, &def, ConfigMap::new(), None)
            .to_json()
            .unwrap();
        assert!(v.get("mods").is_none());
        assert!(v.get("mod_support").is_none());
        assert_eq!(v["external_address"], serde_json::Value::Null);
    }
}
