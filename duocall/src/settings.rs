use derive_new::new;
use duocall_lib::{connection::DEFAULT_ICE_SERVER, negotiation::RoleStrategy};
use tokio::fs::read_to_string;
use toml_edit::DocumentMut;
use tracing::warn;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:3001/ws";

const RELAY_URL: &str = "relay_url";
const ICE_SERVERS: &str = "ice_servers";
const ROLE_STRATEGY: &str = "role_strategy";

#[derive(new)]
pub struct SettingsRepo {
    path: String,
}

impl SettingsRepo {
    async fn load(&self) -> DocumentMut {
        let Ok(text) = read_to_string(&self.path).await else {
            return DocumentMut::default();
        };
        text.parse().unwrap_or_else(|err| {
            warn!("ignored broken settings file {}: {}", self.path, err);
            DocumentMut::default()
        })
    }

    fn read_string(doc: &DocumentMut, key: &str) -> Option<String> {
        doc.get(key).and_then(|x| x.as_str()).map(|x| x.to_owned())
    }

    fn read_strings(doc: &DocumentMut, key: &str) -> Option<Vec<String>> {
        doc.get(key).and_then(|x| x.as_array()).map(|x| {
            x.iter()
                .flat_map(|x| x.as_str())
                .map(|x| x.to_owned())
                .collect()
        })
    }

    fn read_role_strategy(doc: &DocumentMut) -> Option<RoleStrategy> {
        let value = Self::read_string(doc, ROLE_STRATEGY)?;
        match serde_json::from_str(&format!("\"{value}\"")) {
            Ok(strategy) => Some(strategy),
            Err(_) => {
                warn!("unknown {}: {:?}", ROLE_STRATEGY, value);
                None
            }
        }
    }

    pub async fn settings(&self) -> Settings {
        let doc = self.load().await;
        let defaults = Settings::default();
        Settings {
            relay_url: Self::read_string(&doc, RELAY_URL).unwrap_or(defaults.relay_url),
            ice_servers: Self::read_strings(&doc, ICE_SERVERS).unwrap_or(defaults.ice_servers),
            role_strategy: Self::read_role_strategy(&doc).unwrap_or(defaults.role_strategy),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    pub role_strategy: RoleStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            ice_servers: vec![DEFAULT_ICE_SERVER.to_owned()],
            role_strategy: RoleStrategy::default(),
        }
    }
}
