//! Layered configuration: compiled defaults, then `config.yaml`, then the
//! environment (after `.env` is loaded).

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use relaycore::RelayConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Places searched for `config.yaml` when no path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["bot/config.yaml", "config.yaml"];

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_STATIC_URL: &str = "https://example.github.io/miniapp";

/// Plain environment variables and the config key each one sets.
const ENV_KEYS: [(&str, &str); 7] = [
    ("BOT_TOKEN", "bot.token"),
    ("ADMIN_ID", "bot.admin_id"),
    ("BOT_USERNAME", "bot.username"),
    ("HOST", "backend.host"),
    ("PORT", "backend.port"),
    ("PUBLIC_STATIC_URL", "backend.public_static_url"),
    ("TUNNEL_URL", "backend.tunnel_url"),
];

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSection {
    #[serde(skip_serializing, deserialize_with = "secret_token")]
    pub token: Option<SecretString>,
    pub admin_id: Option<i64>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub host: String,
    pub port: u16,
    pub public_static_url: String,
    pub tunnel_url: Option<String>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            public_static_url: DEFAULT_STATIC_URL.to_string(),
            tunnel_url: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bot: BotSection,
    pub backend: BackendSection,
    pub relay: RelayConfig,
}

fn secret_token<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let token = Option::<String>::deserialize(deserializer)?;
    Ok(token.filter(|t| !t.trim().is_empty()).map(SecretString::from))
}

impl AppConfig {
    /// Loads `.env`, then resolves the layered configuration.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("failed to read .env: {}", e);
            }
        }
        let file = explicit.map(Path::to_path_buf).or_else(find_config_file);
        Self::figment(file.as_deref())
            .extract()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))
    }

    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(file) = file {
            figment = figment.merge(Yaml::file(file));
        }
        figment
            .merge(Env::raw().only(&ENV_KEYS.map(|(var, _)| var)).map(|var| {
                ENV_KEYS
                    .iter()
                    .find(|(name, _)| var == *name)
                    .map_or_else(|| var.as_str().to_string(), |(_, key)| key.to_string())
                    .into()
            }))
            .merge(Env::prefixed("RELAY_").map(|key| format!("relay.{}", key.as_str().to_lowercase()).into()))
    }

    pub fn token(&self) -> Option<&SecretString> {
        self.bot.token.as_ref()
    }

    pub fn has_token(&self) -> bool {
        self.token().is_some_and(|t| !t.expose_secret().is_empty())
    }

    /// Public API base: the tunnel URL when set, otherwise localhost.
    pub fn api_url(&self) -> String {
        match self.backend.tunnel_url.as_deref().map(str::trim) {
            Some(tunnel) if !tunnel.is_empty() => tunnel.trim_end_matches('/').to_string(),
            _ => format!("http://localhost:{}", self.backend.port),
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}
