use std::{fs, path::Path, time::Duration};

use once_cell::sync::Lazy;
use rand::{distr::Alphanumeric, rng, Rng};
use serde::{Deserialize, Serialize};

use crate::schema::enum_def::ProviderType;
use crate::utils::billing::Pricing;

// --- QUOTA CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// How long a PENDING reservation may live before the sweeper expires it.
    pub reservation_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 600,
            sweep_interval_secs: 30,
        }
    }
}

impl QuotaConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialQuotaConfig {
    pub reservation_ttl_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

impl PartialQuotaConfig {
    fn merge_into(self, final_config: &mut QuotaConfig) {
        if let Some(ttl) = self.reservation_ttl_secs {
            final_config.reservation_ttl_secs = ttl;
        }
        if let Some(interval) = self.sweep_interval_secs {
            final_config.sweep_interval_secs = interval;
        }
    }
}

// --- CHAT CONFIG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Number of most recent messages replayed to the provider.
    pub history_limit: i64,
    pub stream_idle_timeout_secs: u64,
    /// Chunks buffered between the upstream reader and the client body.
    pub relay_buffer: usize,
    pub max_attachment_chars: usize,
    pub default_max_output_tokens: i32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            stream_idle_timeout_secs: 120,
            relay_buffer: 16,
            max_attachment_chars: 20_000,
            default_max_output_tokens: 1024,
        }
    }
}

impl ChatConfig {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialChatConfig {
    pub history_limit: Option<i64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub relay_buffer: Option<usize>,
    pub max_attachment_chars: Option<usize>,
    pub default_max_output_tokens: Option<i32>,
}

impl PartialChatConfig {
    fn merge_into(self, final_config: &mut ChatConfig) {
        if let Some(v) = self.history_limit { final_config.history_limit = v; }
        if let Some(v) = self.stream_idle_timeout_secs { final_config.stream_idle_timeout_secs = v; }
        if let Some(v) = self.relay_buffer { final_config.relay_buffer = v.max(1); }
        if let Some(v) = self.max_attachment_chars { final_config.max_attachment_chars = v; }
        if let Some(v) = self.default_max_output_tokens { final_config.default_max_output_tokens = v; }
    }
}

// --- PROVIDER CATALOG ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name clients request.
    pub name: String,
    /// Name sent upstream, defaults to `name`.
    #[serde(default)]
    pub upstream_name: Option<String>,
    #[serde(flatten)]
    pub pricing: Pricing,
    #[serde(default)]
    pub max_output_tokens: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub key: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

// Used for deserializing user-provided config files where all fields are optional.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub base_path: Option<String>,
    pub jwt_secret: Option<String>,
    pub db_url: Option<String>,
    pub proxy: Option<String>,
    pub log_level: Option<String>,
    pub quota: Option<PartialQuotaConfig>,
    pub chat: Option<PartialChatConfig>,
    /// Replaces the whole catalog when present.
    pub providers: Option<Vec<ProviderConfig>>,
}

impl PartialConfig {
    /// Merges the fields of this partial config into a final config, overwriting existing values.
    fn merge_into(self, final_config: &mut FinalConfig) {
        if let Some(host) = self.host { final_config.host = host; }
        if let Some(port) = self.port { final_config.port = port; }
        if let Some(base_path) = self.base_path { final_config.base_path = base_path; }
        if let Some(jwt_secret) = self.jwt_secret { final_config.jwt_secret = jwt_secret; }
        if let Some(db_url) = self.db_url { final_config.db_url = db_url; }
        if let Some(proxy) = self.proxy { final_config.proxy = Some(proxy); }
        if let Some(log_level) = self.log_level { final_config.log_level = log_level; }
        if let Some(quota) = self.quota {
            quota.merge_into(&mut final_config.quota);
        }
        if let Some(chat) = self.chat {
            chat.merge_into(&mut final_config.chat);
        }
        if let Some(providers) = self.providers {
            final_config.providers = providers;
        }
    }
}

// The fully resolved configuration used by the application.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FinalConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub jwt_secret: String,
    pub db_url: String,
    pub proxy: Option<String>,
    pub log_level: String,
    pub quota: QuotaConfig,
    pub chat: ChatConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for FinalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            base_path: "/api".to_string(),
            jwt_secret: generate_random_string(48),
            db_url: "./storage/aidock.db".to_string(),
            proxy: None,
            log_level: "info".to_string(),
            quota: QuotaConfig::default(),
            chat: ChatConfig::default(),
            providers: Vec::new(),
        }
    }
}

fn generate_random_string(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn get_env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn get_config_from_env() -> PartialConfig {
    PartialConfig {
        host: get_env_var("HOST"),
        port: get_env_var("PORT"),
        base_path: get_env_var("BASE_PATH"),
        jwt_secret: get_env_var("JWT_SECRET"),
        db_url: get_env_var("DB_URL"),
        proxy: get_env_var("PROXY"),
        log_level: get_env_var("LOG_LEVEL"),
        ..Default::default()
    }
}

fn parse_partial(config_str: &str, path: &Path) -> PartialConfig {
    serde_yaml::from_str(config_str)
        .unwrap_or_else(|e| panic!("Failed to parse configuration file at {:?}: {}", path, e))
}

fn merge_file(path: &Path, final_config: &mut FinalConfig) {
    if !path.exists() {
        return;
    }
    if let Ok(config_str) = fs::read_to_string(path) {
        parse_partial(&config_str, path).merge_into(final_config);
    }
}

pub static CONFIG: Lazy<FinalConfig> = Lazy::new(|| {
    let default_config_path = Path::new("config.default.yaml");
    let user_config_path = if cfg!(debug_assertions) && Path::new("config.local.yaml").exists() {
        Path::new("config.local.yaml")
    } else {
        Path::new("config.yaml")
    };

    let mut final_config = FinalConfig::default();
    merge_file(default_config_path, &mut final_config);
    merge_file(user_config_path, &mut final_config);
    // Environment variables have the highest priority.
    get_config_from_env().merge_into(&mut final_config);

    final_config
});
