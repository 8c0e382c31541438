//! Server configuration
//!
//! Defaults, then the file named by `PALAVER_CONFIG` (YAML, TOML or JSON),
//! then `PALAVER__SECTION__KEY` environment variables.

use palaver_foundation::cache::CacheTtl;
use palaver_foundation::inference::InferenceSettings;
use palaver_foundation::orchestrator::ChatSettings;
use palaver_foundation::queue::QueueSettings;
use palaver_kernel::balancer::ServiceInstance;
use palaver_kernel::config::{ConfigResult, load_layered};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const CONFIG_PATH_VAR: &str = "PALAVER_CONFIG";
pub const ENV_PREFIX: &str = "PALAVER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub queue: QueueSettings,
    pub discovery: DiscoveryConfig,
    pub inference: InferenceSettings,
    pub chat: ChatSettings,
}

impl AppConfig {
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).ok();
        load_layered(&Self::default(), path.as_deref(), ENV_PREFIX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest page a listing endpoint returns.
    pub max_page_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_page_size: 100,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG` when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "palaver=info,palaver_server=info,palaver_foundation=info".to_string(),
            json: false,
        }
    }
}

/// Without a URL the cache tier and load index live in process memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub ttl: CacheTtl,
}

/// `sqlite:` and `postgres://` URLs select the relational backend; no URL
/// keeps everything in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryBackend {
    #[default]
    Static,
    Consul,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub backend: DiscoveryBackend,
    pub consul_address: String,
    pub datacenter: Option<String>,
    /// Model name to instances, used by the static backend.
    pub services: HashMap<String, Vec<ServiceInstance>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backend: DiscoveryBackend::Static,
            consul_address: "http://127.0.0.1:8500".to_string(),
            datacenter: None,
            services: HashMap::new(),
        }
    }
}
