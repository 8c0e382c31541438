//! Layered configuration loading
//!
//! Service configuration is assembled from up to three layers, later layers
//! overriding earlier ones:
//!
//! 1. built-in defaults (any `Serialize` value)
//! 2. an optional file whose format is detected from its extension
//! 3. environment variables under a prefix, with `__` marking nesting
//!
//! File contents go through `${VAR}` / `$VAR` substitution before parsing.

use config::{Config as Cfg, Environment, File};

pub use config::FileFormat;
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::LazyLock;

static BRACED_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced env regex"));
static BARE_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("bare env regex"));

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension
///
/// Supported: `.yaml` / `.yml`, `.toml`, `.json`.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
///
/// `${VAR}` is replaced first, then bare `$VAR`. Unset variables are left
/// untouched so the parser reports them in context.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = BRACED_VAR.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    });

    BARE_VAR
        .replace_all(&braced, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);

    Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load `defaults`, then `path` (if any), then `{env_prefix}__*` variables.
///
/// For a field `redis.url` and prefix `PALAVER` the variable is
/// `PALAVER__REDIS__URL`.
pub fn load_layered<T>(defaults: &T, path: Option<&str>, env_prefix: &str) -> ConfigResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let base = Cfg::try_from(defaults).map_err(|e| ConfigError::Serialization(e.to_string()))?;
    let mut builder = Cfg::builder().add_source(base);

    if let Some(path) = path {
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        builder = builder.add_source(File::from_str(&substitute_env_vars(&content), format));
    }

    builder
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}
