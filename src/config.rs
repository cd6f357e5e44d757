//! Layered configuration: environment variables override a TOML file, which overrides struct
//! defaults, via the `config` crate.
//!
//! One first-run difference from a typical layered-config setup: when no configuration file is
//! present, [`Config::read`] writes out a generated template (with freshly random `password` and
//! `secret`) and returns [`ConfigError::TemplateWritten`] instead of silently falling back to
//! defaults, so the caller can exit cleanly with a message pointing at the new file.

use crate::error::ConfigError;
use config::{Environment, File};
use rand::RngCore;
use serde::Deserialize;
use std::env;
use std::path::Path;

/// Which proxy role(s) this process should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalType {
    Internal,
    External,
    Both,
}

impl Default for GlobalType {
    fn default() -> Self {
        Self::Both
    }
}

/// `global.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub r#type: GlobalType,
    pub debug: bool,
    pub password: String,
    pub secret: String,
    pub buffer_ms: u64,
    pub protocol_version: i32,
    pub ip_forwarding: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            r#type: GlobalType::default(),
            debug: false,
            password: String::new(),
            secret: String::new(),
            buffer_ms: 50,
            protocol_version: 340,
            ip_forwarding: false,
        }
    }
}

/// `internal.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InternalConfig {
    pub bind: String,
    pub minecraft: String,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25566".to_string(),
            minecraft: "127.0.0.1:25565".to_string(),
        }
    }
}

/// `external.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalConfig {
    pub bind: String,
    pub internal: String,
    pub player_limit: usize,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25565".to_string(),
            internal: "127.0.0.1:25566".to_string(),
            player_limit: 100,
        }
    }
}

/// `chunk_caching.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkCachingConfig {
    pub enabled: bool,
    pub threshold: u32,
    pub path: String,
}

impl Default for ChunkCachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 2,
            path: ":memory:".to_string(),
        }
    }
}

/// The full, validated configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub internal: InternalConfig,
    pub external: ExternalConfig,
    pub chunk_caching: ChunkCachingConfig,
}

const TEMPLATE: &str = r#"[global]
type = "both"
debug = false
password = "{password}"
secret = "{secret}"
buffer_ms = 50
protocol_version = 340
ip_forwarding = false

[internal]
bind = "0.0.0.0:25566"
minecraft = "127.0.0.1:25565"

[external]
bind = "0.0.0.0:25565"
internal = "127.0.0.1:25566"
player_limit = 100

[chunk_caching]
enabled = true
threshold = 2
path = ":memory:"
"#;

impl Config {
    /// Loads the configuration, layering environment variables (`LONGHAUL_<FIELD>`) over an
    /// optional file over struct defaults, then validates it.
    ///
    /// `path` defaults to `config/longhaul.toml` (overridable via the `CONFIG_FILE` environment
    /// variable) when `None`. If neither the given path nor any config file the `config` crate
    /// recognizes at that stem exists on disk, a template is written there and
    /// [`ConfigError::TemplateWritten`] is returned.
    pub fn read(path: Option<&str>) -> Result<Self, ConfigError> {
        let config_file = path
            .map(str::to_string)
            .or_else(|| env::var("CONFIG_FILE").ok())
            .unwrap_or_else(|| "config/longhaul".to_string());

        if !config_file_exists(&config_file) {
            write_template(&config_file)?;
            return Err(ConfigError::TemplateWritten(config_file));
        }

        let env_prefix = env::var("ENV_PREFIX").unwrap_or_else(|_| "longhaul".to_string());

        let built = config::Config::builder()
            .add_source(File::with_name(&config_file).required(false))
            .add_source(Environment::with_prefix(&env_prefix).separator("_"))
            .build()?;

        let config: Config = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        parse_host_port("internal.bind", &self.internal.bind)?;
        parse_host_port("internal.minecraft", &self.internal.minecraft)?;
        parse_host_port("external.bind", &self.external.bind)?;
        parse_host_port("external.internal", &self.external.internal)?;
        if self.chunk_caching.enabled && self.chunk_caching.threshold == 0 {
            return Err(ConfigError::InvalidThreshold);
        }
        Ok(())
    }
}

/// Parses a `"host:port"` field, validating shape without resolving the host (the host may be a
/// DNS name, e.g. in `ip_forwarding` scenarios, so full resolution happens at connect time).
pub fn parse_host_port(field: &'static str, value: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = value.rsplit_once(':').ok_or_else(|| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })?;
    let port: u16 = port.parse().map_err(|_| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
    })?;
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
    Ok((host.to_string(), port))
}

fn config_file_exists(stem: &str) -> bool {
    for ext in ["toml", "yaml", "yml", "json", "ini"] {
        if Path::new(&format!("{stem}.{ext}")).exists() {
            return true;
        }
    }
    Path::new(stem).exists()
}

fn write_template(stem: &str) -> Result<(), ConfigError> {
    let path = format!("{stem}.toml");
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let password = random_token();
    let secret = random_token();
    let rendered = TEMPLATE
        .replace("{password}", &password)
        .replace("{secret}", &secret);
    std::fs::write(&path, rendered)?;
    Ok(())
}

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_host_port() {
        assert_eq!(
            parse_host_port("test", "a.example:25565").unwrap(),
            ("a.example".to_string(), 25565)
        );
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_host_port("test", "a.example").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_host_port("test", "a.example:abc").is_err());
    }

    #[test]
    fn missing_config_writes_template_and_errors() {
        let dir = std::env::temp_dir().join(format!("longhaul-cfg-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let stem = dir.join("longhaul").to_string_lossy().to_string();

        let result = Config::read(Some(&stem));
        assert!(matches!(result, Err(ConfigError::TemplateWritten(_))));
        assert!(Path::new(&format!("{stem}.toml")).exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn threshold_zero_is_rejected_when_caching_enabled() {
        let mut config = Config::default();
        config.chunk_caching.enabled = true;
        config.chunk_caching.threshold = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidThreshold)));
    }
}
