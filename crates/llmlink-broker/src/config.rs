use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::health::EndpointKind;

pub const DEFAULT_CLOUD_URL: &str = "https://api.cloudtolocalllm.online";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MIN_HEALTH_CHECK_SECS: u64 = 5;
const MAX_RETRY_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEndpointConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for LocalEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 11434,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEndpointConfig {
    /// Also switched on and off by `auth_status` pushes.
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for CloudEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: DEFAULT_CLOUD_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcConfig {
    pub host: String,
    /// 0 lets the OS pick; the bound port is published for discovery.
    pub port: u16,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiConfig {
    pub auto_start: bool,
    pub show_tray_icon: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            auto_start: false,
            show_tray_icon: true,
        }
    }
}

/// The broker's configuration document (`broker.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub local: LocalEndpointConfig,
    pub cloud: CloudEndpointConfig,
    pub health_check_interval_secs: u64,
    pub retry: RetryConfig,
    pub ipc: IpcConfig,
    pub api: ApiConfig,
    pub log_level: String,
    pub ui: UiConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            local: LocalEndpointConfig::default(),
            cloud: CloudEndpointConfig::default(),
            health_check_interval_secs: 30,
            retry: RetryConfig::default(),
            ipc: IpcConfig::default(),
            api: ApiConfig::default(),
            log_level: "info".to_string(),
            ui: UiConfig::default(),
        }
    }
}

/// A loaded document plus every correction applied while loading it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: BrokerConfig,
    pub warnings: Vec<String>,
}

impl BrokerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn local_base_url(&self) -> String {
        format!("http://{}:{}", self.local.host, self.local.port)
    }

    pub fn cloud_base_url(&self) -> String {
        self.cloud.base_url.trim_end_matches('/').to_string()
    }

    pub fn base_url(&self, kind: EndpointKind) -> String {
        match kind {
            EndpointKind::Local => self.local_base_url(),
            EndpointKind::Cloud => self.cloud_base_url(),
        }
    }

    pub fn timeout(&self, kind: EndpointKind) -> Duration {
        Duration::from_secs(match kind {
            EndpointKind::Local => self.local.timeout_secs,
            EndpointKind::Cloud => self.cloud.timeout_secs,
        })
    }

    pub fn enabled(&self, kind: EndpointKind) -> bool {
        match kind {
            EndpointKind::Local => self.local.enabled,
            EndpointKind::Cloud => self.cloud.enabled,
        }
    }

    /// Read `path`. A missing file is created with defaults; unparseable
    /// fields fall back to their defaults and are reported as warnings.
    pub fn load(path: &Path) -> Result<LoadedConfig, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                tracing::info!(path = %path.display(), "wrote default broker config");
                return Ok(LoadedConfig {
                    config,
                    warnings: Vec::new(),
                });
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(Self::parse(&text))
    }

    /// Lenient parse of a whole document. Never fails: anything unusable is
    /// replaced by its default and noted in `warnings`.
    pub fn parse(text: &str) -> LoadedConfig {
        let mut warnings = Vec::new();
        let mut config = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(root)) => Self::from_object(&root, &mut warnings),
            Ok(_) => {
                warnings.push("config root is not an object; using defaults".to_string());
                Self::default()
            }
            Err(e) => {
                warnings.push(format!("config is not valid JSON ({e}); using defaults"));
                Self::default()
            }
        };
        warnings.extend(config.validate());
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        LoadedConfig { config, warnings }
    }

    fn from_object(root: &Map<String, Value>, warnings: &mut Vec<String>) -> Self {
        let d = Self::default();
        let mut fields = Fields { warnings, prefix: "" };
        let local = fields.section(root, "local");
        let cloud = fields.section(root, "cloud");
        let retry = fields.section(root, "retry");
        let ipc = fields.section(root, "ipc");
        let api = fields.section(root, "api");
        let ui = fields.section(root, "ui");

        Self {
            health_check_interval_secs: fields.get(
                root,
                "health_check_interval_secs",
                d.health_check_interval_secs,
            ),
            log_level: fields.get(root, "log_level", d.log_level),
            local: {
                let mut f = fields.nested("local");
                LocalEndpointConfig {
                    enabled: f.get(&local, "enabled", d.local.enabled),
                    host: f.get(&local, "host", d.local.host),
                    port: f.get(&local, "port", d.local.port),
                    timeout_secs: f.get(&local, "timeout_secs", d.local.timeout_secs),
                }
            },
            cloud: {
                let mut f = fields.nested("cloud");
                CloudEndpointConfig {
                    enabled: f.get(&cloud, "enabled", d.cloud.enabled),
                    base_url: f.get(&cloud, "base_url", d.cloud.base_url),
                    timeout_secs: f.get(&cloud, "timeout_secs", d.cloud.timeout_secs),
                }
            },
            retry: {
                let mut f = fields.nested("retry");
                RetryConfig {
                    max_attempts: f.get(&retry, "max_attempts", d.retry.max_attempts),
                    delay_ms: f.get(&retry, "delay_ms", d.retry.delay_ms),
                }
            },
            ipc: {
                let mut f = fields.nested("ipc");
                IpcConfig {
                    host: f.get(&ipc, "host", d.ipc.host),
                    port: f.get(&ipc, "port", d.ipc.port),
                }
            },
            api: {
                let mut f = fields.nested("api");
                ApiConfig {
                    host: f.get(&api, "host", d.api.host),
                    port: f.get(&api, "port", d.api.port),
                    cors_origins: f.get(&api, "cors_origins", d.api.cors_origins),
                }
            },
            ui: {
                let mut f = fields.nested("ui");
                UiConfig {
                    auto_start: f.get(&ui, "auto_start", d.ui.auto_start),
                    show_tray_icon: f.get(&ui, "show_tray_icon", d.ui.show_tray_icon),
                }
            },
        }
    }

    /// Replace out-of-range values with defaults, returning one warning per fix.
    pub fn validate(&mut self) -> Vec<String> {
        let d = Self::default();
        let mut warnings = Vec::new();
        let mut fix = |field: &str, bad: String, good: String| {
            warnings.push(format!("{field}: invalid value {bad}, using {good}"));
        };

        if self.local.port == 0 {
            fix("local.port", "0".into(), d.local.port.to_string());
            self.local.port = d.local.port;
        }
        if self.api.port == 0 {
            fix("api.port", "0".into(), d.api.port.to_string());
            self.api.port = d.api.port;
        }
        if self.local.host.trim().is_empty() {
            fix("local.host", "\"\"".into(), d.local.host.clone());
            self.local.host = d.local.host.clone();
        }
        if self.ipc.host.trim().is_empty() {
            fix("ipc.host", "\"\"".into(), d.ipc.host.clone());
            self.ipc.host = d.ipc.host.clone();
        }
        if self.api.host.trim().is_empty() {
            fix("api.host", "\"\"".into(), d.api.host.clone());
            self.api.host = d.api.host.clone();
        }
        if !self.cloud.base_url.starts_with("http://") && !self.cloud.base_url.starts_with("https://")
        {
            fix("cloud.base_url", format!("{:?}", self.cloud.base_url), d.cloud.base_url.clone());
            self.cloud.base_url = d.cloud.base_url.clone();
        }
        if self.local.timeout_secs < 1 {
            fix("local.timeout_secs", self.local.timeout_secs.to_string(), d.local.timeout_secs.to_string());
            self.local.timeout_secs = d.local.timeout_secs;
        }
        if self.cloud.timeout_secs < 1 {
            fix("cloud.timeout_secs", self.cloud.timeout_secs.to_string(), d.cloud.timeout_secs.to_string());
            self.cloud.timeout_secs = d.cloud.timeout_secs;
        }
        if self.health_check_interval_secs < MIN_HEALTH_CHECK_SECS {
            fix(
                "health_check_interval_secs",
                self.health_check_interval_secs.to_string(),
                d.health_check_interval_secs.to_string(),
            );
            self.health_check_interval_secs = d.health_check_interval_secs;
        }
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.retry.max_attempts) {
            fix("retry.max_attempts", self.retry.max_attempts.to_string(), d.retry.max_attempts.to_string());
            self.retry.max_attempts = d.retry.max_attempts;
        }
        let level = self.log_level.trim().to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            self.log_level = level;
        } else {
            fix("log_level", format!("{:?}", self.log_level), d.log_level.clone());
            self.log_level = d.log_level;
        }
        warnings
    }

    /// Write the document as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(io_error)?;
        Ok(())
    }
}

/// Per-field extraction that records a warning instead of failing.
struct Fields<'a> {
    warnings: &'a mut Vec<String>,
    prefix: &'static str,
}

impl Fields<'_> {
    fn nested(&mut self, prefix: &'static str) -> Fields<'_> {
        Fields {
            warnings: &mut *self.warnings,
            prefix,
        }
    }

    fn name(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.prefix)
        }
    }

    fn section(&mut self, root: &Map<String, Value>, key: &str) -> Map<String, Value> {
        match root.get(key) {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                self.warnings
                    .push(format!("{}: expected an object, got {other}; using defaults", self.name(key)));
                Map::new()
            }
        }
    }

    fn get<T: DeserializeOwned>(&mut self, section: &Map<String, Value>, key: &str, default: T) -> T {
        let Some(value) = section.get(key) else {
            return default;
        };
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.warnings
                    .push(format!("{}: cannot use {value} ({e}); using default", self.name(key)));
                default
            }
        }
    }
}
