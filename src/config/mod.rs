use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use toml::Value;

use crate::logging::{LogLevel, LoggerConfig};

pub const CONFIG_FILE_NAME: &str = "mole.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

pub const DEFAULT_CONFIG_TOML: &str = r#"
[runtime]
role = "master"

[logging]
level = "info"
human_friendly = false

[cluster]
heartbeat_interval_ms = 10000
dial_timeout_ms = 10000
liveness_check_interval_ms = 5000
flagging_multiplier = 3
dead_multiplier = 5
publish_timeout_ms = 5000
connect_timeout_ms = 10000
subscription_buffer = 16

[master]
host = "0.0.0.0"
port = 7070
serve_cluster = true
serve_http = false
serve_tls = false
channel_capacity = 128
sniff_timeout_ms = 10000

[agent]
id = ""
master_addr = "127.0.0.1:7070"
backoff_min_ms = 1000
backoff_max_ms = 60000
clear_shutdown = false

[storage]
engine = "sled"
path = "~/.mole/agent"

[storage.sled]
"#;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub cluster: ClusterConfig,
    pub master: MasterConfig,
    pub agent: AgentConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub role: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    pub heartbeat_interval_ms: u64,
    pub dial_timeout_ms: u64,
    pub liveness_check_interval_ms: u64,
    pub flagging_multiplier: u32,
    pub dead_multiplier: u32,
    pub publish_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub subscription_buffer: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct MasterConfig {
    pub host: String,
    pub port: u16,
    pub serve_cluster: bool,
    pub serve_http: bool,
    pub serve_tls: bool,
    pub channel_capacity: usize,
    pub sniff_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    pub id: String,
    pub master_addr: String,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub clear_shutdown: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    #[serde(default)]
    pub sled: SledConfig,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SledConfig {
    pub cache_capacity: Option<u64>,
    pub mode: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeRole {
    Master,
    Agent,
}

impl RuntimeRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "master" => Some(Self::Master),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Agent => "agent",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    BuiltIn,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::BuiltIn => write!(f, "<built-in defaults>"),
        }
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl AppConfig {
    // `--config <path>`, then `./mole.toml`, then `~/.mole/mole.toml`, then built-in defaults.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        let (explicit_path, overrides) = split_config_path_arg(args)?;

        let source = match explicit_path {
            Some(path) => ConfigSource::File(path),
            None => discover_config_file()
                .map(ConfigSource::File)
                .unwrap_or(ConfigSource::BuiltIn),
        };

        let config = match &source {
            ConfigSource::File(path) => Self::load_from_toml_with_args(path, overrides)?,
            ConfigSource::BuiltIn => {
                Self::load_from_str_with_args(DEFAULT_CONFIG_TOML, "<built-in>", overrides)?
            }
        };

        Ok((config, source))
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let origin = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: origin.clone(),
            source,
        })?;

        Self::load_from_str_with_args(&toml_content, &origin, args)
    }

    pub fn load_from_str_with_args(
        toml_content: &str,
        origin: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: origin.to_owned(),
                    source,
                })?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn role(&self) -> Result<RuntimeRole, ConfigError> {
        RuntimeRole::parse(&self.runtime.role).ok_or_else(|| ConfigError::InvalidSetting {
            key: "runtime.role".to_owned(),
            reason: format!("'{}' is not one of: master, agent", self.runtime.role),
        })
    }

    pub fn logger_config(&self) -> Result<LoggerConfig, ConfigError> {
        let min_level = LogLevel::from_config_value(&self.logging.level).ok_or_else(|| {
            ConfigError::InvalidSetting {
                key: "logging.level".to_owned(),
                reason: format!(
                    "'{}' is not one of: error, warn, info, debug, verbose",
                    self.logging.level
                ),
            }
        })?;
        Ok(LoggerConfig {
            min_level,
            human_friendly: self.logging.human_friendly,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.role()?;
        self.logger_config()?;

        let cluster = &self.cluster;
        for (key, value) in [
            ("cluster.heartbeat_interval_ms", cluster.heartbeat_interval_ms),
            ("cluster.dial_timeout_ms", cluster.dial_timeout_ms),
            ("cluster.liveness_check_interval_ms", cluster.liveness_check_interval_ms),
            ("cluster.publish_timeout_ms", cluster.publish_timeout_ms),
            ("cluster.connect_timeout_ms", cluster.connect_timeout_ms),
            ("master.sniff_timeout_ms", self.master.sniff_timeout_ms),
            ("agent.backoff_min_ms", self.agent.backoff_min_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: key.to_owned(),
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }

        if cluster.flagging_multiplier == 0
            || cluster.dead_multiplier <= cluster.flagging_multiplier
        {
            return Err(ConfigError::InvalidSetting {
                key: "cluster.dead_multiplier".to_owned(),
                reason: format!(
                    "must exceed flagging_multiplier ({}) which must be non-zero",
                    cluster.flagging_multiplier
                ),
            });
        }

        if self.agent.backoff_max_ms < self.agent.backoff_min_ms {
            return Err(ConfigError::InvalidSetting {
                key: "agent.backoff_max_ms".to_owned(),
                reason: "must not be lower than agent.backoff_min_ms".to_owned(),
            });
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn split_config_path_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_PATH_ARG {
            let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            config_path = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }

    Ok((config_path, rest))
}

fn discover_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }

    let home = std::env::var("HOME").ok()?;
    let in_home = PathBuf::from(home).join(".mole").join(CONFIG_FILE_NAME);
    in_home.is_file().then_some(in_home)
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(unknown)?;
    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
