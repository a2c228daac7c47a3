use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use toml::Value;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub registry: RegistryConfig,
    pub dispatcher: DispatcherConfig,
    pub handler: HandlerConfig,
    pub queue: QueueConfig,
    pub archive: ArchiveConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// "sled" for the on-disk store, "memory" for ephemeral runs.
    pub backend: String,
    pub path: String,
    /// Registry list key shared by every node in the same fleet role.
    pub role_key: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: "sled".to_owned(),
            path: "pulsefab_registry.sled".to_owned(),
            role_key: "pulse:workers".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    pub ping_interval_secs: u64,
    pub msg_timeout_secs: u64,
    pub ping_fail_max: u32,
    pub server_check_interval_secs: u64,
    pub job_retry_max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            ping_interval_secs: 120,
            msg_timeout_secs: 120,
            ping_fail_max: 1,
            server_check_interval_secs: 120,
            job_retry_max_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HandlerConfig {
    pub host: String,
    pub port: u16,
    pub drain_check_interval_secs: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 5555,
            drain_check_interval_secs: 120,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub path: String,
    /// Policy when a job has no live worker to go to:
    /// "requeue", "drop", or "archive".
    pub no_worker_policy: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: ".".to_owned(),
            no_worker_policy: "requeue".to_owned(),
        }
    }
}

impl AppConfig {
    /// Builds the effective config: file contents when a path is given,
    /// compiled-in defaults otherwise, then `--section.key value` overrides
    /// applied on top.
    pub fn load(
        path: Option<&Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value = match path {
            Some(path) => {
                let toml_content =
                    fs::read_to_string(path).map_err(|source| ConfigError::Io {
                        path: path.to_string_lossy().to_string(),
                        source,
                    })?;
                toml_content
                    .parse()
                    .map_err(|source| ConfigError::TomlParse {
                        path: path.to_string_lossy().to_string(),
                        source,
                    })?
            }
            None => Value::try_from(AppConfig::default()).map_err(ConfigError::Serialize)?,
        };

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
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
    Serialize(toml::ser::Error),
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
            Self::Serialize(source) => {
                write!(f, "failed to serialize default config: {source}")
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
        }
    }
}

impl std::error::Error for ConfigError {}

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
    if parts.is_empty() || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
        current = table
            .get_mut(*section)
            .ok_or_else(|| ConfigError::UnknownPath {
                key: key_path.to_owned(),
            })?;
    }

    let final_key = parts[parts.len() - 1];
    let table = current
        .as_table_mut()
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;
    let current_value = table
        .get_mut(final_key)
        .ok_or_else(|| ConfigError::UnknownPath {
            key: key_path.to_owned(),
        })?;

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    *current_value = parsed_value;

    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => {
            let parsed = raw_value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "integer",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Integer(parsed))
        }
        Value::Float(_) => {
            let parsed = raw_value
                .parse::<f64>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "float",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Float(parsed))
        }
        Value::Boolean(_) => {
            let parsed = raw_value
                .parse::<bool>()
                .map_err(|_| ConfigError::InvalidValueForType {
                    key: key_path.to_owned(),
                    expected: "boolean",
                    value: raw_value.to_owned(),
                })?;
            Ok(Value::Boolean(parsed))
        }
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
