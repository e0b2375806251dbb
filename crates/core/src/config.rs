use serde::Deserialize;
use std::{collections::BTreeMap, path::PathBuf};

use crate::account::{Account, AccountStore};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration at {path}; a template was written there")]
    TemplateWritten { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_port")]
    pub default_port: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
        }
    }
}

/// Settings taken from `PERCH_*` environment variables, applied on top of
/// the file.
#[derive(Debug, Default, Clone)]
struct EnvOverrides {
    log_level: Option<String>,
    default_port: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            log_level: std::env::var("PERCH_LOG_LEVEL").ok(),
            default_port: std::env::var("PERCH_DEFAULT_PORT").ok(),
        }
    }

    fn apply(self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(port) = self.default_port {
            config.connection.default_port =
                port.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "connection.default_port".to_string(),
                    message: format!("{port:?} is not a port number"),
                })?;
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Legacy SSL port; sessions connect here unless an account says otherwise.
pub const DEFAULT_PORT: u16 = 5223;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const CONFIG_TEMPLATE: &str = r#"# [accounts.main]
# address = "user@example.com"
# password = ""
# resource = "Perch"
# connection_host = "xmpp.example.com"
# connection_port = 5223
# connection_security = 1
# auto_login = true

[logging]
level = "info"

[connection]
default_port = 5223
"#;

impl AccountStore for Config {
    fn accounts(&self) -> Vec<Account> {
        self.accounts.values().cloned().collect()
    }
}

/// `config.toml` in the platform configuration directory for Perch.
pub fn config_path() -> PathBuf {
    directories::ProjectDirs::from("org", "perch", "perch")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Reads and validates the file at `path` with `PERCH_*` overrides applied.
/// A missing file is replaced by a commented template and reported as
/// [`ConfigError::TemplateWritten`].
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    read_config(path, EnvOverrides::from_env())
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    parse_config(toml_str, EnvOverrides::from_env())
}

fn read_config(path: PathBuf, overrides: EnvOverrides) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(&path) {
        Ok(contents) => parse_config(&contents, overrides),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            write_template(&path)?;
            Err(ConfigError::TemplateWritten { path })
        }
        Err(error) => Err(ConfigError::Io(error)),
    }
}

/// One-based line and column of byte `offset` in `text`.
fn position(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(newline) => offset - newline,
        None => offset + 1,
    };
    (line, column)
}

fn parse_config(toml_str: &str, overrides: EnvOverrides) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|error| {
        let (line, column) = error
            .span()
            .map_or((0, 0), |span| position(toml_str, span.start));
        ConfigError::InvalidToml {
            line,
            column,
            message: error.message().to_string(),
        }
    })?;

    for (key, account) in config.accounts.iter_mut() {
        account.key = key.clone();
    }

    overrides.apply(&mut config)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.accounts.is_empty() {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["accounts".to_string()],
        });
    }

    let mut missing = Vec::new();
    for (key, account) in &config.accounts {
        if account.address.is_empty() {
            missing.push(format!("accounts.{key}.address"));
        }
        if account.password.is_empty() {
            missing.push(format!("accounts.{key}.password"));
        }
        if account.resource.is_empty() {
            missing.push(format!("accounts.{key}.resource"));
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    for (key, account) in &config.accounts {
        if !account.address.contains('@') || account.address.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: format!("accounts.{key}.address"),
                message: "must be a bare address of the form user@host".to_string(),
            });
        }
        if account.connection_security.is_some_and(|security| security > 1) {
            return Err(ConfigError::InvalidValue {
                field: format!("accounts.{key}.connection_security"),
                message: "must be 0 (plaintext) or 1 (TLS)".to_string(),
            });
        }
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

fn write_template(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)?;
    Ok(())
}
