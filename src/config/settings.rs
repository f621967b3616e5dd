//! TOML-based configuration for the bridge and its worker.
//!
//! The same file format is read by the host (to launch the worker) and by the
//! worker itself when it is started with a single configuration path.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! logs = false
//! handshake_timeout = "30s"
//! request_timeout = "60s"
//!
//! [database]
//! host = "db.internal"
//! port = 5000
//! database = "sales"
//! username = "app"
//! password = "${TDS_PASSWORD}"
//!
//! [pool]
//! min_connections = 1
//! max_connections = 10
//! connection_timeout = "30s"
//! idle_timeout = "5m"
//! keepalive_time = "30s"
//! max_lifetime = "1h"
//! transaction_connections = 2
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TDS_BRIDGE_CONFIG";

/// Number of positional parameters the worker accepts.
pub const WORKER_ARG_COUNT: usize = 13;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidArgument { name: &'static str, value: String },

    #[error("Expected 1 config file path or {expected} parameters, got {got}")]
    WrongArgumentCount { expected: usize, got: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A duration written as `"500ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number
/// of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn get(self) -> Duration {
        self.0
    }

    /// Whole seconds, as passed to the worker on its command line.
    pub fn as_secs(self) -> u64 {
        self.0.as_secs()
    }
}

impl From<ConfigDuration> for Duration {
    fn from(value: ConfigDuration) -> Self {
        value.0
    }
}

impl fmt::Display for ConfigDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 1000 != 0 {
            write!(f, "{}ms", millis)
        } else {
            write!(f, "{}s", self.0.as_secs())
        }
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(ConfigDuration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text)
                .map(ConfigDuration)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Parse a duration such as `"250ms"`, `"30s"`, `"5m"`, `"2h"` or `"45"`.
pub fn parse_duration(s: &str) -> Result<Duration, SettingsError> {
    let s = s.trim();
    let invalid = || SettingsError::InvalidDuration(s.to_string());

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => amount.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// How the host launches and talks to the worker.
    pub worker: WorkerSettings,

    /// Database the worker connects to.
    pub database: DatabaseSettings,

    /// Connection pool sizing inside the worker.
    pub pool: PoolSettings,
}

/// Worker process configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to the worker binary. Searched for when unset.
    pub path: Option<String>,

    /// Hand this file to the worker instead of positional parameters.
    pub config_file: Option<String>,

    /// Let the worker emit diagnostic log lines.
    pub logs: bool,

    /// Bound on waiting for the startup confirmation line.
    pub handshake_timeout: ConfigDuration,

    /// Default per-request timeout on the host.
    pub request_timeout: ConfigDuration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            path: None,
            config_file: None,
            logs: false,
            handshake_timeout: ConfigDuration::from_secs(30),
            request_timeout: ConfigDuration::from_secs(60),
        }
    }
}

/// Database connection parameters. String fields support `${VAR}` expansion.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,

    /// Require TLS to the database server.
    pub encrypt: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            database: "master".to_string(),
            username: String::new(),
            password: String::new(),
            encrypt: false,
        }
    }
}

// Keep the password out of logs.
impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("encrypt", &self.encrypt)
            .finish()
    }
}

impl DatabaseSettings {
    /// Copy of these settings with environment variables expanded.
    pub fn resolved(&self) -> Result<DatabaseSettings, SettingsError> {
        Ok(DatabaseSettings {
            host: expand_env_vars(&self.host)?,
            port: self.port,
            database: expand_env_vars(&self.database)?,
            username: expand_env_vars(&self.username)?,
            password: expand_env_vars(&self.password)?,
            encrypt: self.encrypt,
        })
    }

    /// `host:port/database`, as logged once connected.
    pub fn describe(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    /// Connections the stateless pool keeps open.
    pub min_connections: u32,

    /// Upper bound on connections lent out plus idle.
    pub max_connections: u32,

    /// How long `acquire` waits for a connection.
    pub connection_timeout: ConfigDuration,

    /// Idle connections above the minimum are retired after this long.
    pub idle_timeout: ConfigDuration,

    /// Maintenance interval; idle connections older than this are pinged
    /// before being lent out.
    pub keepalive_time: ConfigDuration,

    /// Connections are retired once this old.
    pub max_lifetime: ConfigDuration,

    /// Spare connections the transaction pool keeps warm.
    pub transaction_connections: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connection_timeout: ConfigDuration::from_secs(30),
            idle_timeout: ConfigDuration::from_secs(300),
            keepalive_time: ConfigDuration::from_secs(30),
            max_lifetime: ConfigDuration::from_secs(3600),
            transaction_connections: 2,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `TDS_BRIDGE_CONFIG`
    /// 2. `./tds-bridge.toml`
    /// 3. `./resources/tds-bridge.toml`
    /// 4. `~/.config/tds-bridge/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            return Self::from_file(&path);
        }

        for local in ["tds-bridge.toml", "resources/tds-bridge.toml"] {
            let local_config = PathBuf::from(local);
            if local_config.exists() {
                return Self::from_file(&local_config);
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tds-bridge").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Parse the worker's command line: one config file path, or the 13
    /// ordered parameters produced by [`Settings::to_worker_args`].
    ///
    /// Database fields read from a file are env-expanded here. Positional
    /// parameters were expanded by the host and are taken literally.
    pub fn from_worker_args(args: &[String]) -> Result<Self, SettingsError> {
        match args.len() {
            1 => {
                let mut settings = Self::from_file(&args[0])?;
                settings.database = settings.database.resolved()?;
                Ok(settings)
            }
            WORKER_ARG_COUNT => Self::from_positional(args),
            got => Err(SettingsError::WrongArgumentCount {
                expected: WORKER_ARG_COUNT,
                got,
            }),
        }
    }

    fn from_positional(args: &[String]) -> Result<Self, SettingsError> {
        fn number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, SettingsError> {
            value.trim().parse().map_err(|_| SettingsError::InvalidArgument {
                name,
                value: value.to_string(),
            })
        }

        fn seconds(name: &'static str, value: &str) -> Result<ConfigDuration, SettingsError> {
            number::<u64>(name, value).map(ConfigDuration::from_secs)
        }

        fn flag(name: &'static str, value: &str) -> Result<bool, SettingsError> {
            match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(SettingsError::InvalidArgument {
                    name,
                    value: value.to_string(),
                }),
            }
        }

        let database = DatabaseSettings {
            host: args[0].clone(),
            port: number("port", &args[1])?,
            database: args[2].clone(),
            username: args[3].clone(),
            password: args[4].clone(),
            encrypt: false,
        };

        let worker = WorkerSettings {
            logs: flag("logs", &args[5])?,
            ..WorkerSettings::default()
        };

        let pool = PoolSettings {
            min_connections: number("min_connections", &args[6])?,
            max_connections: number("max_connections", &args[7])?,
            connection_timeout: seconds("connection_timeout", &args[8])?,
            idle_timeout: seconds("idle_timeout", &args[9])?,
            keepalive_time: seconds("keepalive_time", &args[10])?,
            max_lifetime: seconds("max_lifetime", &args[11])?,
            transaction_connections: number("transaction_connections", &args[12])?,
        };

        Ok(Settings {
            worker,
            database,
            pool,
        })
    }

    /// Reject settings the worker cannot start with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.database.username.trim().is_empty() {
            return Err(SettingsError::InvalidConfig(
                "database.username must not be empty".to_string(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(SettingsError::InvalidConfig(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(SettingsError::InvalidConfig(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        Ok(())
    }

    /// Command-line arguments for launching the worker.
    ///
    /// With `worker.config_file` set the worker reads that file itself;
    /// otherwise the 13 ordered parameters are passed, with credentials
    /// expanded and durations as whole seconds. Settings the parameters
    /// cannot carry (TLS, sub-second durations) require `config_file`.
    pub fn to_worker_args(&self) -> Result<Vec<String>, SettingsError> {
        if let Some(file) = &self.worker.config_file {
            return Ok(vec![expand_env_vars(file)?]);
        }

        if self.database.encrypt {
            return Err(SettingsError::InvalidConfig(
                "database.encrypt requires worker.config_file".to_string(),
            ));
        }
        let pool = &self.pool;
        for (name, duration) in [
            ("pool.connection_timeout", pool.connection_timeout),
            ("pool.idle_timeout", pool.idle_timeout),
            ("pool.keepalive_time", pool.keepalive_time),
            ("pool.max_lifetime", pool.max_lifetime),
        ] {
            if duration.get().subsec_nanos() != 0 {
                return Err(SettingsError::InvalidConfig(format!(
                    "{} = {} is not whole seconds; use worker.config_file",
                    name, duration
                )));
            }
        }

        let db = self.database.resolved()?;
        Ok(vec![
            db.host,
            db.port.to_string(),
            db.database,
            db.username,
            db.password,
            self.worker.logs.to_string(),
            pool.min_connections.to_string(),
            pool.max_connections.to_string(),
            pool.connection_timeout.as_secs().to_string(),
            pool.idle_timeout.as_secs().to_string(),
            pool.keepalive_time.as_secs().to_string(),
            pool.max_lifetime.as_secs().to_string(),
            pool.transaction_connections.to_string(),
        ])
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax. A lone `$` is kept.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
