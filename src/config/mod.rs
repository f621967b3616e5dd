//! Configuration for the bridge and the worker.
//!
//! Handles the TOML settings file, environment variable expansion and the
//! worker's positional command line.

mod settings;

pub use settings::{
    expand_env_vars, parse_duration, ConfigDuration, DatabaseSettings, PoolSettings, Settings,
    SettingsError, WorkerSettings, CONFIG_ENV_VAR, WORKER_ARG_COUNT,
};
