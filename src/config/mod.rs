//! Configuration module for Prism.
//!
//! Handles settings files, environment variables, and human-readable durations.

mod settings;

pub use settings::{
    expand_env_vars, parse_duration, EngineSettings, LoggingSettings, QuerySettings,
    SchedulerSettings, Settings, SettingsError, StorageSettings,
};
