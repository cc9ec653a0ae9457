//! Settings file, command line and environment, merged into one [`Config`].
//!
//! Precedence is command line, then environment, then the settings file,
//! then built-in defaults.

use clap::Parser;
use sdash_core::energy::PowerModel;
use sdash_core::validation::{validate_username, ValidationError};
use sdash_refresh::RefreshConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 7;
const MAX_LOG_RETENTION_DAYS: u32 = 365;

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "sdash", version, about = "Terminal dashboard for a Slurm cluster")]
pub struct Args {
    /// Settings file to read instead of the default location.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Seconds between refresh cycles.
    #[arg(long)]
    pub interval: Option<u64>,
    /// User whose jobs and history are shown.
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Run one refresh cycle, print a JSON summary and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_retention_days: u32,
    pub user: Option<String>,
    pub refresh: RefreshConfig,
    pub power: PowerSettings,
}

/// Overrides for the energy estimate; GPU entries extend the built-in table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    pub gpu_tdp_w: BTreeMap<String, u32>,
    pub default_gpu_tdp_w: Option<u32>,
    pub cpu_tdp_per_core_w: Option<u32>,
}

impl PowerSettings {
    pub fn into_model(self) -> PowerModel {
        let mut model = PowerModel::default();
        for (gpu_type, watts) in self.gpu_tdp_w {
            model.gpu_tdp_w.insert(gpu_type.to_ascii_lowercase(), watts);
        }
        if let Some(watts) = self.default_gpu_tdp_w {
            model.default_gpu_tdp_w = watts;
        }
        if let Some(watts) = self.cpu_tdp_per_core_w {
            model.cpu_tdp_per_core_w = watts;
        }
        model
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: None,
            log_dir: None,
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            user: None,
            refresh: RefreshConfig::default(),
            power: PowerSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid settings in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{key}={value} is not valid")]
    InvalidEnv { key: &'static str, value: String },
    #[error("no user given; pass --user or set SDASH_USER")]
    NoUser,
    #[error(transparent)]
    InvalidUser(#[from] ValidationError),
}

/// Everything the binary needs after merging all sources.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub user: String,
    pub refresh: RefreshConfig,
    pub power: PowerModel,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_retention_days: u32,
    pub log_stdout: bool,
    pub debug: bool,
    pub once: bool,
    /// Values that were pulled into range, for logging once logging is up.
    pub notes: Vec<String>,
}

pub fn load_config(args: &Args) -> Result<Config, SettingsError> {
    let config_path = args.config.clone().unwrap_or_else(resolve_config_path);
    let mut settings = load_settings(&config_path)?;

    if let Some(interval) = args.interval {
        settings.refresh.refresh_interval_secs = interval;
    } else if let Some(value) = env_nonempty("SDASH_REFRESH_INTERVAL") {
        settings.refresh.refresh_interval_secs =
            value
                .trim()
                .parse()
                .map_err(|_| SettingsError::InvalidEnv {
                    key: "SDASH_REFRESH_INTERVAL",
                    value: value.clone(),
                })?;
    }
    let mut notes = settings.refresh.sanitize();
    if !(1..=MAX_LOG_RETENTION_DAYS).contains(&settings.log_retention_days) {
        let clamped = settings.log_retention_days.clamp(1, MAX_LOG_RETENTION_DAYS);
        notes.push(format!(
            "log_retention_days {} clamped to {clamped}",
            settings.log_retention_days
        ));
        settings.log_retention_days = clamped;
    }

    let user = resolve_user(args.user.as_deref(), settings.user.as_deref())?;
    let debug = args.debug || env_flag("SDASH_DEBUG")?.unwrap_or(false);
    let log_level = if debug {
        "debug".to_string()
    } else if let Some(level) = env_nonempty("SDASH_LOG_LEVEL") {
        level
    } else {
        settings
            .log_level
            .clone()
            .unwrap_or_else(|| "info".to_string())
    };
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| env_nonempty("SDASH_LOG_DIR").map(PathBuf::from))
        .or_else(|| settings.log_dir.clone())
        .unwrap_or_else(|| resolve_state_dir().join("logs"));

    Ok(Config {
        config_path,
        user,
        refresh: settings.refresh,
        power: settings.power.into_model(),
        log_dir,
        log_level,
        log_retention_days: settings.log_retention_days,
        log_stdout: env_flag("SDASH_LOG_STDOUT")?.unwrap_or(false),
        debug,
        once: args.once,
        notes,
    })
}

/// Reads the settings file; a missing file means defaults.
pub fn load_settings(path: &Path) -> Result<Settings, SettingsError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&contents).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn resolve_user(cli: Option<&str>, file: Option<&str>) -> Result<String, SettingsError> {
    let candidate = cli
        .map(str::to_string)
        .or_else(|| env_nonempty("SDASH_USER"))
        .or_else(|| file.map(str::to_string))
        .or_else(|| env_nonempty("USER"))
        .or_else(|| env_nonempty("LOGNAME"))
        .ok_or(SettingsError::NoUser)?;
    Ok(validate_username(&candidate)?)
}

pub fn resolve_config_path() -> PathBuf {
    if let Some(path) = env_nonempty("SDASH_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    if let Some(dir) = env_nonempty("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("sdash").join("config.toml");
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("sdash")
        .join("config.toml")
}

pub fn resolve_state_dir() -> PathBuf {
    if let Some(dir) = env_nonempty("XDG_STATE_HOME") {
        return PathBuf::from(dir).join("sdash");
    }
    match dirs::home_dir() {
        Some(home) => home.join(".local").join("state").join("sdash"),
        None => PathBuf::from(".sdash/state"),
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_flag(key: &'static str) -> Result<Option<bool>, SettingsError> {
    match env_nonempty(key) {
        Some(value) => parse_bool_flag(&value)
            .map(Some)
            .ok_or(SettingsError::InvalidEnv { key, value }),
        None => Ok(None),
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
