//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{fs, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{
    CliArgs, Command, GlobalOverrides, ListArgs, RecordArgs, SetStatusArgs, WatchArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "almanac";
const ENV_PREFIX: &str = "ALMANAC";
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/api/";
const DEFAULT_API_TIMEOUT_SECS: u64 = 10;
const DEFAULT_API_MAX_RETRIES: u32 = 2;
const DEFAULT_API_RETRY_BACKOFF_MS: u64 = 250;
const DEFAULT_SYNC_STALE_AFTER_MS: u64 = 30_000;
const DEFAULT_SYNC_GC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SYNC_GC_IDLE_MS: u64 = 300_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub api: ApiSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Always ends with `/` so relative paths join below it.
    pub base_url: Url,
    pub token: Option<String>,
    pub timeout: Duration,
    /// Extra attempts for network and server failures.
    pub max_retries: u32,
    /// Delay before the first retry; grows linearly per attempt.
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub stale_after_ms: u64,
    pub gc_interval_ms: u64,
    pub gc_idle_ms: u64,
    pub enable_gc: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_global_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    api: RawApiSettings,
    sync: RawSyncSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.api_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
        if let Some(token) = overrides.api_token.as_ref() {
            self.api.token = Some(token.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(stale_after) = overrides.sync_stale_after_ms {
            self.sync.stale_after_ms = Some(stale_after);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, api, sync } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            api: build_api_settings(api)?,
            sync: build_sync_settings(sync)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    base_url: Option<String>,
    token: Option<String>,
    token_file: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    stale_after_ms: Option<u64>,
    gc_interval_ms: Option<u64>,
    gc_idle_ms: Option<u64>,
    enable_gc: Option<bool>,
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let raw_url = api
        .base_url
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let base_url = parse_base_url(raw_url.trim())
        .map_err(|reason| LoadError::invalid("api.base_url", reason))?;

    let token = match (non_blank(api.token), api.token_file) {
        (Some(token), _) => Some(token),
        (None, Some(path)) => {
            let contents = fs::read_to_string(&path).map_err(|err| {
                LoadError::invalid(
                    "api.token_file",
                    format!("failed to read `{}`: {err}", path.display()),
                )
            })?;
            non_blank(Some(contents))
        }
        (None, None) => None,
    };

    let timeout_seconds = api.timeout_seconds.unwrap_or(DEFAULT_API_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "api.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ApiSettings {
        base_url,
        token,
        timeout: Duration::from_secs(timeout_seconds),
        max_retries: api.max_retries.unwrap_or(DEFAULT_API_MAX_RETRIES),
        retry_backoff: Duration::from_millis(
            api.retry_backoff_ms.unwrap_or(DEFAULT_API_RETRY_BACKOFF_MS),
        ),
    })
}

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let gc_interval_ms = sync.gc_interval_ms.unwrap_or(DEFAULT_SYNC_GC_INTERVAL_MS);
    if gc_interval_ms == 0 {
        return Err(LoadError::invalid(
            "sync.gc_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(SyncSettings {
        stale_after_ms: sync.stale_after_ms.unwrap_or(DEFAULT_SYNC_STALE_AFTER_MS),
        gc_interval_ms,
        gc_idle_ms: sync.gc_idle_ms.unwrap_or(DEFAULT_SYNC_GC_IDLE_MS),
        enable_gc: sync.enable_gc.unwrap_or(true),
    })
}

fn parse_base_url(value: &str) -> Result<Url, String> {
    let mut url = Url::parse(value).map_err(|err| format!("invalid URL `{value}`: {err}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme `{}`", url.scheme()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[cfg(test)]
mod tests;
