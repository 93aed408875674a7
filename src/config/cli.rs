use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the Almanac binary.
#[derive(Debug, Parser)]
#[command(
    name = "almanac",
    version,
    about = "Headless client for the marketplace admin dashboard"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "ALMANAC_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List records of a resource.
    List(ListArgs),
    /// Show one record.
    Show(RecordArgs),
    /// Change the review or publication status of a record.
    #[command(name = "set-status")]
    SetStatus(SetStatusArgs),
    /// Delete a record.
    Delete(RecordArgs),
    /// Keep a list view fresh and print every change.
    Watch(WatchArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ListArgs {
    /// Resource name (users, astrologers, sellers, courses, blogs, notices).
    #[arg(value_name = "RESOURCE")]
    pub resource: String,

    /// Only records with this status.
    #[arg(long, value_name = "STATUS")]
    pub status: Option<String>,

    /// Page number, starting at 1.
    #[arg(long, value_name = "PAGE")]
    pub page: Option<u32>,

    /// Free-text search.
    #[arg(long, value_name = "TEXT")]
    pub search: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct RecordArgs {
    #[arg(value_name = "RESOURCE")]
    pub resource: String,

    #[arg(value_name = "ID")]
    pub id: String,
}

#[derive(Debug, Args, Clone)]
pub struct SetStatusArgs {
    #[arg(value_name = "RESOURCE")]
    pub resource: String,

    #[arg(value_name = "ID")]
    pub id: String,

    /// Target status, e.g. `approve`, `suspend`, `published`.
    #[arg(value_name = "STATUS")]
    pub status: String,
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    #[arg(value_name = "RESOURCE")]
    pub resource: String,

    /// Stop after this many seconds; runs until interrupted when omitted.
    #[arg(long, value_name = "SECONDS")]
    pub seconds: Option<u64>,
}

/// Overrides accepted by every subcommand.
#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the API base URL.
    #[arg(long = "api-url", global = true, value_name = "URL")]
    pub api_url: Option<String>,

    /// Override the API bearer token.
    #[arg(
        long = "api-token",
        global = true,
        env = "ALMANAC_API_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true
    )]
    pub api_token: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        global = true,
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the staleness window of cached entries.
    #[arg(long = "sync-stale-after-ms", global = true, value_name = "MILLIS")]
    pub sync_stale_after_ms: Option<u64>,
}
