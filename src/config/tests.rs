use std::io::Write;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.api.base_url = Some("https://file.example/api".to_string());
    raw.logging.level = Some("info".to_string());

    let overrides = GlobalOverrides {
        api_url: Some("https://cli.example/v2".to_string()),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.api.base_url.as_str(), "https://cli.example/v2/");
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn defaults_are_usable() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.api.base_url.as_str(), DEFAULT_API_BASE_URL);
    assert!(settings.api.token.is_none());
    assert_eq!(settings.api.timeout, Duration::from_secs(10));
    assert_eq!(settings.api.max_retries, 2);
    assert_eq!(settings.sync.stale_after_ms, 30_000);
    assert!(settings.sync.enable_gc);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn invalid_log_level_names_the_key() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("level is rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn base_url_must_be_http() {
    let mut raw = RawSettings::default();
    raw.api.base_url = Some("ftp://example.com/".to_string());

    let err = Settings::from_raw(raw).expect_err("scheme is rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "api.base_url",
            ..
        }
    ));
}

#[test]
fn zero_timeout_is_rejected() {
    let mut raw = RawSettings::default();
    raw.api.timeout_seconds = Some(0);

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn token_file_is_read_and_trimmed() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    writeln!(file, "  secret-token  ").expect("write token");

    let mut raw = RawSettings::default();
    raw.api.token_file = Some(file.path().to_path_buf());
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.api.token.as_deref(), Some("secret-token"));
}

#[test]
fn inline_token_wins_over_token_file() {
    let mut raw = RawSettings::default();
    raw.api.token = Some("inline".to_string());
    raw.api.token_file = Some(PathBuf::from("/nonexistent/token"));
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.api.token.as_deref(), Some("inline"));
}

#[test]
fn missing_token_file_is_reported() {
    let mut raw = RawSettings::default();
    raw.api.token_file = Some(PathBuf::from("/nonexistent/token"));

    let err = Settings::from_raw(raw).expect_err("unreadable file");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "api.token_file",
            ..
        }
    ));
}

#[test]
fn config_file_layers_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    writeln!(
        file,
        "[api]\nbase_url = \"https://file.example/api/\"\n\n[sync]\nstale_after_ms = 500\nenable_gc = false"
    )
    .expect("write config");

    let path = file.path().to_string_lossy().into_owned();
    let args = CliArgs::parse_from(["almanac", "--config-file", &path, "--sync-stale-after-ms", "900"]);
    let settings = load(&args).expect("valid settings");

    assert_eq!(settings.api.base_url.as_str(), "https://file.example/api/");
    assert_eq!(settings.sync.stale_after_ms, 900);
    assert!(!settings.sync.enable_gc);
}

#[test]
fn parse_list_arguments() {
    let args = CliArgs::parse_from([
        "almanac",
        "list",
        "sellers",
        "--status",
        "pending",
        "--page",
        "2",
    ]);

    match args.command.expect("list command") {
        Command::List(list) => {
            assert_eq!(list.resource, "sellers");
            assert_eq!(list.status.as_deref(), Some("pending"));
            assert_eq!(list.page, Some(2));
            assert!(list.search.is_none());
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_set_status_with_global_overrides() {
    let args = CliArgs::parse_from([
        "almanac",
        "set-status",
        "astrologers",
        "a7",
        "approve",
        "--api-url",
        "https://admin.example/api",
        "--log-json",
        "yes",
    ]);

    assert_eq!(
        args.overrides.api_url.as_deref(),
        Some("https://admin.example/api")
    );
    assert_eq!(args.overrides.log_json, Some(true));
    match args.command.expect("set-status command") {
        Command::SetStatus(set) => {
            assert_eq!(set.resource, "astrologers");
            assert_eq!(set.id, "a7");
            assert_eq!(set.status, "approve");
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_watch_arguments() {
    let args = CliArgs::parse_from(["almanac", "watch", "notices", "--seconds", "30"]);

    match args.command.expect("watch command") {
        Command::Watch(watch) => {
            assert_eq!(watch.resource, "notices");
            assert_eq!(watch.seconds, Some(30));
        }
        _ => panic!("wrong command parsed"),
    }
}
