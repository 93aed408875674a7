use std::{process, str::FromStr, sync::Arc, time::Duration};

use almanac::{
    config::{self, Command, ListArgs, RecordArgs, SetStatusArgs, WatchArgs},
    error::AppError,
    infra::{http::HttpTransport, telemetry},
    sync::{
        ChangeCause, EntryState, ListParams, Resource, SessionState, SyncClient, SyncConfig,
        SyncError, actions,
    },
};
use serde::Serialize;
use serde_json::json;
use tracing::{Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = dispatcher::Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let Some(command) = cli_args.command else {
        return Err(AppError::validation(
            "a subcommand is required (list, show, set-status, delete, watch)",
        ));
    };

    let transport = Arc::new(HttpTransport::new(&settings.api)?);
    info!(base_url = %transport.base(), "Connecting to admin API");
    let client = SyncClient::new(SyncConfig::from(&settings.sync), transport);

    match command {
        Command::List(args) => run_list(&client, args).await,
        Command::Show(args) => run_show(&client, args).await,
        Command::SetStatus(args) => run_set_status(&client, args).await,
        Command::Delete(args) => run_delete(&client, args).await,
        Command::Watch(args) => run_watch(&client, args).await,
    }
}

async fn run_list(client: &SyncClient, args: ListArgs) -> Result<(), AppError> {
    let resource = parse_resource(&args.resource)?;
    let params = ListParams {
        status: args.status,
        page: args.page,
        search: args.search,
    };
    let state = client.query(&resource.list_key(&params)).await?;
    print_state(state)
}

async fn run_show(client: &SyncClient, args: RecordArgs) -> Result<(), AppError> {
    let resource = parse_resource(&args.resource)?;
    let state = client.query(&resource.detail_key(&args.id)?).await?;
    print_state(state)
}

async fn run_set_status(client: &SyncClient, args: SetStatusArgs) -> Result<(), AppError> {
    let resource = parse_resource(&args.resource)?;
    let status = resource.parse_status(&args.status).ok_or_else(|| {
        AppError::validation(format!(
            "`{}` is not a valid status for {resource}",
            args.status
        ))
    })?;

    let outcome = actions::set_status(resource, &args.id, status)
        .submit(client)
        .await?;
    print_json(&json!({
        "mutation": outcome.mutation,
        "phase": outcome.phase.as_str(),
        "record": outcome.record,
    }))
}

async fn run_delete(client: &SyncClient, args: RecordArgs) -> Result<(), AppError> {
    let resource = parse_resource(&args.resource)?;
    let outcome = actions::delete(resource, &args.id).submit(client).await?;
    print_json(&json!({
        "mutation": outcome.mutation,
        "phase": outcome.phase.as_str(),
    }))
}

async fn run_watch(client: &SyncClient, args: WatchArgs) -> Result<(), AppError> {
    let resource = parse_resource(&args.resource)?;
    let key = resource.list_key(&ListParams::default());
    let _maintenance = client.spawn_maintenance();
    let (_subscription, mut changes) = client.changes(resource.root_key());
    let mut session = client.session();

    print_state(client.query(&key).await?)?;

    let deadline = async {
        match args.seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let period = client.config().stale_after().max(Duration::from_secs(1));
    let mut refresh = tokio::time::interval(period);
    refresh.tick().await; // Skip the first immediate tick

    loop {
        tokio::select! {
            () = &mut deadline => return Ok(()),
            _ = tokio::signal::ctrl_c() => return Ok(()),
            changed = session.changed() => {
                if changed.is_err() || *session.borrow() == SessionState::ReauthRequired {
                    return Err(SyncError::AuthExpired {
                        message: "the API rejected the configured token".to_string(),
                    }
                    .into());
                }
            }
            _ = refresh.tick() => {
                print_watched(client.query(&key).await?)?;
            }
            Some(notification) = changes.recv() => {
                debug!(
                    changed = %notification.changed,
                    cause = notification.cause.as_str(),
                    "Watched resource changed"
                );
                if notification.cause == ChangeCause::Invalidated {
                    print_watched(client.query(&key).await?)?;
                }
            }
        }
    }
}

fn parse_resource(value: &str) -> Result<Resource, AppError> {
    Resource::from_str(value).map_err(|err| AppError::validation(err.to_string()))
}

fn print_state(state: EntryState) -> Result<(), AppError> {
    if let Some(err) = state.error {
        return Err(err.into());
    }
    print_json(&state.data)
}

/// Like [`print_state`], but a failed refresh only warns; stale data stays on screen.
fn print_watched(state: EntryState) -> Result<(), AppError> {
    match state.error {
        Some(SyncError::AuthExpired { message }) => Err(SyncError::AuthExpired { message }.into()),
        Some(err) => {
            warn!(error = %err, "Refresh failed");
            Ok(())
        }
        None => print_json(&state.data),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{out}");
    Ok(())
}
