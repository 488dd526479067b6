use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use wallsync_core::{
    AppPaths, NotificationChannel, REFRESH_CHANNEL_NAME, SYNC_REQUEST_CHANNEL_NAME, SettingsStore,
    SyncStateStore, logging,
};
use wallsync_widgets::{
    HostSink, HostState, NotificationFanout, StoreStatus, WidgetInstanceRegistry, host,
};

const LOG_FILE_NAME: &str = "wallsync-widgets.log";

#[derive(Parser, Debug)]
#[command(
    name = "wallsync-widgets",
    version,
    about = "Serves wallpaper status cards to widget hosts"
)]
struct WidgetArgs {
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,
    /// Seconds between refreshes when no signal arrives.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    poll_seconds: u64,
    #[arg(long, env = "WALLSYNC_CHANNEL", default_value = REFRESH_CHANNEL_NAME)]
    channel: String,
    /// Where the refresh action asks the agent for a sync.
    #[arg(long, env = "WALLSYNC_SYNC_CHANNEL", default_value = SYNC_REQUEST_CHANNEL_NAME)]
    sync_channel: String,
    #[arg(long, env = "WALLSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = WidgetArgs::parse();
    let paths = args
        .data_dir
        .clone()
        .map(AppPaths::with_base)
        .unwrap_or_else(AppPaths::from_env);
    logging::init_file_logging(&paths.log_file(LOG_FILE_NAME));

    let listener = match tokio::net::TcpListener::bind(&args.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind, err);
            eprintln!("failed to bind {}: {err}", args.bind);
            return ExitCode::FAILURE;
        }
    };

    let status = StoreStatus::new(
        SettingsStore::new(paths.settings_file()),
        SyncStateStore::new(paths.state_file()),
    );
    let sink = Arc::new(HostSink::new());
    let fanout = Arc::new(
        NotificationFanout::new(
            Arc::new(WidgetInstanceRegistry::new()),
            Arc::new(status),
            sink.clone(),
        )
        .with_poll_interval(Duration::from_secs(args.poll_seconds))
        .with_sync_requester(Arc::new(NotificationChannel::new(args.sync_channel.clone()))),
    );

    info!(
        bind = %args.bind,
        channel = %args.channel,
        sync_channel = %args.sync_channel,
        data_dir = %paths.base_dir().display(),
        "widget provider starting"
    );
    let channel_listener = fanout.listen(&NotificationChannel::new(args.channel.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = tokio::spawn({
        let fanout = fanout.clone();
        async move { fanout.run(shutdown_rx).await }
    });

    let served = host::serve(listener, HostState::new(fanout, sink), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {err}");
        }
        info!("shutdown requested");
    })
    .await;

    let _ = shutdown_tx.send(true);
    if let Err(err) = poller.await {
        warn!("fan-out task aborted: {err}");
    }
    channel_listener.stop();

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            warn!("widget host exited: {err}");
            ExitCode::FAILURE
        }
    }
}
