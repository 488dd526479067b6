use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use wallsync_agent::{
    ImageAcquirer, RetentionManager, SyncOrchestrator, SyncScheduler, SystemDesktop, TickOutcome,
    autostart,
};
use wallsync_core::{
    AppPaths, NotificationChannel, REFRESH_CHANNEL_NAME, SYNC_REQUEST_CHANNEL_NAME, SettingsStore,
    SourceKind, SyncStateStore, logging,
};

const LOG_FILE_NAME: &str = "wallsync-agent.log";

#[derive(Parser, Debug)]
#[command(name = "wallsync", version, about = "Keeps the desktop wallpaper in sync")]
struct Cli {
    /// Data directory holding settings, state, logs and downloaded wallpapers.
    #[arg(long, env = "WALLSYNC_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,
    /// Default settings copied into the data directory on first use.
    #[arg(long, env = "WALLSYNC_BUNDLED_SETTINGS", global = true)]
    bundled_settings: Option<PathBuf>,
    #[arg(long, env = "WALLSYNC_CHANNEL", default_value = REFRESH_CHANNEL_NAME, global = true)]
    channel: String,
    /// Channel a running agent listens on for "sync now" requests.
    #[arg(
        long,
        env = "WALLSYNC_SYNC_CHANNEL",
        default_value = SYNC_REQUEST_CHANNEL_NAME,
        global = true
    )]
    sync_channel: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync on a timer until Ctrl-C.
    Run {
        #[arg(long)]
        background: bool,
    },
    /// Sync now, even while disabled. A running agent does the work when
    /// there is one.
    Refresh,
    Status,
    Enable,
    Disable,
    /// Mark onboarding as complete.
    Onboarded,
    ResetStats,
    Autostart {
        #[command(subcommand)]
        action: AutostartAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum AutostartAction {
    On,
    Off,
    Status,
}

struct Agent {
    paths: AppPaths,
    settings: Arc<SettingsStore>,
    state: Arc<SyncStateStore>,
    channel: NotificationChannel,
    sync_requests: NotificationChannel,
}

impl Agent {
    fn from_cli(cli: &Cli) -> Self {
        let paths = cli
            .data_dir
            .clone()
            .map(AppPaths::with_base)
            .unwrap_or_else(AppPaths::from_env);
        let mut settings = SettingsStore::new(paths.settings_file());
        if let Some(bundled) = cli
            .bundled_settings
            .clone()
            .or_else(AppPaths::bundled_settings_file)
        {
            settings = settings.with_bundled_default(bundled);
        }
        Self {
            state: Arc::new(SyncStateStore::new(paths.state_file())),
            settings: Arc::new(settings),
            channel: NotificationChannel::new(cli.channel.clone()),
            sync_requests: NotificationChannel::new(cli.sync_channel.clone()),
            paths,
        }
    }

    fn scheduler(&self) -> Result<SyncScheduler<ImageAcquirer, SystemDesktop>, String> {
        let acquirer = ImageAcquirer::new(self.paths.artifact_dir()).map_err(|e| e.to_string())?;
        let orchestrator = SyncOrchestrator::new(
            self.settings.clone(),
            acquirer,
            SystemDesktop,
            self.state.clone(),
            RetentionManager::new(self.paths.artifact_dir()),
            Arc::new(self.channel.clone()),
        );
        Ok(SyncScheduler::new(Arc::new(orchestrator))
            .with_tick_lock(self.paths.tick_lock_file()))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let agent = Agent::from_cli(&cli);
    if let Err(err) = agent.paths.ensure_dirs() {
        eprintln!(
            "failed to create data directory {}: {err}",
            agent.paths.base_dir().display()
        );
    }
    logging::init_file_logging(&agent.paths.log_file(LOG_FILE_NAME));

    match cli.command {
        Command::Run { background } => run(&agent, background).await,
        Command::Refresh => refresh(&agent).await,
        Command::Status => {
            print_status(&agent);
            ExitCode::SUCCESS
        }
        Command::Enable => {
            agent.state.set_enabled(true);
            println!("sync enabled");
            ExitCode::SUCCESS
        }
        Command::Disable => {
            agent.state.set_enabled(false);
            println!("sync paused");
            ExitCode::SUCCESS
        }
        Command::Onboarded => {
            agent.state.mark_first_run_complete();
            println!("onboarding marked complete");
            ExitCode::SUCCESS
        }
        Command::ResetStats => {
            agent.state.reset_counters();
            println!("statistics reset");
            ExitCode::SUCCESS
        }
        Command::Autostart { action } => autostart_command(action),
    }
}

async fn run(agent: &Agent, background: bool) -> ExitCode {
    let scheduler = match agent.scheduler() {
        Ok(scheduler) => Arc::new(scheduler),
        Err(err) => {
            error!("failed to start: {err}");
            eprintln!("failed to start: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        background,
        data_dir = %agent.paths.base_dir().display(),
        "wallsync agent starting"
    );
    if !background {
        println!(
            "syncing wallpaper, logs at {} (Ctrl-C to stop)",
            agent.paths.log_file(LOG_FILE_NAME).display()
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.start(shutdown_rx).await }
    });
    let requests = agent.sync_requests.listen({
        let scheduler = scheduler.clone();
        move || scheduler.request_tick()
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {err}");
    }
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    requests.stop();

    match task.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            error!("scheduler failed: {err}");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("scheduler task aborted: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn refresh(agent: &Agent) -> ExitCode {
    match agent.sync_requests.signal() {
        Ok(true) => {
            info!(channel = %agent.sync_requests.name(), "sync handed to the running agent");
            println!("sync requested from the running agent");
            return ExitCode::SUCCESS;
        }
        Ok(false) => {}
        Err(err) => warn!("sync request signal failed, syncing here: {err}"),
    }

    let scheduler = match agent.scheduler() {
        Ok(scheduler) => scheduler,
        Err(err) => {
            eprintln!("failed to start: {err}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = scheduler.tick_now().await;
    match &outcome {
        TickOutcome::Success { artifact } => println!("wallpaper updated: {}", artifact.display()),
        TickOutcome::FallbackApplied { artifact, cause } => {
            println!("download failed ({cause}); kept {}", artifact.display());
        }
        TickOutcome::Failed(err) => println!("sync failed: {err}"),
        TickOutcome::ConfigurationError(err) => println!("configuration error: {err}"),
        TickOutcome::Paused => println!("sync is paused"),
        TickOutcome::Skipped => println!("a sync is already running"),
    }
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_status(agent: &Agent) {
    let state = agent.state.load();
    println!("data directory:   {}", agent.paths.base_dir().display());
    println!(
        "status:           {}",
        if state.is_enabled { "Active" } else { "Paused" }
    );
    println!("first run:        {}", state.is_first_run);
    match state.last_update_time {
        Some(at) => println!("last update:      {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("last update:      Never"),
    }
    match &state.last_known_good_path {
        Some(path) => println!("current wallpaper: {}", path.display()),
        None => println!("current wallpaper: none"),
    }
    println!(
        "successes/failures: {}/{}",
        state.success_count, state.failure_count
    );

    match agent.settings.read() {
        Ok(settings) => {
            match settings.source_kind {
                SourceKind::Url => println!("source:           {}", settings.image_url),
                SourceKind::LocalFile => println!(
                    "source:           {}",
                    settings
                        .local_image_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                ),
            }
            println!("interval:         {} min", settings.refresh_interval_minutes);
            println!("fit mode:         {}", settings.fit_mode);
            if let Err(err) = settings.validate() {
                println!("settings problem: {err}");
            }
        }
        Err(err) => println!("settings:         unavailable ({err})"),
    }
}

fn autostart_command(action: AutostartAction) -> ExitCode {
    let exe = match autostart::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match action {
        AutostartAction::On => autostart::set_enabled(&exe, autostart::RUN_VALUE_NAME, true),
        AutostartAction::Off => autostart::set_enabled(&exe, autostart::RUN_VALUE_NAME, false),
        AutostartAction::Status => Ok(()),
    };
    if let Err(err) = result {
        error!("autostart update failed: {err}");
        eprintln!("autostart update failed: {err}");
        return ExitCode::FAILURE;
    }

    match autostart::is_enabled(&exe, autostart::RUN_VALUE_NAME) {
        Ok(enabled) => {
            println!("autostart {}", if enabled { "on" } else { "off" });
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("autostart query failed: {err}");
            ExitCode::FAILURE
        }
    }
}
