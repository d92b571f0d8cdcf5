//! `voxline` - headless host for the voice intake assistant.

mod settings;
mod state;
mod storage;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use voxline_core::audio::{list_input_devices, list_output_devices};
use voxline_core::{
    CpalHost, NoticeLevel, SessionManager, SessionStatus, SubmitApplicationTool, ToolRegistry,
    WebSocketTransport,
};

use settings::{
    apply_runtime_env_from_settings, default_settings_path, load_settings, normalize_voice_name,
    save_settings, websocket_config_from_env,
};
use state::AppState;
use storage::ApplicationStore;

/// Voxline - real-time voice intake assistant
#[derive(Parser)]
#[command(name = "voxline", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Settings file (defaults to the app data directory)
    #[arg(long, env = "VOXLINE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Application records database
    #[arg(long, env = "VOXLINE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one live voice session until Ctrl-C or the backend hangs up
    Talk {
        /// Input device name (overrides settings)
        #[arg(short, long)]
        device: Option<String>,
        /// Prebuilt voice (overrides settings)
        #[arg(long)]
        voice: Option<String>,
    },
    /// List audio devices
    Devices,
    /// Show recorded applications, newest first
    Applications {
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the effective settings
    Settings {
        /// Write the effective settings back to disk
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,voxline=info",
        1 => "warn,voxline=debug",
        _ => "debug,voxline=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let app_settings = load_settings(&settings_path);
    debug!(settings_path = ?settings_path, "settings loaded");

    let db_path = cli.db.unwrap_or_else(ApplicationStore::default_db_path);
    let store = ApplicationStore::new(db_path).map_err(anyhow::Error::msg)?;
    let state = AppState::new(app_settings, settings_path, store);

    match cli.command {
        Command::Talk { device, voice } => talk(&state, device, voice).await,
        Command::Devices => {
            print_devices();
            Ok(())
        }
        Command::Applications { limit, json } => print_applications(&state, limit, json),
        Command::Settings { write } => {
            if write {
                save_settings(&state.settings_path, &state.settings)?;
                info!(path = ?state.settings_path, "settings written");
            }
            let mut shown = state.settings.clone();
            if shown.api_key.is_some() {
                shown.api_key = Some("<redacted>".into());
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

async fn talk(state: &AppState, device: Option<String>, voice: Option<String>) -> anyhow::Result<()> {
    apply_runtime_env_from_settings(&state.settings);
    let ws_config = websocket_config_from_env();
    if ws_config.api_key.is_none() {
        warn!("no API key configured; set VOXLINE_API_KEY or apiKey in settings.json");
    }
    info!(endpoint = %ws_config.endpoint, model = %ws_config.model, "backend selected");

    let mut config = state.settings.engine_config();
    if let Some(device) = device {
        config.preferred_input_device = Some(device);
    }
    if let Some(voice) = voice {
        config.voice_name = normalize_voice_name(&voice);
    }

    let manager = SessionManager::new(
        config,
        Arc::new(CpalHost::new()),
        Arc::new(WebSocketTransport::new(ws_config)),
    );
    let mut tools = ToolRegistry::new();
    tools.register(SubmitApplicationTool::new(
        state.application_sink(),
        manager.notifier(),
    ));
    let manager = manager.with_tools(tools);

    let forwarders = spawn_forwarders(&manager, state);
    let mut status_rx = manager.subscribe_status();

    let session_id = manager.connect().await?;
    info!(session_id = %session_id, "listening; press Ctrl-C to end the session");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            event = status_rx.recv() => match event {
                Ok(event) if matches!(event.status, SessionStatus::Closed | SessionStatus::Error) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.disconnect();
    *state.current_session.write() = None;
    for task in forwarders {
        task.abort();
    }

    let diag = manager.diagnostics_snapshot();
    info!(
        frames_sent = diag.frames_sent,
        frames_dropped = diag.frames_dropped,
        chunks_scheduled = diag.chunks_scheduled,
        interruptions = diag.interruptions,
        tool_calls = diag.tool_calls_dispatched,
        "session summary"
    );

    match manager.last_error() {
        Some(reason) => anyhow::bail!("session ended abnormally: {reason}"),
        None => Ok(()),
    }
}

/// Forward the engine's broadcast channels to the log, and keep the current
/// session id up to date for new application records.
fn spawn_forwarders(
    manager: &SessionManager,
    state: &AppState,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut status_rx = manager.subscribe_status();
    let current_session = Arc::clone(&state.current_session);
    let status = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => {
                    *current_session.write() = match event.status {
                        SessionStatus::Connecting | SessionStatus::Open => {
                            Some(event.session_id.clone())
                        }
                        _ => None,
                    };
                    info!(
                        session_id = %event.session_id,
                        status = ?event.status,
                        detail = event.detail.as_deref().unwrap_or(""),
                        "session status"
                    );
                }
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut activity_rx = manager.subscribe_activity();
    let activity = tokio::spawn(async move {
        loop {
            match activity_rx.recv().await {
                Ok(event) => debug!(
                    seq = event.seq,
                    volume = event.volume,
                    speaking = event.is_speaking,
                    "activity"
                ),
                Err(RecvError::Lagged(n)) => debug!("activity receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut notice_rx = manager.subscribe_notifications();
    let notices = tokio::spawn(async move {
        loop {
            match notice_rx.recv().await {
                Ok(notice) => match notice.level {
                    NoticeLevel::Error => warn!(title = %notice.title, "{}", notice.message),
                    NoticeLevel::Info | NoticeLevel::Success => {
                        info!(title = %notice.title, "{}", notice.message)
                    }
                },
                Err(RecvError::Lagged(n)) => warn!("notification receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    vec![status, activity, notices]
}

fn print_devices() {
    let inputs = list_input_devices();
    let outputs = list_output_devices();
    if inputs.is_empty() && outputs.is_empty() {
        println!("no audio devices found");
        return;
    }
    for device in inputs.iter().chain(outputs.iter()) {
        println!(
            "{:<7} {}{}",
            format!("{:?}", device.direction).to_ascii_lowercase(),
            device.name,
            if device.is_default { "  (default)" } else { "" }
        );
    }
}

fn print_applications(state: &AppState, limit: usize, json: bool) -> anyhow::Result<()> {
    let items = state
        .store
        .list_applications(limit)
        .map_err(anyhow::Error::msg)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("no applications recorded");
        return Ok(());
    }
    let total = state.store.count_applications().map_err(anyhow::Error::msg)?;
    println!("showing {} of {total} applications", items.len());
    for item in items {
        println!(
            "{}  {:<18}  {}",
            item.created_at, item.qualification_status, item.reasoning
        );
    }
    Ok(())
}
