mod audit;
mod broadcast;
mod cli;
mod commands;
mod config;
mod control;
mod diagnostics;
mod event;
mod introspect;
mod manager;
mod model;
mod monitored;
mod poller;
mod storage;
mod tracker;
mod webui;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use audit::AuditLog;
use broadcast::EventBroadcaster;
use cli::Cli;
use commands::services::ControlAction;
use config::Config;
use manager::ServiceManager;
use poller::{Poller, PollerSettings, PollerState};

const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    use cli::{Commands, ConfigCommands, LogsCommands, MonitorCommands};

    init_tracing();

    let cli = Cli::parse_args();
    let config_path = Path::new(&cli.config);

    // Commands that must not create a config file as a side effect
    match &cli.command {
        Some(Commands::Config { command }) => {
            return match command {
                ConfigCommands::Show => commands::config::show_config(config_path),
                ConfigCommands::Validate => commands::config::validate_config(config_path),
                ConfigCommands::Init { force } => commands::config::init_config(config_path, *force),
            };
        }
        Some(Commands::Status { url, format }) => {
            return commands::status::run_status(url.clone(), format.clone());
        }
        _ => {}
    }

    let config = Config::load(config_path)?;

    match cli.command {
        Some(Commands::Services { installed, format }) => {
            commands::services::list_services(&config, installed, format)
        }
        Some(Commands::Start { name }) => {
            commands::services::run_control(&config, ControlAction::Start, name)
        }
        Some(Commands::Stop { name }) => {
            commands::services::run_control(&config, ControlAction::Stop, name)
        }
        Some(Commands::Restart { name }) => {
            commands::services::run_control(&config, ControlAction::Restart, name)
        }
        Some(Commands::Unregister { name }) => {
            commands::services::run_control(&config, ControlAction::Unregister, name)
        }
        Some(Commands::Register {
            name,
            binary_path,
            binary_path_alt,
            display_name,
            description,
            startup_type,
            account,
        }) => commands::services::run_register(
            &config,
            name,
            binary_path,
            binary_path_alt,
            display_name,
            description,
            startup_type,
            account,
        ),
        Some(Commands::Monitor { command }) => match command {
            MonitorCommands::Add {
                name,
                display_name,
                description,
                critical,
            } => commands::services::monitor_add(&config, name, display_name, description, critical),
            MonitorCommands::Remove { name } => commands::services::monitor_remove(&config, name),
        },
        Some(Commands::Logs {
            command,
            query,
            format,
        }) => match command {
            None => commands::logs::run_query(&config, query, format),
            Some(LogsCommands::Export {
                output,
                format,
                compress,
                query,
            }) => commands::export::run_export(&config, output, format, compress, query),
            Some(LogsCommands::Prune { keep_days }) => commands::logs::run_prune(&config, keep_days),
        },
        Some(Commands::Config { .. }) | Some(Commands::Status { .. }) => Ok(()),
        Some(Commands::Run) | None => run_server(config, cli.port),
    }
}

fn run_server(config: Config, port_override: Option<u16>) -> Result<()> {
    for problem in config.validate() {
        warn!(problem = %problem, "configuration problem");
    }

    let port = port_override.unwrap_or(config.server.port);
    let bind = config.server.bind.clone();

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let cancel = CancellationToken::new();

    let result = rt.block_on(async {
        let manager = Arc::new(
            ServiceManager::from_config(&config)
                .await
                .with_context(|| format!("Failed to open data directory {}", config.server.data_dir))?,
        );

        let prune_task = tokio::spawn(prune_loop(
            manager.audit().clone(),
            config.monitor.log_retention_days,
            cancel.clone(),
        ));

        // Sync producers -> tokio broadcast for WebSocket subscribers
        let (event_tx, broadcaster) = EventBroadcaster::new();
        let bridge = broadcaster.clone();
        tokio::task::spawn_blocking(move || bridge.run());

        let poller = Poller::new(
            Arc::clone(&manager),
            Arc::new(event_tx),
            PollerSettings::from_config(&config.monitor),
        );
        let poller_task = tokio::spawn(poller.run(PollerState::new(), cancel.clone()));

        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            signal_cancel.cancel();
        });

        info!(
            bind = %bind,
            port,
            data_dir = %config.server.data_dir,
            configured_services = config.monitor.services.len(),
            polling_interval_secs = config.monitor.polling_interval_secs,
            "svcwatch starting"
        );

        let state = webui::AppState {
            manager,
            broadcaster,
            started: Instant::now(),
        };
        let served = webui::start_server(&bind, port, state, cancel.clone()).await;
        // The server also stops when binding fails; take the background tasks down with it
        cancel.cancel();

        if let Err(e) = poller_task.await {
            error!(error = %e, "background poller panicked");
        }
        if let Err(e) = prune_task.await {
            error!(error = %e, "audit prune task panicked");
        }
        served
    });

    rt.shutdown_timeout(SHUTDOWN_GRACE);
    info!("svcwatch stopped");
    result
}

/// Prune expired audit partitions now and then once a day.
async fn prune_loop(audit: AuditLog, keep_days: u32, cancel: CancellationToken) {
    loop {
        let removed = audit.prune_older_than(keep_days).await;
        if removed > 0 {
            info!(removed, keep_days, "pruned audit log");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
        }
    }
}
