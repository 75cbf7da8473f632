use anyhow::{Context, Result};
use relaycore::notifier::{NoopNotifier, Notifier};
use relaycore::Relay;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relaybot::cli::{Cli, Commands};
use relaybot::http::{self, AppState, MiniAppLinks};
use relaybot::logging::init_logger;
use relaybot::telegram::TelegramNotifier;
use relaybot::AppConfig;

/// Main entry point for the relay server
///
/// Parses CLI arguments and dispatches to the selected subcommand.
///
/// # Errors
/// Returns an error if initialization fails (logging, configuration, bind).
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Log panics from spawned tasks instead of losing them on stderr
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic caught: {}", panic_info);
    }));

    init_logger()?;

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::PrintConfig) => print_config(&config),
        Some(Commands::Serve { port, offline }) => run(config, port, offline).await,
        None => {
            info!("No command specified, serving with defaults");
            run(config, None, false).await
        }
    }
}

fn print_config(config: &AppConfig) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered);
    println!("token: {}", if config.has_token() { "<set>" } else { "<missing>" });
    Ok(())
}

async fn run(mut config: AppConfig, port: Option<u16>, offline: bool) -> Result<()> {
    if let Some(port) = port {
        config.backend.port = port;
    }

    let (notifier, mode): (Arc<dyn Notifier>, &'static str) = if offline {
        warn!("Offline mode: Telegram notifications are disabled");
        (Arc::new(NoopNotifier), "offline")
    } else {
        let token = config
            .token()
            .context("BOT_TOKEN is not set (config.yaml bot.token or environment)")?;
        let telegram = TelegramNotifier::new(token, config.bot.admin_id)?;
        if config.bot.username.is_none() {
            config.bot.username = telegram.resolve_username().await;
        }
        if config.bot.admin_id.is_none() {
            warn!("ADMIN_ID is not set; submissions without a query id will not reach anyone");
        }
        (Arc::new(telegram), "live")
    };

    let relay = Arc::new(Relay::new(config.relay.clone(), notifier).context("Invalid relay configuration")?);
    let links = MiniAppLinks::new(
        &config.backend.public_static_url,
        &config.api_url(),
        config.bot.username.as_deref(),
    )?;
    info!("Mini App URL: {}", links.url);

    let shutdown = CancellationToken::new();
    let sweeps = relay.maintainer().spawn(shutdown.clone());
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let state = Arc::new(AppState {
        relay,
        links,
        mode,
        shutdown: shutdown.clone(),
    });
    let addr = format!("{}:{}", config.backend.host, config.backend.port);
    let served = http::serve(&addr, state).await;

    shutdown.cancel();
    for sweep in sweeps {
        if let Err(e) = sweep.await {
            warn!("Maintenance task ended abnormally: {}", e);
        }
    }
    served
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
