use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use liveroom_proxy::{
    config::{Config, RuntimeSettings},
    database::Database,
    fetcher::Fetcher,
    models::Platform,
    monitor::Monitor,
    pool::ManagerPool,
    repositories::{ConfigRepository, SqliteConfigRepository, SqliteRoomRepository},
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "liveroom-proxy")]
#[command(version = "0.1.0")]
#[command(about = "A local live-room HLS proxy with token refresh and recording")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with specified level
    let log_filter = format!("liveroom_proxy={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting liveroom-proxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    // Override config with CLI arguments
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    info!("Using database: {}", config.database.url);
    let database = Database::new(&config.database).await?;
    database.migrate().await?;

    let room_repo = Arc::new(SqliteRoomRepository::new(database.pool().clone()));
    let config_repo = Arc::new(SqliteConfigRepository::new(database.pool().clone()));

    // Runtime settings: config-file values seeded first, persisted entries
    // override them, later updates arrive through the config API.
    let mut initial = HashMap::new();
    initial.insert(
        Platform::Bilibili.cookie_key().to_string(),
        config.bilibili.cookie.clone(),
    );
    initial.insert(
        Platform::Missevan.cookie_key().to_string(),
        config.missevan.cookie.clone(),
    );
    for entry in config_repo.list_configs().await? {
        initial.insert(entry.key, entry.value);
    }
    let settings = Arc::new(RuntimeSettings::new(initial));

    let fetcher = Arc::new(Fetcher::new(&config.proxy)?);
    let pool = Arc::new(ManagerPool::new());
    let root_cancel = CancellationToken::new();

    let monitor = Monitor::new(
        Arc::clone(&pool),
        room_repo.clone(),
        Arc::clone(&fetcher),
        Arc::clone(&settings),
        config.recorder.clone(),
    );
    monitor.start(&root_cancel);

    // Ctrl-c tears the whole tree down: monitor, managers, recorders, server.
    {
        let monitor = Arc::clone(&monitor);
        let root_cancel = root_cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                monitor.stop();
                root_cancel.cancel();
            }
        });
    }

    let state = AppState {
        config: Arc::new(config),
        pool,
        monitor,
        fetcher,
        settings,
        room_repo,
        config_repo,
        root_cancel,
    };

    let web_server = WebServer::new(state)?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );
    web_server.serve().await?;

    Ok(())
}
