use chrono::Utc;
use clap::Parser;
use spikewatch::adapters::{
    ChatTransport, DexScreenerClient, PostgresStore, RecordingTransport, TelegramTransport,
};
use spikewatch::cli::{Cli, Commands};
use spikewatch::config::{AppConfig, LoggingConfig};
use spikewatch::coordination::{boot, install_signal_handlers, App};
use spikewatch::error::{Result, SpikeError};
use spikewatch::persistence::DocumentStore;
use spikewatch::services::{HealthServer, HealthState};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Seconds between store checks feeding the readiness endpoint
const STORE_CHECK_INTERVAL_SECS: u64 = 30;

/// Messages a dry run keeps in memory after logging them
const DRY_RUN_MESSAGE_BUFFER: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    init_logging(&config.logging);

    if let Err(mut errors) = config.validate() {
        if cli.dry_run {
            errors.retain(|e| !e.contains("bot_token"));
        }
        if !errors.is_empty() {
            for e in &errors {
                error!("Invalid configuration: {}", e);
            }
            return Err(SpikeError::Validation(errors.join("; ")));
        }
    }

    match cli.command() {
        Commands::Run => run_service(config, cli.dry_run).await?,
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
        }
        Commands::EnforceLimits => {
            let app = assemble(config, cli.dry_run).await?;
            let changed = app.tiers.enforce_all().await?;
            app.cache.rebuild_tracked_index().await?;
            info!("Trimmed {} watch lists", changed);
        }
        Commands::CheckExpiry => {
            let app = assemble(config, cli.dry_run).await?;
            let summary = app.expiry.run_pass(Utc::now()).await?;
            info!("Expiry pass: {:?}", summary);
        }
        Commands::MarkRestart => {
            let app = assemble(config, cli.dry_run).await?;
            let marked = app.recovery.mark_active_users().await?;
            info!("Marked {} users for restart", marked.len());
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> Result<PostgresStore> {
    PostgresStore::new(&config.database.url, config.database.max_connections).await
}

fn transport(config: &AppConfig, dry_run: bool) -> Result<Arc<dyn ChatTransport>> {
    if dry_run {
        warn!("Dry run: messages are recorded, not sent");
        return Ok(Arc::new(RecordingTransport::bounded(DRY_RUN_MESSAGE_BUFFER)));
    }
    Ok(Arc::new(TelegramTransport::new(&config.chat)?))
}

/// Wire the service for a one-shot command with users loaded, nothing started
async fn assemble(config: AppConfig, dry_run: bool) -> Result<App> {
    let store: Arc<dyn DocumentStore> = Arc::new(connect(&config).await?);
    store
        .ping()
        .await
        .map_err(|e| SpikeError::PersistenceUnavailable(e.to_string()))?;
    let market = Arc::new(DexScreenerClient::new(&config.market)?);
    let transport = transport(&config, dry_run)?;

    let app = App::assemble(config, store, market, transport);
    app.cache.load_users().await?;
    app.cache.load_tracked_index().await?;
    Ok(app)
}

async fn run_service(config: AppConfig, dry_run: bool) -> Result<()> {
    info!("Starting spikewatch");

    let postgres = connect(&config).await?;
    postgres.migrate().await?;
    let store: Arc<dyn DocumentStore> = Arc::new(postgres);
    let market = Arc::new(DexScreenerClient::new(&config.market)?);
    let transport = transport(&config, dry_run)?;

    let health_port = config.health_port;
    let poll_interval = config.monitor.poll_interval_secs;

    let app = boot(config, Arc::clone(&store), market, transport).await?;
    install_signal_handlers(Arc::clone(&app.shutdown));

    let health_state = Arc::new(
        HealthState::new()
            .with_metrics(Arc::clone(&app.metrics))
            .with_monitor_flag(app.runner.running_flag())
            .with_poll_interval(poll_interval),
    );
    health_state.record_store_check(true).await;

    if let Some(port) = health_port {
        let server = HealthServer::new(Arc::clone(&health_state), port);
        let token = app.shutdown.token();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                error!("Health server failed: {}", e);
            }
        });
    }

    // Store check
    {
        let state = Arc::clone(&health_state);
        let store = Arc::clone(&store);
        let mut token = app.shutdown.token();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(STORE_CHECK_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let ok = store.ping().await.is_ok();
                        if !ok {
                            warn!("Document store unreachable");
                        }
                        state.record_store_check(ok).await;
                    }
                }
            }
        });
    }

    info!("spikewatch running, press Ctrl+C to stop");
    let mut token = app.shutdown.token();
    token.cancelled().await;

    app.shutdown().await;
    info!("spikewatch stopped");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},spikewatch=debug,sqlx=warn", logging.level))
    });

    // `rolling::daily` panics if it can't create the first file, so check writability first
    let file_layer = logging.directory.as_deref().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir, e
            );
            return None;
        }
        let test_path = std::path::Path::new(log_dir).join(".spikewatch_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(log_dir, "spikewatch.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard alive for the whole process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let (json_layer, console_layer) = if logging.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if let Some(dir) = logging.directory.as_deref() {
        eprintln!("Logging to: {}/spikewatch.log", dir);
    }
}
