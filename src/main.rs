mod config;
mod engine;
mod error;
mod exchange;
mod notifications;
mod numeric;
mod persistence;
mod startup;
mod strategy;
mod types;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use engine::{HealthMonitor, OrderPlacer, Orchestrator, PauseController};
use exchange::{BinanceClient, BinanceKlineStream, CandleSource, ExchangeClient, TradingRulesCache};
use notifications::Notifier;
use persistence::{Database, PersistenceStore, TransactionManager};
use startup::StartupValidator;
use types::{CycleState, PauseReason};

const EVENT_RETENTION_DAYS: u32 = 90;

#[derive(Parser)]
#[command(name = "dca-trading-bot")]
#[command(author = "Trading Bot")]
#[command(version = "0.1.0")]
#[command(about = "Automated BTC/USDT dollar-cost-averaging bot for Binance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading loop
    Run,
    /// Run the startup gates and print the report without trading
    Validate,
    /// Show the persisted cycle state and pause status
    Status,
    /// Manually pause the strategy
    Pause {
        /// Reason shown in the pause record
        #[arg(short, long, default_value = "operator pause")]
        message: String,
    },
    /// Resume a paused strategy
    Resume {
        /// Skip the connectivity/balance/config checks
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    info!("DCA Trading Bot v0.1.0");

    let app = AppConfig::from_env()?;

    match cli.command {
        Commands::Run => run_bot(app).await,
        Commands::Validate => run_validation(app).await,
        Commands::Status => show_status(app).await,
        Commands::Pause { message } => pause_bot(app, message).await,
        Commands::Resume { force } => resume_bot(app, force).await,
    }
}

struct Bootstrap {
    app: AppConfig,
    config: config::StrategyConfig,
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<Database>,
    notifier: Arc<Notifier>,
}

/// Shared wiring: store, exchange, notifier and the active strategy config
/// (created from defaults on first boot).
async fn bootstrap(app: AppConfig) -> Result<Bootstrap> {
    let store = Arc::new(Database::new(&app.database_url).await?);

    let config = match store.load_active_config().await? {
        Some(config) => config,
        None => {
            let config = config::StrategyConfig {
                initial_capital_usdt: app.initial_capital_usdt,
                ..Default::default()
            };
            info!("No active strategy config found, seeding defaults");
            store.save_config(&config).await?;
            store
                .append_event(
                    &app.bot_id,
                    types::BotEventType::ConfigUpdated,
                    &serde_json::json!({ "seeded": true, "symbol": config.symbol }),
                )
                .await?;
            config
        }
    };
    if let Err(errors) = config.validate() {
        return Err(anyhow!("invalid strategy config: {}", errors.join("; ")));
    }

    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinanceClient::new(
        app.api_key.clone(),
        app.api_secret.clone(),
        app.use_testnet,
    ));
    let notifier = Arc::new(Notifier::new(app.webhook_url.clone()));

    Ok(Bootstrap {
        app,
        config,
        exchange,
        store,
        notifier,
    })
}

async fn run_bot(app: AppConfig) -> Result<()> {
    let boot = bootstrap(app).await?;
    let store_dyn: Arc<dyn PersistenceStore> = boot.store.clone();

    // Startup gates
    let last_state = boot.store.load_state(&boot.app.bot_id).await?;
    let validator = StartupValidator::new(Arc::clone(&boot.exchange), Arc::clone(&store_dyn));
    let report = validator
        .validate(&boot.app, &boot.config, last_state.as_ref())
        .await?;
    for issue in report.warnings() {
        warn!("Startup warning ({:?}): {}", issue.kind, issue.message);
    }
    if report.is_fatal() {
        for issue in &report.issues {
            if issue.fatal {
                error!("Startup failure ({:?}): {}", issue.kind, issue.message);
            }
        }
        return Err(anyhow!("startup validation failed"));
    }

    // First boot creates the cycle state from the configured capital
    if last_state.is_none() {
        let state = CycleState::new(
            boot.app.bot_id.clone(),
            boot.config.initial_capital_usdt,
            boot.config.max_purchases,
        );
        boot.store.insert_state(&state).await?;
        info!(
            "Created cycle state with {} USDT over {} purchases",
            state.capital_available, boot.config.max_purchases
        );
    }

    let pause = Arc::new(PauseController::new(
        boot.app.bot_id.clone(),
        Arc::clone(&store_dyn),
        Arc::clone(&boot.exchange),
        Arc::clone(&boot.notifier),
    ));
    pause.init_from_store().await?;

    let rules = Arc::new(TradingRulesCache::new(Arc::clone(&boot.exchange)));
    rules.get_rules(&boot.config.symbol, true).await?;
    let _rules_refresh = rules.spawn_auto_refresh(
        boot.config.symbol.clone(),
        std::time::Duration::from_secs(6 * 60 * 60),
        |e| warn!("Trading rules refresh failed: {}", e),
    );

    let health = Arc::new(HealthMonitor::new(boot.app.monitoring.clone()));
    let _health_tick = health.spawn_periodic(Arc::clone(&boot.notifier));

    spawn_event_cleanup(Arc::clone(&store_dyn));

    let placer = OrderPlacer::new(
        Arc::clone(&boot.exchange),
        Arc::clone(&rules),
        boot.config.symbol.clone(),
    );
    let mut orchestrator = Orchestrator::new(
        boot.app.bot_id.clone(),
        boot.config.clone(),
        boot.app.monitoring.clone(),
        Arc::clone(&boot.exchange),
        Arc::clone(&store_dyn),
        rules,
        placer,
        pause,
        Arc::clone(&boot.notifier),
        health,
    );

    orchestrator.start().await?;

    let stream = BinanceKlineStream::new(boot.config.symbol.clone(), boot.config.timeframe);
    let events = stream.subscribe().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received termination signal");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator.run(events, shutdown_rx).await?;
    Ok(())
}

fn spawn_event_cleanup(store: Arc<dyn PersistenceStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.cleanup_old_events(EVENT_RETENTION_DAYS).await {
                Ok(count) if count > 0 => info!("Cleaned up {} old events", count),
                Ok(_) => {}
                Err(e) => warn!("Event cleanup failed: {}", e),
            }
        }
    });
}

async fn run_validation(app: AppConfig) -> Result<()> {
    let boot = bootstrap(app).await?;
    let store_dyn: Arc<dyn PersistenceStore> = boot.store.clone();
    let last_state = boot.store.load_state(&boot.app.bot_id).await?;

    let validator = StartupValidator::new(Arc::clone(&boot.exchange), store_dyn);
    let report = validator
        .validate(&boot.app, &boot.config, last_state.as_ref())
        .await?;

    if report.issues.is_empty() {
        info!("All startup gates passed");
    }
    for issue in &report.issues {
        if issue.fatal {
            error!("FATAL ({:?}): {}", issue.kind, issue.message);
        } else {
            warn!("warning ({:?}): {}", issue.kind, issue.message);
        }
    }
    if report.is_fatal() {
        return Err(anyhow!("validation failed"));
    }
    Ok(())
}

async fn show_status(app: AppConfig) -> Result<()> {
    let store = Database::new(&app.database_url).await?;

    match store.load_state(&app.bot_id).await? {
        Some(state) => {
            info!(
                "Cycle {}: {} | capital {} USDT | BTC {} (net {}) | purchases left {} | ref {:?} | ath {} | v{}",
                state.id,
                state.status,
                state.capital_available,
                state.btc_accumulated,
                state.btc_accum_net,
                state.purchases_remaining,
                state.reference_price,
                state.ath_price,
                state.version,
            );
        }
        None => info!("No cycle state yet (bot has not run)"),
    }

    match store.active_pause().await? {
        Some(pause) => warn!(
            "PAUSED since {} ({}): {}",
            pause.paused_at, pause.reason, pause.message
        ),
        None => info!("Not paused"),
    }
    Ok(())
}

async fn pause_bot(app: AppConfig, message: String) -> Result<()> {
    let boot = bootstrap(app).await?;
    let store_dyn: Arc<dyn PersistenceStore> = boot.store.clone();
    let pause = PauseController::new(
        boot.app.bot_id.clone(),
        store_dyn,
        Arc::clone(&boot.exchange),
        Arc::clone(&boot.notifier),
    );
    pause.init_from_store().await?;
    pause
        .pause(PauseReason::Manual, &message, serde_json::json!({}))
        .await?;
    info!("Paused: {}", message);
    Ok(())
}

async fn resume_bot(app: AppConfig, force: bool) -> Result<()> {
    let boot = bootstrap(app).await?;
    let store_dyn: Arc<dyn PersistenceStore> = boot.store.clone();

    let state = boot
        .store
        .load_state(&boot.app.bot_id)
        .await?
        .ok_or_else(|| anyhow!("no cycle state to resume"))?;

    let pause = PauseController::new(
        boot.app.bot_id.clone(),
        Arc::clone(&store_dyn),
        Arc::clone(&boot.exchange),
        Arc::clone(&boot.notifier),
    );
    pause.init_from_store().await?;

    // Clear any stuck journal entries before trading resumes
    let txn = TransactionManager::new(store_dyn);
    let recovery = txn.recover_incomplete_wal(&boot.app.bot_id).await?;
    if recovery.total > 0 {
        info!(
            "WAL recovery: {} recovered, {} unrecoverable",
            recovery.recovered, recovery.failed
        );
    }

    match pause
        .resume(&boot.config, state.capital_available, force)
        .await?
    {
        Some(entry) => info!("Resumed (was paused since {})", entry.paused_at),
        None => info!("Bot was not paused"),
    }
    Ok(())
}
