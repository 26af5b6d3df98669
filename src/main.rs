use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tradewind::adapters::{BrokerApi, PaperBroker, RestBroker};
use tradewind::cli::{Cli, Commands};
use tradewind::config::AppConfig;
use tradewind::engine::{OrderExecutor, RiskManager, SignalMonitor, StrategyScheduler};
use tradewind::error::{Result, TradewindError};
use tradewind::gateway::Gateway;
use tradewind::store::MemoryStore;
use tradewind::stream::{MarketDataFeed, StreamHub};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config_dir)?;
    init_logging(&config);

    match cli.command {
        Commands::Run { dry_run } => {
            let mut config = config;
            if dry_run {
                config.dry_run.enabled = true;
            }
            run_engine(config).await
        }
        Commands::Stream => run_stream_only(config).await,
        Commands::Account => show_account(config).await,
        Commands::CheckConfig => {
            info!("configuration OK");
            Ok(())
        }
    }
}

fn load_config(config_dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("config error: {}", error);
        }
        return Err(TradewindError::Validation(format!(
            "{} configuration error(s)",
            errors.len()
        )));
    }
    Ok(config)
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,tradewind={}", config.logging.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_broker(config: &AppConfig) -> Result<Arc<dyn BrokerApi>> {
    if config.dry_run.enabled {
        info!("dry run mode: using in-process paper broker");
        return Ok(Arc::new(PaperBroker::new()));
    }
    let api_key = config
        .broker
        .api_key
        .clone()
        .ok_or_else(|| TradewindError::Validation("broker.api_key is required".into()))?;
    let api_secret = config
        .broker
        .api_secret
        .clone()
        .ok_or_else(|| TradewindError::Validation("broker.api_secret is required".into()))?;
    let broker = RestBroker::new(
        &config.broker.rest_url,
        api_key,
        api_secret,
        config.gateway.request_timeout(),
    )?;
    Ok(Arc::new(broker))
}

async fn run_engine(config: AppConfig) -> Result<()> {
    info!(dry_run = config.dry_run.enabled, "starting tradewind engine");

    let broker = build_broker(&config)?;
    let gateway = Arc::new(Gateway::new(broker, config.gateway.clone()));
    let store = Arc::new(MemoryStore::new());

    let (breach_tx, mut breach_rx) = mpsc::channel(256);
    let monitor = Arc::new(SignalMonitor::new(gateway.clone()));
    let risk = Arc::new(RiskManager::new(gateway.clone(), breach_tx));
    let executor = Arc::new(OrderExecutor::new(gateway.clone(), store.clone()));
    let scheduler = Arc::new(StrategyScheduler::new(
        store.clone(),
        gateway.clone(),
        monitor,
        risk,
        executor.clone(),
        config.scheduler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Breach events currently terminate in the log; a notification sink can
    // take this receiver later.
    tokio::spawn(async move {
        while let Some(event) = breach_rx.recv().await {
            warn!(
                rule_id = %event.rule_id,
                strategy_id = ?event.strategy_id,
                action = ?event.action,
                message = %event.message,
                "risk rule breached"
            );
        }
    });

    // Resting limit and bracket orders only reach terminal state through
    // this reconciliation poll.
    let poll_period = std::time::Duration::from_secs(config.scheduler.order_poll_secs.max(1));
    tokio::spawn(
        executor
            .clone()
            .run_poll_loop(poll_period, shutdown_rx.clone()),
    );

    let (hub, commands_rx) = StreamHub::new(config.stream.client_queue_size);
    let feed = MarketDataFeed::new(&config.broker.ws_url, hub.clone(), config.stream.clone());
    let feed_shutdown = shutdown_rx.clone();
    if !config.dry_run.enabled {
        tokio::spawn(feed.run(commands_rx, feed_shutdown));
    }

    let bind_addr = config.stream.bind_addr.clone();
    let ws_hub = hub.clone();
    tokio::spawn(async move {
        if let Err(err) = tradewind::stream::ws::serve(ws_hub, &bind_addr).await {
            error!(error = %err, "stream endpoint failed");
        }
    });

    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    if let Err(err) = scheduler_task.await {
        error!(error = %err, "scheduler task join failed");
    }
    info!("tradewind engine stopped");
    Ok(())
}

async fn run_stream_only(config: AppConfig) -> Result<()> {
    let (hub, commands_rx) = StreamHub::new(config.stream.client_queue_size);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed = MarketDataFeed::new(&config.broker.ws_url, hub.clone(), config.stream.clone());
    tokio::spawn(feed.run(commands_rx, shutdown_rx));

    let bind_addr = config.stream.bind_addr.clone();
    tokio::select! {
        result = tradewind::stream::ws::serve(hub, &bind_addr) => result,
        _ = shutdown_signal() => {
            info!("stream hub stopped");
            Ok(())
        }
    }
}

async fn show_account(config: AppConfig) -> Result<()> {
    let broker = build_broker(&config)?;
    let gateway = Gateway::new(broker, config.gateway.clone());

    let portfolio = gateway.portfolio().await?;
    println!("Cash:          {}", portfolio.account.cash);
    println!("Buying power:  {}", portfolio.account.buying_power);
    println!("Equity:        {}", portfolio.account.equity);
    println!("Daily P&L:     {}", portfolio.account.daily_realized_pnl);
    println!();
    if portfolio.positions.is_empty() {
        println!("No open positions");
    } else {
        println!("{:<8} {:>12} {:>14} {:>14}", "Symbol", "Qty", "Value", "Unrealized");
        for position in &portfolio.positions {
            println!(
                "{:<8} {:>12} {:>14} {:>14}",
                position.symbol, position.qty, position.market_value, position.unrealized_pnl
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
