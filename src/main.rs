use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;

use forecast_edge::config::Config;
use forecast_edge::contract_store::ContractStore;
use forecast_edge::gateway::{MarketGateway, PaperBook, PaperGateway};
use forecast_edge::observation::HttpObservationSource;
use forecast_edge::pipeline::ScanEngine;
use forecast_edge::server;
use forecast_edge::settlement::SettlementProcessor;
use forecast_edge::signal::http::HttpForecastSource;
use forecast_edge::signal::ForecastSource;
use forecast_edge::state::{open_outcome_log, LearningState, OPEN_ENTRIES_FILE};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set FE_CONFIG_PATH or create config/default.toml");
            std::process::exit(1);
        }
    };

    let log_file = std::fs::File::create(&config.logging.file)
        .with_context(|| format!("failed to create log file {}", config.logging.file))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
            }),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .json()
        .init();

    let scan_interval = Duration::from_millis(config.scan_interval_ms()?);
    tracing::info!(
        sources = config.sources.len(),
        segments = config.segments.len(),
        state_dir = %config.persistence.state_dir,
        scan_interval_ms = scan_interval.as_millis() as u64,
        "Starting forecast-edge"
    );

    let fetch_timeout = Duration::from_millis(config.engine.fetch_timeout_ms);
    let mut sources: Vec<Arc<dyn ForecastSource>> = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let http = HttpForecastSource::from_config(source, fetch_timeout)
            .with_context(|| format!("invalid forecast source {}", source.id))?;
        sources.push(Arc::new(http));
    }

    let paper_path = Path::new(&config.gateway.paper_book_path);
    let book = if paper_path.exists() {
        PaperBook::load(paper_path)?
    } else {
        tracing::warn!(
            path = %paper_path.display(),
            "paper book missing; no markets will be listed"
        );
        PaperBook::default()
    };
    let gateway: Arc<dyn MarketGateway> = Arc::new(PaperGateway::new(book));

    let now = Utc::now();
    let state = LearningState::open(&config, now)?;
    let settlement = SettlementProcessor::new(
        open_outcome_log(&config)?,
        config.edge.fee_rate,
        config.fusion.max_source_rmse,
    );
    let store = ContractStore::open(&config.persistence.path(OPEN_ENTRIES_FILE))?;
    let mut engine = ScanEngine::new(config.clone(), sources, gateway, state, settlement, store)?;
    if let Some(feed) = &config.observations.source {
        let http = HttpObservationSource::from_config(feed, fetch_timeout)
            .with_context(|| format!("invalid observation source {}", feed.id))?;
        engine = engine.with_observations(Arc::new(http));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = if config.server.enabled {
        let bind = config.server.bind.clone();
        let snapshots = engine.subscribe();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, snapshots, shutdown).await {
                tracing::error!(error = %format!("{e:#}"), "inspection server stopped");
            }
        }))
    } else {
        None
    };

    let ctrl_c_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received");
        let _ = ctrl_c_shutdown.send(true);
    });

    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = shutdown_rx;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.run_cycle(Utc::now()).await {
                    tracing::error!(error = %format!("{e:#}"), "scan cycle failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if let Err(e) = engine.state().risk.persist() {
        tracing::error!(error = %format!("{e:#}"), "failed to persist risk state on shutdown");
    }
    if let Some(task) = server_task {
        let _ = task.await;
    }
    tracing::info!("forecast-edge stopped");
    Ok(())
}
