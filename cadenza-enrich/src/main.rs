//! cadenza-enrich - Enrichment orchestrator service
//!
//! Runs enrichment cycles over the catalog on a fixed tick, hands audio and
//! vibe analysis to external analyzers through broker queues, and serves a
//! small operator API (status, control, failure log, text embedding, SSE).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadenza_common::config::{default_config_path, load_toml_config, resolve_root_folder};
use cadenza_common::events::EventBus;
use cadenza_enrich::broker::{self, TEXT_EMBED_TOPIC};
use cadenza_enrich::config::{TomlConfig, DEFAULT_PORT, SERVICE_NAME};
use cadenza_enrich::providers::{HttpFeedRefresher, MusicBrainzClient};
use cadenza_enrich::services::{
    spawn_control_listener, CatalogNotifier, ControlState, CorrelationChannel,
    EnrichmentOrchestrator, OrchestratorServices, VibeTextEmbedder,
};
use cadenza_enrich::AppState;

/// Command-line arguments for cadenza-enrich
#[derive(Parser, Debug)]
#[command(name = "cadenza-enrich")]
#[command(about = "Enrichment orchestrator for the Cadenza catalog")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "CADENZA_ENRICH_CONFIG")]
    config: Option<PathBuf>,

    /// Folder holding cadenza.db
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CADENZA_ENRICH_PORT")]
    port: Option<u16>,

    /// Broker URL (redis://... or memory://)
    #[arg(long, env = "CADENZA_BROKER_URL")]
    broker_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(|| default_config_path(SERVICE_NAME));
    let config: TomlConfig = match &config_path {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => TomlConfig::default(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(&config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        "CADENZA_ROOT",
        config.root_folder.as_deref(),
    );
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create {}", root_folder.display()))?;
    info!("Root folder: {}", root_folder.display());

    let db = cadenza_enrich::db::init_database_pool(&root_folder).await?;
    info!("Database connection established");

    let broker_url = args.broker_url.unwrap_or_else(|| config.broker.url.clone());
    let broker = broker::connect(&broker_url)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", broker_url))?;
    info!("Broker connected: {}", broker_url);

    let event_bus = EventBus::new(100);
    let control = ControlState::new();

    let metadata = MusicBrainzClient::new(&config.musicbrainz)
        .context("Failed to build MusicBrainz client")?;
    let feeds = HttpFeedRefresher::new(&config.musicbrainz.user_agent)
        .context("Failed to build feed client")?;
    let services = OrchestratorServices {
        metadata: Arc::new(metadata),
        feeds: Arc::new(feeds),
        notifier: Arc::new(CatalogNotifier::new(db.clone(), event_bus.clone())),
    };

    let enrichment = config.enrichment.clone();
    let orchestrator = Arc::new(
        EnrichmentOrchestrator::new(
            db.clone(),
            event_bus.clone(),
            Arc::clone(&broker),
            control.clone(),
            services,
            enrichment.clone(),
        )
        .await
        .context("Failed to initialize orchestrator")?,
    );

    let embedder = Arc::new(VibeTextEmbedder::new(
        CorrelationChannel::new(Arc::clone(&broker), TEXT_EMBED_TOPIC),
        enrichment.correlation_timeout(),
    ));

    let cancel = CancellationToken::new();
    let control_listener = spawn_control_listener(
        Arc::clone(&broker),
        control.clone(),
        event_bus.clone(),
        cancel.clone(),
    )
    .await
    .context("Failed to subscribe to control topic")?;
    let scheduler = tokio::spawn(Arc::clone(&orchestrator).run_forever(cancel.clone()));

    let state = AppState::new(db, event_bus, broker, Arc::clone(&orchestrator), embedder);
    let app = cadenza_enrich::build_router(state);

    let port = args.port.or(config.port).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Halt the running cycle at its next check, then stop the tasks
    control.apply(cadenza_enrich::models::ControlSignal::Stop);
    cancel.cancel();
    if let Err(e) = scheduler.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    if let Err(e) = control_listener.await {
        warn!("Control listener ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Bare levels apply to this crate only; anything else is a full directive
fn default_filter(level: &str) -> String {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => {
            format!("cadenza_enrich={},cadenza_common={},tower_http=info", level, level)
        }
        directive => directive.to_string(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
