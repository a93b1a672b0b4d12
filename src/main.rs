use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use junction::{
    adapters::{
        DispatchChain, FileConfigProvider, FilterChain, HttpHandler, SnapshotStore,
        TransportCache, audit,
    },
    config::{GatewayConfigValidator, load_config},
    core::RequestInfoResolver,
    metrics,
    ports::config_provider::ConfigProvider,
    tracing_setup,
    utils::GracefulShutdown,
};
use tracing::Instrument;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "junction.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate a configuration file, including its routing objects
    Validate {
        #[clap(short, long, default_value = "junction.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "junction.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .with_context(|| format!("{config_path} is invalid"))?;

    println!("Configuration {config_path} is valid");
    println!("  listen address:   {}", config.listen_addr);
    println!(
        "  kubernetes:       {}",
        config.kubernetes.endpoint.as_deref().unwrap_or("disabled")
    );
    println!(
        "  fallback:         {}",
        config.fallback.upstream.as_deref().unwrap_or("disabled")
    );
    println!(
        "  auditing:         {}",
        if config.audit.enabled { config.audit.level.to_string() } else { "disabled".to_string() }
    );
    println!("  api services:     {}", config.routing.api_services.len());
    println!("  reverse proxies:  {}", config.routing.reverse_proxies.len());
    println!("  js bundles:       {}", config.routing.js_bundles.len());
    println!("  clusters:         {}", config.routing.clusters.len());
    Ok(())
}

/// Reload the routing snapshot whenever the config file changes. Everything outside the
/// `routing` section needs a restart.
fn spawn_config_watcher(
    provider: Arc<FileConfigProvider>,
    snapshots: Arc<SnapshotStore>,
    transports: Arc<TransportCache>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let Some(mut notify_rx) = provider.watch() else {
        tracing::warn!("Config watch channel already taken; routing hot-reload disabled");
        return;
    };
    let debounce = Duration::from_millis(500);

    tokio::spawn(
        async move {
            tracing::info!(path = %provider.path().display(), "Config watcher started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    signal = notify_rx.recv() => {
                        if signal.is_none() {
                            break;
                        }
                    }
                }
                // Editors write in bursts; settle before reading.
                tokio::time::sleep(debounce).await;
                while notify_rx.try_recv().is_ok() {}

                let config = match provider.load_config().await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to reload configuration, keeping current routing");
                        continue;
                    }
                };
                if let Err(e) = GatewayConfigValidator::validate_routing_snapshot(&config.routing) {
                    tracing::error!(error = %e, "Reloaded routing is invalid, keeping current routing");
                    continue;
                }
                snapshots.replace(config.routing);
                transports.retain_keys(&snapshots.transport_keys()).await;
                tracing::info!(transports = transports.len(), "Routing reloaded");
            }
            tracing::info!("Config watcher stopped");
        }
        .instrument(tracing_setup::component_span("config_watcher")),
    );
}

async fn serve(config_path: &str) -> Result<()> {
    let crypto = rustls::crypto::aws_lc_rs::default_provider();
    let crypto_installed = rustls::crypto::CryptoProvider::install_default(crypto).is_ok();

    let provider = Arc::new(
        FileConfigProvider::new(config_path)
            .with_context(|| format!("Failed to watch {config_path}"))?,
    );
    let config = provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    tracing_setup::init_tracing(&config.logging)?;
    if !crypto_installed {
        tracing::warn!("A rustls crypto provider was already installed; keeping it");
    }
    metrics::init_metrics();
    GatewayConfigValidator::validate(&config)
        .with_context(|| format!("{config_path} is invalid"))?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr))?;

    let transports = Arc::new(TransportCache::new());
    let snapshots = Arc::new(SnapshotStore::with_snapshot(config.routing.clone()));
    let resolver = RequestInfoResolver::new(&config.request_info);
    let dispatch =
        DispatchChain::from_config(&config, snapshots.clone(), &resolver, transports.clone())?;
    tracing::info!(dispatchers = ?dispatch.dispatcher_names(), "Dispatch chain ready");

    let (audit_filter, audit_pipeline) =
        audit::start(&config.audit).wrap_err("Failed to start the audit pipeline")?;
    let chain = FilterChain::builder(resolver, dispatch)
        .audit(audit_filter)
        .build();
    tracing::info!(filters = ?chain.filter_names(), "Filter chain ready");

    let shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.run_signal_handler().await;
        });
    }
    spawn_config_watcher(provider, snapshots.clone(), transports, shutdown.token());

    let handler = Arc::new(HttpHandler::new(Arc::new(chain), snapshots));
    let app = handler.router();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "Junction gateway listening");

    let token = shutdown.token();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await
    .map_err(|e| eyre!("Server error: {e}"))?;
    tracing::info!("HTTP server stopped");

    if let Some(pipeline) = audit_pipeline {
        if tokio::time::timeout(shutdown.drain_timeout(), pipeline.shutdown())
            .await
            .is_err()
        {
            tracing::warn!(timeout = ?shutdown.drain_timeout(), "Audit pipeline did not drain in time");
        }
    }

    tracing::info!("Junction gateway shut down");
    Ok(())
}
