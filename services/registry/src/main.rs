//! Artifact registry server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use artifact_registry::config::RegistryConfig;
use artifact_registry::metadata::MemoryMetadataStore;
use artifact_registry::remote::HttpRemote;
use artifact_registry::{RegistryBuilder, SECRET_ENV_PREFIX, router};
use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use eyre::WrapErr as _;
use secret::EnvSecrets;
use tracing_subscriber::EnvFilter;
use upstream_client::UpstreamClient;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Multi-format artifact registry
#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "REGISTRY_CONFIG")]
    config: Utf8PathBuf,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = RegistryConfig::load(&args.config)
        .await
        .wrap_err_with(|| format!("loading {}", args.config))?;
    let registries = config.registries().wrap_err("invalid registry configuration")?;
    tracing::info!(registries = registries.len(), "configuration loaded");

    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("building storage driver")?;
    let secrets = config
        .static_secrets()
        .with_fallback(EnvSecrets::with_prefix(SECRET_ENV_PREFIX));
    let remote = HttpRemote::new(
        UpstreamClient::new(config.limits.upstream_timeout()),
        Arc::new(secrets),
    );

    let mut builder = RegistryBuilder::new()
        .storage(storage)
        .bucket(config.bucket.clone())
        .metadata(Arc::new(MemoryMetadataStore::with_registries(registries)))
        .remote(Arc::new(remote))
        .limits(config.limits.clone())
        .oci_scope(config.oci_scope.clone());
    if let Some(base_url) = &config.base_url {
        builder = builder.base_url(base_url.clone());
    }
    let context = builder.context();

    let uploads = context.uploads().clone();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let swept = uploads.sweep_expired().await;
            if swept > 0 {
                tracing::info!(swept, "expired upload sessions removed");
            }
        }
    });

    let listen = args.listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .wrap_err_with(|| format!("binding {listen}"))?;
    tracing::info!("registry listening on http://{listen}");

    axum::serve(listener, router(context.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serving")?;

    sweeper.abort();
    context.cache().flush().await;
    tracing::info!("pending cache writes finished");
    Ok(())
}
