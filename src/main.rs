//! Blobgate -- HTTP blob-serving gateway.
//!
//! Serves objects out of a remote store (Google Cloud Storage) with
//! byte-range and conditional-request semantics.  SIGTERM/SIGINT stop
//! accepting connections and let in-flight streams drain.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

/// Command-line arguments for the Blobgate server.
#[derive(Parser, Debug)]
#[command(
    name = "blobgate",
    version,
    about = "HTTP gateway for range and conditional reads of GCS-stored blobs"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "blobgate.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = blobgate::config::load_config(&cli.config)?;

    // Initialize tracing / logging.  RUST_LOG wins over the config level.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Initialize Prometheus metrics recorder and register metric descriptions.
    if config.observability.metrics {
        blobgate::metrics::init_metrics();
        blobgate::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Initialize the blob store backend based on config.
    let store: Arc<dyn blobgate::storage::backend::BlobStore> =
        match config.storage.backend.as_str() {
            "gcs" => {
                let gcs = config.storage.gcs.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "storage.backend is 'gcs' but storage.gcs config section is missing"
                    )
                })?;
                let store = blobgate::storage::gcs::GcsStore::new(
                    gcs.bucket.clone(),
                    gcs.project.clone(),
                    gcs.prefix.clone(),
                    gcs.credentials_file.clone(),
                )
                .await?;
                Arc::new(store)
            }
            "memory" | _ => {
                info!("In-memory store initialized (empty)");
                Arc::new(blobgate::storage::memory::MemoryStore::new())
            }
        };

    // Build AppState.
    let state = Arc::new(blobgate::AppState {
        config: config.clone(),
        store,
    });

    let app = blobgate::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Blobgate listening on {}", bind_addr);

    // Graceful shutdown: on SIGTERM/SIGINT, stop accepting new connections
    // and let in-flight requests complete.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Blobgate shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
