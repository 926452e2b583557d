use std::sync::Arc;

use axum::http::Method;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pfpk_service::api;
use pfpk_service::config::Config;
use pfpk_service::oracle::{IndexerOracle, NoopOracle, OwnershipOracle};
use pfpk_service::state::AppState;
use pfpk_service::store::{IdentityStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pfpk_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    config.validate()?;
    tracing::info!("Starting PFPK Profile Service v{}", config.version);
    tracing::info!("Host: {}:{}", config.host, config.port);

    if std::env::var("JWT_SECRET").is_err() {
        tracing::warn!("JWT_SECRET not set; tokens will not survive a restart");
    }

    let chains = config.load_chain_registry()?;
    tracing::info!("Loaded {} chains", chains.len());

    let store = open_store(&config).await?;

    let oracle: Arc<dyn OwnershipOracle> = match &config.nft_indexer_url {
        Some(url) => {
            tracing::info!("NFT indexer: {}", url);
            Arc::new(IndexerOracle::new(url.clone(), config.oracle_timeout)?)
        }
        None => {
            tracing::warn!("NFT_INDEXER_URL not set; profile NFTs will not resolve");
            Arc::new(NoopOracle)
        }
    };

    let state = AppState::new(config.clone(), chains, store, oracle);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = api::create_router(Arc::clone(&state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn IdentityStore>> {
    use pfpk_service::store::PostgresStore;

    match &config.database_url {
        Some(url) => {
            tracing::info!("Using PostgreSQL store");
            Ok(Arc::new(PostgresStore::new(url).await?))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; profiles are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn IdentityStore>> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL ignored: built without the postgres feature");
    }
    tracing::info!("Using in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
