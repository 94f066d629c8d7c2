//! livequery-gateway server entry point.
//!
//! Starts the change-feed consumer and the Axum HTTP server with REST and
//! WebSocket endpoints.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use livequery_gateway::app_state::AppState;
use livequery_gateway::auth::{
    IdentityStore, InMemoryIdentityStore, PostgresIdentityStore, SessionResolver,
};
use livequery_gateway::build_app;
use livequery_gateway::config::{IdentityStoreKind, LiveQueryConfig};
use livequery_gateway::hooks::NoopHooks;
use livequery_gateway::pubsub::Publisher;
use livequery_gateway::service::{LiveQueryService, run_change_feed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = LiveQueryConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e))
        .context("loading configuration")?;
    tracing::info!(
        addr = %config.listen_addr,
        application_id = %config.application_id,
        "starting livequery-gateway"
    );

    // Identity store
    let store: Arc<dyn IdentityStore> = match config.identity_store {
        IdentityStoreKind::Memory => {
            tracing::warn!("using the in-memory identity store; sessions are empty");
            Arc::new(InMemoryIdentityStore::new())
        }
        IdentityStoreKind::Postgres => Arc::new(
            PostgresIdentityStore::connect(
                &config.database_url,
                config.database_max_connections,
                Duration::from_secs(config.database_connect_timeout_secs),
            )
            .await
            .context("connecting to the identity store")?,
        ),
    };

    // Build service layer
    let resolver = SessionResolver::new(store, config.cache_ttl(), config.cache_max_size);
    let service = LiveQueryService::new(resolver, Arc::new(NoopHooks), config.key_pairs.clone());

    // Change feed
    let adapter = config.pubsub.resolve();
    tokio::spawn(run_change_feed(
        service.clone(),
        adapter.create_subscriber(),
        config.application_id.clone(),
    ));
    let publisher: Arc<dyn Publisher> = Arc::from(adapter.create_publisher());

    // Build application state
    let listen_addr = config.listen_addr;
    let app = build_app(AppState {
        service,
        publisher,
        config: Arc::new(config),
    });

    // Start server
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, "server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
