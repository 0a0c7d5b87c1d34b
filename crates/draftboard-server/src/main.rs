use std::sync::Arc;

use draftboard_server::config::Settings;
use draftboard_server::event_bus::{LocalBus, PubSub, ReplicaBridge};
use draftboard_server::{router, AppState, DraftboardError};
use tracing::{error, info, warn};

async fn build_pubsub(settings: &Settings) -> Result<PubSub, DraftboardError> {
    let bus_settings = &settings.event_bus;

    match PubSub::from_settings(bus_settings).await {
        Ok(pubsub) => Ok(pubsub),
        Err(e) if !bus_settings.require_broker => {
            warn!(error = %e, "durable broker unavailable, continuing local-only");
            Ok(PubSub::local_only(
                LocalBus::with_capacity(bus_settings.subscriber_capacity),
                bus_settings.replica_id(),
            ))
        }
        Err(e) => {
            error!(error = %e, "durable broker required but unavailable");
            Err(e.into())
        }
    }
}

async fn shutdown_signal(pubsub: Arc<PubSub>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    // Ends open event streams so their connections can drain.
    pubsub.local().shutdown().await;
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Draftboard event server");

    let settings = Settings::new().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let pubsub = Arc::new(build_pubsub(&settings).await?);
    info!(
        replica = %pubsub.replica_id(),
        durable = pubsub.is_durable(),
        "Event bus initialized"
    );

    if let (true, Some(consumer)) = (pubsub.is_durable(), settings.event_bus.replica_consumer.as_deref()) {
        let bridge = ReplicaBridge::new(pubsub.replica_id(), pubsub.local().clone());
        pubsub
            .attach_durable(consumer, bridge.into_handler())
            .await
            .map_err(DraftboardError::from)?;
        info!(consumer = %consumer, "Replica bridge started");
    }

    let app = router(AppState::new(pubsub.clone(), settings.clone()));

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(DraftboardError::from)?;
    info!("Starting server on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(pubsub.clone()))
        .await
        .map_err(DraftboardError::from)?;

    pubsub.shutdown().await;
    info!("Server stopped");

    Ok(())
}
