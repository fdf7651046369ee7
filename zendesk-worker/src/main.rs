//! Periodically sync new Zendesk tickets into PostHog.
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use health::HealthRegistry;
use tracing_subscriber::EnvFilter;

use zendesk_common::capture::PostHogSink;
use zendesk_common::config::SessionConfig;
use zendesk_common::metrics::{add_operational_routes, serve, setup_metrics_recorder};
use zendesk_common::storage::{RedisStorage, SyncStore};
use zendesk_common::zendesk::ZendeskClient;
use zendesk_worker::config::Config;
use zendesk_worker::ingestion::TicketIngestion;
use zendesk_worker::scheduler::IngestionScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    let session = SessionConfig::from_env_config(&config.zendesk)?;
    let zendesk = Arc::new(ZendeskClient::new(&session)?);
    zendesk.verify_access().await?;

    let storage = RedisStorage::new(&config.storage.redis_url).await?;
    let store = SyncStore::new(Arc::new(storage), &config.storage.key_prefix);
    let sink = PostHogSink::new(
        &config.capture.posthog_api_key,
        &config.capture.posthog_endpoint,
    )
    .await;

    let liveness = HealthRegistry::new("liveness");
    let ingestion_liveness = liveness.register("ingestion", config.liveness_deadline());

    let scheduler = IngestionScheduler::new(
        TicketIngestion::new(zendesk, store.clone(), Arc::new(sink)),
        store,
        &config.worker_name,
        config.ingestion_interval.0,
        config.ingestion_lock_ttl(),
        ingestion_liveness,
    );

    let recorder = setup_metrics_recorder()?;
    let app = add_operational_routes(
        Router::new(),
        "zendesk ticket worker",
        liveness,
        Some(recorder),
    );
    let bind = config.bind();
    let http_server = Box::pin(serve(app, &bind));
    let ingestion_loop = Box::pin(scheduler.run());

    match select(http_server, ingestion_loop).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                tracing::error!("failed to start zendesk worker http server, {}", e);
                return Err(e.into());
            }
        }
        Either::Right((_, _)) => {
            tracing::error!("zendesk ingestion loop exited");
        }
    };

    Ok(())
}
