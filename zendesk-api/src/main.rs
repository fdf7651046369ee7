//! Receive analytics events and write their timestamps onto Zendesk users.
use std::sync::Arc;
use std::time;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use tracing_subscriber::EnvFilter;

use zendesk_api::config::Config;
use zendesk_api::dispatch::UserSyncDispatcher;
use zendesk_api::handlers::{add_routes, AppState};
use zendesk_common::config::SessionConfig;
use zendesk_common::metrics::{add_operational_routes, serve, setup_metrics_recorder};
use zendesk_common::storage::{RedisStorage, SyncStore};
use zendesk_common::zendesk::ZendeskClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env()?;

    let session = Arc::new(SessionConfig::from_env_config(&config.zendesk)?);
    let zendesk = Arc::new(ZendeskClient::new(&session)?);
    zendesk.verify_access().await?;

    let storage = RedisStorage::new(&config.storage.redis_url).await?;
    let store = SyncStore::new(Arc::new(storage), &config.storage.key_prefix);

    let state = AppState {
        session,
        dispatcher: Arc::new(UserSyncDispatcher::new(zendesk, store)),
    };

    // Requests are served inline, so liveness only tracks that the runtime keeps ticking.
    let liveness = HealthRegistry::new("liveness");
    let runtime_liveness = liveness.register("runtime", time::Duration::from_secs(30));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            runtime_liveness.report_healthy();
        }
    });

    let recorder = setup_metrics_recorder()?;
    let app = add_routes(
        Router::new(),
        state,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = add_operational_routes(app, "zendesk event api", liveness, Some(recorder));

    if let Err(e) = serve(app, &config.bind()).await {
        tracing::error!("failed to start zendesk api http server, {}", e);
        return Err(e.into());
    }

    Ok(())
}
