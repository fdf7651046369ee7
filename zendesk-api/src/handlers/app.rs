use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;
use zendesk_common::config::SessionConfig;

use crate::dispatch::UserSyncDispatcher;

use super::event;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionConfig>,
    pub dispatcher: Arc<UserSyncDispatcher>,
}

pub fn add_routes(
    router: Router,
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router.route(
        "/event",
        routing::post(event::post_event)
            .with_state(state)
            .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
            .layer(DefaultBodyLimit::max(max_body_size)),
    )
}
