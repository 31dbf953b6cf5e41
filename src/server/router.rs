use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{Router, routing::get};

use super::admin::admin_router;
use super::node::node_router;
use crate::auth::TokenHasher;
use crate::config::Settings;
use crate::coordinator::{Clock, Context};
use crate::error::Result;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub tokens: TokenHasher,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            tokens: TokenHasher::new(),
        }
    }

    /// Runs `f` against the coordinator with settings as currently stored.
    pub fn with_context<T>(&self, f: impl FnOnce(Context<'_>) -> Result<T>) -> Result<T> {
        let settings = Settings::load(self.store.as_ref())?;
        f(Context::new(
            self.store.as_ref(),
            &settings,
            self.clock.as_ref(),
        ))
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        response.status().as_u16(),
        start.elapsed().as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/internal/search/zoekt", node_router())
        .nest("/api/v1/admin", admin_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
