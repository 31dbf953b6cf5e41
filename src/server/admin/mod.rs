mod indices;
mod mirror;
mod namespaces;
mod nodes;
mod settings;
mod tokens;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use crate::server::AppState;

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        // Node routes
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/{id}", get(nodes::get_node))
        // Enabled namespace routes
        .route("/enabled-namespaces", post(namespaces::enable_namespace))
        .route("/enabled-namespaces", get(namespaces::list_enabled_namespaces))
        .route(
            "/enabled-namespaces/{root_namespace_id}",
            get(namespaces::get_enabled_namespace),
        )
        .route(
            "/enabled-namespaces/{root_namespace_id}",
            delete(namespaces::disable_namespace),
        )
        .route(
            "/replicas/{id}/reallocate",
            post(namespaces::reallocate_replica),
        )
        // Index routes
        .route("/indices", get(indices::list_indices))
        .route("/indices/{id}", get(indices::get_index))
        .route("/indices/{id}/retire", post(indices::retire_index))
        .route(
            "/indices/{id}/finish-reallocation",
            post(indices::finish_reallocation),
        )
        .route(
            "/repositories/{id}/reset",
            post(indices::reset_repository),
        )
        // Settings routes
        .route("/settings", get(settings::get_settings))
        .route("/settings", put(settings::update_settings))
        // Mirror routes
        .route("/namespaces/{id}", put(mirror::put_namespace))
        .route("/projects/{id}", put(mirror::put_project))
        .route("/projects/{id}", delete(mirror::delete_project))
        .route("/projects/{id}/nodes", get(nodes::searchable_nodes))
        .route("/subscriptions/{namespace_id}", put(mirror::put_subscription))
        // Node token routes
        .route("/tokens", post(tokens::create_token))
        .route("/tokens", get(tokens::list_tokens))
        .route("/tokens/{id}", delete(tokens::delete_token))
}
