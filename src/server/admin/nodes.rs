use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use crate::auth::RequireAdmin;
use crate::coordinator::Context;
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::dto::NodeResponse;
use crate::server::response::{ApiError, ApiResponse};
use crate::types::Node;

fn describe(ctx: Context<'_>, node: Node) -> Result<NodeResponse> {
    Ok(NodeResponse {
        online: ctx.nodes().is_online(&node),
        lost: ctx.nodes().is_lost(&node),
        concurrency_limit: ctx.nodes().concurrency_limit(&node),
        unclaimed_storage_bytes: ctx.storage().unclaimed_storage_bytes(&node)?,
        node,
    })
}

pub async fn list_nodes(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let nodes = state.with_context(|ctx| {
        ctx.store
            .list_nodes()?
            .into_iter()
            .map(|node| describe(ctx, node))
            .collect::<Result<Vec<_>>>()
    })?;

    Ok::<_, ApiError>(Json(ApiResponse::success(nodes)))
}

pub async fn get_node(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let node = state.with_context(|ctx| {
        let node = ctx.store.get_node(id)?.ok_or(Error::NotFound)?;
        describe(ctx, node)
    })?;

    Ok::<_, ApiError>(Json(ApiResponse::success(node)))
}

/// Nodes holding a ready copy of the project, i.e. where searches can go.
pub async fn searchable_nodes(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i64>,
) -> impl IntoResponse {
    let nodes = state.with_context(|ctx| {
        ctx.nodes()
            .searchable_nodes_for(project_id)?
            .into_iter()
            .map(|node| describe(ctx, node))
            .collect::<Result<Vec<_>>>()
    })?;

    Ok::<_, ApiError>(Json(ApiResponse::success(nodes)))
}
