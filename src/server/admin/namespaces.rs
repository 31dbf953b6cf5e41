use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::RequireAdmin;
use crate::error::Result;
use crate::server::AppState;
use crate::server::dto::{
    EnableNamespaceRequest, EnabledNamespaceResponse, PaginationParams, ReallocateRequest,
    ReplicaResponse,
};
use crate::server::response::{
    ApiError, ApiResponse, DEFAULT_PAGE_SIZE, PaginatedResponse, id_cursor,
};
use crate::store::Store;
use crate::types::EnabledNamespace;

fn describe(
    store: &dyn Store,
    enabled_namespace: EnabledNamespace,
) -> Result<EnabledNamespaceResponse> {
    let replicas = store
        .list_replicas(enabled_namespace.id)?
        .into_iter()
        .map(|replica| {
            Ok(ReplicaResponse {
                indices: store.list_indices_for_replica(replica.id)?,
                replica,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(EnabledNamespaceResponse {
        enabled_namespace,
        replicas,
    })
}

pub async fn enable_namespace(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnableNamespaceRequest>,
) -> impl IntoResponse {
    let response = state.with_context(|ctx| {
        let replicas = req
            .replicas
            .unwrap_or(ctx.settings.default_number_of_replicas);
        let (enabled_namespace, _) = ctx
            .planner()
            .enable_namespace(req.root_namespace_id, replicas)?;
        describe(ctx.store, enabled_namespace)
    })?;

    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

pub async fn list_enabled_namespaces(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let after_id = id_cursor(params.cursor.as_deref())?;

    let enabled_namespaces = state
        .store
        .list_enabled_namespaces(after_id, DEFAULT_PAGE_SIZE + 1)?;

    Ok::<_, ApiError>(Json(PaginatedResponse::from_overfetch(
        enabled_namespaces,
        DEFAULT_PAGE_SIZE as usize,
        |en| en.id.to_string(),
    )))
}

pub async fn get_enabled_namespace(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(root_namespace_id): Path<i64>,
) -> impl IntoResponse {
    let enabled_namespace = state
        .store
        .get_enabled_namespace_by_root(root_namespace_id)?
        .ok_or_else(|| ApiError::not_found("Enabled namespace not found"))?;
    let response = describe(state.store.as_ref(), enabled_namespace)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(response)))
}

pub async fn disable_namespace(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(root_namespace_id): Path<i64>,
) -> impl IntoResponse {
    let disabled = state.with_context(|ctx| ctx.planner().disable_namespace(root_namespace_id))?;
    if !disabled {
        return Err(ApiError::not_found("Enabled namespace not found"));
    }

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn reallocate_replica(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(replica_id): Path<i64>,
    Json(req): Json<ReallocateRequest>,
) -> impl IntoResponse {
    let index = state.with_context(|ctx| {
        ctx.planner()
            .reallocate_replica(replica_id, req.from_node_id, req.to_node_id)
    })?;

    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(index))))
}
