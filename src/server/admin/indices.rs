use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::RequireAdmin;
use crate::server::AppState;
use crate::server::dto::{IndexResponse, PaginationParams};
use crate::server::response::{
    ApiError, ApiResponse, DEFAULT_PAGE_SIZE, PaginatedResponse, id_cursor,
};

pub async fn list_indices(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let after_id = id_cursor(params.cursor.as_deref())?;
    let indices = state
        .store
        .list_indices(after_id, DEFAULT_PAGE_SIZE + 1)?
        .into_iter()
        .map(IndexResponse::from)
        .collect();

    Ok::<_, ApiError>(Json(PaginatedResponse::from_overfetch(
        indices,
        DEFAULT_PAGE_SIZE as usize,
        |response: &IndexResponse| response.index.id.to_string(),
    )))
}

pub async fn get_index(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let index = state
        .store
        .get_index(id)?
        .ok_or_else(|| ApiError::not_found("Index not found"))?;

    Ok::<_, ApiError>(Json(ApiResponse::success(IndexResponse::from(index))))
}

pub async fn retire_index(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state.with_context(|ctx| ctx.planner().retire_index(id))?;

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn finish_reallocation(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let index = state.with_context(|ctx| ctx.planner().finish_reallocation(id))?;

    Ok::<_, ApiError>(Json(ApiResponse::success(index)))
}

pub async fn reset_repository(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let repository = state.with_context(|ctx| ctx.repositories().reset_failed(id))?;

    Ok::<_, ApiError>(Json(ApiResponse::success(repository)))
}
