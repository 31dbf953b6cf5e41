use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::TimeDelta;

use crate::auth::RequireAdmin;
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{CreateTokenRequest, CreateTokenResponse, PaginationParams};
use crate::server::response::{ApiError, ApiResponse, DEFAULT_PAGE_SIZE, PaginatedResponse};

/// Issues a node token. Admin tokens are only created by `admin init`.
pub async fn create_token(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTokenRequest>,
) -> impl IntoResponse {
    let now = state.clock.now();
    let expires_at = match req.expires_in_seconds {
        None => None,
        Some(secs) if secs > 0 => Some(
            TimeDelta::try_seconds(secs)
                .and_then(|ttl| now.checked_add_signed(ttl))
                .ok_or_else(|| Error::validation("expires_in_seconds is too large"))?,
        ),
        Some(_) => {
            return Err(ApiError::from(Error::validation(
                "expires_in_seconds must be positive",
            )));
        }
    };

    let issued = state
        .tokens
        .issue(state.store.as_ref(), false, req.description, expires_at, now)?;
    tracing::info!(token_id = %issued.token.id, "Node token created");

    Ok::<_, ApiError>((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreateTokenResponse {
            token: issued.raw,
            metadata: issued.token,
        })),
    ))
}

pub async fn list_tokens(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let cursor = params.cursor.as_deref().unwrap_or("");
    let page_size = DEFAULT_PAGE_SIZE as i32;

    let tokens = state.store.list_tokens(cursor, page_size + 1)?;

    Ok::<_, ApiError>(Json(PaginatedResponse::from_overfetch(
        tokens,
        DEFAULT_PAGE_SIZE as usize,
        |t| t.id.clone(),
    )))
}

pub async fn delete_token(
    admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if id == admin.0.id {
        return Err(ApiError::bad_request("Cannot delete current token"));
    }
    if !state.store.delete_token(&id)? {
        return Err(ApiError::not_found("Token not found"));
    }

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
