use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::Error;
use crate::server::AppState;
use crate::types::Token;

/// Extractor that requires an admin token.
pub struct RequireAdmin(pub Token);

/// Extractor that requires a node token (non-admin).
pub struct RequireNode(pub Token);

#[derive(Debug)]
pub enum AuthError {
    MissingAuth,
    InvalidScheme,
    InvalidToken,
    TokenExpired,
    NotAdmin,
    NotNode,
    InternalError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidScheme => (StatusCode::UNAUTHORIZED, "Invalid authorization scheme"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::NotAdmin => (StatusCode::FORBIDDEN, "Admin access required"),
            AuthError::NotNode => (StatusCode::FORBIDDEN, "Node token required"),
            AuthError::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let mut response = (status, Json(json!({ "data": null, "error": message }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"zoekt\""),
            );
        }
        response
    }
}

impl FromRequestParts<Arc<AppState>> for RequireAdmin {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = authenticate(parts, state)?;
        if !token.is_admin {
            return Err(AuthError::NotAdmin);
        }
        Ok(RequireAdmin(token))
    }
}

impl FromRequestParts<Arc<AppState>> for RequireNode {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = authenticate(parts, state)?;
        if token.is_admin {
            return Err(AuthError::NotNode);
        }
        Ok(RequireNode(token))
    }
}

/// Pulls the bearer token out of `Authorization`.
fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidScheme)?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or(AuthError::InvalidScheme)
}

fn authenticate(parts: &Parts, state: &AppState) -> Result<Token, AuthError> {
    let raw = bearer_token(parts)?;
    state
        .tokens
        .authenticate(state.store.as_ref(), raw, state.clock.now())
        .map_err(|e| match e {
            Error::InvalidTokenFormat | Error::Unauthorized => AuthError::InvalidToken,
            Error::TokenExpired => AuthError::TokenExpired,
            e => {
                tracing::error!(error = %e, "Token validation failed");
                AuthError::InternalError
            }
        })
}
