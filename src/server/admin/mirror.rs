//! Write-through copies of the namespaces, projects and subscriptions owned
//! by the web layer.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::RequireAdmin;
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{NamespaceMirrorRequest, ProjectMirrorRequest, SubscriptionRequest};
use crate::server::response::{ApiError, ApiResponse};
use crate::types::{Namespace, Project, Subscription};

pub async fn put_namespace(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<NamespaceMirrorRequest>,
) -> impl IntoResponse {
    if req.parent_id == Some(id) {
        return Err(ApiError::from(Error::validation(
            "a namespace cannot be its own parent",
        )));
    }

    let namespace = Namespace {
        id,
        parent_id: req.parent_id,
        name: req.name,
    };
    state.store.upsert_namespace(&namespace)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(namespace)))
}

pub async fn put_project(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ProjectMirrorRequest>,
) -> impl IntoResponse {
    let project = Project {
        id,
        namespace_id: req.namespace_id,
        root_namespace_id: req.root_namespace_id,
    };
    state.store.upsert_project(&project)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(project)))
}

/// Repositories of a deleted project are orphaned by the next maintenance pass.
pub async fn delete_project(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if !state.store.delete_project(id)? {
        return Err(ApiError::not_found("Project not found"));
    }

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn put_subscription(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Path(namespace_id): Path<i64>,
    Json(req): Json<SubscriptionRequest>,
) -> impl IntoResponse {
    let subscription = Subscription {
        namespace_id,
        end_date: req.end_date,
    };
    state.store.upsert_subscription(&subscription)?;

    Ok::<_, ApiError>(Json(ApiResponse::success(subscription)))
}
