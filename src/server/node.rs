//! Endpoints called by the index nodes themselves.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::post,
};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::RequireNode;
use crate::error::{Error, Result};
use crate::server::AppState;
use crate::server::dto::HeartbeatResponse;
use crate::server::response::{ApiError, ApiResponse};
use crate::types::{Heartbeat, TaskCallback};

pub fn node_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{uuid}/heartbeat", post(heartbeat))
        .route("/{uuid}/callback", post(callback))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::validation(format!("invalid node uuid: {raw}")))
}

/// Parses the heartbeat body. The path names the node; a body that names
/// another one is rejected.
fn heartbeat_from(uuid: Uuid, mut body: Value) -> Result<Heartbeat> {
    if let Value::Object(fields) = &mut body {
        fields
            .entry("uuid")
            .or_insert_with(|| Value::String(uuid.to_string()));
    }
    let heartbeat = Heartbeat::from_value(&body)?;
    if heartbeat.uuid != uuid {
        return Err(Error::validation("heartbeat uuid does not match the path"));
    }
    Ok(heartbeat)
}

async fn heartbeat(
    _node: RequireNode,
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let heartbeat = heartbeat_from(parse_uuid(&uuid)?, body)?;

    let response = state.with_context(|ctx| {
        let node = ctx.nodes().register_or_update(&heartbeat)?;
        let tasks = ctx
            .tasks()
            .drain_for_node(&node)?
            .iter()
            .map(|task| ctx.tasks().payload(task))
            .collect::<Result<Vec<_>>>()?;
        let pull_frequency = ctx.tasks().task_pull_frequency(&node)?;

        if !tasks.is_empty() {
            tracing::info!(node_id = node.id, tasks = tasks.len(), "Dispatched tasks");
        }
        Ok(HeartbeatResponse {
            node_id: node.id,
            pull_frequency_secs: pull_frequency.as_secs(),
            tasks,
        })
    })?;

    Ok::<_, ApiError>(Json(ApiResponse::success(response)))
}

async fn callback(
    _node: RequireNode,
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    Json(callback): Json<TaskCallback>,
) -> impl IntoResponse {
    let uuid = parse_uuid(&uuid)?;

    let task = state.with_context(|ctx| {
        let node = ctx.store.get_node_by_uuid(&uuid)?.ok_or(Error::NotFound)?;
        if let Some(message) = callback.error.as_deref().filter(|_| !callback.success) {
            tracing::warn!(
                node_id = node.id,
                task_id = callback.payload.task_id,
                error = message,
                "Node reported task failure"
            );
        }
        ctx.tasks().record_result(&node, &callback)
    })?;

    Ok::<_, ApiError>(Json(ApiResponse::success(task)))
}
