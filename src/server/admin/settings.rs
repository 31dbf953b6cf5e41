use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};

use crate::auth::RequireAdmin;
use crate::config::{SettingKey, Settings};
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::UpdateSettingsRequest;
use crate::server::response::{ApiError, ApiResponse};

pub async fn get_settings(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let values = Settings::raw_values(state.store.as_ref())?;

    Ok::<_, ApiError>(Json(ApiResponse::success(values)))
}

/// Applies every change or none: all values are checked before any is written.
pub async fn update_settings(
    _admin: RequireAdmin,
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateSettingsRequest>,
) -> impl IntoResponse {
    for (name, value) in &req {
        SettingKey::from_name(name)
            .ok_or_else(|| Error::validation(format!("unknown setting: {name}")))?
            .validate(value)?;
    }
    for (name, value) in &req {
        Settings::update(state.store.as_ref(), name, value)?;
        tracing::info!(setting = %name, value = %value, "Setting updated");
    }

    let values = Settings::raw_values(state.store.as_ref())?;
    Ok::<_, ApiError>(Json(ApiResponse::success(values)))
}
