//! Agent routes: heartbeat check-ins and client settings

use std::collections::BTreeMap;

use axum::{extract::State, Extension, Json};
use serde::Serialize;

use super::extract::JsonBody;
use crate::auth::{RequestContext, Session};
use crate::error::AppError;
use crate::event_log::Category;
use crate::heartbeat::{HeartbeatRequest, HeartbeatResponse};
use crate::settings::SettingValue;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub settings: BTreeMap<String, SettingValue>,
}

/// POST /heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Extension(ctx): Extension<RequestContext>,
    JsonBody(request): JsonBody<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let user_id = state.guard().require_authenticated(&session)?;
    let report = request.validate()?;

    let response = state
        .heartbeat()
        .beat(user_id, &report, ctx.ip_address.as_deref())
        .await?;

    if response.first_check_in {
        state
            .event_log()
            .info(
                Some(user_id),
                &format!(
                    "Machine registered (HostName={}, MachineId={})",
                    report.host_name, response.machine_id
                ),
                Category::Heartbeat,
            )
            .await;
    }

    Ok(Json(response))
}

/// GET /settings
pub async fn settings(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<SettingsResponse>, AppError> {
    let user_id = state.guard().require_authenticated(&session)?;
    let settings = state.settings().for_user(user_id).await?;

    Ok(Json(SettingsResponse { settings }))
}
