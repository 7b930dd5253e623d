// libs/rescheduling-queue-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, Extension},
    Json,
};
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use appointment_cell::SchedulingState;
use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::extractor::require_organization;

use crate::models::{CancelFromQueueRequest, RescheduleFromQueueRequest, ReschedulingQueueQuery, SnoozeRequest};
use crate::services::queue::ReschedulingQueueService;

fn queue_service(state: &SchedulingState, token: &str) -> ReschedulingQueueService {
    ReschedulingQueueService::new(Arc::new(state.service_for(token)))
}

#[axum::debug_handler]
pub async fn list_queue(
    State(state): State<Arc<SchedulingState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Query(query): Query<ReschedulingQueueQuery>,
) -> Result<Json<Value>, AppError> {
    let organization_id = require_organization(&user)?;
    debug!("User {} listing rescheduling queue", user.id);

    let page = queue_service(&state, auth.token())
        .list_queue(&organization_id, query)
        .await?;

    Ok(Json(json!(page)))
}

#[axum::debug_handler]
pub async fn cancel_from_queue(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CancelFromQueueRequest>,
) -> Result<Json<Value>, AppError> {
    let organization_id = require_organization(&user)?;

    let appointment = queue_service(&state, auth.token())
        .cancel_from_queue(appointment_id, &organization_id, request)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment cancelled"
    })))
}

#[axum::debug_handler]
pub async fn reschedule_from_queue(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<RescheduleFromQueueRequest>,
) -> Result<Json<Value>, AppError> {
    let organization_id = require_organization(&user)?;

    let result = queue_service(&state, auth.token())
        .reschedule_from_queue(appointment_id, &organization_id, request)
        .await?;

    Ok(Json(json!({
        "success": true,
        "original": result.original,
        "appointment": result.replacement,
        "message": "Appointment rescheduled"
    })))
}

#[axum::debug_handler]
pub async fn snooze(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<SnoozeRequest>,
) -> Result<Json<Value>, AppError> {
    let organization_id = require_organization(&user)?;

    let appointment = queue_service(&state, auth.token())
        .snooze(appointment_id, &organization_id, request)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment snoozed"
    })))
}
