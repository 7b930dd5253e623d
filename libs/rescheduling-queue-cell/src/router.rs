// libs/rescheduling-queue-cell/src/router.rs
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
    middleware,
};

use appointment_cell::SchedulingState;
use shared_utils::extractor::auth_middleware;

use crate::handlers;

pub fn rescheduling_queue_routes(state: Arc<SchedulingState>) -> Router {
    let protected_routes = Router::new()
        .route("/", get(handlers::list_queue))
        .route("/{appointment_id}/cancel", post(handlers::cancel_from_queue))
        .route("/{appointment_id}/reschedule", post(handlers::reschedule_from_queue))
        .route("/{appointment_id}/snooze", post(handlers::snooze))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
