use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use appointment_cell::{appointment_routes, SchedulingState};
use rescheduling_queue_cell::rescheduling_queue_routes;

pub fn create_router(state: Arc<SchedulingState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic scheduling API is running!" }))
        .nest("/appointments", appointment_routes(state.clone()))
        .nest("/rescheduling-queue", rescheduling_queue_routes(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use shared_utils::test_utils::TestConfig;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = TestConfig::with_supabase_url("http://127.0.0.1:9");
        create_router(Arc::new(SchedulingState::new(config.to_arc())))
    }

    #[tokio::test]
    async fn test_root_reports_running() {
        let response = app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"Clinic scheduling API is running!");
    }

    #[tokio::test]
    async fn test_cells_are_nested_behind_auth() {
        let id = uuid::Uuid::new_v4();
        let cases = [
            ("GET", format!("/appointments/{}", id)),
            ("POST", format!("/rescheduling-queue/{}/snooze", id)),
        ];

        for (method, uri) in cases {
            let response = app()
                .oneshot(Request::builder().method(method).uri(&uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }
}
