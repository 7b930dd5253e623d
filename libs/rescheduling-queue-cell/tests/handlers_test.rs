use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use appointment_cell::SchedulingState;
use rescheduling_queue_cell::rescheduling_queue_routes;
use shared_utils::test_utils::{JwtTestUtils, MockSupabaseResponses, TestConfig, TestUser};

fn app(mock_server: &MockServer) -> (Router, TestConfig) {
    let config = TestConfig::with_supabase_url(mock_server.uri());
    let state = Arc::new(SchedulingState::new(config.to_arc()));
    (rescheduling_queue_routes(state), config)
}

fn request(http_method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(http_method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token));

    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A `scheduled` appointment whose unit belongs to `organization_id`.
async fn mount_scheduled_appointment(mock_server: &MockServer, appointment_id: &str, organization_id: &str) {
    let unit_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("id", format!("eq.{}", appointment_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::appointment_row(
                appointment_id,
                &Uuid::new_v4().to_string(),
                &Uuid::new_v4().to_string(),
                &unit_id,
                "2024-03-01T15:00:00Z",
                "2024-03-01T15:30:00Z",
                "scheduled",
            )
        ])))
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/treatment_units"))
        .and(query_param("id", format!("eq.{}", unit_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::unit_with_clinic_row(
                &unit_id,
                &Uuid::new_v4().to_string(),
                organization_id,
                Some("America/Mexico_City"),
            )
        ])))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_queue_requires_organization() {
    let mock_server = MockServer::start().await;
    let (app, config) = app(&mock_server);
    let token = JwtTestUtils::create_test_token(&TestUser::default(), &config.jwt_secret, None);

    let response = app.oneshot(request("GET", "/", &token, None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_list_queue_reports_total_from_content_range() {
    let mock_server = MockServer::start().await;
    let (app, config) = app(&mock_server);
    let token = JwtTestUtils::create_test_token(&TestUser::staff("frontdesk@clinic.example", "org-1"), &config.jwt_secret, None);

    let appointment_id = Uuid::new_v4().to_string();
    let mut row = MockSupabaseResponses::appointment_row(
        &appointment_id,
        &Uuid::new_v4().to_string(),
        &Uuid::new_v4().to_string(),
        &Uuid::new_v4().to_string(),
        "2024-03-01T15:00:00Z",
        "2024-03-01T15:30:00Z",
        "needs_rescheduling",
    );
    row["moved_to_needs_rescheduling_at"] = json!("2024-01-01T00:00:00Z");
    row["patient"] = json!({ "full_name": "Ana Lopez", "phone": null, "email": "ana@example.com" });
    row["doctor"] = json!({ "full_name": "Dr. Ruiz" });
    row["unit"] = json!({ "name": "Room", "clinic_id": Uuid::new_v4(), "clinic": null });

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("status", "eq.needs_rescheduling"))
        .and(query_param("unit.clinic.organization_id", "eq.org-1"))
        .and(query_param("limit", "20"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Range", "0-0/41")
                .set_body_json(json!([row])),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = app.oneshot(request("GET", "/", &token, None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["total"], 41);
    assert_eq!(body["total_pages"], 3);
    assert_eq!(body["items"][0]["id"], appointment_id);
    assert_eq!(body["items"][0]["patient_name"], "Ana Lopez");
    assert_eq!(body["items"][0]["doctor_name"], "Dr. Ruiz");
}

#[tokio::test]
async fn test_invalid_page_is_bad_request() {
    let mock_server = MockServer::start().await;
    let (app, config) = app(&mock_server);
    let token = JwtTestUtils::create_test_token(&TestUser::staff("frontdesk@clinic.example", "org-1"), &config.jwt_secret, None);

    let response = app.oneshot(request("GET", "/?page=0", &token, None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_scheduled_appointment_is_conflict() {
    let mock_server = MockServer::start().await;
    let (app, config) = app(&mock_server);
    let token = JwtTestUtils::create_test_token(&TestUser::staff("frontdesk@clinic.example", "org-1"), &config.jwt_secret, None);
    let appointment_id = Uuid::new_v4().to_string();

    mount_scheduled_appointment(&mock_server, &appointment_id, "org-1").await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let response = app
        .oneshot(request(
            "POST",
            &format!("/{}/cancel", appointment_id),
            &token,
            Some(json!({ "reason_code": "PATIENT_REQUEST" })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_foreign_scheduled_appointment_is_forbidden() {
    let mock_server = MockServer::start().await;
    let (app, config) = app(&mock_server);
    let token = JwtTestUtils::create_test_token(&TestUser::staff("frontdesk@other.example", "org-2"), &config.jwt_secret, None);
    let appointment_id = Uuid::new_v4().to_string();

    mount_scheduled_appointment(&mock_server, &appointment_id, "org-1").await;

    let response = app
        .oneshot(request(
            "POST",
            &format!("/{}/cancel", appointment_id),
            &token,
            Some(json!({ "reason_code": "PATIENT_REQUEST" })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
