// Project registration and service surface
mod common;

use common::*;
use orchestrate_common::OperationStatus;
use serde_json::Value;

#[tokio::test]
async fn test_root() {
    let app = create_test_app();
    let response = app.server.get("/").await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_openapi_document() {
    let app = create_test_app();
    let response = app.server.get("/api-docs/openapi.json").await;
    assert_eq!(response.status_code(), 200);
    let doc: Value = response.json();
    assert!(doc["paths"]["/templates"].is_object());
    assert!(doc["paths"]["/operations/{request_id}"].is_object());
}

#[tokio::test]
async fn test_register_grants_access_and_is_idempotent() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    register(&app.server, PROJECT).await;
    assert_eq!(app.provider.access(PROJECT), vec!["orchestrate@test"]);
}

#[tokio::test]
async fn test_deregister_unknown_project() {
    let app = create_test_app();
    let response = app.server.post("/projects/nowhere/deregister").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_deregister_with_templates_conflicts() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    create_template(&app.server, "vfx", &["small"]).await;

    let response = app
        .server
        .post(&format!("/projects/{}/deregister", PROJECT))
        .await;
    assert_eq!(response.status_code(), 409);

    let response = app
        .server
        .delete(&format!("/projects/{}/templates/vfx", PROJECT))
        .await;
    accepted_and_finished(response, &app.server).await;

    let response = app
        .server
        .post(&format!("/projects/{}/deregister", PROJECT))
        .await;
    let op = accepted_and_finished(response, &app.server).await;
    assert_eq!(op.status, OperationStatus::Succeeded, "{}", op.detail);
    assert!(app.provider.access(PROJECT).is_empty());

    // The gate applies again once deregistered.
    let response = app
        .server
        .post("/templates")
        .json(&template_json("vfx", &["small"]))
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_unknown_operation() {
    let app = create_test_app();
    let response = app
        .server
        .get(&format!("/operations/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(response.status_code(), 404);
}
