// Template & size lifecycle over HTTP
mod common;

use common::*;
use orchestrate_common::{ErrorKind, OperationStatus, Template};
use serde_json::json;

#[tokio::test]
async fn test_create_template_one_instance_template_per_size() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;

    let op = create_template(&app.server, "vfx", &["small", "medium", "large"]).await;
    assert_eq!(op.status, OperationStatus::Succeeded, "{}", op.detail);

    let live = app.provider.instance_templates(PROJECT);
    assert_eq!(live, vec!["vfx-large", "vfx-medium", "vfx-small"]);

    let response = app
        .server
        .get(&format!("/projects/{}/zones/{}/templates/vfx", PROJECT, ZONE))
        .await;
    assert_eq!(response.status_code(), 200);
    let template: Template = response.json();
    assert_eq!(template.sizes.len(), live.len());
    assert_eq!(template.default_size_name.as_deref(), Some("small"));
}

#[tokio::test]
async fn test_create_template_bad_default_creates_nothing() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;

    let mut body = template_json("vfx", &["small", "large"]);
    body["default_size_name"] = json!("huge");
    let response = app.server.post("/templates").json(&body).await;

    assert_eq!(response.status_code(), 400);
    let err: serde_json::Value = response.json();
    assert_eq!(err["error"], "validation");
    assert!(app.provider.instance_templates(PROJECT).is_empty());
    assert!(app
        .provider
        .calls()
        .iter()
        .all(|c| !c.starts_with("create_instance_template")));
}

#[tokio::test]
async fn test_create_template_duplicate_name_conflicts() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    create_template(&app.server, "vfx", &["small"]).await;

    let response = app
        .server
        .post("/templates")
        .json(&template_json("vfx", &["small"]))
        .await;
    assert_eq!(response.status_code(), 409);
}

#[tokio::test]
async fn test_create_template_requires_registered_project() {
    let app = create_test_app();
    let response = app
        .server
        .post("/templates")
        .json(&template_json("vfx", &["small"]))
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_partial_create_is_rolled_back() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    app.provider
        .fail_instance_template_create("vfx-large", "quota exceeded");

    let op = create_template(&app.server, "vfx", &["small", "medium", "large"]).await;
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.error_kind, Some(ErrorKind::PartialCreate));
    assert!(op.detail.contains("'large'"), "{}", op.detail);
    assert!(op.detail.contains("quota exceeded"), "{}", op.detail);

    assert!(app.provider.instance_templates(PROJECT).is_empty());
    let response = app
        .server
        .get(&format!("/projects/{}/zones/{}/templates/vfx", PROJECT, ZONE))
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_delete_template_is_idempotent() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    create_template(&app.server, "vfx", &["small", "medium", "large"]).await;

    let response = app
        .server
        .delete(&format!("/projects/{}/templates/vfx", PROJECT))
        .await;
    let op = accepted_and_finished(response, &app.server).await;
    assert_eq!(op.status, OperationStatus::Succeeded, "{}", op.detail);
    assert!(app.provider.instance_templates(PROJECT).is_empty());

    let response = app
        .server
        .delete(&format!("/projects/{}/templates/vfx", PROJECT))
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_delete_template_reports_failed_sizes() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    create_template(&app.server, "vfx", &["small", "medium", "large"]).await;
    app.provider
        .fail_instance_template_delete("vfx-medium", "resource in use");

    let response = app
        .server
        .delete(&format!("/projects/{}/templates/vfx?zone={}", PROJECT, ZONE))
        .await;
    let op = accepted_and_finished(response, &app.server).await;
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.error_kind, Some(ErrorKind::PartialDelete));
    assert!(op.detail.contains("medium"), "{}", op.detail);
    assert_eq!(app.provider.instance_templates(PROJECT), vec!["vfx-medium"]);

    let template: Template = app
        .server
        .get(&format!("/projects/{}/zones/{}/templates/vfx", PROJECT, ZONE))
        .await
        .json();
    let names: Vec<&str> = template.sizes.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["medium"]);
}

#[tokio::test]
async fn test_size_operations() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    create_template(&app.server, "vfx", &["small", "large"]).await;
    let base = format!("/projects/{}/zones/{}/templates/vfx", PROJECT, ZONE);

    // AddSize
    let response = app
        .server
        .post(&format!("{}/sizes", base))
        .json(&size_json("xl", 32))
        .await;
    let op = accepted_and_finished(response, &app.server).await;
    assert_eq!(op.status, OperationStatus::Succeeded, "{}", op.detail);
    assert!(app.provider.instance_template(PROJECT, "vfx-xl").is_some());

    let response = app
        .server
        .post(&format!("{}/sizes", base))
        .json(&size_json("xl", 32))
        .await;
    assert_eq!(response.status_code(), 409);

    // DeleteSize on the default is rejected
    let response = app.server.delete(&format!("{}/sizes/small", base)).await;
    assert_eq!(response.status_code(), 409);
    let err: serde_json::Value = response.json();
    assert_eq!(err["error"], "invalid_state");

    // SetDefaultSize
    let response = app
        .server
        .put(&format!("{}/default_size", base))
        .json(&json!({"size": "missing"}))
        .await;
    assert_eq!(response.status_code(), 404);
    let response = app
        .server
        .put(&format!("{}/default_size", base))
        .json(&json!({"size": "large"}))
        .await;
    accepted_and_finished(response, &app.server).await;

    let response = app.server.delete(&format!("{}/sizes/small", base)).await;
    let op = accepted_and_finished(response, &app.server).await;
    assert_eq!(op.status, OperationStatus::Succeeded, "{}", op.detail);

    let template: Template = app.server.get(&base).await.json();
    assert_eq!(template.default_size_name.as_deref(), Some("large"));
    let names: Vec<&str> = template.sizes.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["large", "xl"]);
    assert_eq!(
        app.provider.instance_templates(PROJECT),
        vec!["vfx-large", "vfx-xl"]
    );
}

#[tokio::test]
async fn test_concurrent_add_size_and_delete_template_stay_consistent() {
    let app = create_test_app_with(
        orchestrate_providers::mock::MockProvider::new()
            .with_latency(std::time::Duration::from_millis(3)),
    );
    register(&app.server, PROJECT).await;
    create_template(&app.server, "vfx", &["small", "medium", "large"]).await;
    let base = format!("/projects/{}/zones/{}/templates/vfx", PROJECT, ZONE);

    let add = app
        .server
        .post(&format!("{}/sizes", base))
        .json(&size_json("xl", 32))
        .await;
    let delete = app
        .server
        .delete(&format!("/projects/{}/templates/vfx", PROJECT))
        .await;
    assert_eq!(add.status_code(), 202);
    assert_eq!(delete.status_code(), 202);

    let add_id = add.json::<orchestrate_service::api::AcceptedResponse>().request_id;
    let delete_id = delete.json::<orchestrate_service::api::AcceptedResponse>().request_id;
    wait_for_operation(&app.server, add_id).await;
    let deleted = wait_for_operation(&app.server, delete_id).await;
    assert_eq!(deleted.status, OperationStatus::Succeeded, "{}", deleted.detail);

    let response = app.server.get(&base).await;
    let live = app.provider.instance_templates(PROJECT);
    if response.status_code() == 404 {
        assert!(live.is_empty(), "leftover instance-templates {:?}", live);
    } else {
        let template: Template = response.json();
        assert_eq!(template.sizes.len(), live.len());
        assert!(!live.is_empty());
    }
}
