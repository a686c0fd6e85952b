// Image provisioning pipeline over HTTP
mod common;

use common::*;
use orchestrate_common::bus::OperationEventType;
use orchestrate_common::steps::ProvisioningStep;
use orchestrate_common::{ErrorKind, OperationStatus};
use serde_json::{json, Value};

fn image_json(steps: &[&str]) -> Value {
    json!({
        "project": PROJECT,
        "zone": ZONE,
        "name": "render-node-v1",
        "image_family": "centos-7",
        "image_project": "centos-cloud",
        "steps": steps,
        "metadata": [
            {"key": "gpu_driver_version", "value": "535.104"},
            {"key": "blender_version", "value": "4.1"},
            {"key": "teradici_registration_code", "value": "abc-123"}
        ],
        "disk_size": 120,
        "network": "render-net",
        "os_type": "linux",
    })
}

#[tokio::test]
async fn test_create_image_runs_steps_and_captures() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;

    let response = app
        .server
        .post("/images")
        .json(&image_json(&["disable_selinux", "install_gpu_driver", "install_blender"]))
        .await;
    let op = accepted_and_finished(response, &app.server).await;
    assert_eq!(op.status, OperationStatus::Succeeded, "{}", op.detail);

    let steps: Vec<String> = app
        .provider
        .applied_steps()
        .into_iter()
        .map(|(_, step)| step)
        .collect();
    assert_eq!(steps, vec!["disable_selinux", "install_gpu_driver", "install_blender"]);

    let image = app.provider.image(PROJECT, "render-node-v1").unwrap();
    assert_eq!(image.disk_size_gb, 120);
    assert_eq!(image.network, "render-net");
    assert!(app.provider.instances(PROJECT).is_empty());

    let types: Vec<OperationEventType> = app
        .publisher
        .events()
        .into_iter()
        .filter(|e| e.request_id == op.request_id)
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types.first(), Some(&OperationEventType::Accepted));
    assert_eq!(types.last(), Some(&OperationEventType::Succeeded));
}

#[tokio::test]
async fn test_step_two_of_three_fails() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;
    app.provider
        .fail_step(ProvisioningStep::InstallTeradici, "license server unreachable");

    let response = app
        .server
        .post("/images")
        .json(&image_json(&["install_gpu_driver", "install_teradici", "install_blender"]))
        .await;
    let op = accepted_and_finished(response, &app.server).await;

    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.error_kind, Some(ErrorKind::Provider));
    assert!(op.detail.contains("install_teradici"), "{}", op.detail);
    assert!(op.detail.contains("license server unreachable"), "{}", op.detail);
    assert!(app.provider.images(PROJECT).is_empty());
    assert!(app.provider.instances(PROJECT).is_empty());
    assert_eq!(app.provider.applied_steps().len(), 2);
}

#[tokio::test]
async fn test_unknown_step_fails_before_booting() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;

    let response = app
        .server
        .post("/images")
        .json(&image_json(&["install_gpu_driver", "install_flash"]))
        .await;
    assert_eq!(response.status_code(), 400);
    let err: Value = response.json();
    assert_eq!(err["error"], "unknown_step");
    assert!(app.provider.calls().iter().all(|c| !c.starts_with("create_instance")));
}

#[tokio::test]
async fn test_unknown_os_type_is_rejected() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;

    let mut body = image_json(&[]);
    body["os_type"] = json!("unknown");
    let response = app.server.post("/images").json(&body).await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_windows_only_step_on_linux_is_rejected() {
    let app = create_test_app();
    register(&app.server, PROJECT).await;

    let response = app
        .server
        .post("/images")
        .json(&image_json(&["join_domain"]))
        .await;
    assert_eq!(response.status_code(), 400);
    let err: Value = response.json();
    assert_eq!(err["error"], "validation");
}
