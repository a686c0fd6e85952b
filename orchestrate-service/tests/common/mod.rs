// Shared fixtures: the HTTP app over the in-memory store and the mock provider.
#![allow(dead_code)]

use axum_test::TestServer;
use orchestrate_common::{Operation, OperationStatus};
use orchestrate_providers::mock::MockProvider;
use orchestrate_service::api::AcceptedResponse;
use orchestrate_service::config::{Settings, Timeouts};
use orchestrate_service::events::RecordingPublisher;
use orchestrate_service::service::Orchestrator;
use orchestrate_service::store::MemoryStore;
use orchestrate_service::{app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const PROJECT: &str = "p1";
pub const ZONE: &str = "us-central1-a";

pub struct TestApp {
    pub server: TestServer,
    pub provider: Arc<MockProvider>,
    pub publisher: Arc<RecordingPublisher>,
}

pub fn test_settings() -> Settings {
    Settings {
        timeouts: Timeouts {
            operation: Duration::from_millis(500),
            step: Duration::from_millis(300),
            poll_interval: Duration::from_millis(5),
        },
        service_account: "orchestrate@test".to_string(),
        ..Settings::default()
    }
}

pub fn create_test_app_with(provider: MockProvider) -> TestApp {
    let provider = Arc::new(provider);
    let publisher = Arc::new(RecordingPublisher::new());
    let orchestrator = Orchestrator::new(
        Arc::new(MemoryStore::new()),
        provider.clone(),
        publisher.clone(),
        &test_settings(),
    );
    let server = TestServer::new(app(AppState::new(orchestrator))).unwrap();
    TestApp {
        server,
        provider,
        publisher,
    }
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(MockProvider::new())
}

/// Poll GET /operations/{id} until the Operation is terminal.
pub async fn wait_for_operation(server: &TestServer, id: Uuid) -> Operation {
    for _ in 0..400 {
        let response = server.get(&format!("/operations/{}", id)).await;
        assert_eq!(response.status_code(), 200);
        let op: Operation = response.json();
        if op.status.is_terminal() {
            return op;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("operation {} did not finish", id);
}

/// Submit a request that must be accepted and wait for its Operation.
pub async fn accepted_and_finished(response: axum_test::TestResponse, server: &TestServer) -> Operation {
    assert_eq!(response.status_code(), 202, "{}", response.text());
    let body: AcceptedResponse = response.json();
    assert_eq!(body.status, "accepted");
    wait_for_operation(server, body.request_id).await
}

pub async fn register(server: &TestServer, project: &str) {
    let response = server.post(&format!("/projects/{}/register", project)).await;
    let op = accepted_and_finished(response, server).await;
    assert_eq!(op.status, OperationStatus::Succeeded, "{}", op.detail);
}

pub fn size_json(name: &str, cpus: i64) -> Value {
    json!({
        "name": name,
        "cpus": cpus,
        "memory_mb": cpus * 4096,
        "disk_size_gb": 50,
    })
}

pub fn template_json(name: &str, sizes: &[&str]) -> Value {
    json!({
        "project": PROJECT,
        "zone": ZONE,
        "name": name,
        "image_family": "centos-7",
        "image_project": "centos-cloud",
        "network": "default",
        "subnetwork": "default",
        "scopes": ["https://www.googleapis.com/auth/devstorage.read_only"],
        "instance_name_pattern": "{type}-{region}-{size}",
        "sizes": sizes.iter().enumerate().map(|(i, s)| size_json(s, 2 << i)).collect::<Vec<_>>(),
        "default_size_name": sizes.first(),
        "metadata": [{"key": "team", "value": "render"}],
    })
}

pub async fn create_template(server: &TestServer, name: &str, sizes: &[&str]) -> Operation {
    let response = server.post("/templates").json(&template_json(name, sizes)).await;
    accepted_and_finished(response, server).await
}
