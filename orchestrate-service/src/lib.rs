pub mod api;
pub mod api_docs;
pub mod config;
pub mod events;
pub mod handlers;
pub mod images;
pub mod instances;
pub mod locks;
pub mod operations;
pub mod projects;
pub mod provider_manager;
pub mod service;
pub mod store;
pub mod templates;

use axum::routing::{get, post, put};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::service::Orchestrator;

pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Arc<Self> {
        Arc::new(Self { orchestrator })
    }
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(api_docs::ApiDoc::openapi())
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/api-docs/openapi.json", get(openapi))
        // Images
        .route("/images", post(handlers::create_image))
        // Templates
        .route("/templates", post(handlers::create_template))
        .route(
            "/projects/{project}/templates/{name}",
            axum::routing::delete(handlers::delete_template),
        )
        .route(
            "/projects/{project}/zones/{zone}/templates/{name}",
            get(handlers::get_template),
        )
        .route(
            "/projects/{project}/zones/{zone}/templates/{name}/sizes",
            post(handlers::add_size),
        )
        .route(
            "/projects/{project}/zones/{zone}/templates/{name}/sizes/{size}",
            axum::routing::delete(handlers::delete_size),
        )
        .route(
            "/projects/{project}/zones/{zone}/templates/{name}/default_size",
            put(handlers::set_default_size),
        )
        // Instances
        .route("/instances", post(handlers::create_instance))
        // Projects
        .route("/projects/{project}/register", post(handlers::register_project))
        .route("/projects/{project}/deregister", post(handlers::deregister_project))
        // Operations
        .route("/operations/{request_id}", get(handlers::get_operation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
