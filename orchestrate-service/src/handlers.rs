use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use uuid::Uuid;

use orchestrate_common::{ErrorKind, Operation, OrchestrateError, Size, Template};

use crate::api::{
    AcceptedResponse, CreateImageRequest, CreateInstanceRequest, CreateTemplateRequest,
    DeleteTemplateQuery, ErrorResponse, SetDefaultSizeRequest,
};
use crate::AppState;

/// Maps the error taxonomy onto HTTP statuses.
pub struct ApiError(pub OrchestrateError);

impl From<OrchestrateError> for ApiError {
    fn from(err: OrchestrateError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::UnknownStep | ErrorKind::Pattern => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::Provider => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::PartialCreate
        | ErrorKind::PartialDelete
        | ErrorKind::Store
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error_kind = kind.as_str(), error = %self.0, "request failed");
        } else {
            tracing::debug!(error_kind = kind.as_str(), error = %self.0, "request rejected");
        }
        let body = ErrorResponse {
            error: kind.as_str().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type Accepted = Result<(StatusCode, Json<AcceptedResponse>), ApiError>;

fn accepted(resp: AcceptedResponse) -> (StatusCode, Json<AcceptedResponse>) {
    (StatusCode::ACCEPTED, Json(resp))
}

pub async fn root() -> &'static str {
    "Orchestrate control plane"
}

#[utoipa::path(
    post,
    path = "/images",
    tag = "Images",
    request_body = CreateImageRequest,
    responses(
        (status = 202, description = "Image build accepted", body = AcceptedResponse),
        (status = 400, description = "Invalid request or unknown step", body = ErrorResponse),
        (status = 404, description = "Project not registered", body = ErrorResponse),
        (status = 409, description = "Image already exists", body = ErrorResponse)
    )
)]
pub async fn create_image(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateImageRequest>,
) -> Accepted {
    let resp = state.orchestrator.create_image(req.into_image()).await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    post,
    path = "/templates",
    tag = "Templates",
    request_body = CreateTemplateRequest,
    responses(
        (status = 202, description = "Template creation accepted", body = AcceptedResponse),
        (status = 400, description = "Invalid template", body = ErrorResponse),
        (status = 404, description = "Project not registered", body = ErrorResponse),
        (status = 409, description = "Template already exists", body = ErrorResponse)
    )
)]
pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTemplateRequest>,
) -> Accepted {
    let resp = state.orchestrator.create_template(req.into_template()).await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    delete,
    path = "/projects/{project}/templates/{name}",
    tag = "Templates",
    params(
        ("project" = String, Path, description = "Project"),
        ("name" = String, Path, description = "Template name"),
        DeleteTemplateQuery
    ),
    responses(
        (status = 202, description = "Template deletion accepted", body = AcceptedResponse),
        (status = 404, description = "Template not found", body = ErrorResponse),
        (status = 409, description = "Name exists in several zones", body = ErrorResponse)
    )
)]
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path((project, name)): Path<(String, String)>,
    Query(q): Query<DeleteTemplateQuery>,
) -> Accepted {
    let resp = state
        .orchestrator
        .delete_template(&project, &name, q.zone.as_deref())
        .await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    get,
    path = "/projects/{project}/zones/{zone}/templates/{name}",
    tag = "Templates",
    params(
        ("project" = String, Path, description = "Project"),
        ("zone" = String, Path, description = "Zone"),
        ("name" = String, Path, description = "Template name")
    ),
    responses(
        (status = 200, description = "Template", body = Template),
        (status = 404, description = "Template not found", body = ErrorResponse)
    )
)]
pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path((project, zone, name)): Path<(String, String, String)>,
) -> Result<Json<Template>, ApiError> {
    Ok(Json(state.orchestrator.get_template(&project, &zone, &name).await?))
}

#[utoipa::path(
    post,
    path = "/projects/{project}/zones/{zone}/templates/{name}/sizes",
    tag = "Templates",
    params(
        ("project" = String, Path, description = "Project"),
        ("zone" = String, Path, description = "Zone"),
        ("name" = String, Path, description = "Template name")
    ),
    request_body = Size,
    responses(
        (status = 202, description = "Size creation accepted", body = AcceptedResponse),
        (status = 404, description = "Template not found", body = ErrorResponse),
        (status = 409, description = "Size already exists", body = ErrorResponse)
    )
)]
pub async fn add_size(
    State(state): State<Arc<AppState>>,
    Path((project, zone, name)): Path<(String, String, String)>,
    Json(size): Json<Size>,
) -> Accepted {
    let resp = state.orchestrator.add_size(&project, &zone, &name, size).await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    delete,
    path = "/projects/{project}/zones/{zone}/templates/{name}/sizes/{size}",
    tag = "Templates",
    params(
        ("project" = String, Path, description = "Project"),
        ("zone" = String, Path, description = "Zone"),
        ("name" = String, Path, description = "Template name"),
        ("size" = String, Path, description = "Size name")
    ),
    responses(
        (status = 202, description = "Size deletion accepted", body = AcceptedResponse),
        (status = 404, description = "Template or size not found", body = ErrorResponse),
        (status = 409, description = "Size is the template default", body = ErrorResponse)
    )
)]
pub async fn delete_size(
    State(state): State<Arc<AppState>>,
    Path((project, zone, name, size)): Path<(String, String, String, String)>,
) -> Accepted {
    let resp = state
        .orchestrator
        .delete_size(&project, &zone, &name, &size)
        .await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    put,
    path = "/projects/{project}/zones/{zone}/templates/{name}/default_size",
    tag = "Templates",
    params(
        ("project" = String, Path, description = "Project"),
        ("zone" = String, Path, description = "Zone"),
        ("name" = String, Path, description = "Template name")
    ),
    request_body = SetDefaultSizeRequest,
    responses(
        (status = 202, description = "Default size change accepted", body = AcceptedResponse),
        (status = 404, description = "Template or size not found", body = ErrorResponse)
    )
)]
pub async fn set_default_size(
    State(state): State<Arc<AppState>>,
    Path((project, zone, name)): Path<(String, String, String)>,
    Json(req): Json<SetDefaultSizeRequest>,
) -> Accepted {
    let resp = state
        .orchestrator
        .set_default_size(&project, &zone, &name, req.size.trim())
        .await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    post,
    path = "/instances",
    tag = "Instances",
    request_body = CreateInstanceRequest,
    responses(
        (status = 202, description = "Instance creation accepted", body = AcceptedResponse),
        (status = 400, description = "Invalid request or unresolvable naming pattern", body = ErrorResponse),
        (status = 404, description = "Template or size not found", body = ErrorResponse)
    )
)]
pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInstanceRequest>,
) -> Accepted {
    let resp = state.orchestrator.create_instance(req.into()).await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    post,
    path = "/projects/{project}/register",
    tag = "Projects",
    params(("project" = String, Path, description = "Project")),
    responses((status = 202, description = "Registration accepted", body = AcceptedResponse))
)]
pub async fn register_project(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Accepted {
    let resp = state.orchestrator.register_project(project.trim()).await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    post,
    path = "/projects/{project}/deregister",
    tag = "Projects",
    params(("project" = String, Path, description = "Project")),
    responses(
        (status = 202, description = "Deregistration accepted", body = AcceptedResponse),
        (status = 404, description = "Project not registered", body = ErrorResponse),
        (status = 409, description = "Project still owns templates or images", body = ErrorResponse)
    )
)]
pub async fn deregister_project(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Accepted {
    let resp = state.orchestrator.deregister_project(project.trim()).await?;
    Ok(accepted(resp))
}

#[utoipa::path(
    get,
    path = "/operations/{request_id}",
    tag = "Operations",
    params(("request_id" = Uuid, Path, description = "Operation id")),
    responses(
        (status = 200, description = "Operation status", body = Operation),
        (status = 404, description = "Unknown operation", body = ErrorResponse)
    )
)]
pub async fn get_operation(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Operation>, ApiError> {
    Ok(Json(state.orchestrator.get_operation(request_id).await?))
}
