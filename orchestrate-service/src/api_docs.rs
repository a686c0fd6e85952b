use orchestrate_common::{
    ErrorKind, MetadataEntry, Operation, OperationKind, OperationStatus, OsType, Size, Template,
};
use utoipa::OpenApi;

use crate::api;
use crate::handlers;

#[derive(OpenApi)]
#[openapi(
    paths(
        // Images
        handlers::create_image,
        // Templates
        handlers::create_template,
        handlers::delete_template,
        handlers::get_template,
        handlers::add_size,
        handlers::delete_size,
        handlers::set_default_size,
        // Instances
        handlers::create_instance,
        // Projects
        handlers::register_project,
        handlers::deregister_project,
        // Operations
        handlers::get_operation
    ),
    components(
        schemas(
            api::CreateImageRequest,
            api::CreateTemplateRequest,
            api::CreateInstanceRequest,
            api::SetDefaultSizeRequest,
            api::AcceptedResponse,
            api::ErrorResponse,
            Template,
            Size,
            MetadataEntry,
            OsType,
            Operation,
            OperationKind,
            OperationStatus,
            ErrorKind
        )
    ),
    tags(
        (name = "Images", description = "Provisioned image builds"),
        (name = "Templates", description = "Templates and their sizes"),
        (name = "Instances", description = "Instances spawned from a template size"),
        (name = "Projects", description = "Project registration"),
        (name = "Operations", description = "Asynchronous operation status")
    )
)]
pub struct ApiDoc;
