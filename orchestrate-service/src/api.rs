//! Request/response bodies of the HTTP surface.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use orchestrate_common::{Image, MetadataEntry, OsType, Size, Template};

use crate::instances::InstanceRequest;

#[derive(Deserialize, Serialize, Debug, Clone, ToSchema)]
pub struct CreateImageRequest {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub image_family: String,
    pub image_project: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    /// GB; 0 keeps the base image's size.
    #[serde(default)]
    pub disk_size: i64,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub os_type: OsType,
    #[serde(default)]
    pub api_project: Option<String>,
}

impl CreateImageRequest {
    pub fn into_image(self) -> Image {
        Image {
            project: self.project.trim().to_string(),
            zone: self.zone.trim().to_string(),
            name: self.name.trim().to_string(),
            image_family: self.image_family,
            image_project: self.image_project,
            steps: self.steps,
            metadata: self.metadata,
            disk_size_gb: self.disk_size,
            network: self.network,
            os_type: self.os_type,
            api_project: self.api_project,
            created_at: Utc::now(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, ToSchema)]
pub struct CreateTemplateRequest {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub image_family: String,
    pub image_project: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub subnetwork: String,
    #[serde(default)]
    pub static_ip: bool,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub instance_name_pattern: String,
    pub sizes: Vec<Size>,
    #[serde(default)]
    pub default_size_name: Option<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

impl CreateTemplateRequest {
    pub fn into_template(self) -> Template {
        let now = Utc::now();
        Template {
            project: self.project.trim().to_string(),
            zone: self.zone.trim().to_string(),
            name: self.name.trim().to_string(),
            image_family: self.image_family,
            image_project: self.image_project,
            network: self.network,
            subnetwork: self.subnetwork,
            static_ip: self.static_ip,
            scopes: self.scopes,
            instance_name_pattern: self.instance_name_pattern,
            sizes: self.sizes,
            default_size_name: self.default_size_name.filter(|s| !s.trim().is_empty()),
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeleteTemplateQuery {
    /// Required only when the name exists in several zones.
    pub zone: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, ToSchema)]
pub struct CreateInstanceRequest {
    pub project: String,
    pub zone: String,
    pub template: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
    #[serde(default)]
    pub use_latest_image: bool,
    #[serde(default)]
    pub use_external_ip: bool,
    /// Value of the `{user}` naming token.
    #[serde(default)]
    pub user: Option<String>,
}

impl From<CreateInstanceRequest> for InstanceRequest {
    fn from(req: CreateInstanceRequest) -> Self {
        InstanceRequest {
            project: req.project.trim().to_string(),
            zone: req.zone.trim().to_string(),
            template: req.template.trim().to_string(),
            size: req.size.trim().to_string(),
            name: req.name.trim().to_string(),
            metadata: req.metadata,
            use_latest_image: req.use_latest_image,
            use_external_ip: req.use_external_ip,
            user: req.user.filter(|u| !u.trim().is_empty()),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, ToSchema)]
pub struct SetDefaultSizeRequest {
    pub size: String,
}

/// Returned by every mutating call once the Operation exists.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, ToSchema)]
pub struct AcceptedResponse {
    pub status: String,
    pub request_id: Uuid,
    /// Resolved instance name (CreateInstance only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
