use anyhow::Result;
use async_trait::async_trait;
use orchestrate_common::{MetadataEntry, OsType};
use std::time::Duration;

/// Handle to a provider-side long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOperation {
    pub name: String,
    pub project: String,
    /// `None` for global operations (instance-templates, images).
    pub zone: Option<String>,
}

impl ProviderOperation {
    pub fn zonal(name: impl Into<String>, project: &str, zone: &str) -> Self {
        Self {
            name: name.into(),
            project: project.to_string(),
            zone: Some(zone.to_string()),
        }
    }

    pub fn global(name: impl Into<String>, project: &str) -> Self {
        Self {
            name: name.into(),
            project: project.to_string(),
            zone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Done,
    Failed(String),
}

/// Where a boot disk comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Newest non-deprecated image of the family at creation time.
    Family { project: String, family: String },
    /// A concrete image path (`projects/<p>/global/images/<name>`).
    Image(String),
}

impl ImageSource {
    pub fn family(project: &str, family: &str) -> Self {
        ImageSource::Family {
            project: project.to_string(),
            family: family.to_string(),
        }
    }

    pub fn path(&self) -> String {
        match self {
            ImageSource::Family { project, family } => {
                format!("projects/{}/global/images/family/{}", project, family)
            }
            ImageSource::Image(path) => path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub name: String,
    /// Create from this instance-template (global name) when set.
    pub source_instance_template: Option<String>,
    /// Overrides the template's boot image, or is the boot image when no template is used.
    pub image: Option<ImageSource>,
    pub machine_type: Option<String>,
    pub disk_size_gb: Option<i64>,
    pub network: Option<String>,
    pub metadata: Vec<MetadataEntry>,
    pub external_ip: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceTemplateSpec {
    pub name: String,
    pub cpus: i32,
    pub memory_mb: i64,
    pub gpu_type: Option<String>,
    pub gpu_count: i32,
    pub disk_size_gb: i64,
    pub disk_type: String,
    pub image: ImageSource,
    pub network: String,
    pub subnetwork: String,
    pub static_ip: bool,
    pub scopes: Vec<String>,
    pub metadata: Vec<MetadataEntry>,
}

impl InstanceTemplateSpec {
    /// Custom machine type for the requested shape, e.g. `custom-8-32768`.
    pub fn machine_type(&self) -> String {
        format!("custom-{}-{}", self.cpus, self.memory_mb)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    pub name: String,
    /// Zone of the disk the image is captured from.
    pub zone: String,
    pub source_disk: String,
    pub disk_size_gb: i64,
    pub network: String,
    pub os_type: OsType,
    pub labels: Vec<(String, String)>,
}

/// Thin client over the provider's compute API.
///
/// Delete methods return `Ok(None)` when the resource does not exist, so callers can
/// treat repeated deletes as success.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_instance(
        &self,
        project: &str,
        zone: &str,
        spec: &InstanceSpec,
    ) -> Result<ProviderOperation>;

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<ProviderOperation>>;

    async fn stop_instance(&self, project: &str, zone: &str, name: &str) -> Result<ProviderOperation>;

    /// Drop the `remove` keys, then merge `metadata` into the instance's metadata (same
    /// key replaces).
    async fn set_instance_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &[MetadataEntry],
        remove: &[&str],
    ) -> Result<ProviderOperation>;

    /// Read a guest attribute (`namespace/key`). `None` when not yet written.
    async fn get_guest_attribute(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>>;

    async fn create_instance_template(
        &self,
        project: &str,
        spec: &InstanceTemplateSpec,
    ) -> Result<ProviderOperation>;

    async fn delete_instance_template(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ProviderOperation>>;

    async fn instance_template_exists(&self, project: &str, name: &str) -> Result<bool>;

    async fn create_image(&self, project: &str, spec: &ImageSpec) -> Result<ProviderOperation>;

    async fn delete_image(&self, project: &str, name: &str) -> Result<Option<ProviderOperation>>;

    async fn image_exists(&self, project: &str, name: &str) -> Result<bool>;

    /// Resolve the newest image of a family to a concrete image path.
    async fn latest_image_from_family(&self, project: &str, family: &str) -> Result<String>;

    async fn get_operation(&self, op: &ProviderOperation) -> Result<OperationState>;

    // Optional: project access management.
    // Default is a no-op for providers where access is managed out of band.
    async fn grant_project_access(&self, _project: &str, _member: &str) -> Result<()> {
        Ok(())
    }

    async fn revoke_project_access(&self, _project: &str, _member: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("operation {0} did not finish within {1:?}")]
    Timeout(String, Duration),

    #[error("operation {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// Poll `op` until it finishes or `timeout` elapses.
pub async fn wait_for_operation(
    provider: &dyn ComputeProvider,
    op: &ProviderOperation,
    timeout: Duration,
    poll_interval: Duration,
) -> std::result::Result<(), WaitError> {
    match tokio::time::timeout(timeout, poll_until_done(provider, op, poll_interval)).await {
        Ok(res) => res,
        Err(_) => Err(WaitError::Timeout(op.name.clone(), timeout)),
    }
}

async fn poll_until_done(
    provider: &dyn ComputeProvider,
    op: &ProviderOperation,
    poll_interval: Duration,
) -> std::result::Result<(), WaitError> {
    loop {
        match provider.get_operation(op).await? {
            OperationState::Done => return Ok(()),
            OperationState::Failed(reason) => {
                return Err(WaitError::Failed {
                    name: op.name.clone(),
                    reason,
                })
            }
            OperationState::Running => tokio::time::sleep(poll_interval).await,
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "gce")]
pub mod gce;
