use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;
pub mod error;
pub mod naming;
pub mod steps;

pub use error::{ErrorKind, OrchestrateError, Result};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    #[default]
    Unknown,
    Linux,
    Windows,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Unknown => "unknown",
            OsType::Linux => "linux",
            OsType::Windows => "windows",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Unregistered,
    Registered,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,   // Accepted, no work started yet
    Running,   // Worker picked it up
    Succeeded, // Terminal
    Failed,    // Terminal, carries an error kind
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateImage,
    CreateTemplate,
    DeleteTemplate,
    CreateInstance,
    RegisterProject,
    DeregisterProject,
    AddSize,
    DeleteSize,
    SetDefaultSize,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateImage => "create_image",
            OperationKind::CreateTemplate => "create_template",
            OperationKind::DeleteTemplate => "delete_template",
            OperationKind::CreateInstance => "create_instance",
            OperationKind::RegisterProject => "register_project",
            OperationKind::DeregisterProject => "deregister_project",
            OperationKind::AddSize => "add_size",
            OperationKind::DeleteSize => "delete_size",
            OperationKind::SetDefaultSize => "set_default_size",
        }
    }
}

// --- Metadata ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, utoipa::ToSchema)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

impl MetadataEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Returns the first key that appears more than once.
pub fn duplicate_metadata_key(entries: &[MetadataEntry]) -> Option<&str> {
    let mut seen = std::collections::HashSet::new();
    entries
        .iter()
        .find(|e| !seen.insert(e.key.as_str()))
        .map(|e| e.key.as_str())
}

/// Key-wise merge: entries in `overrides` replace entries in `base` with the same key.
/// Order of `base` is kept, new keys are appended in `overrides` order.
pub fn merge_metadata(base: &[MetadataEntry], overrides: &[MetadataEntry]) -> Vec<MetadataEntry> {
    let mut out: Vec<MetadataEntry> = base.to_vec();
    for entry in overrides {
        match out.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => existing.value = entry.value.clone(),
            None => out.push(entry.clone()),
        }
    }
    out
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct Project {
    pub name: String,
    pub state: ProjectState,
    pub service_account: Option<String>,
    pub registered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct Image {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub image_family: String,
    pub image_project: String,
    pub steps: Vec<String>,
    pub metadata: Vec<MetadataEntry>,
    pub disk_size_gb: i64,
    pub network: String,
    pub os_type: OsType,
    pub api_project: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One resource-shape variant of a Template. Backed by exactly one provider instance-template.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct Size {
    pub name: String,
    pub memory_mb: i64,
    pub cpus: i32,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub gpu_count: i32,
    pub disk_size_gb: i64,
    #[serde(default = "default_disk_type")]
    pub disk_type: String,
    /// Size-specific overrides of the Template's shared metadata.
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

fn default_disk_type() -> String {
    "pd-standard".to_string()
}

impl Size {
    pub fn has_gpu(&self) -> bool {
        self.gpu_count > 0 && self.gpu_type.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct Template {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub image_family: String,
    pub image_project: String,
    pub network: String,
    pub subnetwork: String,
    pub static_ip: bool,
    pub scopes: Vec<String>,
    pub instance_name_pattern: String,
    pub sizes: Vec<Size>,
    pub default_size_name: Option<String>,
    pub metadata: Vec<MetadataEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn size(&self, name: &str) -> Option<&Size> {
        self.sizes.iter().find(|s| s.name == name)
    }

    pub fn has_size(&self, name: &str) -> bool {
        self.size(name).is_some()
    }
}

/// Record of the single provider instance-template backing one Size.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct SizeBinding {
    pub project: String,
    pub zone: String,
    pub template: String,
    pub size: String,
    pub instance_template: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, utoipa::ToSchema)]
pub struct Operation {
    pub request_id: Uuid,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub detail: String,
    pub error_kind: Option<ErrorKind>,
    pub project: Option<String>,
    pub target: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keys_are_reported() {
        let entries = vec![
            MetadataEntry::new("a", "1"),
            MetadataEntry::new("b", "2"),
            MetadataEntry::new("a", "3"),
        ];
        assert_eq!(duplicate_metadata_key(&entries), Some("a"));
        assert_eq!(duplicate_metadata_key(&entries[..2]), None);
    }

    #[test]
    fn merge_overrides_keywise() {
        let base = vec![MetadataEntry::new("a", "1"), MetadataEntry::new("b", "2")];
        let overrides = vec![MetadataEntry::new("b", "20"), MetadataEntry::new("c", "30")];
        let merged = merge_metadata(&base, &overrides);
        assert_eq!(
            merged,
            vec![
                MetadataEntry::new("a", "1"),
                MetadataEntry::new("b", "20"),
                MetadataEntry::new("c", "30"),
            ]
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OperationStatus::Pending.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Succeeded.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
    }

    #[test]
    fn size_without_type_has_no_gpu() {
        let size = Size {
            name: "small".into(),
            memory_mb: 4096,
            cpus: 2,
            gpu_type: None,
            gpu_count: 1,
            disk_size_gb: 50,
            disk_type: default_disk_type(),
            metadata: vec![],
        };
        assert!(!size.has_gpu());
    }
}
