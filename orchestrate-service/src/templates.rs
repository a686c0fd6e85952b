//! Template & Size Lifecycle Manager.
//!
//! One Template record fans out to one provider instance-template per Size. Every mutation
//! of a Template runs under the Template's lock, so a record and its instance-templates are
//! only ever changed by one task at a time. Instance-template names are project-wide, so
//! creating one also takes the lock on that name.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use orchestrate_common::naming::{instance_template_name, validate_resource_name};
use orchestrate_common::{
    duplicate_metadata_key, merge_metadata, OrchestrateError, Result, Size, SizeBinding, Template,
};
use orchestrate_providers::{ComputeProvider, ImageSource, InstanceTemplateSpec};

use crate::config::Timeouts;
use crate::locks::{provider_resource_key, resource_key, KeyedLocks};
use crate::operations::ProgressReporter;
use crate::provider_manager::await_op;
use crate::store::Records;

pub fn template_lock_key(project: &str, zone: &str, name: &str) -> String {
    resource_key("template", project, zone, name)
}

pub fn instance_template_lock_key(project: &str, resource: &str) -> String {
    provider_resource_key("instance-template", project, resource)
}

/// A size resource that was not created. `accepted` is set once the provider took the
/// request, so whatever exists under that name was made by this call.
struct CreateFailure {
    error: OrchestrateError,
    accepted: bool,
}

/// Checks one Size in isolation.
pub fn validate_size(size: &Size) -> Result<()> {
    if size.name.trim().is_empty() {
        return Err(OrchestrateError::validation("size name is empty"));
    }
    if size.cpus <= 0 {
        return Err(OrchestrateError::validation(format!(
            "size '{}': cpu count must be positive",
            size.name
        )));
    }
    if size.memory_mb <= 0 {
        return Err(OrchestrateError::validation(format!(
            "size '{}': memory must be positive",
            size.name
        )));
    }
    if size.disk_size_gb < 0 {
        return Err(OrchestrateError::validation(format!(
            "size '{}': disk size cannot be negative",
            size.name
        )));
    }
    let has_type = size
        .gpu_type
        .as_deref()
        .map(|t| !t.trim().is_empty())
        .unwrap_or(false);
    if size.gpu_count < 0 || (size.gpu_count > 0) != has_type {
        return Err(OrchestrateError::validation(format!(
            "size '{}': gpu_type and a positive gpu_count must be given together",
            size.name
        )));
    }
    if let Some(key) = duplicate_metadata_key(&size.metadata) {
        return Err(OrchestrateError::validation(format!(
            "size '{}': duplicate metadata key '{}'",
            size.name, key
        )));
    }
    Ok(())
}

/// Checks everything about a new Template that needs no store or provider access.
pub fn validate_template(template: &Template) -> Result<()> {
    if template.project.trim().is_empty() || template.zone.trim().is_empty() {
        return Err(OrchestrateError::validation("project and zone are required"));
    }
    validate_resource_name(&template.name)?;
    if template.image_family.trim().is_empty() || template.image_project.trim().is_empty() {
        return Err(OrchestrateError::validation(
            "image_family and image_project are required",
        ));
    }
    if template.sizes.is_empty() {
        return Err(OrchestrateError::validation(format!(
            "template '{}' declares no sizes",
            template.name
        )));
    }
    if let Some(key) = duplicate_metadata_key(&template.metadata) {
        return Err(OrchestrateError::validation(format!(
            "duplicate metadata key '{}'",
            key
        )));
    }

    let mut names = HashSet::new();
    let mut resources = HashSet::new();
    for size in &template.sizes {
        validate_size(size)?;
        if !names.insert(size.name.as_str()) {
            return Err(OrchestrateError::validation(format!(
                "duplicate size name '{}'",
                size.name
            )));
        }
        let resource = instance_template_name(&template.name, &size.name)?;
        if !resources.insert(resource.clone()) {
            return Err(OrchestrateError::validation(format!(
                "sizes of template '{}' map to the same instance-template '{}'",
                template.name, resource
            )));
        }
    }

    if let Some(default) = &template.default_size_name {
        if !template.has_size(default) {
            return Err(OrchestrateError::validation(format!(
                "default size '{}' is not one of the declared sizes",
                default
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct TemplateManager {
    records: Records,
    provider: Arc<dyn ComputeProvider>,
    locks: KeyedLocks,
    timeouts: Timeouts,
}

impl TemplateManager {
    pub fn new(
        records: Records,
        provider: Arc<dyn ComputeProvider>,
        locks: KeyedLocks,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            records,
            provider,
            locks,
            timeouts,
        }
    }

    pub async fn get(&self, project: &str, zone: &str, name: &str) -> Result<Template> {
        self.records
            .get_template(project, zone, name)
            .await?
            .ok_or_else(|| {
                OrchestrateError::not_found(format!("template {}/{}/{}", project, zone, name))
            })
    }

    /// Zone of the Template called `name`. Without an explicit zone the name must be unique
    /// across the project's zones.
    pub async fn resolve_zone(&self, project: &str, name: &str, zone: Option<&str>) -> Result<String> {
        if let Some(zone) = zone.filter(|z| !z.trim().is_empty()) {
            self.get(project, zone, name).await?;
            return Ok(zone.to_string());
        }
        let found = self.records.templates_named(project, name).await?;
        match found.as_slice() {
            [] => Err(OrchestrateError::not_found(format!(
                "template {}/{}",
                project, name
            ))),
            [only] => Ok(only.zone.clone()),
            many => Err(OrchestrateError::conflict(format!(
                "template '{}' exists in zones [{}]; specify a zone",
                name,
                many.iter().map(|t| t.zone.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// Fails with Conflict when a Template with this name already exists in the zone.
    pub async fn ensure_absent(&self, project: &str, zone: &str, name: &str) -> Result<()> {
        if self.records.get_template(project, zone, name).await?.is_some() {
            return Err(OrchestrateError::conflict(format!(
                "template {}/{}/{} already exists",
                project, zone, name
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // CreateTemplate
    // -------------------------------------------------------------------------

    pub async fn create_template(&self, template: Template, progress: &ProgressReporter) -> Result<String> {
        let _guard = self
            .locks
            .lock(&template_lock_key(&template.project, &template.zone, &template.name))
            .await;
        let project = template.project.as_str();
        let planned: Vec<String> = template
            .sizes
            .iter()
            .map(|s| instance_template_name(&template.name, &s.name))
            .collect::<Result<_>>()?;
        let resource_keys: Vec<String> = planned
            .iter()
            .map(|r| instance_template_lock_key(project, r))
            .collect();
        let _resources = self.locks.lock_all(&resource_keys).await;

        self.ensure_absent(&template.project, &template.zone, &template.name)
            .await?;
        for resource in &planned {
            let exists = self
                .provider
                .instance_template_exists(project, resource)
                .await
                .map_err(OrchestrateError::provider)?;
            if exists {
                return Err(OrchestrateError::conflict(format!(
                    "instance-template {} already exists in project {}",
                    resource, project
                )));
            }
        }

        let total = template.sizes.len();
        let mut created: Vec<String> = Vec::with_capacity(total);
        for (i, (size, resource)) in template.sizes.iter().zip(&planned).enumerate() {
            progress
                .report(&format!(
                    "creating instance-template {} for size '{}' ({}/{})",
                    resource,
                    size.name,
                    i + 1,
                    total
                ))
                .await;

            if let Err(CreateFailure { error: err, accepted }) =
                self.create_size_resource(&template, size, resource).await
            {
                tracing::warn!(
                    project,
                    zone = %template.zone,
                    template = %template.name,
                    size = %size.name,
                    error = %err,
                    "size creation failed, rolling back"
                );
                // An accepted create may still have left its resource behind (timeout).
                let failed = accepted.then_some(resource.as_str());
                let (mut rolled_back, leaked) = self.rollback(project, failed, &created).await;
                if created.is_empty() && leaked.is_empty() {
                    return Err(err);
                }
                rolled_back.retain(|r| r != resource);
                return Err(OrchestrateError::PartialCreate {
                    failed: size.name.clone(),
                    reason: err.to_string(),
                    rolled_back,
                    leaked,
                });
            }
            created.push(resource.clone());
        }

        if let Err(err) = self.persist_new(&template, &planned).await {
            tracing::error!(template = %template.name, error = %err, "template record write failed, rolling back");
            self.rollback_all(project, &created).await;
            return Err(err);
        }

        tracing::info!(
            project,
            zone = %template.zone,
            template = %template.name,
            sizes = total,
            "template created"
        );
        Ok(format!(
            "template {} created with {} size(s): [{}]",
            template.name,
            total,
            created.join(", ")
        ))
    }

    async fn persist_new(&self, template: &Template, resources: &[String]) -> Result<()> {
        let now = Utc::now();
        for (size, resource) in template.sizes.iter().zip(resources) {
            self.records
                .put_size_binding(&SizeBinding {
                    project: template.project.clone(),
                    zone: template.zone.clone(),
                    template: template.name.clone(),
                    size: size.name.clone(),
                    instance_template: resource.clone(),
                    created_at: now,
                })
                .await?;
        }
        let mut record = template.clone();
        record.created_at = now;
        record.updated_at = now;
        self.records.put_template(&record).await
    }

    async fn create_size_resource(
        &self,
        template: &Template,
        size: &Size,
        resource: &str,
    ) -> std::result::Result<(), CreateFailure> {
        let spec = InstanceTemplateSpec {
            name: resource.to_string(),
            cpus: size.cpus,
            memory_mb: size.memory_mb,
            gpu_type: size.gpu_type.clone().filter(|_| size.has_gpu()),
            gpu_count: size.gpu_count,
            disk_size_gb: size.disk_size_gb,
            disk_type: size.disk_type.clone(),
            image: ImageSource::family(&template.image_project, &template.image_family),
            network: template.network.clone(),
            subnetwork: template.subnetwork.clone(),
            static_ip: template.static_ip,
            scopes: template.scopes.clone(),
            metadata: merge_metadata(&template.metadata, &size.metadata),
        };
        let op = self
            .provider
            .create_instance_template(&template.project, &spec)
            .await
            .map_err(|e| CreateFailure {
                error: OrchestrateError::provider(e),
                accepted: false,
            })?;
        await_op(
            self.provider.as_ref(),
            &op,
            self.timeouts.operation,
            self.timeouts.poll_interval,
        )
        .await
        .map_err(|error| CreateFailure {
            error,
            accepted: true,
        })
    }

    /// Delete one instance-template and wait for it. `Ok(false)` when it did not exist.
    async fn delete_resource(&self, project: &str, resource: &str) -> Result<bool> {
        let op = self
            .provider
            .delete_instance_template(project, resource)
            .await
            .map_err(OrchestrateError::provider)?;
        match op {
            None => Ok(false),
            Some(op) => {
                await_op(
                    self.provider.as_ref(),
                    &op,
                    self.timeouts.operation,
                    self.timeouts.poll_interval,
                )
                .await?;
                Ok(true)
            }
        }
    }

    /// Remove the failed resource (if given and it exists) and then `created` in reverse
    /// order. Returns (rolled back, leaked).
    async fn rollback(
        &self,
        project: &str,
        failed: Option<&str>,
        created: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let mut rolled_back = Vec::new();
        let mut leaked = Vec::new();
        if let Some(failed) = failed {
            match self.delete_resource(project, failed).await {
                Ok(true) => rolled_back.push(failed.to_string()),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(project, resource = failed, error = %e, "rollback delete failed");
                    leaked.push(failed.to_string());
                }
            }
        }
        for resource in created.iter().rev() {
            match self.delete_resource(project, resource).await {
                Ok(_) => rolled_back.push(resource.clone()),
                Err(e) => {
                    tracing::error!(project, resource = %resource, error = %e, "rollback delete failed");
                    leaked.push(resource.clone());
                }
            }
        }
        (rolled_back, leaked)
    }

    async fn rollback_all(&self, project: &str, created: &[String]) {
        for resource in created.iter().rev() {
            if let Err(e) = self.delete_resource(project, resource).await {
                tracing::error!(project, resource = %resource, error = %e, "rollback delete failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // AddSize / DeleteSize / SetDefaultSize
    // -------------------------------------------------------------------------

    pub async fn add_size(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        size: Size,
        progress: &ProgressReporter,
    ) -> Result<String> {
        let _guard = self.locks.lock(&template_lock_key(project, zone, name)).await;
        let mut template = self.get(project, zone, name).await?;
        if template.has_size(&size.name) {
            return Err(OrchestrateError::conflict(format!(
                "size '{}' already exists in template {}",
                size.name, name
            )));
        }
        validate_size(&size)?;
        let resource = instance_template_name(&template.name, &size.name)?;
        let _resource_guard = self
            .locks
            .lock(&instance_template_lock_key(project, &resource))
            .await;
        let exists = self
            .provider
            .instance_template_exists(project, &resource)
            .await
            .map_err(OrchestrateError::provider)?;
        if exists {
            return Err(OrchestrateError::conflict(format!(
                "instance-template {} already exists in project {}",
                resource, project
            )));
        }

        progress
            .report(&format!("creating instance-template {} for size '{}'", resource, size.name))
            .await;
        if let Err(CreateFailure { error: err, accepted }) =
            self.create_size_resource(&template, &size, &resource).await
        {
            let failed = accepted.then_some(resource.as_str());
            let (_, leaked) = self.rollback(project, failed, &[]).await;
            if !leaked.is_empty() {
                return Err(OrchestrateError::PartialCreate {
                    failed: size.name.clone(),
                    reason: err.to_string(),
                    rolled_back: Vec::new(),
                    leaked,
                });
            }
            return Err(err);
        }

        let now = Utc::now();
        let binding = SizeBinding {
            project: project.to_string(),
            zone: zone.to_string(),
            template: name.to_string(),
            size: size.name.clone(),
            instance_template: resource.clone(),
            created_at: now,
        };
        let size_name = size.name.clone();
        template.sizes.push(size);
        template.updated_at = now;
        let persisted = match self.records.put_size_binding(&binding).await {
            Ok(()) => self.records.put_template(&template).await,
            Err(e) => Err(e),
        };
        if let Err(err) = persisted {
            self.rollback_all(project, std::slice::from_ref(&resource)).await;
            if let Err(e) = self
                .records
                .delete_size_binding(project, zone, name, &size_name)
                .await
            {
                tracing::error!(project, zone, template = name, size = %size_name, error = %e, "size binding cleanup failed");
            }
            return Err(err);
        }

        tracing::info!(project, zone, template = name, size = %size_name, "size added");
        Ok(format!("size '{}' added to template {} as {}", size_name, name, resource))
    }

    pub async fn delete_size(&self, project: &str, zone: &str, name: &str, size_name: &str) -> Result<String> {
        let _guard = self.locks.lock(&template_lock_key(project, zone, name)).await;
        let mut template = self.get(project, zone, name).await?;
        check_size_removable(&template, size_name)?;

        let resource = self.resource_for(&template, size_name).await?;
        self.delete_resource(project, &resource).await?;
        self.records
            .delete_size_binding(project, zone, name, size_name)
            .await?;

        template.sizes.retain(|s| s.name != size_name);
        template.updated_at = Utc::now();
        self.records.put_template(&template).await?;

        tracing::info!(project, zone, template = name, size = size_name, "size deleted");
        Ok(format!("size '{}' deleted from template {}", size_name, name))
    }

    pub async fn set_default_size(&self, project: &str, zone: &str, name: &str, size_name: &str) -> Result<String> {
        let _guard = self.locks.lock(&template_lock_key(project, zone, name)).await;
        let mut template = self.get(project, zone, name).await?;
        if !template.has_size(size_name) {
            return Err(OrchestrateError::not_found(format!(
                "size '{}' in template {}",
                size_name, name
            )));
        }
        template.default_size_name = Some(size_name.to_string());
        template.updated_at = Utc::now();
        self.records.put_template(&template).await?;

        tracing::info!(project, zone, template = name, size = size_name, "default size set");
        Ok(format!("default size of template {} is now '{}'", name, size_name))
    }

    async fn resource_for(&self, template: &Template, size_name: &str) -> Result<String> {
        let bound = self
            .records
            .size_bindings(&template.project, &template.zone, &template.name)
            .await?
            .into_iter()
            .find(|b| b.size == size_name)
            .map(|b| b.instance_template);
        match bound {
            Some(resource) => Ok(resource),
            None => instance_template_name(&template.name, size_name),
        }
    }

    // -------------------------------------------------------------------------
    // DeleteTemplate
    // -------------------------------------------------------------------------

    /// Best effort: every size is attempted. The Template record goes away only once no
    /// size resource is left; otherwise it keeps the sizes whose delete failed.
    pub async fn delete_template(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        progress: &ProgressReporter,
    ) -> Result<String> {
        let _guard = self.locks.lock(&template_lock_key(project, zone, name)).await;
        let mut template = self.get(project, zone, name).await?;

        let bindings: HashMap<String, String> = self
            .records
            .size_bindings(project, zone, name)
            .await?
            .into_iter()
            .map(|b| (b.size, b.instance_template))
            .collect();

        let total = template.sizes.len();
        let mut deleted = 0usize;
        let mut failed: Vec<String> = Vec::new();
        let mut surviving: Vec<String> = Vec::new();
        for (i, size) in template.sizes.iter().enumerate() {
            let resource = match bindings.get(&size.name) {
                Some(r) => r.clone(),
                None => match instance_template_name(name, &size.name) {
                    Ok(r) => r,
                    Err(e) => {
                        failed.push(format!("{}: {}", size.name, e));
                        surviving.push(size.name.clone());
                        continue;
                    }
                },
            };
            progress
                .report(&format!(
                    "deleting instance-template {} ({}/{})",
                    resource,
                    i + 1,
                    total
                ))
                .await;

            let outcome = match self.delete_resource(project, &resource).await {
                Ok(_) => self
                    .records
                    .delete_size_binding(project, zone, name, &size.name)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(project, zone, template = name, size = %size.name, error = %e, "size delete failed");
                    failed.push(format!("{}: {}", size.name, e));
                    surviving.push(size.name.clone());
                }
            }
        }

        if failed.is_empty() {
            // Stray bindings whose size is no longer declared.
            for binding in self.records.size_bindings(project, zone, name).await? {
                self.records
                    .delete_size_binding(project, zone, name, &binding.size)
                    .await?;
            }
            self.records.delete_template(project, zone, name).await?;
            tracing::info!(project, zone, template = name, sizes = deleted, "template deleted");
            return Ok(format!("template {} deleted ({} size(s))", name, deleted));
        }

        template.sizes.retain(|s| surviving.contains(&s.name));
        if let Some(default) = &template.default_size_name {
            if !template.has_size(default) {
                template.default_size_name = None;
            }
        }
        template.updated_at = Utc::now();
        self.records.put_template(&template).await?;
        Err(OrchestrateError::PartialDelete { deleted, failed })
    }
}

/// DeleteSize is rejected for unknown sizes and for the current default.
pub fn check_size_removable(template: &Template, size_name: &str) -> Result<()> {
    if !template.has_size(size_name) {
        return Err(OrchestrateError::not_found(format!(
            "size '{}' in template {}",
            size_name, template.name
        )));
    }
    if template.default_size_name.as_deref() == Some(size_name) {
        return Err(OrchestrateError::InvalidState(format!(
            "size '{}' is the default of template {}; set another default first",
            size_name, template.name
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::NoopPublisher;
    use crate::operations::OperationTracker;
    use crate::store::MemoryStore;
    use orchestrate_common::{ErrorKind, MetadataEntry, OperationKind};
    use crate::store::{Collection, Store};
    use async_trait::async_trait;
    use orchestrate_providers::mock::MockProvider;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory store whose Template writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_template_writes: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn get(&self, collection: Collection, key: &str) -> anyhow::Result<Option<Value>> {
            self.inner.get(collection, key).await
        }

        async fn put(&self, collection: Collection, key: &str, value: Value) -> anyhow::Result<()> {
            if collection == Collection::Templates && self.fail_template_writes.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.put(collection, key, value).await
        }

        async fn delete(&self, collection: Collection, key: &str) -> anyhow::Result<bool> {
            self.inner.delete(collection, key).await
        }

        async fn list(&self, collection: Collection, prefix: &str) -> anyhow::Result<Vec<(String, Value)>> {
            self.inner.list(collection, prefix).await
        }
    }

    pub(crate) fn size(name: &str, cpus: i32) -> Size {
        Size {
            name: name.to_string(),
            memory_mb: 1024 * cpus as i64,
            cpus,
            gpu_type: None,
            gpu_count: 0,
            disk_size_gb: 50,
            disk_type: "pd-standard".to_string(),
            metadata: vec![],
        }
    }

    pub(crate) fn template(name: &str, sizes: &[&str]) -> Template {
        let now = Utc::now();
        Template {
            project: "p1".into(),
            zone: "us-central1-a".into(),
            name: name.into(),
            image_family: "centos-7".into(),
            image_project: "centos-cloud".into(),
            network: "default".into(),
            subnetwork: "default".into(),
            static_ip: false,
            scopes: vec![],
            instance_name_pattern: "{type}-{size}".into(),
            sizes: sizes.iter().map(|s| size(s, 2)).collect(),
            default_size_name: sizes.first().map(|s| s.to_string()),
            metadata: vec![MetadataEntry::new("team", "render")],
            created_at: now,
            updated_at: now,
        }
    }

    fn fast() -> Timeouts {
        Timeouts {
            operation: Duration::from_millis(200),
            step: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn setup() -> (TemplateManager, Arc<MockProvider>, Records, ProgressReporter) {
        let provider = Arc::new(MockProvider::new());
        let records = Records::new(Arc::new(MemoryStore::new()));
        let tracker = OperationTracker::new(records.clone(), Arc::new(NoopPublisher));
        let op = tracker.begin(OperationKind::CreateTemplate, None, None).await.unwrap();
        let manager = TemplateManager::new(records.clone(), provider.clone(), KeyedLocks::new(), fast());
        (manager, provider, records, tracker.reporter(op.request_id))
    }

    #[test]
    fn default_size_must_be_declared() {
        let mut t = template("vfx", &["small", "large"]);
        t.default_size_name = Some("huge".into());
        assert_eq!(validate_template(&t).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn gpu_fields_come_together() {
        let mut s = size("gpu", 4);
        s.gpu_count = 1;
        assert!(validate_size(&s).is_err());
        s.gpu_type = Some("nvidia-tesla-t4".into());
        assert!(validate_size(&s).is_ok());
    }

    #[test]
    fn sizes_colliding_after_normalization_are_rejected() {
        let t = template("vfx", &["a b", "a-b"]);
        assert_eq!(validate_template(&t).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn create_makes_one_instance_template_per_size() {
        let (manager, provider, records, progress) = setup().await;
        let mut t = template("vfx", &["small", "medium", "large"]);
        t.sizes[2].metadata = vec![MetadataEntry::new("team", "lighting")];
        manager.create_template(t, &progress).await.unwrap();

        assert_eq!(
            provider.instance_templates("p1"),
            vec!["vfx-large", "vfx-medium", "vfx-small"]
        );
        let large = provider.instance_template("p1", "vfx-large").unwrap();
        assert_eq!(large.metadata, vec![MetadataEntry::new("team", "lighting")]);
        let bindings = records.size_bindings("p1", "us-central1-a", "vfx").await.unwrap();
        assert_eq!(bindings.len(), 3);
    }

    #[tokio::test]
    async fn failure_on_second_size_rolls_back_first() {
        let (manager, provider, records, progress) = setup().await;
        provider.fail_instance_template_create("vfx-medium", "quota exceeded");

        let err = manager
            .create_template(template("vfx", &["small", "medium", "large"]), &progress)
            .await
            .unwrap_err();
        match err {
            OrchestrateError::PartialCreate { failed, rolled_back, leaked, .. } => {
                assert_eq!(failed, "medium");
                assert_eq!(rolled_back, vec!["vfx-small"]);
                assert!(leaked.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(provider.instance_templates("p1").is_empty());
        assert!(records.get_template("p1", "us-central1-a", "vfx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_on_first_size_is_a_plain_provider_error() {
        let (manager, provider, _, progress) = setup().await;
        provider.fail_instance_template_create("vfx-small", "bad image");
        let err = manager
            .create_template(template("vfx", &["small", "large"]), &progress)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
    }

    #[tokio::test]
    async fn timed_out_size_is_cleaned_up() {
        let (manager, provider, _, progress) = setup().await;
        provider.stall_operations_on("vfx-large");
        let err = manager
            .create_template(template("vfx", &["small", "large"]), &progress)
            .await
            .unwrap_err();
        match err {
            OrchestrateError::PartialCreate { failed, rolled_back, leaked, .. } => {
                assert_eq!(failed, "large");
                assert_eq!(rolled_back, vec!["vfx-small"]);
                // Its delete operation stalls as well, so it cannot be confirmed gone.
                assert_eq!(leaked, vec!["vfx-large"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(provider.instance_templates("p1").is_empty());
    }

    #[tokio::test]
    async fn rejected_create_is_not_rolled_back() {
        let (manager, provider, _, progress) = setup().await;
        provider.fail_instance_template_create("vfx-medium", "quota exceeded");
        manager
            .create_template(template("vfx", &["small", "medium"]), &progress)
            .await
            .unwrap_err();

        let calls = provider.calls();
        assert!(calls.iter().any(|c| c == "delete_instance_template p1/vfx-small"));
        assert!(!calls.iter().any(|c| c == "delete_instance_template p1/vfx-medium"));
    }

    #[tokio::test]
    async fn concurrent_creates_across_zones_keep_the_winner_intact() {
        let provider = Arc::new(MockProvider::new().with_latency(Duration::from_millis(2)));
        let records = Records::new(Arc::new(MemoryStore::new()));
        let tracker = OperationTracker::new(records.clone(), Arc::new(NoopPublisher));
        let op = tracker.begin(OperationKind::CreateTemplate, None, None).await.unwrap();
        let progress = tracker.reporter(op.request_id);
        let manager = TemplateManager::new(records.clone(), provider.clone(), KeyedLocks::new(), fast());

        let west = template("vfx", &["small"]);
        let mut europe = template("vfx", &["small"]);
        europe.zone = "europe-west1-b".into();
        let (a, b) = tokio::join!(
            manager.create_template(west, &progress),
            manager.create_template(europe, &progress)
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let (winner_zone, loser) = match (a, b) {
            (Ok(_), Err(e)) => ("us-central1-a", e),
            (Err(e), Ok(_)) => ("europe-west1-b", e),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(loser.kind(), ErrorKind::Conflict);
        assert_eq!(provider.instance_templates("p1"), vec!["vfx-small"]);
        let bindings = records.size_bindings("p1", winner_zone, "vfx").await.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].instance_template, "vfx-small");
    }

    #[tokio::test]
    async fn add_size_store_failure_removes_the_new_resource() {
        let store = Arc::new(FlakyStore::default());
        let provider = Arc::new(MockProvider::new());
        let records = Records::new(store.clone());
        let tracker = OperationTracker::new(records.clone(), Arc::new(NoopPublisher));
        let op = tracker.begin(OperationKind::AddSize, None, None).await.unwrap();
        let progress = tracker.reporter(op.request_id);
        let manager = TemplateManager::new(records.clone(), provider.clone(), KeyedLocks::new(), fast());
        manager
            .create_template(template("vfx", &["small"]), &progress)
            .await
            .unwrap();

        store.fail_template_writes.store(true, Ordering::SeqCst);
        let err = manager
            .add_size("p1", "us-central1-a", "vfx", size("xl", 16), &progress)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert_eq!(provider.instance_templates("p1"), vec!["vfx-small"]);
        let bindings = records.size_bindings("p1", "us-central1-a", "vfx").await.unwrap();
        assert_eq!(bindings.len(), 1);
        let t = manager.get("p1", "us-central1-a", "vfx").await.unwrap();
        assert_eq!(t.sizes.len(), 1);
    }

    #[tokio::test]
    async fn delete_treats_vanished_instance_template_as_deleted() {
        let (manager, provider, records, progress) = setup().await;
        manager
            .create_template(template("vfx", &["small", "large"]), &progress)
            .await
            .unwrap();
        provider.delete_instance_template("p1", "vfx-large").await.unwrap();

        let detail = manager
            .delete_template("p1", "us-central1-a", "vfx", &progress)
            .await
            .unwrap();
        assert!(detail.contains("2 size(s)"), "{}", detail);
        assert!(provider.instance_templates("p1").is_empty());
        assert!(records
            .size_bindings("p1", "us-central1-a", "vfx")
            .await
            .unwrap()
            .is_empty());
        let err = manager.get("p1", "us-central1-a", "vfx").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_size_rejects_default() {
        let (manager, _, _, progress) = setup().await;
        manager
            .create_template(template("vfx", &["small", "large"]), &progress)
            .await
            .unwrap();
        let err = manager
            .delete_size("p1", "us-central1-a", "vfx", "small")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        manager
            .delete_size("p1", "us-central1-a", "vfx", "large")
            .await
            .unwrap();
        let t = manager.get("p1", "us-central1-a", "vfx").await.unwrap();
        assert_eq!(t.sizes.len(), 1);
    }

    #[tokio::test]
    async fn add_size_and_set_default() {
        let (manager, provider, _, progress) = setup().await;
        manager
            .create_template(template("vfx", &["small"]), &progress)
            .await
            .unwrap();
        manager
            .add_size("p1", "us-central1-a", "vfx", size("xl", 16), &progress)
            .await
            .unwrap();
        assert!(provider.instance_template("p1", "vfx-xl").is_some());

        let err = manager
            .add_size("p1", "us-central1-a", "vfx", size("xl", 16), &progress)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        manager
            .set_default_size("p1", "us-central1-a", "vfx", "xl")
            .await
            .unwrap();
        let err = manager
            .set_default_size("p1", "us-central1-a", "vfx", "tiny")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let t = manager.get("p1", "us-central1-a", "vfx").await.unwrap();
        assert_eq!(t.default_size_name.as_deref(), Some("xl"));
    }

    #[tokio::test]
    async fn delete_is_best_effort_and_retryable() {
        let (manager, provider, _, progress) = setup().await;
        manager
            .create_template(template("vfx", &["small", "medium", "large"]), &progress)
            .await
            .unwrap();
        provider.fail_instance_template_delete("vfx-medium", "in use");

        let err = manager
            .delete_template("p1", "us-central1-a", "vfx", &progress)
            .await
            .unwrap_err();
        match err {
            OrchestrateError::PartialDelete { deleted, failed } => {
                assert_eq!(deleted, 2);
                assert_eq!(failed.len(), 1);
                assert!(failed[0].starts_with("medium:"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(provider.instance_templates("p1"), vec!["vfx-medium"]);
        let left = manager.get("p1", "us-central1-a", "vfx").await.unwrap();
        assert_eq!(left.sizes.len(), 1);
        assert_eq!(left.default_size_name, None);

        provider.clear_instance_template_delete_failure("vfx-medium");
        manager
            .delete_template("p1", "us-central1-a", "vfx", &progress)
            .await
            .unwrap();
        assert!(provider.instance_templates("p1").is_empty());
        let err = manager.get("p1", "us-central1-a", "vfx").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn zone_must_be_unambiguous() {
        let (manager, _, _, progress) = setup().await;
        manager
            .create_template(template("vfx", &["small"]), &progress)
            .await
            .unwrap();
        assert_eq!(
            manager.resolve_zone("p1", "vfx", None).await.unwrap(),
            "us-central1-a"
        );

        // Instance-template names are project-wide, so the same sizes collide.
        let mut clash = template("vfx", &["small"]);
        clash.zone = "europe-west1-b".into();
        let err = manager.create_template(clash, &progress).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let mut other = template("vfx", &["large"]);
        other.zone = "europe-west1-b".into();
        manager.create_template(other, &progress).await.unwrap();
        let err = manager.resolve_zone("p1", "vfx", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(
            manager
                .resolve_zone("p1", "vfx", Some("europe-west1-b"))
                .await
                .unwrap(),
            "europe-west1-b"
        );

        let err = manager.resolve_zone("p1", "nope", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
