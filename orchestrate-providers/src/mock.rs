use crate::{
    ComputeProvider, ImageSpec, InstanceSpec, InstanceTemplateSpec, OperationState,
    ProviderOperation,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use orchestrate_common::steps::{ProvisioningStep, STEP_FAILED_PREFIX, STEP_METADATA_KEY};
use orchestrate_common::{merge_metadata, MetadataEntry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// In-memory provider for local runs and tests.
///
/// Operations finish immediately unless the resource was marked as stalled. Build
/// instances report step results through guest attributes as soon as the step marker
/// lands in their metadata.
pub struct MockProvider {
    state: Mutex<MockState>,
    latency: Duration,
}

#[derive(Debug, Clone)]
pub struct MockInstance {
    pub project: String,
    pub zone: String,
    pub name: String,
    pub status: String,
    pub spec: InstanceSpec,
    pub metadata: Vec<MetadataEntry>,
    pub guest_attributes: HashMap<String, String>,
}

#[derive(Default)]
struct Faults {
    create_instance: HashMap<String, String>,
    delete_instance: HashMap<String, String>,
    create_instance_template: HashMap<String, String>,
    delete_instance_template: HashMap<String, String>,
    create_image: Option<String>,
    steps: HashMap<String, String>,
    stalled_steps: HashSet<String>,
    stalled_resources: HashSet<String>,
}

#[derive(Default)]
struct MockState {
    instances: BTreeMap<String, MockInstance>,
    instance_templates: BTreeMap<String, InstanceTemplateSpec>,
    images: BTreeMap<String, ImageSpec>,
    families: HashMap<String, String>,
    operations: HashMap<String, OperationState>,
    access: BTreeMap<String, Vec<String>>,
    applied_steps: Vec<(String, String)>,
    step_metadata: Vec<(String, Vec<String>)>,
    calls: Vec<String>,
    faults: Faults,
    op_seq: u64,
}

impl MockState {
    fn new_op(&mut self, resource: &str, project: &str, zone: Option<&str>) -> ProviderOperation {
        self.op_seq += 1;
        let name = format!("operation-{}", self.op_seq);
        let state = if self.faults.stalled_resources.contains(resource) {
            OperationState::Running
        } else {
            OperationState::Done
        };
        self.operations.insert(name.clone(), state);
        match zone {
            Some(z) => ProviderOperation::zonal(name, project, z),
            None => ProviderOperation::global(name, project),
        }
    }

    fn record(&mut self, call: String) {
        tracing::debug!(call = %call, "mock provider call");
        self.calls.push(call);
    }
}

fn zonal_key(project: &str, zone: &str, name: &str) -> String {
    format!("{}/{}/{}", project, zone, name)
}

fn global_key(project: &str, name: &str) -> String {
    format!("{}/{}", project, name)
}

fn in_project<'a, V>(map: &'a BTreeMap<String, V>, project: &str) -> impl Iterator<Item = &'a V> {
    let prefix = format!("{}/", project);
    map.iter()
        .filter(move |(k, _)| k.starts_with(&prefix))
        .map(|(_, v)| v)
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            latency: Duration::ZERO,
        }
    }

    /// Every call sleeps this long before touching state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn tick(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    // --- Fault injection ---

    pub fn fail_instance_create(&self, name: &str, reason: &str) {
        let mut s = self.state.lock();
        s.faults.create_instance.insert(name.to_string(), reason.to_string());
    }

    pub fn fail_instance_delete(&self, name: &str, reason: &str) {
        let mut s = self.state.lock();
        s.faults.delete_instance.insert(name.to_string(), reason.to_string());
    }

    pub fn fail_instance_template_create(&self, name: &str, reason: &str) {
        let mut s = self.state.lock();
        s.faults
            .create_instance_template
            .insert(name.to_string(), reason.to_string());
    }

    pub fn fail_instance_template_delete(&self, name: &str, reason: &str) {
        let mut s = self.state.lock();
        s.faults
            .delete_instance_template
            .insert(name.to_string(), reason.to_string());
    }

    pub fn clear_instance_template_delete_failure(&self, name: &str) {
        self.state.lock().faults.delete_instance_template.remove(name);
    }

    pub fn fail_image_create(&self, reason: &str) {
        self.state.lock().faults.create_image = Some(reason.to_string());
    }

    /// The build instance reports `failed: <reason>` for this step.
    pub fn fail_step(&self, step: ProvisioningStep, reason: &str) {
        let mut s = self.state.lock();
        s.faults
            .steps
            .insert(step.as_str().to_string(), reason.to_string());
    }

    /// The build instance never reports a result for this step.
    pub fn stall_step(&self, step: ProvisioningStep) {
        let mut s = self.state.lock();
        s.faults.stalled_steps.insert(step.as_str().to_string());
    }

    /// Operations created for this resource name stay `Running` forever.
    pub fn stall_operations_on(&self, resource: &str) {
        let mut s = self.state.lock();
        s.faults.stalled_resources.insert(resource.to_string());
    }

    pub fn set_family_image(&self, project: &str, family: &str, image: &str) {
        let mut s = self.state.lock();
        s.families
            .insert(global_key(project, family), image.to_string());
    }

    // --- Inspection ---

    pub fn instance_templates(&self, project: &str) -> Vec<String> {
        let s = self.state.lock();
        in_project(&s.instance_templates, project)
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn instance_template(&self, project: &str, name: &str) -> Option<InstanceTemplateSpec> {
        let s = self.state.lock();
        s.instance_templates.get(&global_key(project, name)).cloned()
    }

    pub fn instances(&self, project: &str) -> Vec<String> {
        let s = self.state.lock();
        in_project(&s.instances, project)
            .map(|i| i.name.clone())
            .collect()
    }

    pub fn instance(&self, project: &str, zone: &str, name: &str) -> Option<MockInstance> {
        let s = self.state.lock();
        s.instances.get(&zonal_key(project, zone, name)).cloned()
    }

    pub fn images(&self, project: &str) -> Vec<String> {
        let s = self.state.lock();
        in_project(&s.images, project).map(|i| i.name.clone()).collect()
    }

    pub fn image(&self, project: &str, name: &str) -> Option<ImageSpec> {
        let s = self.state.lock();
        s.images.get(&global_key(project, name)).cloned()
    }

    /// `(instance, step)` in the order steps were started.
    pub fn applied_steps(&self) -> Vec<(String, String)> {
        self.state.lock().applied_steps.clone()
    }

    /// Metadata keys the build instance carried when `step` was started.
    pub fn metadata_seen_by(&self, step: ProvisioningStep) -> Option<Vec<String>> {
        let s = self.state.lock();
        s.step_metadata
            .iter()
            .find(|(name, _)| name == step.as_str())
            .map(|(_, keys)| keys.clone())
    }

    pub fn access(&self, project: &str) -> Vec<String> {
        let s = self.state.lock();
        s.access.get(project).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_instance(
        &self,
        project: &str,
        zone: &str,
        spec: &InstanceSpec,
    ) -> Result<ProviderOperation> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("create_instance {}/{}/{}", project, zone, spec.name));
        if let Some(reason) = s.faults.create_instance.get(&spec.name) {
            return Err(anyhow!("create instance {} rejected: {}", spec.name, reason));
        }
        if let Some(tpl) = &spec.source_instance_template {
            if !s.instance_templates.contains_key(&global_key(project, tpl)) {
                return Err(anyhow!("instance template {} not found", tpl));
            }
        }
        let key = zonal_key(project, zone, &spec.name);
        if s.instances.contains_key(&key) {
            return Err(anyhow!("instance {} already exists", spec.name));
        }
        s.instances.insert(
            key,
            MockInstance {
                project: project.to_string(),
                zone: zone.to_string(),
                name: spec.name.clone(),
                status: "RUNNING".to_string(),
                spec: spec.clone(),
                metadata: spec.metadata.clone(),
                guest_attributes: HashMap::new(),
            },
        );
        Ok(s.new_op(&spec.name, project, Some(zone)))
    }

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<ProviderOperation>> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("delete_instance {}/{}/{}", project, zone, name));
        if let Some(reason) = s.faults.delete_instance.get(name) {
            return Err(anyhow!("delete instance {} rejected: {}", name, reason));
        }
        if s.instances.remove(&zonal_key(project, zone, name)).is_none() {
            return Ok(None);
        }
        Ok(Some(s.new_op(name, project, Some(zone))))
    }

    async fn stop_instance(&self, project: &str, zone: &str, name: &str) -> Result<ProviderOperation> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("stop_instance {}/{}/{}", project, zone, name));
        let instance = s
            .instances
            .get_mut(&zonal_key(project, zone, name))
            .ok_or_else(|| anyhow!("instance {} not found", name))?;
        instance.status = "TERMINATED".to_string();
        Ok(s.new_op(name, project, Some(zone)))
    }

    async fn set_instance_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &[MetadataEntry],
        remove: &[&str],
    ) -> Result<ProviderOperation> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("set_instance_metadata {}/{}/{}", project, zone, name));

        let step = metadata
            .iter()
            .find(|e| e.key == STEP_METADATA_KEY)
            .map(|e| e.value.clone());
        let report = step.as_ref().and_then(|step| {
            if s.faults.stalled_steps.contains(step) {
                None
            } else if let Some(reason) = s.faults.steps.get(step) {
                Some(format!("{} {}", STEP_FAILED_PREFIX, reason))
            } else {
                Some("done".to_string())
            }
        });

        let instance = s
            .instances
            .get_mut(&zonal_key(project, zone, name))
            .ok_or_else(|| anyhow!("instance {} not found", name))?;
        instance.metadata.retain(|e| !remove.contains(&e.key.as_str()));
        instance.metadata = merge_metadata(&instance.metadata, metadata);
        if let (Some(step), Some(report)) = (&step, report) {
            instance
                .guest_attributes
                .insert(format!("orchestrate/{}", step), report);
        }
        let visible: Vec<String> = instance.metadata.iter().map(|e| e.key.clone()).collect();
        if let Some(step) = step {
            s.step_metadata.push((step.clone(), visible));
            s.applied_steps.push((name.to_string(), step));
        }
        Ok(s.new_op(name, project, Some(zone)))
    }

    async fn get_guest_attribute(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        self.tick().await;
        let s = self.state.lock();
        let instance = s
            .instances
            .get(&zonal_key(project, zone, name))
            .ok_or_else(|| anyhow!("instance {} not found", name))?;
        Ok(instance.guest_attributes.get(key).cloned())
    }

    async fn create_instance_template(
        &self,
        project: &str,
        spec: &InstanceTemplateSpec,
    ) -> Result<ProviderOperation> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("create_instance_template {}/{}", project, spec.name));
        if let Some(reason) = s.faults.create_instance_template.get(&spec.name) {
            return Err(anyhow!(
                "create instance template {} rejected: {}",
                spec.name,
                reason
            ));
        }
        let key = global_key(project, &spec.name);
        if s.instance_templates.contains_key(&key) {
            return Err(anyhow!("instance template {} already exists", spec.name));
        }
        s.instance_templates.insert(key, spec.clone());
        Ok(s.new_op(&spec.name, project, None))
    }

    async fn delete_instance_template(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ProviderOperation>> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("delete_instance_template {}/{}", project, name));
        if let Some(reason) = s.faults.delete_instance_template.get(name) {
            return Err(anyhow!("delete instance template {} rejected: {}", name, reason));
        }
        if s.instance_templates.remove(&global_key(project, name)).is_none() {
            return Ok(None);
        }
        Ok(Some(s.new_op(name, project, None)))
    }

    async fn instance_template_exists(&self, project: &str, name: &str) -> Result<bool> {
        self.tick().await;
        let s = self.state.lock();
        Ok(s.instance_templates.contains_key(&global_key(project, name)))
    }

    async fn create_image(&self, project: &str, spec: &ImageSpec) -> Result<ProviderOperation> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("create_image {}/{}", project, spec.name));
        if let Some(reason) = &s.faults.create_image {
            return Err(anyhow!("create image {} rejected: {}", spec.name, reason));
        }
        if !s
            .instances
            .contains_key(&zonal_key(project, &spec.zone, &spec.source_disk))
        {
            return Err(anyhow!("source disk {} not found", spec.source_disk));
        }
        let key = global_key(project, &spec.name);
        if s.images.contains_key(&key) {
            return Err(anyhow!("image {} already exists", spec.name));
        }
        s.images.insert(key, spec.clone());
        Ok(s.new_op(&spec.name, project, None))
    }

    async fn delete_image(&self, project: &str, name: &str) -> Result<Option<ProviderOperation>> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("delete_image {}/{}", project, name));
        if s.images.remove(&global_key(project, name)).is_none() {
            return Ok(None);
        }
        Ok(Some(s.new_op(name, project, None)))
    }

    async fn image_exists(&self, project: &str, name: &str) -> Result<bool> {
        self.tick().await;
        let s = self.state.lock();
        Ok(s.images.contains_key(&global_key(project, name)))
    }

    async fn latest_image_from_family(&self, project: &str, family: &str) -> Result<String> {
        self.tick().await;
        let s = self.state.lock();
        Ok(s
            .families
            .get(&global_key(project, family))
            .cloned()
            .unwrap_or_else(|| format!("projects/{}/global/images/{}-latest", project, family)))
    }

    async fn get_operation(&self, op: &ProviderOperation) -> Result<OperationState> {
        self.tick().await;
        let s = self.state.lock();
        s.operations
            .get(&op.name)
            .cloned()
            .ok_or_else(|| anyhow!("operation {} not found", op.name))
    }

    async fn grant_project_access(&self, project: &str, member: &str) -> Result<()> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("grant_project_access {} {}", project, member));
        let members = s.access.entry(project.to_string()).or_default();
        if !members.iter().any(|m| m == member) {
            members.push(member.to_string());
        }
        Ok(())
    }

    async fn revoke_project_access(&self, project: &str, member: &str) -> Result<()> {
        self.tick().await;
        let mut s = self.state.lock();
        s.record(format!("revoke_project_access {} {}", project, member));
        if let Some(members) = s.access.get_mut(project) {
            members.retain(|m| m != member);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{wait_for_operation, ImageSource, WaitError};

    fn template_spec(name: &str) -> InstanceTemplateSpec {
        InstanceTemplateSpec {
            name: name.to_string(),
            cpus: 4,
            memory_mb: 16384,
            gpu_type: None,
            gpu_count: 0,
            disk_size_gb: 100,
            disk_type: "pd-ssd".to_string(),
            image: ImageSource::family("base", "centos-7"),
            network: "default".to_string(),
            subnetwork: "default".to_string(),
            static_ip: false,
            scopes: vec![],
            metadata: vec![],
        }
    }

    #[test]
    fn family_lookup_prefers_pinned_image() {
        let provider = MockProvider::new();
        provider.set_family_image("centos-cloud", "centos-7", "centos-7-v20261001");
        let pinned = tokio_test::block_on(provider.latest_image_from_family("centos-cloud", "centos-7"));
        assert_eq!(pinned.unwrap(), "centos-7-v20261001");
        let fallback = tokio_test::block_on(provider.latest_image_from_family("centos-cloud", "rocky-9"));
        assert_eq!(
            fallback.unwrap(),
            "projects/centos-cloud/global/images/rocky-9-latest"
        );
    }

    #[tokio::test]
    async fn deleting_missing_template_is_none() {
        let provider = MockProvider::new();
        provider
            .create_instance_template("p1", &template_spec("vfx-small"))
            .await
            .unwrap();
        assert!(provider
            .delete_instance_template("p1", "vfx-small")
            .await
            .unwrap()
            .is_some());
        assert!(provider
            .delete_instance_template("p1", "vfx-small")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stalled_operation_times_out() {
        let provider = MockProvider::new();
        provider.stall_operations_on("vfx-small");
        let op = provider
            .create_instance_template("p1", &template_spec("vfx-small"))
            .await
            .unwrap();
        let err = wait_for_operation(
            &provider,
            &op,
            Duration::from_millis(50),
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WaitError::Timeout(..)));
    }

    #[tokio::test]
    async fn step_marker_produces_guest_attribute() {
        let provider = MockProvider::new();
        provider.fail_step(ProvisioningStep::InstallBlender, "mirror down");
        let spec = InstanceSpec {
            name: "build".to_string(),
            source_instance_template: None,
            image: Some(ImageSource::family("base", "centos-7")),
            machine_type: None,
            disk_size_gb: Some(50),
            network: None,
            metadata: vec![],
            external_ip: false,
        };
        provider.create_instance("p1", "z1", &spec).await.unwrap();

        for step in [ProvisioningStep::InstallGpuDriver, ProvisioningStep::InstallBlender] {
            provider
                .set_instance_metadata("p1", "z1", "build", &step.injected_metadata(&[]), &[])
                .await
                .unwrap();
        }

        let ok = provider
            .get_guest_attribute("p1", "z1", "build", "orchestrate/install_gpu_driver")
            .await
            .unwrap();
        assert_eq!(ok.as_deref(), Some("done"));
        let failed = provider
            .get_guest_attribute("p1", "z1", "build", "orchestrate/install_blender")
            .await
            .unwrap();
        assert_eq!(failed.as_deref(), Some("failed: mirror down"));
        assert_eq!(provider.applied_steps().len(), 2);
    }
}
