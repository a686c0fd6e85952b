//! Image Provisioning Pipeline.
//!
//! boot build instance -> apply steps in order -> stop -> capture image -> tear down.
//! The build instance is deleted on every path once it may exist.

use chrono::Utc;
use std::sync::Arc;

use orchestrate_common::naming::{build_instance_name, validate_resource_name};
use orchestrate_common::steps::{parse_steps, ProvisioningStep, StepReport};
use orchestrate_common::{
    duplicate_metadata_key, Image, MetadataEntry, OrchestrateError, OsType, Result,
};
use orchestrate_providers::{
    ComputeProvider, ImageSource, ImageSpec, InstanceSpec, ProviderOperation,
};

use crate::config::Timeouts;
use crate::locks::{provider_resource_key, KeyedLocks};
use crate::operations::ProgressReporter;
use crate::provider_manager::await_op;
use crate::store::Records;

/// Image names are unique across the project, whatever zone the build ran in.
pub fn image_lock_key(project: &str, name: &str) -> String {
    provider_resource_key("image", project, name)
}

/// Checks a CreateImage request without touching the provider. Returns the parsed steps.
pub fn validate_image(image: &Image) -> Result<Vec<ProvisioningStep>> {
    if image.project.trim().is_empty() || image.zone.trim().is_empty() {
        return Err(OrchestrateError::validation("project and zone are required"));
    }
    validate_resource_name(&image.name)?;
    if image.os_type == OsType::Unknown {
        return Err(OrchestrateError::validation("os_type must be linux or windows"));
    }
    if image.image_family.trim().is_empty() || image.image_project.trim().is_empty() {
        return Err(OrchestrateError::validation(
            "image_family and image_project are required",
        ));
    }
    if image.disk_size_gb < 0 {
        return Err(OrchestrateError::validation("disk_size cannot be negative"));
    }
    if let Some(key) = duplicate_metadata_key(&image.metadata) {
        return Err(OrchestrateError::validation(format!(
            "duplicate metadata key '{}'",
            key
        )));
    }
    let steps = parse_steps(&image.steps)?;
    if let Some(step) = steps.iter().find(|s| !s.supports(image.os_type)) {
        return Err(OrchestrateError::validation(format!(
            "step '{}' does not apply to {} images",
            step,
            image.os_type.as_str()
        )));
    }
    Ok(steps)
}

/// Labels carried on the captured image.
fn image_labels(image: &Image) -> Vec<(String, String)> {
    let mut labels = vec![
        ("created-by".to_string(), "orchestrate".to_string()),
        ("os-type".to_string(), image.os_type.as_str().to_string()),
    ];
    if !image.network.is_empty() {
        labels.push(("network".to_string(), image.network.to_lowercase()));
    }
    if let Some(api_project) = image.api_project.as_deref().filter(|p| !p.is_empty()) {
        labels.push(("api-project".to_string(), api_project.to_lowercase()));
    }
    labels
}

/// Prefix an error with the step it happened in, keeping its kind.
fn in_step(step: ProvisioningStep, index: usize, total: usize, err: OrchestrateError) -> OrchestrateError {
    let at = format!("step '{}' ({}/{})", step, index + 1, total);
    match err {
        OrchestrateError::Provider(msg) => OrchestrateError::Provider(format!("{} failed: {}", at, msg)),
        OrchestrateError::Timeout(msg) => OrchestrateError::Timeout(format!("{}: {}", at, msg)),
        other => other,
    }
}

#[derive(Clone)]
pub struct ImagePipeline {
    records: Records,
    provider: Arc<dyn ComputeProvider>,
    locks: KeyedLocks,
    timeouts: Timeouts,
    build_machine_type: String,
}

impl ImagePipeline {
    pub fn new(
        records: Records,
        provider: Arc<dyn ComputeProvider>,
        locks: KeyedLocks,
        timeouts: Timeouts,
        build_machine_type: String,
    ) -> Self {
        Self {
            records,
            provider,
            locks,
            timeouts,
            build_machine_type,
        }
    }

    /// Fails with Conflict when an Image record with this name exists in the zone.
    pub async fn ensure_absent(&self, project: &str, zone: &str, name: &str) -> Result<()> {
        if self.records.get_image(project, zone, name).await?.is_some() {
            return Err(OrchestrateError::conflict(format!(
                "image {}/{}/{} already exists",
                project, zone, name
            )));
        }
        Ok(())
    }

    pub async fn create_image(
        &self,
        image: Image,
        steps: Vec<ProvisioningStep>,
        progress: &ProgressReporter,
    ) -> Result<String> {
        let _guard = self
            .locks
            .lock(&image_lock_key(&image.project, &image.name))
            .await;
        self.ensure_absent(&image.project, &image.zone, &image.name)
            .await?;
        let exists = self
            .provider
            .image_exists(&image.project, &image.name)
            .await
            .map_err(OrchestrateError::provider)?;
        if exists {
            return Err(OrchestrateError::conflict(format!(
                "image {} already exists in project {}",
                image.name, image.project
            )));
        }

        let build = build_instance_name(&image.name);
        let built = self.build(&image, &steps, &build, progress).await;

        progress
            .report(&format!("tearing down build instance {}", build))
            .await;
        let leaked = match self.teardown(&image.project, &image.zone, &build).await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(
                    project = %image.project,
                    zone = %image.zone,
                    instance = %build,
                    error = %e,
                    "build instance teardown failed"
                );
                Some(format!("build instance {} was not deleted: {}", build, e))
            }
        };
        if let Err(err) = built {
            return Err(match &leaked {
                Some(note) => err.with_note(note),
                None => err,
            });
        }

        let mut record = image.clone();
        record.created_at = Utc::now();
        self.records.put_image(&record).await?;

        tracing::info!(
            project = %image.project,
            zone = %image.zone,
            image = %image.name,
            steps = steps.len(),
            "image created"
        );
        let mut detail = format!("image {} created after {} step(s)", image.name, steps.len());
        if let Some(note) = leaked {
            detail.push_str("; ");
            detail.push_str(&note);
        }
        Ok(detail)
    }

    async fn build(
        &self,
        image: &Image,
        steps: &[ProvisioningStep],
        build: &str,
        progress: &ProgressReporter,
    ) -> Result<()> {
        let project = image.project.as_str();
        let zone = image.zone.as_str();

        progress.report(&format!("booting build instance {}", build)).await;
        let spec = InstanceSpec {
            name: build.to_string(),
            source_instance_template: None,
            image: Some(ImageSource::family(&image.image_project, &image.image_family)),
            machine_type: Some(self.build_machine_type.clone()),
            disk_size_gb: Some(image.disk_size_gb).filter(|gb| *gb > 0),
            network: Some(image.network.clone()).filter(|n| !n.is_empty()),
            metadata: Vec::new(),
            external_ip: true,
        };
        let op = self
            .provider
            .create_instance(project, zone, &spec)
            .await
            .map_err(OrchestrateError::provider)?;
        self.wait(&op).await?;

        let total = steps.len();
        let mut previous = None;
        for (i, step) in steps.iter().enumerate() {
            progress
                .report(&format!("running step '{}' ({}/{})", step, i + 1, total))
                .await;
            tracing::info!(project, zone, instance = build, step = step.as_str(), "applying step");
            self.apply_step(project, zone, build, *step, previous, &image.metadata)
                .await
                .map_err(|e| in_step(*step, i, total, e))?;
            previous = Some(*step);
        }

        progress.report(&format!("stopping build instance {}", build)).await;
        let op = self
            .provider
            .stop_instance(project, zone, build)
            .await
            .map_err(OrchestrateError::provider)?;
        self.wait(&op).await?;

        progress.report(&format!("capturing image {}", image.name)).await;
        let spec = ImageSpec {
            name: image.name.clone(),
            zone: zone.to_string(),
            source_disk: build.to_string(),
            disk_size_gb: image.disk_size_gb,
            network: image.network.clone(),
            os_type: image.os_type,
            labels: image_labels(image),
        };
        let op = self
            .provider
            .create_image(project, &spec)
            .await
            .map_err(OrchestrateError::provider)?;
        if let Err(err) = self.wait(&op).await {
            // A capture that did not finish may still leave a half-made image.
            if let Err(e) = self.provider.delete_image(project, &image.name).await {
                tracing::error!(project, image = %image.name, error = %format!("{:#}", e), "image cleanup failed");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn apply_step(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        step: ProvisioningStep,
        previous: Option<ProvisioningStep>,
        metadata: &[MetadataEntry],
    ) -> Result<()> {
        // Each step sees only its own keys.
        let stale: &[&str] = previous.map(|p| p.metadata_keys()).unwrap_or(&[]);
        let op = self
            .provider
            .set_instance_metadata(project, zone, instance, &step.injected_metadata(metadata), stale)
            .await
            .map_err(OrchestrateError::provider)?;
        self.wait(&op).await?;

        let step_timeout = self.timeouts.step;
        match tokio::time::timeout(step_timeout, self.wait_for_report(project, zone, instance, step)).await {
            Ok(Ok(StepReport::Done)) => Ok(()),
            Ok(Ok(StepReport::Failed(reason))) => Err(OrchestrateError::Provider(reason)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OrchestrateError::Timeout(format!(
                "no result reported within {:?}",
                step_timeout
            ))),
        }
    }

    async fn wait_for_report(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
        step: ProvisioningStep,
    ) -> Result<StepReport> {
        let key = step.guest_attribute_key();
        loop {
            let value = self
                .provider
                .get_guest_attribute(project, zone, instance, &key)
                .await
                .map_err(OrchestrateError::provider)?;
            if let Some(report) = value.as_deref().and_then(StepReport::from_guest_attribute) {
                return Ok(report);
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
    }

    async fn teardown(&self, project: &str, zone: &str, instance: &str) -> Result<()> {
        let op = self
            .provider
            .delete_instance(project, zone, instance)
            .await
            .map_err(OrchestrateError::provider)?;
        if let Some(op) = op {
            self.wait(&op).await?;
        }
        Ok(())
    }

    async fn wait(&self, op: &ProviderOperation) -> Result<()> {
        await_op(
            self.provider.as_ref(),
            op,
            self.timeouts.operation,
            self.timeouts.poll_interval,
        )
        .await
    }
}
