//! CreateInstance: spawn one instance from a resolved (Template, Size) pair.
//! Instances are not tracked after creation.

use std::sync::Arc;

use orchestrate_common::naming::{
    instance_template_name, normalize_resource_name, region_of_zone, resolve,
    validate_resource_name, NamingContext,
};
use orchestrate_common::{
    duplicate_metadata_key, merge_metadata, MetadataEntry, OrchestrateError, Result, Size, Template,
};
use orchestrate_providers::{ComputeProvider, ImageSource, InstanceSpec};

use crate::config::Timeouts;
use crate::operations::ProgressReporter;
use crate::provider_manager::await_op;
use crate::store::Records;

#[derive(Debug, Clone, Default)]
pub struct InstanceRequest {
    pub project: String,
    pub zone: String,
    pub template: String,
    /// Empty means the Template's default size.
    pub size: String,
    /// Empty means "derive from the Template's naming pattern".
    pub name: String,
    pub metadata: Vec<MetadataEntry>,
    pub use_latest_image: bool,
    pub use_external_ip: bool,
    pub user: Option<String>,
}

/// Everything resolved at acceptance time.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub project: String,
    pub zone: String,
    pub template: Template,
    pub size: Size,
    pub instance_template: String,
    pub name: String,
    pub metadata: Vec<MetadataEntry>,
    pub use_latest_image: bool,
    pub use_external_ip: bool,
}

pub fn naming_context(
    template: &Template,
    size: &Size,
    project: &str,
    zone: &str,
    user: Option<&str>,
) -> NamingContext {
    NamingContext {
        template: Some(template.name.clone()),
        size: Some(size.name.clone()),
        region: Some(region_of_zone(zone)).filter(|r| !r.is_empty()),
        zone: Some(zone.to_string()),
        project: Some(project.to_string()),
        gpu_count: Some(size.gpu_count).filter(|_| size.has_gpu()),
        gpu_type: size.gpu_type.clone().filter(|_| size.has_gpu()),
        user: user.map(str::to_string),
    }
}

/// Instance name: the requested one, or the Template's pattern resolved for this size.
pub fn instance_name(req: &InstanceRequest, template: &Template, size: &Size) -> Result<String> {
    let raw = if !req.name.trim().is_empty() {
        req.name.clone()
    } else if template.instance_name_pattern.trim().is_empty() {
        return Err(OrchestrateError::validation(format!(
            "no instance name given and template '{}' has no naming pattern",
            template.name
        )));
    } else {
        let ctx = naming_context(template, size, &req.project, &req.zone, req.user.as_deref());
        resolve(&template.instance_name_pattern, &ctx)?
    };
    let name = normalize_resource_name(&raw);
    validate_resource_name(&name)?;
    Ok(name)
}

#[derive(Clone)]
pub struct InstanceLauncher {
    records: Records,
    provider: Arc<dyn ComputeProvider>,
    timeouts: Timeouts,
}

impl InstanceLauncher {
    pub fn new(records: Records, provider: Arc<dyn ComputeProvider>, timeouts: Timeouts) -> Self {
        Self {
            records,
            provider,
            timeouts,
        }
    }

    pub async fn resolve(&self, req: &InstanceRequest) -> Result<LaunchPlan> {
        if let Some(key) = duplicate_metadata_key(&req.metadata) {
            return Err(OrchestrateError::validation(format!(
                "duplicate metadata key '{}'",
                key
            )));
        }
        let template = self
            .records
            .get_template(&req.project, &req.zone, &req.template)
            .await?
            .ok_or_else(|| {
                OrchestrateError::not_found(format!(
                    "template {}/{}/{}",
                    req.project, req.zone, req.template
                ))
            })?;

        let size_name = if req.size.trim().is_empty() {
            template.default_size_name.clone().ok_or_else(|| {
                OrchestrateError::validation(format!(
                    "no size given and template '{}' has no default size",
                    template.name
                ))
            })?
        } else {
            req.size.clone()
        };
        let size = template.size(&size_name).cloned().ok_or_else(|| {
            OrchestrateError::not_found(format!("size '{}' in template {}", size_name, template.name))
        })?;

        let bound = self
            .records
            .size_bindings(&req.project, &req.zone, &req.template)
            .await?
            .into_iter()
            .find(|b| b.size == size.name)
            .map(|b| b.instance_template);
        let instance_template = match bound {
            Some(resource) => resource,
            None => instance_template_name(&template.name, &size.name)?,
        };

        let name = instance_name(req, &template, &size)?;
        Ok(LaunchPlan {
            project: req.project.clone(),
            zone: req.zone.clone(),
            template,
            size,
            instance_template,
            name,
            metadata: req.metadata.clone(),
            use_latest_image: req.use_latest_image,
            use_external_ip: req.use_external_ip,
        })
    }

    pub async fn launch(&self, plan: LaunchPlan, progress: &ProgressReporter) -> Result<String> {
        let image = if plan.use_latest_image {
            let path = self
                .provider
                .latest_image_from_family(&plan.template.image_project, &plan.template.image_family)
                .await
                .map_err(OrchestrateError::provider)?;
            Some(ImageSource::Image(path))
        } else {
            None
        };

        // Instance-level metadata replaces the template's, so carry all layers.
        let metadata = merge_metadata(
            &merge_metadata(&plan.template.metadata, &plan.size.metadata),
            &plan.metadata,
        );
        let spec = InstanceSpec {
            name: plan.name.clone(),
            source_instance_template: Some(plan.instance_template.clone()),
            image,
            machine_type: None,
            disk_size_gb: None,
            network: None,
            metadata,
            external_ip: plan.use_external_ip,
        };

        progress
            .report(&format!(
                "creating instance {} from {}",
                plan.name, plan.instance_template
            ))
            .await;
        let op = self
            .provider
            .create_instance(&plan.project, &plan.zone, &spec)
            .await
            .map_err(OrchestrateError::provider)?;
        await_op(
            self.provider.as_ref(),
            &op,
            self.timeouts.operation,
            self.timeouts.poll_interval,
        )
        .await?;

        tracing::info!(
            project = %plan.project,
            zone = %plan.zone,
            template = %plan.template.name,
            size = %plan.size.name,
            instance = %plan.name,
            "instance created"
        );
        Ok(format!(
            "instance {} created from {}",
            plan.name, plan.instance_template
        ))
    }
}
