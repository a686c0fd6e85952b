//! The façade: validate synchronously, open an Operation, run the work in the background.

use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use orchestrate_common::naming::instance_template_name;
use orchestrate_common::{Image, OperationKind, OrchestrateError, Operation, Result, Size, Template};
use orchestrate_providers::ComputeProvider;

use crate::api::AcceptedResponse;
use crate::config::Settings;
use crate::events::EventPublisher;
use crate::images::{validate_image, ImagePipeline};
use crate::instances::{InstanceLauncher, InstanceRequest};
use crate::locks::KeyedLocks;
use crate::operations::{OperationTracker, ProgressReporter};
use crate::projects::{validate_project_name, ProjectRegistry};
use crate::store::{Records, Store};
use crate::templates::{check_size_removable, validate_size, validate_template, TemplateManager};

pub const ACCEPTED: &str = "accepted";

#[derive(Clone)]
pub struct Orchestrator {
    tracker: OperationTracker,
    projects: ProjectRegistry,
    templates: TemplateManager,
    images: ImagePipeline,
    instances: InstanceLauncher,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn ComputeProvider>,
        publisher: Arc<dyn EventPublisher>,
        settings: &Settings,
    ) -> Self {
        let records = Records::new(store);
        let locks = KeyedLocks::new();
        let timeouts = settings.timeouts;
        Self {
            tracker: OperationTracker::new(records.clone(), publisher),
            projects: ProjectRegistry::new(
                records.clone(),
                provider.clone(),
                locks.clone(),
                settings.service_account.clone(),
            ),
            templates: TemplateManager::new(records.clone(), provider.clone(), locks.clone(), timeouts),
            images: ImagePipeline::new(
                records.clone(),
                provider.clone(),
                locks,
                timeouts,
                settings.build_machine_type.clone(),
            ),
            instances: InstanceLauncher::new(records, provider, timeouts),
        }
    }

    /// Open an Operation and run `work` on its own task. Returns as soon as the record exists.
    async fn accept<F, Fut>(
        &self,
        kind: OperationKind,
        project: &str,
        target: Option<&str>,
        work: F,
    ) -> Result<Operation>
    where
        F: FnOnce(ProgressReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let op = self.tracker.begin(kind, Some(project), target).await?;
        let tracker = self.tracker.clone();
        let id = op.request_id;
        tokio::spawn(async move {
            if let Err(e) = tracker.start(id, "running").await {
                tracing::error!(request_id = %id, error = %e, "operation could not start");
                tracker.finish(id, Err(e)).await;
                return;
            }
            // Run on a child task so a panic still lands on the record.
            let outcome = match tokio::spawn(work(tracker.reporter(id))).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let what = if e.is_panic() { "panicked" } else { "was cancelled" };
                    tracing::error!(request_id = %id, kind = kind.as_str(), "operation task {}", what);
                    Err(OrchestrateError::Internal(format!("operation task {}", what)))
                }
            };
            tracker.finish(id, outcome).await;
        });
        Ok(op)
    }

    fn accepted(op: &Operation, name: Option<String>) -> AcceptedResponse {
        AcceptedResponse {
            status: ACCEPTED.to_string(),
            request_id: op.request_id,
            name,
        }
    }

    pub async fn get_operation(&self, id: Uuid) -> Result<Operation> {
        self.tracker.get(id).await
    }

    pub async fn get_template(&self, project: &str, zone: &str, name: &str) -> Result<Template> {
        self.templates.get(project, zone, name).await
    }

    // --- Images ---

    pub async fn create_image(&self, image: Image) -> Result<AcceptedResponse> {
        validate_project_name(&image.project)?;
        let steps = validate_image(&image)?;
        self.projects.ensure_registered(&image.project).await?;
        self.images
            .ensure_absent(&image.project, &image.zone, &image.name)
            .await?;

        let pipeline = self.images.clone();
        let registry = self.projects.clone();
        let project = image.project.clone();
        let target = format!("{}/{}", image.zone, image.name);
        let op = self
            .accept(OperationKind::CreateImage, &project, Some(&target), move |progress| async move {
                let _project = registry.hold(&image.project).await?;
                pipeline.create_image(image, steps, &progress).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }

    // --- Templates ---

    pub async fn create_template(&self, template: Template) -> Result<AcceptedResponse> {
        validate_project_name(&template.project)?;
        validate_template(&template)?;
        self.projects.ensure_registered(&template.project).await?;
        self.templates
            .ensure_absent(&template.project, &template.zone, &template.name)
            .await?;

        let manager = self.templates.clone();
        let registry = self.projects.clone();
        let project = template.project.clone();
        let target = format!("{}/{}", template.zone, template.name);
        let op = self
            .accept(OperationKind::CreateTemplate, &project, Some(&target), move |progress| async move {
                let _project = registry.hold(&template.project).await?;
                manager.create_template(template, &progress).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }

    pub async fn delete_template(&self, project: &str, name: &str, zone: Option<&str>) -> Result<AcceptedResponse> {
        validate_project_name(project)?;
        self.projects.ensure_registered(project).await?;
        let zone = self.templates.resolve_zone(project, name, zone).await?;

        let manager = self.templates.clone();
        let (p, n, z) = (project.to_string(), name.to_string(), zone.clone());
        let target = format!("{}/{}", zone, name);
        let op = self
            .accept(OperationKind::DeleteTemplate, project, Some(&target), move |progress| async move {
                manager.delete_template(&p, &z, &n, &progress).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }

    pub async fn add_size(&self, project: &str, zone: &str, name: &str, size: Size) -> Result<AcceptedResponse> {
        self.projects.ensure_registered(project).await?;
        validate_size(&size)?;
        let template = self.templates.get(project, zone, name).await?;
        if template.has_size(&size.name) {
            return Err(OrchestrateError::conflict(format!(
                "size '{}' already exists in template {}",
                size.name, name
            )));
        }
        instance_template_name(name, &size.name)?;

        let manager = self.templates.clone();
        let (p, z, n) = (project.to_string(), zone.to_string(), name.to_string());
        let target = format!("{}/{}/{}", zone, name, size.name);
        let op = self
            .accept(OperationKind::AddSize, project, Some(&target), move |progress| async move {
                manager.add_size(&p, &z, &n, size, &progress).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }

    pub async fn delete_size(&self, project: &str, zone: &str, name: &str, size: &str) -> Result<AcceptedResponse> {
        self.projects.ensure_registered(project).await?;
        let template = self.templates.get(project, zone, name).await?;
        check_size_removable(&template, size)?;

        let manager = self.templates.clone();
        let (p, z, n, s) = (project.to_string(), zone.to_string(), name.to_string(), size.to_string());
        let target = format!("{}/{}/{}", zone, name, size);
        let op = self
            .accept(OperationKind::DeleteSize, project, Some(&target), move |_| async move {
                manager.delete_size(&p, &z, &n, &s).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }

    pub async fn set_default_size(&self, project: &str, zone: &str, name: &str, size: &str) -> Result<AcceptedResponse> {
        self.projects.ensure_registered(project).await?;
        let template = self.templates.get(project, zone, name).await?;
        if !template.has_size(size) {
            return Err(OrchestrateError::not_found(format!(
                "size '{}' in template {}",
                size, name
            )));
        }

        let manager = self.templates.clone();
        let (p, z, n, s) = (project.to_string(), zone.to_string(), name.to_string(), size.to_string());
        let target = format!("{}/{}", zone, name);
        let op = self
            .accept(OperationKind::SetDefaultSize, project, Some(&target), move |_| async move {
                manager.set_default_size(&p, &z, &n, &s).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }

    // --- Instances ---

    pub async fn create_instance(&self, req: InstanceRequest) -> Result<AcceptedResponse> {
        validate_project_name(&req.project)?;
        self.projects.ensure_registered(&req.project).await?;
        let plan = self.instances.resolve(&req).await?;
        let name = plan.name.clone();

        let launcher = self.instances.clone();
        let target = format!("{}/{}", plan.zone, plan.name);
        let op = self
            .accept(OperationKind::CreateInstance, &req.project, Some(&target), move |progress| async move {
                launcher.launch(plan, &progress).await
            })
            .await?;
        Ok(Self::accepted(&op, Some(name)))
    }

    // --- Projects ---

    pub async fn register_project(&self, project: &str) -> Result<AcceptedResponse> {
        validate_project_name(project)?;
        let registry = self.projects.clone();
        let p = project.to_string();
        let op = self
            .accept(OperationKind::RegisterProject, project, None, move |_| async move {
                registry.register(&p).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }

    pub async fn deregister_project(&self, project: &str) -> Result<AcceptedResponse> {
        validate_project_name(project)?;
        self.projects.ensure_registered(project).await?;
        self.projects.ensure_empty(project).await?;

        let registry = self.projects.clone();
        let p = project.to_string();
        let op = self
            .accept(OperationKind::DeregisterProject, project, None, move |_| async move {
                registry.deregister(&p).await
            })
            .await?;
        Ok(Self::accepted(&op, None))
    }
}
