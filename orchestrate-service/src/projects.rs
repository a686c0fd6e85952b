use chrono::Utc;
use std::sync::Arc;

use orchestrate_common::{OrchestrateError, Project, ProjectState, Result};
use orchestrate_providers::ComputeProvider;

use crate::locks::{project_key, KeyGuard, KeyedLocks};
use crate::store::Records;

/// RegisterProject / DeregisterProject and the registration gate used by every other call.
#[derive(Clone)]
pub struct ProjectRegistry {
    records: Records,
    provider: Arc<dyn ComputeProvider>,
    locks: KeyedLocks,
    service_account: String,
}

pub fn validate_project_name(project: &str) -> Result<()> {
    if project.trim().is_empty() {
        return Err(OrchestrateError::validation("project is required"));
    }
    if project.contains('/') {
        return Err(OrchestrateError::validation(format!(
            "project '{}' contains '/'",
            project
        )));
    }
    Ok(())
}

impl ProjectRegistry {
    pub fn new(
        records: Records,
        provider: Arc<dyn ComputeProvider>,
        locks: KeyedLocks,
        service_account: String,
    ) -> Self {
        Self {
            records,
            provider,
            locks,
            service_account,
        }
    }

    pub async fn is_registered(&self, project: &str) -> Result<bool> {
        Ok(self
            .records
            .get_project(project)
            .await?
            .map(|p| p.state == ProjectState::Registered)
            .unwrap_or(false))
    }

    pub async fn ensure_registered(&self, project: &str) -> Result<()> {
        if !self.is_registered(project).await? {
            return Err(OrchestrateError::not_found(format!(
                "project {} is not registered",
                project
            )));
        }
        Ok(())
    }

    /// Shared hold on a registered project for the length of a create. Deregistration waits
    /// for every hold to be released.
    pub async fn hold(&self, project: &str) -> Result<KeyGuard> {
        let guard = self.locks.lock_shared(&project_key(project)).await;
        self.ensure_registered(project).await?;
        Ok(guard)
    }

    /// Fails with Conflict while the project still owns Templates or Images.
    pub async fn ensure_empty(&self, project: &str) -> Result<()> {
        let templates = self.records.templates_in_project(project).await?;
        let images = self.records.images_in_project(project).await?;
        if templates.is_empty() && images.is_empty() {
            return Ok(());
        }
        Err(OrchestrateError::conflict(format!(
            "project {} still has {} template(s) and {} image(s)",
            project,
            templates.len(),
            images.len()
        )))
    }

    /// Idempotent; registering again re-grants access.
    pub async fn register(&self, project: &str) -> Result<String> {
        let _guard = self.locks.lock(&project_key(project)).await;
        self.provider
            .grant_project_access(project, &self.service_account)
            .await
            .map_err(OrchestrateError::provider)?;

        let now = Utc::now();
        let existing = self.records.get_project(project).await?;
        let registered_at = existing
            .as_ref()
            .filter(|p| p.state == ProjectState::Registered)
            .and_then(|p| p.registered_at)
            .unwrap_or(now);
        self.records
            .put_project(&Project {
                name: project.to_string(),
                state: ProjectState::Registered,
                service_account: Some(self.service_account.clone()),
                registered_at: Some(registered_at),
                updated_at: now,
            })
            .await?;

        tracing::info!(project, service_account = %self.service_account, "project registered");
        Ok(format!("project {} registered", project))
    }

    pub async fn deregister(&self, project: &str) -> Result<String> {
        let _guard = self.locks.lock(&project_key(project)).await;
        self.ensure_registered(project).await?;
        self.ensure_empty(project).await?;

        let member = self
            .records
            .get_project(project)
            .await?
            .and_then(|p| p.service_account)
            .unwrap_or_else(|| self.service_account.clone());
        self.provider
            .revoke_project_access(project, &member)
            .await
            .map_err(OrchestrateError::provider)?;

        self.records
            .put_project(&Project {
                name: project.to_string(),
                state: ProjectState::Unregistered,
                service_account: None,
                registered_at: None,
                updated_at: Utc::now(),
            })
            .await?;

        tracing::info!(project, "project deregistered");
        Ok(format!("project {} deregistered", project))
    }
}
