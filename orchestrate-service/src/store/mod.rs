//! Persistence behind a narrow key/value interface.
//!
//! Records live in named collections under `/`-joined keys, so every child of a
//! Template (its size bindings) can be found with a prefix scan.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use orchestrate_common::{Image, OrchestrateError, Operation, Project, SizeBinding, Template};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Projects,
    Templates,
    SizeBindings,
    Images,
    Operations,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Projects => "projects",
            Collection::Templates => "templates",
            Collection::SizeBindings => "size_bindings",
            Collection::Images => "images",
            Collection::Operations => "operations",
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>>;
    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<()>;
    /// Returns whether a record was removed.
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool>;
    /// All records whose key starts with `prefix`, ordered by key.
    async fn list(&self, collection: Collection, prefix: &str) -> Result<Vec<(String, Value)>>;
}

pub mod keys {
    use uuid::Uuid;

    pub fn project(project: &str) -> String {
        project.to_string()
    }

    /// Prefix of every zonal record owned by `project`.
    pub fn project_prefix(project: &str) -> String {
        format!("{}/", project)
    }

    pub fn template(project: &str, zone: &str, name: &str) -> String {
        format!("{}/{}/{}", project, zone, name)
    }

    pub fn size_binding(project: &str, zone: &str, template: &str, size: &str) -> String {
        format!("{}/{}/{}/{}", project, zone, template, size)
    }

    /// Prefix of every size binding of one Template.
    pub fn size_binding_prefix(project: &str, zone: &str, template: &str) -> String {
        format!("{}/{}/{}/", project, zone, template)
    }

    pub fn image(project: &str, zone: &str, name: &str) -> String {
        format!("{}/{}/{}", project, zone, name)
    }

    pub fn operation(id: Uuid) -> String {
        id.to_string()
    }
}

fn store_error(err: anyhow::Error) -> OrchestrateError {
    OrchestrateError::Store(format!("{:#}", err))
}

/// Typed access to the store.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn Store>,
}

impl Records {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn get_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<T>, OrchestrateError> {
        match self.store.get(collection, key).await.map_err(store_error)? {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| OrchestrateError::Store(format!("corrupt {} record {}: {}", collection.as_str(), key, e))),
            None => Ok(None),
        }
    }

    async fn put_as<T: Serialize>(
        &self,
        collection: Collection,
        key: &str,
        value: &T,
    ) -> Result<(), OrchestrateError> {
        let v = serde_json::to_value(value).map_err(|e| OrchestrateError::Store(e.to_string()))?;
        self.store.put(collection, key, v).await.map_err(store_error)
    }

    async fn list_as<T: DeserializeOwned>(
        &self,
        collection: Collection,
        prefix: &str,
    ) -> Result<Vec<T>, OrchestrateError> {
        self.store
            .list(collection, prefix)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(|(key, v)| {
                serde_json::from_value(v).map_err(|e| {
                    OrchestrateError::Store(format!("corrupt {} record {}: {}", collection.as_str(), key, e))
                })
            })
            .collect()
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, OrchestrateError> {
        self.store.delete(collection, key).await.map_err(store_error)
    }

    // --- Projects ---

    pub async fn get_project(&self, project: &str) -> Result<Option<Project>, OrchestrateError> {
        self.get_as(Collection::Projects, &keys::project(project)).await
    }

    pub async fn put_project(&self, project: &Project) -> Result<(), OrchestrateError> {
        self.put_as(Collection::Projects, &keys::project(&project.name), project)
            .await
    }

    // --- Templates ---

    pub async fn get_template(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<Template>, OrchestrateError> {
        self.get_as(Collection::Templates, &keys::template(project, zone, name))
            .await
    }

    pub async fn put_template(&self, template: &Template) -> Result<(), OrchestrateError> {
        let key = keys::template(&template.project, &template.zone, &template.name);
        self.put_as(Collection::Templates, &key, template).await
    }

    pub async fn delete_template(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<bool, OrchestrateError> {
        self.delete(Collection::Templates, &keys::template(project, zone, name))
            .await
    }

    pub async fn templates_in_project(&self, project: &str) -> Result<Vec<Template>, OrchestrateError> {
        self.list_as(Collection::Templates, &keys::project_prefix(project))
            .await
    }

    /// Templates called `name` in any zone of `project`.
    pub async fn templates_named(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Vec<Template>, OrchestrateError> {
        Ok(self
            .templates_in_project(project)
            .await?
            .into_iter()
            .filter(|t| t.name == name)
            .collect())
    }

    // --- Size bindings ---

    pub async fn put_size_binding(&self, binding: &SizeBinding) -> Result<(), OrchestrateError> {
        let key = keys::size_binding(&binding.project, &binding.zone, &binding.template, &binding.size);
        self.put_as(Collection::SizeBindings, &key, binding).await
    }

    pub async fn delete_size_binding(
        &self,
        project: &str,
        zone: &str,
        template: &str,
        size: &str,
    ) -> Result<bool, OrchestrateError> {
        self.delete(
            Collection::SizeBindings,
            &keys::size_binding(project, zone, template, size),
        )
        .await
    }

    pub async fn size_bindings(
        &self,
        project: &str,
        zone: &str,
        template: &str,
    ) -> Result<Vec<SizeBinding>, OrchestrateError> {
        self.list_as(
            Collection::SizeBindings,
            &keys::size_binding_prefix(project, zone, template),
        )
        .await
    }

    // --- Images ---

    pub async fn get_image(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<Image>, OrchestrateError> {
        self.get_as(Collection::Images, &keys::image(project, zone, name))
            .await
    }

    pub async fn put_image(&self, image: &Image) -> Result<(), OrchestrateError> {
        let key = keys::image(&image.project, &image.zone, &image.name);
        self.put_as(Collection::Images, &key, image).await
    }

    pub async fn images_in_project(&self, project: &str) -> Result<Vec<Image>, OrchestrateError> {
        self.list_as(Collection::Images, &keys::project_prefix(project))
            .await
    }

    // --- Operations ---

    pub async fn get_operation(&self, id: Uuid) -> Result<Option<Operation>, OrchestrateError> {
        self.get_as(Collection::Operations, &keys::operation(id)).await
    }

    pub async fn put_operation(&self, op: &Operation) -> Result<(), OrchestrateError> {
        self.put_as(Collection::Operations, &keys::operation(op.request_id), op)
            .await
    }
}
