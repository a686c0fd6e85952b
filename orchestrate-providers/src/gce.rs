use crate::{
    ComputeProvider, ImageSpec, InstanceSpec, InstanceTemplateSpec, OperationState,
    ProviderOperation,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use orchestrate_common::{merge_metadata, MetadataEntry, OsType};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";
const RESOURCE_MANAGER_API: &str = "https://cloudresourcemanager.googleapis.com/v1";

/// Role granted to the orchestration identity on registered projects.
const ORCHESTRATE_ROLE: &str = "roles/compute.admin";

/// Compute Engine v1 REST client.
///
/// The access token is provided by the caller (metadata server, workload identity, ...);
/// acquiring and refreshing it is not this type's concern.
pub struct GceProvider {
    client: Client,
    access_token: String,
}

impl GceProvider {
    pub fn new(access_token: String) -> Result<Self> {
        // Default reqwest client has no overall timeout. A stalled API call would hang a worker.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            access_token: access_token.trim().to_string(),
        })
    }

    /// Send a request; 404 becomes `Ok(None)`, any other non-2xx an error with the body.
    async fn call(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Option<Value>> {
        tracing::debug!(%method, url, "compute api request");
        let mut req = self
            .client
            .request(method.clone(), url)
            .bearer_auth(&self.access_token);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.with_context(|| format!("{} {}", method, url))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(%method, url, status = status.as_u16(), "compute api request failed");
            return Err(anyhow!("{} {} failed: status={} body={}", method, url, status, text));
        }
        let value = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok(Some(value))
    }

    async fn call_required(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value> {
        self.call(method.clone(), url, body)
            .await?
            .ok_or_else(|| anyhow!("{} {} returned 404", method, url))
    }

    fn zonal_url(project: &str, zone: &str, path: &str) -> String {
        format!("{}/projects/{}/zones/{}/{}", COMPUTE_API, project, zone, path)
    }

    fn global_url(project: &str, path: &str) -> String {
        format!("{}/projects/{}/global/{}", COMPUTE_API, project, path)
    }
}

fn metadata_json(entries: &[MetadataEntry]) -> Value {
    let items: Vec<Value> = entries
        .iter()
        .map(|e| json!({"key": e.key, "value": e.value}))
        .collect();
    json!({ "items": items })
}

fn metadata_from_json(value: &Value) -> Vec<MetadataEntry> {
    value["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|i| {
                    Some(MetadataEntry::new(
                        i["key"].as_str()?,
                        i["value"].as_str().unwrap_or_default(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse an Operation resource returned by insert/delete calls.
fn parse_operation(value: &Value, project: &str) -> Result<ProviderOperation> {
    let name = value["name"]
        .as_str()
        .ok_or_else(|| anyhow!("no operation name in response"))?;
    // `zone` is a full URL for zonal operations and absent for global ones.
    let zone = value["zone"]
        .as_str()
        .and_then(|z| z.rsplit('/').next())
        .map(|z| z.to_string());
    Ok(ProviderOperation {
        name: name.to_string(),
        project: project.to_string(),
        zone,
    })
}

fn network_url(project: &str, network: &str) -> String {
    if network.contains('/') {
        network.to_string()
    } else {
        format!("projects/{}/global/networks/{}", project, network)
    }
}

fn instance_body(project: &str, zone: &str, spec: &InstanceSpec) -> Value {
    let mut body = json!({ "name": spec.name });

    if let Some(machine_type) = &spec.machine_type {
        body["machineType"] = json!(format!("zones/{}/machineTypes/{}", zone, machine_type));
    }
    if !spec.metadata.is_empty() {
        body["metadata"] = metadata_json(&spec.metadata);
    }
    if spec.image.is_some() || spec.disk_size_gb.is_some() {
        let mut init = json!({});
        if let Some(image) = &spec.image {
            init["sourceImage"] = json!(image.path());
        }
        if let Some(size) = spec.disk_size_gb {
            init["diskSizeGb"] = json!(size.to_string());
        }
        body["disks"] = json!([{
            "boot": true,
            "autoDelete": true,
            "initializeParams": init,
        }]);
    }
    if spec.network.is_some() || spec.external_ip {
        let mut nic = json!({});
        if let Some(network) = &spec.network {
            nic["network"] = json!(network_url(project, network));
        }
        if spec.external_ip {
            nic["accessConfigs"] = json!([{ "name": "External NAT", "type": "ONE_TO_ONE_NAT" }]);
        }
        body["networkInterfaces"] = json!([nic]);
    }
    body
}

fn instance_template_body(project: &str, spec: &InstanceTemplateSpec) -> Value {
    let mut nic = json!({
        "network": network_url(project, &spec.network),
    });
    if !spec.subnetwork.is_empty() {
        nic["subnetwork"] = json!(spec.subnetwork);
    }
    if spec.static_ip {
        nic["accessConfigs"] = json!([{ "name": "External NAT", "type": "ONE_TO_ONE_NAT" }]);
    }

    let mut properties = json!({
        "machineType": spec.machine_type(),
        "disks": [{
            "boot": true,
            "autoDelete": true,
            "initializeParams": {
                "sourceImage": spec.image.path(),
                "diskSizeGb": spec.disk_size_gb.to_string(),
                "diskType": spec.disk_type,
            }
        }],
        "networkInterfaces": [nic],
        "metadata": metadata_json(&spec.metadata),
        "serviceAccounts": [{ "email": "default", "scopes": spec.scopes }],
    });

    if let Some(gpu_type) = spec.gpu_type.as_deref().filter(|_| spec.gpu_count > 0) {
        properties["guestAccelerators"] = json!([{
            "acceleratorType": gpu_type,
            "acceleratorCount": spec.gpu_count,
        }]);
        // GPU instances cannot live-migrate.
        properties["scheduling"] = json!({ "onHostMaintenance": "TERMINATE" });
    }

    json!({ "name": spec.name, "properties": properties })
}

#[async_trait]
impl ComputeProvider for GceProvider {
    fn name(&self) -> &'static str {
        "gce"
    }

    async fn create_instance(
        &self,
        project: &str,
        zone: &str,
        spec: &InstanceSpec,
    ) -> Result<ProviderOperation> {
        let mut url = Self::zonal_url(project, zone, "instances");
        if let Some(tpl) = &spec.source_instance_template {
            url = format!("{}?sourceInstanceTemplate=global/instanceTemplates/{}", url, tpl);
        }
        let body = instance_body(project, zone, spec);
        let resp = self.call_required(Method::POST, &url, Some(&body)).await?;
        tracing::info!(project, zone, instance = %spec.name, "instance insert requested");
        parse_operation(&resp, project)
    }

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Option<ProviderOperation>> {
        let url = Self::zonal_url(project, zone, &format!("instances/{}", name));
        match self.call(Method::DELETE, &url, None).await? {
            Some(resp) => Ok(Some(parse_operation(&resp, project)?)),
            None => Ok(None),
        }
    }

    async fn stop_instance(&self, project: &str, zone: &str, name: &str) -> Result<ProviderOperation> {
        let url = Self::zonal_url(project, zone, &format!("instances/{}/stop", name));
        let resp = self.call_required(Method::POST, &url, None).await?;
        parse_operation(&resp, project)
    }

    async fn set_instance_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &[MetadataEntry],
        remove: &[&str],
    ) -> Result<ProviderOperation> {
        // setMetadata replaces the whole set and needs the current fingerprint.
        let instance_url = Self::zonal_url(project, zone, &format!("instances/{}", name));
        let instance = self.call_required(Method::GET, &instance_url, None).await?;
        let mut current = metadata_from_json(&instance["metadata"]);
        current.retain(|e| !remove.contains(&e.key.as_str()));
        let fingerprint = instance["metadata"]["fingerprint"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let mut body = metadata_json(&merge_metadata(&current, metadata));
        body["fingerprint"] = json!(fingerprint);

        let url = format!("{}/setMetadata", instance_url);
        let resp = self.call_required(Method::POST, &url, Some(&body)).await?;
        parse_operation(&resp, project)
    }

    async fn get_guest_attribute(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let url = Self::zonal_url(
            project,
            zone,
            &format!("instances/{}/getGuestAttributes?variableKey={}", name, key),
        );
        Ok(self
            .call(Method::GET, &url, None)
            .await?
            .and_then(|v| v["variableValue"].as_str().map(|s| s.to_string())))
    }

    async fn create_instance_template(
        &self,
        project: &str,
        spec: &InstanceTemplateSpec,
    ) -> Result<ProviderOperation> {
        let url = Self::global_url(project, "instanceTemplates");
        let body = instance_template_body(project, spec);
        let resp = self.call_required(Method::POST, &url, Some(&body)).await?;
        tracing::info!(project, instance_template = %spec.name, "instance template insert requested");
        parse_operation(&resp, project)
    }

    async fn delete_instance_template(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<ProviderOperation>> {
        let url = Self::global_url(project, &format!("instanceTemplates/{}", name));
        match self.call(Method::DELETE, &url, None).await? {
            Some(resp) => Ok(Some(parse_operation(&resp, project)?)),
            None => Ok(None),
        }
    }

    async fn instance_template_exists(&self, project: &str, name: &str) -> Result<bool> {
        let url = Self::global_url(project, &format!("instanceTemplates/{}", name));
        Ok(self.call(Method::GET, &url, None).await?.is_some())
    }

    async fn create_image(&self, project: &str, spec: &ImageSpec) -> Result<ProviderOperation> {
        let url = Self::global_url(project, "images");
        let labels: serde_json::Map<String, Value> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        let mut body = json!({
            "name": spec.name,
            "sourceDisk": format!("projects/{}/zones/{}/disks/{}", project, spec.zone, spec.source_disk),
            "diskSizeGb": spec.disk_size_gb.to_string(),
            "labels": labels,
        });
        if spec.os_type == OsType::Windows {
            body["guestOsFeatures"] = json!([{ "type": "WINDOWS" }]);
        }
        let resp = self.call_required(Method::POST, &url, Some(&body)).await?;
        tracing::info!(project, image = %spec.name, "image insert requested");
        parse_operation(&resp, project)
    }

    async fn delete_image(&self, project: &str, name: &str) -> Result<Option<ProviderOperation>> {
        let url = Self::global_url(project, &format!("images/{}", name));
        match self.call(Method::DELETE, &url, None).await? {
            Some(resp) => Ok(Some(parse_operation(&resp, project)?)),
            None => Ok(None),
        }
    }

    async fn image_exists(&self, project: &str, name: &str) -> Result<bool> {
        let url = Self::global_url(project, &format!("images/{}", name));
        Ok(self.call(Method::GET, &url, None).await?.is_some())
    }

    async fn latest_image_from_family(&self, project: &str, family: &str) -> Result<String> {
        let url = Self::global_url(project, &format!("images/family/{}", family));
        let image = self
            .call(Method::GET, &url, None)
            .await?
            .ok_or_else(|| anyhow!("image family {}/{} not found", project, family))?;
        let name = image["name"]
            .as_str()
            .ok_or_else(|| anyhow!("image family {}/{} returned no name", project, family))?;
        Ok(format!("projects/{}/global/images/{}", project, name))
    }

    async fn get_operation(&self, op: &ProviderOperation) -> Result<OperationState> {
        let url = match &op.zone {
            Some(zone) => Self::zonal_url(&op.project, zone, &format!("operations/{}", op.name)),
            None => Self::global_url(&op.project, &format!("operations/{}", op.name)),
        };
        let resp = self.call_required(Method::GET, &url, None).await?;
        if resp["status"].as_str() != Some("DONE") {
            return Ok(OperationState::Running);
        }
        let errors: Vec<String> = resp["error"]["errors"]
            .as_array()
            .map(|errs| {
                errs.iter()
                    .filter_map(|e| e["message"].as_str().map(|m| m.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        if errors.is_empty() {
            Ok(OperationState::Done)
        } else {
            Ok(OperationState::Failed(errors.join("; ")))
        }
    }

    async fn grant_project_access(&self, project: &str, member: &str) -> Result<()> {
        let mut policy = self.get_iam_policy(project).await?;
        let member = format!("serviceAccount:{}", member);
        if !policy["bindings"].is_array() {
            policy["bindings"] = json!([]);
        }
        if let Some(bindings) = policy["bindings"].as_array_mut() {
            let existing = bindings
                .iter()
                .position(|b| b["role"].as_str() == Some(ORCHESTRATE_ROLE));
            match existing {
                Some(i) => {
                    let binding = &mut bindings[i];
                    if !binding["members"].is_array() {
                        binding["members"] = json!([]);
                    }
                    if let Some(members) = binding["members"].as_array_mut() {
                        if members.iter().any(|m| m.as_str() == Some(member.as_str())) {
                            return Ok(());
                        }
                        members.push(json!(member));
                    }
                }
                None => bindings.push(json!({"role": ORCHESTRATE_ROLE, "members": [member]})),
            }
        }
        self.set_iam_policy(project, &policy).await
    }

    async fn revoke_project_access(&self, project: &str, member: &str) -> Result<()> {
        let mut policy = self.get_iam_policy(project).await?;
        let member = format!("serviceAccount:{}", member);
        let mut changed = false;
        if let Some(bindings) = policy["bindings"].as_array_mut() {
            for binding in bindings.iter_mut() {
                if binding["role"].as_str() != Some(ORCHESTRATE_ROLE) {
                    continue;
                }
                if let Some(members) = binding["members"].as_array_mut() {
                    let before = members.len();
                    members.retain(|m| m.as_str() != Some(member.as_str()));
                    changed |= members.len() != before;
                }
            }
            bindings.retain(|b| b["members"].as_array().is_some_and(|m| !m.is_empty()));
        }
        if !changed {
            return Ok(());
        }
        self.set_iam_policy(project, &policy).await
    }
}

impl GceProvider {
    async fn get_iam_policy(&self, project: &str) -> Result<Value> {
        let url = format!("{}/projects/{}:getIamPolicy", RESOURCE_MANAGER_API, project);
        self.call_required(Method::POST, &url, Some(&json!({}))).await
    }

    async fn set_iam_policy(&self, project: &str, policy: &Value) -> Result<()> {
        let url = format!("{}/projects/{}:setIamPolicy", RESOURCE_MANAGER_API, project);
        self.call_required(Method::POST, &url, Some(&json!({ "policy": policy })))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageSource;

    #[test]
    fn zonal_operation_zone_is_short_name() {
        let v = json!({
            "name": "operation-123",
            "zone": "https://www.googleapis.com/compute/v1/projects/p1/zones/us-central1-a"
        });
        let op = parse_operation(&v, "p1").unwrap();
        assert_eq!(op, ProviderOperation::zonal("operation-123", "p1", "us-central1-a"));
        let global = parse_operation(&json!({"name": "operation-9"}), "p1").unwrap();
        assert_eq!(global.zone, None);
    }

    #[test]
    fn gpu_template_body_sets_accelerators() {
        let spec = InstanceTemplateSpec {
            name: "vfx-large".into(),
            cpus: 8,
            memory_mb: 32768,
            gpu_type: Some("nvidia-tesla-t4".into()),
            gpu_count: 2,
            disk_size_gb: 200,
            disk_type: "pd-ssd".into(),
            image: ImageSource::family("p1", "vfx"),
            network: "default".into(),
            subnetwork: String::new(),
            static_ip: false,
            scopes: vec!["https://www.googleapis.com/auth/cloud-platform".into()],
            metadata: vec![MetadataEntry::new("a", "1")],
        };
        let body = instance_template_body("p1", &spec);
        let props = &body["properties"];
        assert_eq!(props["machineType"], "custom-8-32768");
        assert_eq!(props["guestAccelerators"][0]["acceleratorCount"], 2);
        assert_eq!(props["scheduling"]["onHostMaintenance"], "TERMINATE");
        assert_eq!(
            props["disks"][0]["initializeParams"]["sourceImage"],
            "projects/p1/global/images/family/vfx"
        );
        assert_eq!(props["networkInterfaces"][0]["network"], "projects/p1/global/networks/default");
    }

    #[test]
    fn metadata_roundtrips_through_json() {
        let entries = vec![MetadataEntry::new("k", "v")];
        assert_eq!(metadata_from_json(&metadata_json(&entries)), entries);
    }
}
