use std::sync::Arc;
use std::time::Duration;

use orchestrate_common::OrchestrateError;
use orchestrate_providers::{wait_for_operation, ComputeProvider, ProviderOperation, WaitError};

use crate::config::Settings;

pub struct ProviderManager;

impl ProviderManager {
    /// Build the provider named by `PROVIDER`. `None` when it is unknown, not compiled in,
    /// or missing credentials.
    pub fn get_provider(settings: &Settings) -> Option<Arc<dyn ComputeProvider>> {
        match settings.provider.as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(orchestrate_providers::mock::MockProvider::new())),
            #[cfg(feature = "provider-gce")]
            "gce" => {
                let token = settings.gce_access_token.clone()?;
                match orchestrate_providers::gce::GceProvider::new(token) {
                    Ok(p) => Some(Arc::new(p)),
                    Err(e) => {
                        tracing::error!(error = %format!("{:#}", e), "failed to build gce provider");
                        None
                    }
                }
            }
            _ => None,
        }
    }
}

/// Await a provider operation, mapping wait failures into the error taxonomy.
pub async fn await_op(
    provider: &dyn ComputeProvider,
    op: &ProviderOperation,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), OrchestrateError> {
    wait_for_operation(provider, op, timeout, poll_interval)
        .await
        .map_err(|e| match e {
            WaitError::Timeout(..) => OrchestrateError::Timeout(e.to_string()),
            WaitError::Failed { .. } => OrchestrateError::provider(e),
            WaitError::Provider(inner) => OrchestrateError::provider(inner),
        })
}
