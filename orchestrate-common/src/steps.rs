use serde::{Deserialize, Serialize};

use crate::{MetadataEntry, OrchestrateError, OsType, Result};

/// Metadata key telling the build instance which step to run next.
pub const STEP_METADATA_KEY: &str = "orchestrate-step";

/// Guest attribute namespace the build instance reports step results under.
pub const GUEST_ATTRIBUTE_NAMESPACE: &str = "orchestrate";

/// Guest attribute value reported when a step completed.
pub const STEP_DONE: &str = "done";

/// Prefix of the guest attribute value reported when a step failed.
pub const STEP_FAILED_PREFIX: &str = "failed:";

/// Provisioning steps the image pipeline knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    DisableSelinux,
    InstallGpuDriver,
    InstallNvidiaGrid,
    InstallTeradici,
    InstallBlender,
    JoinDomain,
    RunScript,
}

impl ProvisioningStep {
    pub const ALL: [ProvisioningStep; 7] = [
        ProvisioningStep::DisableSelinux,
        ProvisioningStep::InstallGpuDriver,
        ProvisioningStep::InstallNvidiaGrid,
        ProvisioningStep::InstallTeradici,
        ProvisioningStep::InstallBlender,
        ProvisioningStep::JoinDomain,
        ProvisioningStep::RunScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStep::DisableSelinux => "disable_selinux",
            ProvisioningStep::InstallGpuDriver => "install_gpu_driver",
            ProvisioningStep::InstallNvidiaGrid => "install_nvidia_grid",
            ProvisioningStep::InstallTeradici => "install_teradici",
            ProvisioningStep::InstallBlender => "install_blender",
            ProvisioningStep::JoinDomain => "join_domain",
            ProvisioningStep::RunScript => "run_script",
        }
    }

    /// Case-insensitive; `-` and `_` are interchangeable.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|step| step.as_str() == normalized)
    }

    /// Request metadata keys this step is allowed to see.
    pub fn metadata_keys(&self) -> &'static [&'static str] {
        match self {
            ProvisioningStep::DisableSelinux => &[],
            ProvisioningStep::InstallGpuDriver => &["gpu_driver_version", "gpu_driver_url"],
            ProvisioningStep::InstallNvidiaGrid => &["grid_driver_url"],
            ProvisioningStep::InstallTeradici => &["teradici_registration_code"],
            ProvisioningStep::InstallBlender => &["blender_version"],
            ProvisioningStep::JoinDomain => &["domain_name", "domain_ou"],
            ProvisioningStep::RunScript => &["script_url"],
        }
    }

    pub fn supports(&self, os_type: OsType) -> bool {
        match self {
            ProvisioningStep::DisableSelinux => os_type == OsType::Linux,
            ProvisioningStep::JoinDomain => os_type == OsType::Windows,
            _ => os_type != OsType::Unknown,
        }
    }

    /// `orchestrate/<step>`
    pub fn guest_attribute_key(&self) -> String {
        format!("{}/{}", GUEST_ATTRIBUTE_NAMESPACE, self.as_str())
    }

    /// Metadata injected on the build instance before the step runs: the step marker plus
    /// the whitelisted subset of the request metadata.
    pub fn injected_metadata(&self, metadata: &[MetadataEntry]) -> Vec<MetadataEntry> {
        let mut out = vec![MetadataEntry::new(STEP_METADATA_KEY, self.as_str())];
        out.extend(
            metadata
                .iter()
                .filter(|e| self.metadata_keys().contains(&e.key.as_str()))
                .cloned(),
        );
        out
    }
}

impl std::fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse every step name, failing on the first unknown one.
pub fn parse_steps(names: &[String]) -> Result<Vec<ProvisioningStep>> {
    names
        .iter()
        .map(|name| {
            ProvisioningStep::parse(name).ok_or_else(|| OrchestrateError::UnknownStep(name.clone()))
        })
        .collect()
}

/// Outcome a build instance reported for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepReport {
    Done,
    Failed(String),
}

impl StepReport {
    /// Interprets a guest attribute value. Anything else means the step is still running.
    pub fn from_guest_attribute(value: &str) -> Option<Self> {
        let v = value.trim();
        if v.eq_ignore_ascii_case(STEP_DONE) {
            return Some(StepReport::Done);
        }
        v.strip_prefix(STEP_FAILED_PREFIX)
            .map(|reason| StepReport::Failed(reason.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_parse_roundtrip() {
        for step in ProvisioningStep::ALL {
            assert_eq!(ProvisioningStep::parse(step.as_str()), Some(step));
            assert_eq!(ProvisioningStep::parse(&step.as_str().to_uppercase()), Some(step));
        }
        assert_eq!(
            ProvisioningStep::parse("install-gpu-driver"),
            Some(ProvisioningStep::InstallGpuDriver)
        );
        assert_eq!(ProvisioningStep::parse("install_flash"), None);
    }

    #[test]
    fn first_unknown_step_is_reported() {
        let names = vec![
            "install_gpu_driver".to_string(),
            "install_flash".to_string(),
            "bogus".to_string(),
        ];
        assert_eq!(
            parse_steps(&names).unwrap_err(),
            OrchestrateError::UnknownStep("install_flash".into())
        );
    }

    #[test]
    fn injected_metadata_is_whitelisted() {
        let metadata = vec![
            MetadataEntry::new("gpu_driver_version", "535"),
            MetadataEntry::new("teradici_registration_code", "secret"),
        ];
        let injected = ProvisioningStep::InstallGpuDriver.injected_metadata(&metadata);
        assert_eq!(
            injected,
            vec![
                MetadataEntry::new(STEP_METADATA_KEY, "install_gpu_driver"),
                MetadataEntry::new("gpu_driver_version", "535"),
            ]
        );
    }

    #[test]
    fn os_applicability() {
        assert!(ProvisioningStep::DisableSelinux.supports(OsType::Linux));
        assert!(!ProvisioningStep::DisableSelinux.supports(OsType::Windows));
        assert!(ProvisioningStep::JoinDomain.supports(OsType::Windows));
        assert!(!ProvisioningStep::InstallBlender.supports(OsType::Unknown));
    }

    #[test]
    fn guest_attribute_reports() {
        assert_eq!(StepReport::from_guest_attribute("done"), Some(StepReport::Done));
        assert_eq!(
            StepReport::from_guest_attribute("failed: no gpu"),
            Some(StepReport::Failed("no gpu".into()))
        );
        assert_eq!(StepReport::from_guest_attribute("running"), None);
    }
}
