use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8001";
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_BUILD_MACHINE_TYPE: &str = "n1-standard-4";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "orchestrate-service";

/// How long provider work may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on every provider long-running operation.
    pub operation: Duration,
    /// Bound on a single provisioning step.
    pub step: Duration,
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            operation: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            step: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub provider: String,
    pub gce_access_token: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub timeouts: Timeouts,
    /// Machine type of the transient instance images are built on.
    pub build_machine_type: String,
    /// Identity granted access on RegisterProject.
    pub service_account: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            provider: "mock".to_string(),
            gce_access_token: None,
            database_url: None,
            redis_url: None,
            timeouts: Timeouts::default(),
            build_machine_type: DEFAULT_BUILD_MACHINE_TYPE.to_string(),
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_opt(key) {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "invalid value, using default");
                default
            }
        },
    }
}

impl Settings {
    pub fn from_env() -> Self {
        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        let gce_access_token = env_opt("GCE_ACCESS_TOKEN_FILE")
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| env_opt("GCE_ACCESS_TOKEN"));

        Self {
            bind_addr: env_opt("ORCHESTRATE_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            provider: env_opt("PROVIDER")
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "mock".to_string()),
            gce_access_token,
            database_url: env_opt("DATABASE_URL"),
            redis_url: env_opt("REDIS_URL"),
            timeouts: Timeouts {
                operation: Duration::from_secs(env_parse(
                    "OPERATION_TIMEOUT_SECS",
                    DEFAULT_OPERATION_TIMEOUT_SECS,
                )),
                step: Duration::from_secs(env_parse("STEP_TIMEOUT_SECS", DEFAULT_STEP_TIMEOUT_SECS)),
                poll_interval: Duration::from_millis(env_parse(
                    "POLL_INTERVAL_MS",
                    DEFAULT_POLL_INTERVAL_MS,
                )),
            },
            build_machine_type: env_opt("ORCHESTRATE_BUILD_MACHINE_TYPE")
                .unwrap_or_else(|| DEFAULT_BUILD_MACHINE_TYPE.to_string()),
            service_account: env_opt("ORCHESTRATE_SERVICE_ACCOUNT")
                .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string()),
        }
    }
}
