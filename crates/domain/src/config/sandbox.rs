use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox provisioning configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how per-topic execution sandboxes are created, locked, and
/// reaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Which backend dispatches sandbox create/exec calls.
    #[serde(default)]
    pub backend: SandboxBackendKind,
    /// Max time to wait for a sandbox to become ready (milliseconds).
    #[serde(default = "d_create_timeout")]
    pub create_timeout_ms: u64,
    /// TTL of the distributed creation lock held while a sandbox is
    /// being provisioned (milliseconds).
    #[serde(default = "d_lock_ttl")]
    pub lock_ttl_ms: u64,
    /// Interval between lock-holder polls while waiting (milliseconds).
    #[serde(default = "d_poll_interval")]
    pub poll_interval_ms: u64,
    /// Idle time after which an unused sandbox is torn down (seconds).
    #[serde(default = "d_idle_ttl")]
    pub idle_ttl_seconds: u64,
    /// Base URL of the cloud sandbox provisioning API (when backend = cloud).
    #[serde(default)]
    pub cloud_api_base_url: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackendKind::Cloud,
            create_timeout_ms: d_create_timeout(),
            lock_ttl_ms: d_lock_ttl(),
            poll_interval_ms: d_poll_interval(),
            idle_ttl_seconds: d_idle_ttl(),
            cloud_api_base_url: None,
        }
    }
}

/// Which backend actually provisions and executes inside sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackendKind {
    /// Hosted sandbox provider reached over HTTP.
    #[default]
    Cloud,
    /// A connected runner executes commands directly (dev / self-hosted mode).
    Runner,
}

fn d_create_timeout() -> u64 {
    60_000
}
fn d_lock_ttl() -> u64 {
    45_000
}
fn d_poll_interval() -> u64 {
    500
}
fn d_idle_ttl() -> u64 {
    1_800
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.backend, SandboxBackendKind::Cloud);
        assert!(cfg.create_timeout_ms > 0);
        assert!(cfg.lock_ttl_ms > 0);
    }

    #[test]
    fn deserialize_empty_uses_defaults() {
        let cfg: SandboxConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.create_timeout_ms, d_create_timeout());
    }

    #[test]
    fn deserialize_runner_backend() {
        let cfg: SandboxConfig = toml::from_str("backend = \"runner\"").unwrap();
        assert_eq!(cfg.backend, SandboxBackendKind::Runner);
    }
}
