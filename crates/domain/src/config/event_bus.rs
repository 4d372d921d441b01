use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event bus (Redis pub/sub + TTL store) configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection and key-space settings for the cross-pod event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379/0`.
    #[serde(default = "d_redis_url")]
    pub redis_url: String,
    /// Prefix applied to every key this process writes (multi-tenant isolation).
    #[serde(default = "d_key_prefix")]
    pub key_prefix: String,
    /// TTL for presence keys (seconds). Refreshed on each heartbeat.
    #[serde(default = "d_presence_ttl")]
    pub presence_ttl_seconds: u64,
    /// TTL for abort-signal keys (seconds).
    #[serde(default = "d_abort_ttl")]
    pub abort_ttl_seconds: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            redis_url: d_redis_url(),
            key_prefix: d_key_prefix(),
            presence_ttl_seconds: d_presence_ttl(),
            abort_ttl_seconds: d_abort_ttl(),
        }
    }
}

fn d_redis_url() -> String {
    "redis://127.0.0.1:6379/0".into()
}
fn d_key_prefix() -> String {
    "pz".into()
}
fn d_presence_ttl() -> u64 {
    30
}
fn d_abort_ttl() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EventBusConfig::default();
        assert_eq!(cfg.redis_url, "redis://127.0.0.1:6379/0");
        assert_eq!(cfg.key_prefix, "pz");
        assert!(cfg.presence_ttl_seconds > 0);
        assert!(cfg.abort_ttl_seconds > 0);
    }

    #[test]
    fn deserialize_empty_uses_defaults() {
        let cfg: EventBusConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.redis_url, d_redis_url());
    }
}
