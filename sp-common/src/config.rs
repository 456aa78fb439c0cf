use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Control-plane configuration (§6). Loaded from an optional TOML file with
/// environment variables overriding individual fields — the same layering
/// `hr-agent` and `homeroute` use, just with `toml::from_str` feeding the
/// base instead of a handwritten default-and-override ladder for every key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Path to the SQLite store file. ":memory:" for an ephemeral store.
    pub store_path: PathBuf,

    /// Address the agent WebSocket gateway binds to.
    pub gateway_bind: String,

    pub heartbeat_interval_seconds: u64,
    pub heartbeat_miss_multiplier: u32,

    pub command_max_attempts: u32,
    pub command_backoff_base_seconds: u64,
    pub command_backoff_cap_seconds: u64,

    pub dispatcher_workers_per_agent: usize,
    /// Max in-flight (`sent`/`ack`, not yet terminal) commands per agent
    /// before the dispatcher stops claiming more for it (§4.4 "Selection &
    /// queueing").
    pub dispatcher_max_in_flight_per_agent: u32,

    pub reconciler_interval_seconds: u64,
    pub send_visibility_timeout_seconds: u64,
    pub agent_offline_grace_seconds: u64,

    pub connection_staleness_multiplier: u32,
    pub connection_sweep_interval_seconds: u64,

    /// Retention horizon for the Reconciler's orphan GC pass (§4.6.3) —
    /// terminated sessions and terminal commands older than this are
    /// deleted. Not named explicitly in the configuration surface, but the
    /// orphan-GC feature it backs is.
    pub session_retention_seconds: u64,
    pub command_retention_seconds: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/var/lib/streamspace/control-plane.db"),
            gateway_bind: "0.0.0.0:7700".to_string(),
            heartbeat_interval_seconds: 10,
            heartbeat_miss_multiplier: 3,
            command_max_attempts: 8,
            command_backoff_base_seconds: 2,
            command_backoff_cap_seconds: 60,
            dispatcher_workers_per_agent: 4,
            dispatcher_max_in_flight_per_agent: 16,
            reconciler_interval_seconds: 30,
            send_visibility_timeout_seconds: 20,
            agent_offline_grace_seconds: 300,
            connection_staleness_multiplier: 3,
            connection_sweep_interval_seconds: 30,
            session_retention_seconds: 7 * 24 * 3600,
            command_retention_seconds: 24 * 3600,
        }
    }
}

impl ControlPlaneConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", p.display()))?;
                toml::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", p.display()))?
            }
            _ => Self::default(),
        };

        if let Ok(v) = std::env::var("SP_STORE_PATH") {
            config.store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SP_GATEWAY_BIND") {
            config.gateway_bind = v;
        }
        if let Ok(v) = std::env::var("SP_HEARTBEAT_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse() {
                config.heartbeat_interval_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("SP_COMMAND_MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                config.command_max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("SP_RECONCILER_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse() {
                config.reconciler_interval_seconds = n;
            }
        }

        Ok(config)
    }

    pub fn heartbeat_miss_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            (self.heartbeat_interval_seconds * self.heartbeat_miss_multiplier as u64) as i64,
        )
    }

    pub fn connection_staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            (self.heartbeat_interval_seconds * self.connection_staleness_multiplier as u64) as i64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = ControlPlaneConfig::default();
        assert_eq!(c.heartbeat_interval_seconds, 10);
        assert_eq!(c.command_max_attempts, 8);
        assert_eq!(c.command_backoff_cap_seconds, 60);
        assert_eq!(c.agent_offline_grace_seconds, 300);
    }

    #[test]
    fn parses_toml_overrides() {
        let toml_str = "heartbeat_interval_seconds = 5\ncommand_max_attempts = 3\n";
        let config: ControlPlaneConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.heartbeat_interval_seconds, 5);
        assert_eq!(config.command_max_attempts, 3);
        // Untouched fields keep their defaults.
        assert_eq!(config.reconciler_interval_seconds, 30);
    }
}
