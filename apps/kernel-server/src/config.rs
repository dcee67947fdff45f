// apps/kernel-server/src/config.rs
// Purpose: Layered configuration (defaults -> optional YAML file -> env vars).
// Architecture: Ambient Infrastructure
// Dependencies: serde, serde_yaml

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_agent_host")]
    pub agent_host: String,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    #[serde(default = "default_storage_root")]
    pub storage_root: String,
    #[serde(default = "default_live_log_channel")]
    pub live_log_channel: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_ws_snapshot_ms")]
    pub ws_snapshot_interval_ms: u64,
    #[serde(default = "default_active_run_ttl_secs")]
    pub active_run_ttl_secs: i64,
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: i64,
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_agent_host() -> String {
    "127.0.0.1".to_string()
}
fn default_agent_port() -> u16 {
    8000
}
fn default_storage_root() -> String {
    "/app/storage".to_string()
}
fn default_live_log_channel() -> String {
    "raro:live_logs".to_string()
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_ws_snapshot_ms() -> u64 {
    250
}
fn default_active_run_ttl_secs() -> i64 {
    86400
}
fn default_artifact_ttl_secs() -> i64 {
    3600
}
fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            bind_addr: default_bind_addr(),
            port: default_port(),
            redis_url: None,
            agent_host: default_agent_host(),
            agent_port: default_agent_port(),
            storage_root: default_storage_root(),
            live_log_channel: default_live_log_channel(),
            poll_interval_ms: default_poll_interval_ms(),
            ws_snapshot_interval_ms: default_ws_snapshot_ms(),
            active_run_ttl_secs: default_active_run_ttl_secs(),
            artifact_ttl_secs: default_artifact_ttl_secs(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl KernelConfig {
    /// Load defaults, overlay an optional YAML file, then overlay environment
    /// variables. Each layer only overrides fields it actually sets.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = KernelConfig::default();

        if let Some(path) = config_path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                let from_file: KernelConfig = serde_yaml::from_str(&raw)?;
                cfg = from_file;
            } else {
                tracing::warn!("Config file {:?} not found; using defaults", path);
            }
        }

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("KERNEL_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("KERNEL_PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Ok(v) = std::env::var("AGENT_HOST") {
            self.agent_host = v;
        }
        if let Ok(v) = std::env::var("AGENT_PORT") {
            if let Ok(p) = v.parse() {
                self.agent_port = p;
            }
        }
        if let Ok(v) = std::env::var("RARO_STORAGE_ROOT") {
            self.storage_root = v;
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn agent_base_url(&self) -> String {
        format!("http://{}:{}", self.agent_host, self.agent_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.bind_address(), "0.0.0.0:3000");
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn load_with_missing_file_falls_back_to_defaults() {
        let cfg = KernelConfig::load(Some(Path::new("/nonexistent/path.yaml"))).unwrap();
        assert_eq!(cfg.port, default_port());
    }

    #[test]
    fn env_override_applies_after_file() {
        std::env::set_var("KERNEL_PORT", "4100");
        let cfg = KernelConfig::load(None).unwrap();
        assert_eq!(cfg.port, 4100);
        std::env::remove_var("KERNEL_PORT");
    }
}
