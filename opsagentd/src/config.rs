// ABOUTME: loads the static agent configuration (hosts, policy knobs, planner settings).
// ABOUTME: the loaded snapshot is immutable; a reload builds a fresh snapshot and swaps the Arc.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthLevel {
    Readonly,
    Operator,
    Admin,
}

impl AuthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthLevel::Readonly => "readonly",
            AuthLevel::Operator => "operator",
            AuthLevel::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub addr: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub key_path: String,
    /// SHA-256 fingerprint of the remote host key, hex encoded. A mismatch
    /// at connect time is fatal and never retried.
    pub host_key_sha256: String,
    pub level: AuthLevel,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_planner_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub allowed_user_ids: Vec<u64>,
    pub default_host: String,
    pub hosts: BTreeMap<String, HostConfig>,
    pub planner: PlannerConfig,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_max_context_entries")]
    pub max_context_entries: usize,
    #[serde(default = "default_context_keep_recent")]
    pub context_keep_recent: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: usize,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_api_key_env() -> String {
    "OPSAGENT_PLANNER_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_planner_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    60
}

fn default_max_output_lines() -> usize {
    150
}

fn default_max_output_bytes() -> usize {
    65536
}

fn default_max_context_entries() -> usize {
    40
}

fn default_context_keep_recent() -> usize {
    20
}

fn default_max_iterations() -> usize {
    10
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_rate_limit_max_requests() -> usize {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

pub async fn load(path: &Path) -> anyhow::Result<AgentConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read config at {}", path.display()))?;
    let config: AgentConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config at {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &AgentConfig) -> anyhow::Result<()> {
    if config.hosts.is_empty() {
        anyhow::bail!("config must define at least one host");
    }
    if !config.hosts.contains_key(&config.default_host) {
        anyhow::bail!("default_host '{}' is not a configured host", config.default_host);
    }
    if config.max_iterations == 0 {
        anyhow::bail!("max_iterations must be at least 1");
    }
    if config.max_output_lines == 0 || config.max_output_bytes == 0 {
        anyhow::bail!("truncation limits must be at least 1");
    }
    if config.context_keep_recent == 0 {
        anyhow::bail!("context_keep_recent must be at least 1");
    }
    // compaction keeps the recent window plus one summary entry
    if config.context_keep_recent >= config.max_context_entries {
        anyhow::bail!("context_keep_recent must be smaller than max_context_entries");
    }
    if config.rate_limit_max_requests == 0 || config.rate_limit_window_secs == 0 {
        anyhow::bail!("rate limit knobs must be at least 1");
    }
    for (alias, host) in &config.hosts {
        if host.addr.trim().is_empty() {
            anyhow::bail!("host '{alias}' has an empty addr");
        }
        if host.host_key_sha256.trim().is_empty() {
            anyhow::bail!("host '{alias}' has no pinned host key fingerprint");
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config() -> AgentConfig {
    let mut hosts = BTreeMap::new();
    hosts.insert(
        "web-1".to_string(),
        HostConfig {
            addr: "10.0.0.5".to_string(),
            port: 22,
            username: "ops".to_string(),
            key_path: "/etc/opsagent/id_ed25519".to_string(),
            host_key_sha256: "aa".repeat(32),
            level: AuthLevel::Operator,
            description: "primary web server".to_string(),
        },
    );
    hosts.insert(
        "metrics".to_string(),
        HostConfig {
            addr: "10.0.0.7".to_string(),
            port: 22,
            username: "ops".to_string(),
            key_path: "/etc/opsagent/id_ed25519".to_string(),
            host_key_sha256: "bb".repeat(32),
            level: AuthLevel::Readonly,
            description: "metrics collector".to_string(),
        },
    );
    hosts.insert(
        "bastion".to_string(),
        HostConfig {
            addr: "10.0.0.9".to_string(),
            port: 22,
            username: "root".to_string(),
            key_path: "/etc/opsagent/id_ed25519".to_string(),
            host_key_sha256: "cc".repeat(32),
            level: AuthLevel::Admin,
            description: "bastion".to_string(),
        },
    );
    AgentConfig {
        allowed_user_ids: vec![42],
        default_host: "web-1".to_string(),
        hosts,
        planner: PlannerConfig {
            endpoint: "http://127.0.0.1:0/v1/messages".to_string(),
            model: "test-model".to_string(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_planner_timeout(),
        },
        connect_timeout_secs: 1,
        command_timeout_secs: 5,
        max_output_lines: default_max_output_lines(),
        max_output_bytes: default_max_output_bytes(),
        max_context_entries: 8,
        context_keep_recent: 4,
        max_iterations: 3,
        retry_attempts: 2,
        retry_delay_ms: 1,
        rate_limit_max_requests: 2,
        rate_limit_window_secs: 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_test_config() {
        validate(&test_config()).unwrap();
    }

    #[test]
    fn validate_rejects_unknown_default_host() {
        let mut config = test_config();
        config.default_host = "nope".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_keep_recent_at_or_above_max_entries() {
        let mut config = test_config();
        config.context_keep_recent = config.max_context_entries;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_missing_fingerprint() {
        let mut config = test_config();
        config.hosts.get_mut("web-1").unwrap().host_key_sha256 = "  ".to_string();
        assert!(validate(&config).is_err());
    }

    #[tokio::test]
    async fn load_parses_json_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        let raw = r#"{
          "allowed_user_ids": [42],
          "default_host": "web-1",
          "hosts": {
            "web-1": {
              "addr": "10.0.0.5",
              "username": "ops",
              "key_path": "/etc/opsagent/id_ed25519",
              "host_key_sha256": "deadbeef",
              "level": "operator",
              "description": "primary web server"
            }
          },
          "planner": {
            "endpoint": "https://planner.example/v1/messages",
            "model": "sonnet"
          }
        }"#;
        tokio::fs::write(&path, raw).await.unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(config.hosts["web-1"].port, 22);
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.max_output_lines, 150);
        assert_eq!(config.rate_limit_max_requests, 10);
        assert_eq!(config.rate_limit_window_secs, 60);
        assert_eq!(config.hosts["web-1"].level, AuthLevel::Operator);
    }

    #[tokio::test]
    async fn load_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        let raw = r#"{
          "allowed_user_ids": [],
          "default_host": "web-1",
          "hosts": {},
          "planner": {"endpoint": "x", "model": "y"},
          "surprise": true
        }"#;
        tokio::fs::write(&path, raw).await.unwrap();
        assert!(load(&path).await.is_err());
    }
}
