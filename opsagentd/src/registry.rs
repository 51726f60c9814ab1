// ABOUTME: read-only view over the configured fleet of hosts and their authorization levels.
// ABOUTME: every command request must resolve an alias here before anything else happens.

use std::collections::BTreeMap;

use crate::config::{AgentConfig, HostConfig};

#[derive(Debug)]
pub struct HostRegistry {
    hosts: BTreeMap<String, HostConfig>,
    default_host: String,
}

impl HostRegistry {
    pub fn from_config(config: &AgentConfig) -> Self {
        HostRegistry {
            hosts: config.hosts.clone(),
            default_host: config.default_host.clone(),
        }
    }

    pub fn get(&self, alias: &str) -> Option<&HostConfig> {
        self.hosts.get(alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.hosts.contains_key(alias)
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(|k| k.as_str())
    }

    /// Human-readable host list for the list_hosts tool and the planner prompt.
    pub fn format_hosts_list(&self) -> String {
        let mut lines = vec!["Known hosts:".to_string()];
        for (alias, host) in &self.hosts {
            lines.push(format!(
                "- {} ({}): {}",
                alias,
                host.level.as_str(),
                host.description
            ));
        }
        lines.push(format!("Default host: {}", self.default_host));
        lines.join("\n")
    }
}
