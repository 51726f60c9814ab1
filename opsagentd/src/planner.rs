// ABOUTME: adapts session context into reasoning-engine calls and parses the replies.
// ABOUTME: tool requests form a closed set of two operations; anything else is a protocol error.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::PlannerConfig;
use crate::store::{ContextEntry, EntryRole, Incident};

/// The only operations the reasoning engine may request. Free-form text from
/// the engine is never interpreted as an instruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolRequest {
    ExecuteCommand {
        command: String,
        host: Option<String>,
        timeout_secs: Option<u64>,
    },
    ListHosts,
}

impl ToolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::ExecuteCommand { .. } => "execute_command",
            ToolRequest::ListHosts => "list_hosts",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerReply {
    Final(String),
    Tool(ToolRequest),
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner request failed: {0}")]
    Http(String),
    #[error("planner protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub system: String,
    pub entries: Vec<ContextEntry>,
}

#[async_trait::async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<PlannerReply, PlannerError>;
}

pub fn system_prompt(hosts_list: &str, incidents: &[Incident]) -> String {
    let mut prompt = format!(
        "You are an operations agent with SSH access to a fixed fleet of servers.\n\n\
         {hosts_list}\n\n\
         Tools:\n\
         - execute_command: run one shell command on a named host\n\
         - list_hosts: show known hosts and their authorization levels\n\n\
         Rules:\n\
         1. Each command runs in a separate SSH session; combine dependent steps with &&.\n\
         2. Work in order: gather information, analyze, act, then verify the result.\n\
         3. Authorization levels: readonly hosts accept inspection commands only; operator\n\
            hosts also accept service and container restarts; admin hosts accept anything\n\
            that is not destructive.\n\
         4. Never use interactive programs (vim, nano, less, more, bare database shells).\n\
         5. After changing anything, verify it with a follow-up command before answering.\n\
         6. Be brief; explain what you did and why."
    );

    if !incidents.is_empty() {
        prompt.push_str("\n\nRecent incidents for this user:\n");
        for incident in incidents {
            let outcome = if incident.success { "resolved" } else { "unresolved" };
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                incident.query,
                outcome,
                incident.resolution.as_deref().unwrap_or("no resolution recorded")
            ));
        }
    }
    prompt
}

/// Reasoning-engine adapter over an Anthropic-style messages endpoint.
pub struct HttpPlanner {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    api_key: String,
}

impl HttpPlanner {
    pub fn new(config: &PlannerConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("planner api key env var '{}' is not set", config.api_key_env)
        })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(HttpPlanner {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl Planner for HttpPlanner {
    async fn plan(&self, request: PlanRequest) -> Result<PlannerReply, PlannerError> {
        let body = build_request_body(&self.model, self.max_tokens, &request);
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|err| PlannerError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PlannerError::Http(format!("status {status}: {detail}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| PlannerError::Http(err.to_string()))?;
        parse_reply(&body)
    }
}

pub fn build_request_body(model: &str, max_tokens: u32, request: &PlanRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .entries
        .iter()
        .map(|entry| {
            let (role, content) = match entry.role {
                EntryRole::Assistant => ("assistant", entry.content.clone()),
                EntryRole::User => ("user", entry.content.clone()),
                EntryRole::Tool => ("user", format!("[tool result]\n{}", entry.content)),
                EntryRole::System => ("user", format!("[context]\n{}", entry.content)),
            };
            json!({ "role": role, "content": content })
        })
        .collect();

    json!({
        "model": model,
        "max_tokens": max_tokens,
        "system": request.system,
        "messages": messages,
        "tools": [
            {
                "name": "execute_command",
                "description": "Execute one shell command on a named remote host over SSH. \
                    Commands are checked against the host's authorization level first.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "command": { "type": "string", "description": "shell command to run" },
                        "host": { "type": "string", "description": "host alias; defaults to the configured default host" },
                        "timeout_secs": { "type": "integer", "description": "command timeout in seconds" }
                    },
                    "required": ["command"]
                }
            },
            {
                "name": "list_hosts",
                "description": "List known hosts with their authorization levels and descriptions.",
                "input_schema": { "type": "object", "properties": {} }
            }
        ]
    })
}

/// Parses an engine reply into either final text or exactly one tool request.
pub fn parse_reply(body: &serde_json::Value) -> Result<PlannerReply, PlannerError> {
    let content = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| PlannerError::Protocol("reply has no content array".to_string()))?;

    let mut text_parts: Vec<&str> = Vec::new();
    let mut tools: Vec<&serde_json::Value> = Vec::new();
    for block in content {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => tools.push(block),
            other => {
                return Err(PlannerError::Protocol(format!(
                    "unsupported content block type {other:?}"
                )))
            }
        }
    }

    match tools.as_slice() {
        [] => Ok(PlannerReply::Final(text_parts.join("\n"))),
        [tool] => parse_tool_request(tool).map(PlannerReply::Tool),
        _ => Err(PlannerError::Protocol(
            "reply requested more than one tool call".to_string(),
        )),
    }
}

fn parse_tool_request(block: &serde_json::Value) -> Result<ToolRequest, PlannerError> {
    let name = block
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| PlannerError::Protocol("tool_use block has no name".to_string()))?;
    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));

    match name {
        "execute_command" => {
            let command = input
                .get("command")
                .and_then(|c| c.as_str())
                .ok_or_else(|| {
                    PlannerError::Protocol("execute_command requires a command string".to_string())
                })?
                .to_string();
            let host = input
                .get("host")
                .and_then(|h| h.as_str())
                .map(str::to_string);
            let timeout_secs = input.get("timeout_secs").and_then(|t| t.as_u64());
            Ok(ToolRequest::ExecuteCommand {
                command,
                host,
                timeout_secs,
            })
        }
        "list_hosts" => Ok(ToolRequest::ListHosts),
        other => Err(PlannerError::Protocol(format!(
            "unsupported operation '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_text_reply() {
        let body = json!({
            "content": [{"type": "text", "text": "All services healthy."}],
            "stop_reason": "end_turn"
        });
        let reply = parse_reply(&body).unwrap();
        assert_eq!(reply, PlannerReply::Final("All services healthy.".to_string()));
    }

    #[test]
    fn parses_execute_command_tool_request() {
        let body = json!({
            "content": [
                {"type": "text", "text": "Checking disk usage."},
                {"type": "tool_use", "id": "tu_1", "name": "execute_command",
                 "input": {"command": "df -h", "host": "web-1", "timeout_secs": 30}}
            ],
            "stop_reason": "tool_use"
        });
        let reply = parse_reply(&body).unwrap();
        assert_eq!(
            reply,
            PlannerReply::Tool(ToolRequest::ExecuteCommand {
                command: "df -h".to_string(),
                host: Some("web-1".to_string()),
                timeout_secs: Some(30),
            })
        );
    }

    #[test]
    fn parses_list_hosts_tool_request() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "tu_1", "name": "list_hosts", "input": {}}]
        });
        let reply = parse_reply(&body).unwrap();
        assert_eq!(reply, PlannerReply::Tool(ToolRequest::ListHosts));
    }

    #[test]
    fn rejects_unknown_operation() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "tu_1", "name": "delete_fleet", "input": {}}]
        });
        let err = parse_reply(&body).unwrap_err();
        assert!(matches!(err, PlannerError::Protocol(_)));
        assert!(err.to_string().contains("delete_fleet"));
    }

    #[test]
    fn rejects_multiple_tool_calls_in_one_reply() {
        let body = json!({
            "content": [
                {"type": "tool_use", "id": "tu_1", "name": "list_hosts", "input": {}},
                {"type": "tool_use", "id": "tu_2", "name": "list_hosts", "input": {}}
            ]
        });
        assert!(matches!(
            parse_reply(&body),
            Err(PlannerError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_execute_command_without_command() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "tu_1", "name": "execute_command", "input": {}}]
        });
        assert!(matches!(
            parse_reply(&body),
            Err(PlannerError::Protocol(_))
        ));
    }

    #[test]
    fn system_prompt_names_hosts_and_history() {
        let incidents = vec![Incident {
            id: "i-1".to_string(),
            user_id: 42,
            timestamp: chrono::Utc::now(),
            query: "disk full on web-1".to_string(),
            resolution: Some("pruned docker images".to_string()),
            tools_used: vec!["execute_command".to_string()],
            success: true,
            duration_ms: 2000,
        }];
        let prompt = system_prompt("Known hosts:\n- web-1 (operator)", &incidents);
        assert!(prompt.contains("web-1 (operator)"));
        assert!(prompt.contains("disk full on web-1"));
        assert!(prompt.contains("pruned docker images"));
    }
}
