// ABOUTME: defines the shared gateway protocol types used by opsctl and opsagentd.
// ABOUTME: provides parsing and validation helpers so both sides reject malformed requests.

use serde::{Deserialize, Serialize};

pub const MAX_QUERY_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentRequest {
    pub user_id: u64,
    pub query: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentResponse {
    pub success: bool,
    pub reply: String,
    pub session_id: Option<String>,
    pub error: Option<RequestError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseFailed,
    ValidationFailed,
    RequestTooLarge,
    Unauthorized,
    RateLimited,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

pub fn parse_agent_request(input: &str) -> Result<AgentRequest, serde_json::Error> {
    serde_json::from_str(input)
}

pub fn validate_agent_request(request: &AgentRequest) -> Result<(), ValidationError> {
    if request.query.trim().is_empty() {
        return Err(ValidationError {
            message: "query must be non-empty".to_string(),
        });
    }
    if request.query.len() > MAX_QUERY_BYTES {
        return Err(ValidationError {
            message: format!("query exceeds {MAX_QUERY_BYTES} bytes"),
        });
    }
    if let Some(session_id) = &request.session_id {
        if session_id.trim().is_empty() {
            return Err(ValidationError {
                message: "session_id must be non-empty when present".to_string(),
            });
        }
    }
    Ok(())
}

impl AgentResponse {
    pub fn failure(code: ErrorCode, message: &str) -> Self {
        AgentResponse {
            success: false,
            reply: String::new(),
            session_id: None,
            error: Some(RequestError {
                code,
                message: message.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_fields() {
        let input = r#"
        {
          "user_id": 42,
          "query": "check disk space",
          "session_id": null,
          "unexpected": "hallucination"
        }
        "#;

        assert!(parse_agent_request(input).is_err());
    }

    #[test]
    fn parse_accepts_minimal_request() {
        let input = r#"{"user_id":42,"query":"uptime","session_id":null}"#;
        let request = parse_agent_request(input).unwrap();
        assert_eq!(request.user_id, 42);
        assert_eq!(request.query, "uptime");
        assert!(request.session_id.is_none());
    }

    #[test]
    fn validate_rejects_blank_query() {
        let request = AgentRequest {
            user_id: 1,
            query: "   ".to_string(),
            session_id: None,
        };
        assert!(validate_agent_request(&request).is_err());
    }

    #[test]
    fn validate_rejects_blank_session_id() {
        let request = AgentRequest {
            user_id: 1,
            query: "df -h".to_string(),
            session_id: Some("".to_string()),
        };
        assert!(validate_agent_request(&request).is_err());
    }

    #[test]
    fn validate_rejects_oversized_query() {
        let request = AgentRequest {
            user_id: 1,
            query: "a".repeat(MAX_QUERY_BYTES + 1),
            session_id: None,
        };
        assert!(validate_agent_request(&request).is_err());
    }

    #[test]
    fn response_roundtrips_through_json() {
        let response = AgentResponse {
            success: true,
            reply: "nginx restarted and verified".to_string(),
            session_id: Some("sess-1".to_string()),
            error: None,
        };
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: AgentResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, response);
    }
}
