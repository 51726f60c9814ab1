// ABOUTME: provides opsctl helpers for building and validating agent requests before sending them.
// ABOUTME: keeps client behavior deterministic by enforcing local validation first.

use opsagent_common::{
    parse_agent_request, validate_agent_request, AgentRequest, ErrorCode, RequestError,
};

pub fn build_request(
    user_id: u64,
    query: &str,
    session_id: Option<&str>,
) -> anyhow::Result<AgentRequest> {
    let request = AgentRequest {
        user_id,
        query: query.to_string(),
        session_id: session_id.map(str::to_string),
    };
    validate_agent_request(&request).map_err(|e| anyhow::anyhow!(e.message))?;
    Ok(request)
}

pub fn parse_and_validate(input: &str) -> anyhow::Result<AgentRequest> {
    let request = parse_agent_request(input)?;
    validate_agent_request(&request).map_err(|e| anyhow::anyhow!(e.message))?;
    Ok(request)
}

#[derive(Debug, serde::Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ValidateVerdict {
    pub ok: bool,
    pub error: Option<RequestError>,
}

pub fn validate_verdict(input: &str) -> ValidateVerdict {
    match parse_agent_request(input) {
        Ok(request) => match validate_agent_request(&request) {
            Ok(()) => ValidateVerdict { ok: true, error: None },
            Err(err) => ValidateVerdict {
                ok: false,
                error: Some(RequestError {
                    code: ErrorCode::ValidationFailed,
                    message: err.message,
                }),
            },
        },
        Err(err) => ValidateVerdict {
            ok: false,
            error: Some(RequestError {
                code: ErrorCode::ParseFailed,
                message: err.to_string(),
            }),
        },
    }
}
