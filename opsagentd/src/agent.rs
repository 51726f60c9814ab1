// ABOUTME: the plan/act/verify control loop driving one remediation run per user query.
// ABOUTME: every command passes policy first, every run ends in a persisted incident record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::audit::{AuditEntry, AuditLog};
use crate::config::AgentConfig;
use crate::planner::{PlanRequest, Planner, PlannerReply, ToolRequest};
use crate::policy::{self, PolicyEngine};
use crate::registry::HostRegistry;
use crate::ssh::{ExecResult, RemoteExecutor};
use crate::store::{ContextEntry, EntryRole, SessionStatus, SessionStore};

const RECENT_INCIDENT_LIMIT: usize = 5;

const VERIFY_INSTRUCTION: &str =
    "You changed remote state but have not verified the result. Run a read-only \
     command to confirm the fix took effect before giving your final answer.";

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub reply: String,
    pub session_id: String,
}

pub struct Agent {
    config: Arc<AgentConfig>,
    registry: Arc<HostRegistry>,
    policy: PolicyEngine,
    executor: Arc<dyn RemoteExecutor>,
    planner: Arc<dyn Planner>,
    store: Arc<SessionStore>,
    audit: Arc<AuditLog>,
}

impl Agent {
    pub fn new(
        config: Arc<AgentConfig>,
        registry: Arc<HostRegistry>,
        policy: PolicyEngine,
        executor: Arc<dyn RemoteExecutor>,
        planner: Arc<dyn Planner>,
        store: Arc<SessionStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Agent {
            config,
            registry,
            policy,
            executor,
            planner,
            store,
            audit,
        }
    }

    /// Runs one query to completion: DONE with a final reply, or FAILED when
    /// the iteration budget runs out or the planner becomes unreachable.
    pub async fn handle_query(
        &self,
        user_id: u64,
        query: &str,
        session_id: Option<&str>,
    ) -> anyhow::Result<AgentOutcome> {
        let session = self.resolve_session(user_id, session_id).await?;
        let started = Instant::now();

        let incidents = self
            .store
            .recent_incidents(user_id, RECENT_INCIDENT_LIMIT)
            .await?;
        let system = crate::planner::system_prompt(&self.registry.format_hosts_list(), &incidents);

        self.store
            .append_context(&session.id, ContextEntry::new(EntryRole::User, query))
            .await?;

        let mut tools_used: Vec<String> = Vec::new();
        // set after a state-changing command executes, cleared by a read-only
        // command; a final answer while set gets one verification nudge
        let mut verify_pending = false;
        let mut verify_nudged = false;
        let mut outcome: Option<AgentOutcome> = None;

        for iteration in 0..self.config.max_iterations {
            let entries = self
                .store
                .get_session(&session.id)
                .await
                .with_context(|| format!("session '{}' vanished mid-run", session.id))?
                .entries;

            let reply = match self
                .planner
                .plan(PlanRequest {
                    system: system.clone(),
                    entries,
                })
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::error!(error = %err, iteration, "planner call failed");
                    outcome = Some(AgentOutcome {
                        success: false,
                        reply: format!("The planning service is unavailable: {err}"),
                        session_id: session.id.clone(),
                    });
                    break;
                }
            };

            match reply {
                PlannerReply::Final(text) => {
                    if verify_pending && !verify_nudged {
                        verify_nudged = true;
                        self.store
                            .append_context(
                                &session.id,
                                ContextEntry::new(EntryRole::User, VERIFY_INSTRUCTION),
                            )
                            .await?;
                        continue;
                    }
                    self.store
                        .append_context(&session.id, ContextEntry::new(EntryRole::Assistant, &text))
                        .await?;
                    outcome = Some(AgentOutcome {
                        success: true,
                        reply: text,
                        session_id: session.id.clone(),
                    });
                    break;
                }
                PlannerReply::Tool(request) => {
                    tools_used.push(request.name().to_string());
                    let observation = match request {
                        ToolRequest::ListHosts => self.registry.format_hosts_list(),
                        ToolRequest::ExecuteCommand {
                            command,
                            host,
                            timeout_secs,
                        } => {
                            let (observation, executed_readonly, executed_state_change) = self
                                .run_command(user_id, host.as_deref(), &command, timeout_secs)
                                .await?;
                            if executed_state_change {
                                verify_pending = true;
                                verify_nudged = false;
                            } else if executed_readonly {
                                verify_pending = false;
                            }
                            observation
                        }
                    };
                    self.store
                        .append_context(&session.id, ContextEntry::new(EntryRole::Tool, observation))
                        .await?;
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| AgentOutcome {
            success: false,
            reply: format!(
                "I could not complete this within {} planning steps. Partial progress is in the session log.",
                self.config.max_iterations
            ),
            session_id: session.id.clone(),
        });

        if !outcome.success {
            self.store
                .append_context(
                    &session.id,
                    ContextEntry::new(EntryRole::Assistant, &outcome.reply),
                )
                .await?;
        }

        self.store
            .save_incident(
                user_id,
                query,
                outcome.success.then(|| outcome.reply.as_str()),
                tools_used,
                outcome.success,
                started.elapsed().as_millis() as u64,
            )
            .await?;

        Ok(outcome)
    }

    pub async fn close_session(&self, user_id: u64, session_id: &str) -> anyhow::Result<()> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .with_context(|| format!("unknown session '{session_id}'"))?;
        if session.user_id != user_id {
            anyhow::bail!("session '{session_id}' belongs to a different user");
        }
        self.store.close_session(session_id).await
    }

    async fn resolve_session(
        &self,
        user_id: u64,
        session_id: Option<&str>,
    ) -> anyhow::Result<crate::store::Session> {
        match session_id {
            Some(id) => {
                let session = self
                    .store
                    .get_session(id)
                    .await
                    .with_context(|| format!("unknown session '{id}'"))?;
                if session.user_id != user_id {
                    anyhow::bail!("session '{id}' belongs to a different user");
                }
                if session.status != SessionStatus::Active {
                    anyhow::bail!("session '{id}' is closed");
                }
                Ok(session)
            }
            None => self.store.create_or_get_session(user_id).await,
        }
    }

    /// Policy check, execution, and the post-execution audit record for one
    /// command. Returns the observation text plus what actually ran.
    async fn run_command(
        &self,
        user_id: u64,
        host: Option<&str>,
        command: &str,
        timeout_secs: Option<u64>,
    ) -> anyhow::Result<(String, bool, bool)> {
        let host = host.unwrap_or_else(|| self.registry.default_host());
        let decision = self.policy.evaluate(user_id, host, command).await?;
        if !decision.allowed {
            return Ok((
                format!("command denied on {host}: {}", decision.reason),
                false,
                false,
            ));
        }

        // policy already resolved the host, so the level lookup cannot miss
        let level = self
            .registry
            .get(host)
            .map(|h| h.level.as_str())
            .unwrap_or("unknown");

        let timeout = Duration::from_secs(
            timeout_secs
                .unwrap_or(self.config.command_timeout_secs)
                .clamp(1, self.config.command_timeout_secs),
        );

        let exec_started = Instant::now();
        match self.executor.execute(host, command, timeout).await {
            Ok(result) => {
                self.audit
                    .append(AuditEntry::execution(
                        user_id,
                        host,
                        command,
                        level,
                        Some(result.exit_code),
                        result.duration_ms,
                    ))
                    .await?;
                let state_changing = policy::is_state_changing(command);
                Ok((
                    format_exec_observation(host, command, &result),
                    !state_changing,
                    state_changing,
                ))
            }
            Err(err) => {
                self.audit
                    .append(AuditEntry::execution(
                        user_id,
                        host,
                        command,
                        level,
                        None,
                        exec_started.elapsed().as_millis() as u64,
                    ))
                    .await?;
                // a failed attempt may still have changed state; keep the
                // verification obligation conservative
                let state_changing = policy::is_state_changing(command);
                Ok((
                    format!("command failed on {host}: {err}"),
                    false,
                    state_changing,
                ))
            }
        }
    }
}

fn format_exec_observation(host: &str, command: &str, result: &ExecResult) -> String {
    let mut text = format!("{host} $ {command}\nexit code: {}", result.exit_code);
    if !result.stdout.is_empty() {
        text.push('\n');
        text.push_str(&result.stdout);
    }
    if !result.stderr.is_empty() {
        text.push_str("\nstderr:\n");
        text.push_str(&result.stderr);
    }
    if let Some(info) = &result.truncated_info {
        text.push_str(&format!("\n[output truncated: {info}]"));
    }
    text
}
