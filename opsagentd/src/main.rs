// ABOUTME: runs the fleet remediation daemon behind a local unix socket gateway.
// ABOUTME: wires config, policy, audit, ssh transport, planner, and the session store together.

mod agent;
mod audit;
mod config;
mod planner;
mod policy;
mod registry;
mod server;
mod ssh;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value = "/etc/opsagent/agent.json")]
    config_path: PathBuf,

    #[arg(long, default_value = "/tmp/opsagentd.sock")]
    socket_path: String,

    #[arg(long, default_value = "./opsagent-audit.jsonl")]
    audit_path: PathBuf,

    #[arg(long, default_value = "./opsagent-state")]
    state_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Arc::new(config::load(&args.config_path).await?);

    let registry = Arc::new(registry::HostRegistry::from_config(&config));
    let audit = Arc::new(audit::AuditLog::new(args.audit_path.clone()));
    let policy = policy::PolicyEngine::new(registry.clone(), audit.clone());
    let store = store::SessionStore::open(
        args.state_dir.clone(),
        config.max_context_entries,
        config.context_keep_recent,
    )
    .await?;
    let executor = Arc::new(ssh::SshClient::new(config.clone()));
    let planner = Arc::new(planner::HttpPlanner::new(&config.planner)?);

    let agent = Arc::new(agent::Agent::new(
        config.clone(),
        registry,
        policy,
        executor,
        planner,
        store,
        audit.clone(),
    ));

    server::run(&args.socket_path, config, agent, audit).await
}
