//! `qc`: the quorumcode process launcher.
//!
//! Subcommands:
//!
//! - `qc registry` serves the agent registry over HTTP.
//! - `qc orchestrator` runs the orchestrator loop (optionally
//!   autonomous) with an in-process fleet: worker agents are attached
//!   automatically as the orchestrator spawns them.
//! - `qc agent` runs a single worker-agent loop.
//!
//! The LLM binding is external; this binary wires a loopback model so
//! the plumbing can be exercised end to end. Production deployments
//! provide a real [`ChatModel`] implementation.

mod model;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use qc_engine::context::ContextEngine;
use qc_engine::time_travel::TimeTravelRecorder;
use qc_fabric::{Fabric, Mailbox, MailboxReader, MemoryFabric};
use qc_registry::{api, AgentStore, RegistryClient, RegistryService};
use qc_runtime::checkpoint::FsCheckpointStore;
use qc_runtime::driver::ChatModel;
use qc_runtime::graph::GraphExecutor;
use qc_runtime::tools::agents::ManageAgentsTool;
use qc_runtime::tools::ledger::RefinementLedgerTool;
use qc_runtime::tools::testing::{
    RecordPropertyTestTool, RecordTestSuiteTool, RequestFinalReviewTool,
};
use qc_runtime::tools::workspace::{LocalWorkspaceBackend, WorkspaceTool};
use qc_runtime::tools::ToolRegistry;
use qc_runtime::{Profile, RuntimeRunner};
use qc_types::config::RuntimeConfig;
use qc_types::envelope::{
    mailbox_recipient, MessageEnvelope, HUMAN_RECIPIENT, MAILBOX_PREFIX, ORCHESTRATOR_RECIPIENT,
};

/// quorumcode process launcher.
#[derive(Parser)]
#[command(name = "qc", about = "quorumcode multi-agent runtime", version)]
struct Cli {
    /// Path to a TOML config file (or set QC_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the agent registry over HTTP.
    Registry {
        /// Listen port.
        #[arg(long, default_value_t = 9410)]
        port: u16,

        /// SQLite database path.
        #[arg(long, default_value = "./qc-registry.db")]
        db: PathBuf,
    },

    /// Run the orchestrator loop with an in-process fleet.
    Orchestrator {
        /// Apply the autonomous routing policy and prompt.
        #[arg(long)]
        autonomous: bool,

        /// Post this task as the first human envelope.
        #[arg(long)]
        prompt: Option<String>,

        /// State directory (checkpoints, workspaces, archives).
        #[arg(long, default_value = "./qc-state")]
        state_dir: PathBuf,
    },

    /// Run a single worker-agent loop.
    Agent {
        /// Agent identity; generated when omitted.
        #[arg(long)]
        agent_id: Option<String>,

        /// State directory (checkpoints, workspaces).
        #[arg(long, default_value = "./qc-state")]
        state_dir: PathBuf,
    },

    /// Replay or diff recorded cycles from the time-travel log.
    Replay {
        /// Thread (chat) id whose log to read.
        #[arg(long)]
        thread: String,

        /// Cycle id to replay.
        #[arg(long)]
        cycle: Option<String>,

        /// Diff: from-cycle (requires --diff-to).
        #[arg(long, requires = "diff_to")]
        diff_from: Option<String>,

        /// Diff: to-cycle.
        #[arg(long)]
        diff_to: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RuntimeConfig> {
    let path = path
        .cloned()
        .or_else(|| std::env::var("QC_CONFIG").ok().map(PathBuf::from));
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(RuntimeConfig::default()),
    }
}

fn build_tools(
    identity: &str,
    config: &RuntimeConfig,
    fabric: Arc<dyn Fabric>,
    state_dir: &std::path::Path,
    fleet_management: bool,
) -> ToolRegistry {
    let mailbox = Mailbox::new(fabric);
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(RefinementLedgerTool));
    tools.register(Arc::new(RecordTestSuiteTool));
    tools.register(Arc::new(RecordPropertyTestTool));
    tools.register(Arc::new(WorkspaceTool::new(
        Arc::new(LocalWorkspaceBackend::new(state_dir.join("workspaces"))),
        mailbox.clone(),
        identity,
    )));
    if fleet_management {
        tools.register(Arc::new(RequestFinalReviewTool::new(
            mailbox.clone(),
            identity,
        )));
        tools.register(Arc::new(ManageAgentsTool::new(
            RegistryClient::new(&config.registry.base_url),
            mailbox,
            identity,
            "127.0.0.1",
            0,
            config.autonomous.max_agents,
        )));
    }
    tools
}

fn build_runner(
    profile: Profile,
    config: &RuntimeConfig,
    fabric: Arc<dyn Fabric>,
    model: Arc<dyn ChatModel>,
    state_dir: &std::path::Path,
) -> Arc<RuntimeRunner> {
    let fleet_management = profile.kind == qc_runtime::profile::ProfileKind::Orchestrator;
    let tools = build_tools(
        &profile.identity,
        config,
        fabric.clone(),
        state_dir,
        fleet_management,
    );
    let engine = ContextEngine::new(config.context.clone(), &config.exhaustion)
        .with_workspace_root(state_dir.join("workspaces"));
    let recorder = TimeTravelRecorder::new(&config.observability.time_travel_dir);
    let graph = GraphExecutor::new(
        Arc::new(engine),
        model,
        Arc::new(tools),
        profile.system_prompt.clone(),
    )
    .with_recorder(Arc::new(recorder));

    let checkpoints = Arc::new(FsCheckpointStore::new(
        state_dir.join("checkpoints").join(&profile.identity),
    ));
    Arc::new(
        RuntimeRunner::new(profile, config.clone(), fabric, checkpoints, graph)
            .with_registry(RegistryClient::new(&config.registry.base_url)),
    )
}

/// Watch the fabric for freshly spawned agent mailboxes and attach an
/// in-process worker runner for each.
async fn attach_spawned_agents(
    fabric: Arc<dyn Fabric>,
    config: RuntimeConfig,
    model: Arc<dyn ChatModel>,
    state_dir: PathBuf,
) {
    let mut attached: Vec<String> = Vec::new();
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Ok(mailboxes) = fabric.scan(&format!("{MAILBOX_PREFIX}agent-")).await else {
            continue;
        };
        for mailbox in mailboxes {
            let agent_id = mailbox_recipient(&mailbox).to_string();
            if attached.contains(&agent_id) {
                continue;
            }
            attached.push(agent_id.clone());
            info!(agent_id = %agent_id, "attaching in-process worker agent");
            let runner = build_runner(
                Profile::agent(&agent_id),
                &config,
                fabric.clone(),
                model.clone(),
                &state_dir,
            );
            tokio::spawn(runner.run());
        }
    }
}

/// Print envelopes landing in the human mailbox.
async fn watch_human_mailbox(fabric: Arc<dyn Fabric>) {
    let mut reader = MailboxReader::new(fabric, HUMAN_RECIPIENT);
    loop {
        match reader.read(16, Duration::from_secs(2)).await {
            Ok(batch) => {
                for (_, envelope) in batch {
                    println!("[{}] {}", envelope.sender, envelope.message);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "human mailbox read failed");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Registry { port, db } => {
            let store = AgentStore::open(&db)
                .await
                .map_err(|e| anyhow::anyhow!("opening registry store: {e}"))?;
            let service = Arc::new(RegistryService::new(
                store,
                config.registry.agent_timeout_secs,
            ));
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            api::serve(service, addr)
                .await
                .context("registry server failed")?;
        }

        Commands::Orchestrator {
            autonomous,
            prompt,
            state_dir,
        } => {
            let fabric: Arc<dyn Fabric> = Arc::new(MemoryFabric::new());
            let model: Arc<dyn ChatModel> = Arc::new(model::LoopbackModel::default());

            let runner = build_runner(
                Profile::orchestrator(autonomous),
                &config,
                fabric.clone(),
                model.clone(),
                &state_dir,
            );

            tokio::spawn(attach_spawned_agents(
                fabric.clone(),
                config.clone(),
                model,
                state_dir.clone(),
            ));
            tokio::spawn(watch_human_mailbox(fabric.clone()));

            if let Some(prompt) = prompt {
                let envelope =
                    MessageEnvelope::new(HUMAN_RECIPIENT, ORCHESTRATOR_RECIPIENT, prompt)
                        .with_payload("chat_id", serde_json::json!("cli"))
                        .with_payload("ticket_id", serde_json::json!("cli-1"));
                Mailbox::new(fabric.clone()).post(&envelope).await
                    .map_err(|e| anyhow::anyhow!("posting initial prompt: {e}"))?;
            }

            let cancel = runner.cancel_token();
            let loop_handle = tokio::spawn(runner.run());
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
            cancel.cancel();
            loop_handle.await?.map_err(|e| anyhow::anyhow!("runtime loop: {e}"))?;
        }

        Commands::Agent {
            agent_id,
            state_dir,
        } => {
            let agent_id = agent_id.unwrap_or_else(qc_types::agent_id::generate_agent_id);
            let fabric: Arc<dyn Fabric> = Arc::new(MemoryFabric::new());
            let model: Arc<dyn ChatModel> = Arc::new(model::LoopbackModel::default());

            let runner = build_runner(
                Profile::agent(&agent_id),
                &config,
                fabric,
                model,
                &state_dir,
            );
            let cancel = runner.cancel_token();
            let loop_handle = tokio::spawn(runner.run());
            tokio::signal::ctrl_c().await.ok();
            cancel.cancel();
            loop_handle.await?.map_err(|e| anyhow::anyhow!("runtime loop: {e}"))?;
        }

        Commands::Replay {
            thread,
            cycle,
            diff_from,
            diff_to,
        } => {
            let recorder = TimeTravelRecorder::new(&config.observability.time_travel_dir);
            let path = recorder.log_path(&thread);
            if let (Some(from), Some(to)) = (diff_from, diff_to) {
                let diff = qc_engine::time_travel::diff_cycles(&path, &from, &to);
                println!("{}", serde_json::to_string_pretty(&diff)?);
            } else if let Some(cycle) = cycle {
                for event in qc_engine::time_travel::replay_cycle(&path, &cycle) {
                    println!("{event}");
                }
            } else {
                anyhow::bail!("pass --cycle or --diff-from/--diff-to");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_when_no_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.context.context_window_max, 120_000);
    }

    #[test]
    fn toml_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qc.toml");
        std::fs::write(
            &path,
            "[context]\ncontext_window_max = 9000\n[registry]\nbase_url = \"http://reg:1\"\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.context.context_window_max, 9000);
        assert_eq!(config.registry.base_url, "http://reg:1");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["qc", "registry", "--port", "9999"]).unwrap();
        match cli.command {
            Commands::Registry { port, .. } => assert_eq!(port, 9999),
            _ => panic!("wrong subcommand"),
        }

        let cli = Cli::try_parse_from(["qc", "orchestrator", "--autonomous"]).unwrap();
        match cli.command {
            Commands::Orchestrator { autonomous, .. } => assert!(autonomous),
            _ => panic!("wrong subcommand"),
        }
    }
}
