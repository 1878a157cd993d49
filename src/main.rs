//! Adjutant - assistant core entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use adjutant::{
    agent::{AssistantAgent, ToolAgent},
    bus::{Bus, KvStore, MemoryBus},
    channels::TelegramAdapter,
    config::{Config, ConfigHandle},
    llm::create_model_gateway,
    mcp::{confirmations, ConfirmationStore, EndpointRegistry, GatewayState},
    memory::UserMemory,
    orchestrator::{Orchestrator, ToolWorker},
    ratelimit::RateLimiter,
    skills::{
        builtin::{FilesystemSkill, ShellSkill, TimeSkill},
        SandboxRunner, SkillRegistry,
    },
    tasks::TaskStore,
};

#[derive(Parser, Debug)]
#[command(name = "adjutant")]
#[command(about = "Event-driven orchestration core for a personal AI assistant")]
#[command(version)]
struct Args {
    /// Configuration file path (optional, uses env vars by default)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Run without the Telegram adapter (bus and gateway only)
    #[arg(long)]
    no_telegram: bool,

    /// Run without the MCP gateway
    #[arg(long)]
    no_gateway: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("adjutant=debug,tower_http=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting assistant core...");

    // Shared fabric: pub/sub topics plus the KV store.
    let fabric = Arc::new(MemoryBus::new());
    let bus: Arc<dyn Bus> = fabric.clone();
    let kv: Arc<dyn KvStore> = fabric.clone();

    // Configuration resolves KV -> environment -> file.
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_kv(kv.as_ref()).await?;
    config.validate(!args.no_telegram).map_err(|e| {
        tracing::error!(error = %e, "configuration invalid");
        e
    })?;
    let config = ConfigHandle::new(config);
    let snapshot = config.get().await;
    tracing::info!(model = %snapshot.model.name, "configuration loaded");

    let tasks = Arc::new(TaskStore::new(kv.clone(), snapshot.memory.short_term_window));
    let memory = Arc::new(UserMemory::new(kv.clone(), snapshot.memory.short_term_window));
    let confirmations_store = Arc::new(ConfirmationStore::new(kv.clone(), bus.clone()));
    let endpoints = Arc::new(EndpointRegistry::new(kv.clone()));
    let limiter = Arc::new(RateLimiter::new(
        kv.clone(),
        snapshot.rate_limit.capacity,
        snapshot.rate_limit.refill_per_sec,
    ));

    // Skill registry is immutable after this block.
    let mut registry = SkillRegistry::new();
    let workspace = std::path::PathBuf::from(&snapshot.sandbox.workspace_dir);
    registry.register(Arc::new(FilesystemSkill::new(
        workspace.clone(),
        snapshot.sandbox.skill_timeout_secs,
    )));
    registry.register(Arc::new(ShellSkill::new(
        &snapshot.sandbox.command_allow_list,
        workspace,
        snapshot.sandbox.network_enabled,
        snapshot.sandbox.shell_timeout_secs,
    )));
    registry.register(Arc::new(TimeSkill::new()));
    let registry = Arc::new(registry);
    tracing::info!("skill registry initialized with {} skills", registry.count());

    let gateway = create_model_gateway(&snapshot.model);
    tracing::info!("model gateway initialized: {}", gateway.model_name());

    let assistant = Arc::new(AssistantAgent::new(gateway, registry.as_ref()));
    let runner = Arc::new(SandboxRunner::new(snapshot.sandbox.network_enabled));
    let tool_agent = Arc::new(ToolAgent::new(registry, runner));

    // Workers, each in its own concurrency domain.
    let orchestrator = Arc::new(Orchestrator::new(
        bus.clone(),
        tasks,
        memory,
        assistant,
        confirmations_store.clone(),
        config.clone(),
    ));
    tokio::spawn(orchestrator.clone().run());
    tokio::spawn(orchestrator.run_restart_listener());
    tokio::spawn(Arc::new(ToolWorker::new(bus.clone(), tool_agent)).run());
    tokio::spawn(confirmations::run_sweeper(confirmations_store.clone()));

    if !args.no_gateway {
        let state = Arc::new(GatewayState::new(
            bus.clone(),
            endpoints.clone(),
            confirmations_store.clone(),
            limiter.clone(),
            snapshot.gateway.admin_token.clone(),
        ));
        let addr: std::net::SocketAddr = snapshot.gateway.bind_addr.parse()?;
        let bound = adjutant::mcp::serve(state, addr).await?;
        tracing::info!("MCP gateway enabled on {bound}");
    }

    if !args.no_telegram {
        let adapter = Arc::new(
            TelegramAdapter::new(
                bus.clone(),
                kv.clone(),
                config.clone(),
                confirmations_store,
                endpoints,
                limiter,
            )
            .await?,
        );
        tokio::spawn(adapter.run());
        tracing::info!("Telegram adapter enabled");
    }

    tracing::info!("assistant core running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    Ok(())
}
