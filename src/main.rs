use agent_runtime::{
    error::{AppError, AppResult},
    initialize_logging_with,
    messaging::{
        CommunicationPoller, Inbound, MessageService, MessageType, PubSubService, PublicationType,
        PublishOptions, SendOptions, SubscriptionFilters,
    },
    pool::{LoadBalancingStrategy, PoolConfig, PoolManager, RequestOutcome},
    runtime::{AgentSpec, RuntimeManager, SystemClock, TaskSpec},
    RuntimeConfig,
};
use serde_json::json;
use std::{
    env,
    path::PathBuf,
    process,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> AppResult<()> {
    // Parse command line arguments first (before logging to avoid noise)
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        process::exit(0);
    }

    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => match args.get(i + 1) {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                eprintln!("--config requires a path");
                process::exit(2);
            }
        },
        None => None,
    };

    let config = match &config_path {
        Some(path) => RuntimeConfig::load_with_env(Some(path.as_path()))?,
        None => RuntimeConfig::load().await?,
    };

    initialize_logging_with(&config.logging).map_err(|e| AppError::validation(e.to_string()))?;

    if args.iter().any(|a| a == "--demo") {
        run_demo(config).await
    } else {
        run_service(config).await
    }
}

fn print_help() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("{}", env!("CARGO_PKG_DESCRIPTION"));
    println!();
    println!("USAGE:");
    println!("    {} [OPTIONS]", env!("CARGO_PKG_NAME"));
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message and exit");
    println!("    -V, --version        Print version information and exit");
    println!("        --demo           Run a short scripted demo and exit");
    println!("        --config <PATH>  Load configuration from PATH");
    println!();
    println!("ENVIRONMENT:");
    println!("    AGENT_RUNTIME__<SECTION>__<KEY>  Override a configuration value");
    println!("    RUST_LOG                         Set logging level (debug, info, warn, error)");
    println!();
    println!("EXAMPLES:");
    println!("    {}                       Run until Ctrl-C", env!("CARGO_PKG_NAME"));
    println!("    {} --demo                Run the demo", env!("CARGO_PKG_NAME"));
    println!("    {} --config rt.toml      Use a configuration file", env!("CARGO_PKG_NAME"));
}

/// Host the runtime with its background loops until interrupted
async fn run_service(config: RuntimeConfig) -> AppResult<()> {
    let runtime = Arc::new(RuntimeManager::new(config.manager_config()));
    runtime.restore_from_store().await?;
    runtime.start_health_monitor()?;
    let pools = PoolManager::new(runtime.clone(), config.pool_manager_config());
    pools.restore_from_store().await?;

    info!("🚀 Agent runtime started; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    pools.shutdown().await;
    let report = runtime.shutdown().await;
    info!(
        "Shutdown complete: {} drained, {} forced, {} failed",
        report.drained.len(),
        report.forced.len(),
        report.failed.len()
    );
    Ok(())
}

async fn run_demo(config: RuntimeConfig) -> AppResult<()> {
    let start_time = Instant::now();
    info!("🚀 Agent runtime demo starting");

    let runtime = Arc::new(RuntimeManager::new(config.manager_config()));

    // Single agent: priority ordering and dependencies
    let agent = runtime
        .create_agent(AgentSpec::new("demo-worker", "worker"))
        .await?;
    runtime.start_agent(agent.id()).await?;

    let first = runtime
        .submit_task(agent.id(), TaskSpec::new("delay", json!({"duration": "50ms"})).with_priority(8))
        .await?;
    let second = runtime
        .submit_task(
            agent.id(),
            TaskSpec::new("echo", json!({"step": "after delay"})).with_dependency(&first),
        )
        .await?;
    let result = runtime
        .wait_for_task(agent.id(), &second, Duration::from_secs(5))
        .await?;
    info!("✅ Dependent task finished: {} ({:?})", result.status, result.output);

    // Pool: provisioning and round-robin leasing
    let pools = PoolManager::new(runtime.clone(), config.pool_manager_config());
    let pool = pools
        .create_pool(
            PoolConfig::new(
                "demo-pool",
                config
                    .pools
                    .default_min_agents
                    .max(2)
                    .min(config.pools.default_max_agents),
                config.pools.default_max_agents,
            )
            .with_strategy(LoadBalancingStrategy::RoundRobin),
        )
        .await?;
    info!("📦 Pool {} created with {} members", pool.id, pool.members.len());

    for _ in 0..3 {
        let leased = pools.get_agent_from_pool(&pool.id).await?;
        let task = runtime
            .submit_task(leased.id(), TaskSpec::new("echo", json!({"pool": pool.config.name})))
            .await?;
        let outcome = match runtime
            .wait_for_task(leased.id(), &task, Duration::from_secs(5))
            .await
        {
            Ok(result) if result.is_success() => RequestOutcome::success(result.duration),
            Ok(result) => RequestOutcome::failure(result.duration),
            Err(e) => {
                warn!("Pool task failed: {}", e);
                RequestOutcome::failure(Duration::ZERO)
            }
        };
        pools.release_agent(&pool.id, leased.id(), outcome).await?;
        info!("  leased {}", leased.id());
    }
    let pool_metrics = pools.get_pool_metrics(&pool.id).await?;
    info!(
        "📊 Pool requests: {} total, {} failed",
        pool_metrics.total_requests, pool_metrics.failed_requests
    );

    // Messaging: direct message and publication through a poller
    let clock = Arc::new(SystemClock);
    let messages = Arc::new(MessageService::new(config.messaging_config(), clock.clone()));
    let pubsub = Arc::new(PubSubService::new(config.messaging_config(), clock));
    pubsub.subscribe(agent.id(), agent.agent_type(), "task.*", SubscriptionFilters::default())?;

    let (tx, mut rx) = mpsc::channel(16);
    let poller = Arc::new(CommunicationPoller::new(
        agent.id(),
        messages.clone(),
        pubsub.clone(),
        config.poller_config(),
        tx,
    )?);

    messages.send_message(
        "demo-client",
        agent.id(),
        MessageType::TaskRequest,
        json!({"task_type": "echo", "payload": {"via": "message"}}),
        SendOptions::default().with_priority(7),
    )?;
    pubsub.publish(
        "demo-client",
        "client",
        "task.announced",
        json!({"note": "hello"}),
        PublishOptions::new(PublicationType::Event),
    )?;

    let forwarded = poller.poll_once().await?;
    info!("📨 Poller forwarded {} items", forwarded);
    while let Ok(inbound) = rx.try_recv() {
        match inbound {
            Inbound::Message(message) => {
                let task_id = runtime.submit_task(agent.id(), message.to_task_spec()?).await?;
                messages.acknowledge(&message.id)?;
                info!("  message {} became task {}", message.id, task_id);
            }
            Inbound::Publication(publication) => {
                info!("  publication '{}' from {}", publication.event_name, publication.publisher_agent_id);
            }
        }
    }

    let metrics = runtime.get_metrics();
    info!(
        "📈 Fleet: {} agents created, {} tasks executed, {} failed",
        metrics.total_agents_created, metrics.total_tasks_executed, metrics.total_tasks_failed
    );

    pools.delete_pool(&pool.id).await?;
    pools.shutdown().await;
    runtime.shutdown().await;

    info!("Demo finished in {:?}", start_time.elapsed());
    Ok(())
}
