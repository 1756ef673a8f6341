//! Kestrel Worker - main entry point

use anyhow::{Context, Result};
use clap::Parser;
use kestrel_backend::{Client, RedisClient};
use kestrel_core::{Jid, KestrelConfig};
use kestrel_telemetry::{init_logging, LoggingConfig};
use kestrel_worker::child::{run_job_child, run_watchdog};
use kestrel_worker::cli::{Cli, Command};
use kestrel_worker::{builtin_registry, reserver, HandlerRegistry, SelfExecLauncher, WorkerSupervisor};
use nix::unistd::Pid;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Work(args) => {
            let mut config = KestrelConfig::load(args.config.as_ref())?;
            args.apply(&mut config);
            init(&config)?;
            work(config).await
        }
        Command::JobChild(args) => {
            let config = child_config()?;
            init(&config)?;
            let registry = registry(&config)?;
            run_job_child::<RedisClient>(&config, &registry, &Jid::from(args.jid), &args.worker).await?;
            Ok(())
        }
        Command::Watchdog(args) => {
            let config = child_config()?;
            init(&config)?;
            let sibling = Pid::from_raw(args.sibling);
            run_watchdog::<RedisClient>(&config, &Jid::from(args.jid), &args.worker, sibling).await?;
            Ok(())
        }
    }
}

async fn work(mut config: KestrelConfig) -> Result<()> {
    // Children must agree with the master on the worker name.
    let name = config.worker.get_name();
    config.worker.name = Some(name.clone());

    info!("Starting Kestrel Worker v{}", env!("CARGO_PKG_VERSION"));
    info!("Backend: {}", config.backend.url);
    anyhow::ensure!(
        !config.backend.url.starts_with("memory://"),
        "memory:// backends cannot be shared with child processes"
    );

    // Fail fast on a bad default handler instead of in every job-child.
    let registry = registry(&config)?;
    info!("Registered job handlers: {}", registry.names().join(", "));

    let client = RedisClient::connect(&config.backend)
        .await
        .context("connecting to the backend")?;
    let reserver = reserver::build(&client, &config.worker)?;
    let launcher = SelfExecLauncher::new(&config)?;

    let mut supervisor = WorkerSupervisor::new(client, launcher, reserver, name);
    supervisor.configure(&config.worker);
    supervisor.run().await?;

    Ok(())
}

fn child_config() -> Result<KestrelConfig> {
    match KestrelConfig::from_child_env()? {
        Some(config) => Ok(config),
        None => Ok(KestrelConfig::from_env()?),
    }
}

fn registry(config: &KestrelConfig) -> Result<HandlerRegistry> {
    let mut registry = builtin_registry();
    if let Some(default) = &config.worker.default_handler {
        registry.set_default(default)?;
    }
    Ok(registry)
}

fn init(config: &KestrelConfig) -> Result<()> {
    let logging = LoggingConfig::new(config.logging.level.clone(), &config.logging.format)?;
    init_logging(logging)?;
    Ok(())
}
