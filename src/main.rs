use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, bail};
use appmanager::{
    Manager,
    builtin::register_builtin,
    config::{AppSettings, ConfigManager, EnvConfigManager},
    description::AppDescription,
    framework::Framework,
    logger::init_tracing,
};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "appmanager",
    about = "Run applications made of services wired by data and channels",
    version
)]
struct Cli {
    /// Settings file loaded into the environment
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an application and run it until Ctrl-C
    Run(RunArgs),

    /// Load an application and check its inputs without starting anything
    Check { file: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// App description (.json, .yaml or .yml)
    file: PathBuf,

    /// Stop again right after everything started
    #[arg(long)]
    once: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let mut settings = futures::executor::block_on(AppSettings::load(&config));
    if let Some(level) = &cli.log_level {
        settings.log.level = level.clone();
    }
    let _guard = init_tracing(&settings.log)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = settings.worker_threads {
        builder.worker_threads(threads);
    }
    let runtime = builder.build().context("cannot build the tokio runtime")?;

    let result = runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => run(args).await,
            Commands::Check { file } => check(file).await,
        }
    });
    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

async fn load(file: &Path) -> anyhow::Result<Arc<Manager>> {
    let framework = Framework::global()?;
    register_builtin(framework.factory());

    let manager = Manager::new(framework);
    manager.create();
    let desc = AppDescription::from_path(file)?;
    desc.apply(&manager).await?;
    Ok(manager)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let manager = load(&args.file).await?;
    if !manager.check_inputs().await? {
        manager.destroy().await?;
        bail!("{} has missing inputs", args.file.display());
    }

    manager.start_services().await?;
    let started = manager.started_services().await;
    info!(manager = %manager.id(), ?started, "application running");

    if !args.once {
        println!("{} running; press Ctrl-C to exit", args.file.display());
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
    }

    manager.destroy().await?;
    Ok(())
}

async fn check(file: PathBuf) -> anyhow::Result<()> {
    let manager = load(&file).await?;
    let ok = manager.check_inputs().await?;
    manager.destroy().await?;
    if !ok {
        bail!("{} has missing inputs", file.display());
    }
    println!("{}: all inputs resolved", file.display());
    Ok(())
}
