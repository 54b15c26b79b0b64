use std::{path::PathBuf, process};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use assetline::{
    ReloadHub, TaskKind, TaskRunner,
    cli::Cli,
    error::Result,
    task::{
        check_plan, config::DEFAULT_CONFIG_FILE, load_configuration, resolve_plan,
        show_plan_relationships,
    },
};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    if let Err(e) = run_assetline(args).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_assetline(args: Cli) -> Result<()> {
    let required = args.file.is_some();
    let file = args
        .file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = load_configuration(&file, required)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.incremental |= args.incremental;
    config.continue_on_failure |= args.continue_on_failure;

    if args.list {
        print_names(&config);
        return Ok(());
    }

    let target = args.task.clone().unwrap_or_else(|| config.default_task.clone());
    let plan = resolve_plan(&config, &target)?;
    check_plan(&plan, &config)?;
    show_plan_relationships(&plan, &config);

    debug!("Task execution order: {}", plan);

    if args.dry_run {
        println!("Dry run mode - showing what would be executed:");
        println!("  {}: {}", target, plan);
        for kind in plan.tasks() {
            println!("  {} would run: {}", kind, kind.description());
        }
        return Ok(());
    }

    let runner = TaskRunner::new(config, ReloadHub::new());

    // One-shot pipelines keep the default Ctrl+C behaviour.
    if plan.tasks().into_iter().any(TaskKind::is_long_running) {
        spawn_interrupt_listener(runner.clone());
    }

    let result = runner.run(&plan).await;
    runner.save_cache().await;
    result
}

fn spawn_interrupt_listener(runner: TaskRunner) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                runner.request_shutdown();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}

fn print_names(config: &assetline::Configuration) {
    println!("Tasks:");
    for kind in TaskKind::ALL {
        println!("  {:<14} {}", kind.name(), kind.description());
    }

    println!("Pipelines:");
    for name in config.pipelines.keys() {
        let plan = match resolve_plan(config, name) {
            Ok(plan) => plan.to_string(),
            Err(e) => e.to_string(),
        };
        let marker = if *name == config.default_task { " (default)" } else { "" };
        println!("  {:<14} {}{}", name, plan, marker);
    }
}
