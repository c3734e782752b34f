use anyhow::{Context, Result};
use mxqueue::cli::{
    Args, ConfigDiscovery, ExecutionMode, InitConfigOptions, RunConfig, ShowSnapshotConfig,
};
use mxqueue::queue::{
    FileQueueStore, LoggingEventHandler, QueueConfig, QueueManager, read_snapshot_file,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "mxqueue=debug"
    } else {
        "mxqueue=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Logs go to stderr so projections printed on stdout stay parseable
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let verbose = matches!(&mode, ExecutionMode::Run(run) if run.verbose);
    init_logging(verbose);

    match mode {
        ExecutionMode::Run(config) => run_snapshot(config).await,
        ExecutionMode::Show(config) => show_snapshot(config).await,
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
        ExecutionMode::InitConfig(options) => init_config(options),
    }
}

fn init_config(options: InitConfigOptions) -> Result<()> {
    match options.output {
        Some(path) => {
            if ConfigDiscovery::write_default_config(&path, options.force)? {
                println!("Wrote default configuration to {:?}", path);
            } else {
                println!("Kept existing configuration {:?} (use --force to overwrite)", path);
            }
        }
        None => {
            let path = ConfigDiscovery::create_default_user_config(options.force)?;
            println!("User configuration: {:?}", path);
        }
    }
    Ok(())
}

/// Build a manager on the simulated beamline and load a snapshot into it
async fn load_manager(config: &QueueConfig, snapshot: &std::path::Path) -> Result<QueueManager> {
    let (manager, _device) = QueueManager::with_simulated_device(config);
    manager.add_event_handler(Arc::new(LoggingEventHandler));

    let blob = read_snapshot_file(snapshot)
        .await
        .with_context(|| format!("Failed to read snapshot {:?}", snapshot))?;
    let loaded = manager
        .load_json(&blob)
        .await
        .with_context(|| format!("Failed to load snapshot {:?}", snapshot))?;

    info!(
        "Loaded {} samples with {} tasks from {:?}",
        loaded.sample_order.len(),
        loaded.task_count(),
        snapshot
    );
    Ok(manager)
}

async fn run_snapshot(run: RunConfig) -> Result<()> {
    let mut config = ConfigDiscovery::load(run.config_override.as_deref())?;
    if run.auto_mount {
        config.auto_mount_sample = true;
    }
    if let Some(delay) = run.image_delay_ms {
        config.simulation.image_delay_ms = delay;
    }

    let manager = load_manager(&config, &run.snapshot).await?;

    let target = match &run.sample {
        Some(sample_id) => Some(manager.get_sample(sample_id).await?.queue_id),
        None => None,
    };

    let stopper = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the queue");
            if let Err(e) = stopper.stop().await {
                warn!("Failed to stop the queue: {}", e);
            }
        }
    });

    let run_id = manager.start(target).await?;
    info!("Started run {}", run_id);
    let outcome = manager.wait().await;

    let snapshot = manager.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if let Some(proposal_id) = config.proposal_id {
        let workspace = std::env::current_dir()?;
        let store = FileQueueStore::new(config.store.resolve_directory(&workspace))
            .with_compression(config.store.compress);
        manager
            .save(&store, proposal_id)
            .await
            .with_context(|| format!("Failed to save queue for proposal {}", proposal_id))?;
    }

    let summary = outcome.context("Queue execution failed")?;
    info!(
        "Run {} ended {}: {} succeeded, {} skipped, {} failed",
        summary.run_id, summary.final_state, summary.succeeded, summary.skipped, summary.failed
    );
    Ok(())
}

async fn show_snapshot(show: ShowSnapshotConfig) -> Result<()> {
    let config = ConfigDiscovery::load(show.config_override.as_deref())?;
    let manager = load_manager(&config, &show.snapshot).await?;

    let snapshot = manager.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
