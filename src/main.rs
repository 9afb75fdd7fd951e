mod cli;

use transq::{
    config,
    converter::Converter,
    events::{EventBus, EventPayload},
    monitor::ResourceMonitor,
    service,
};
use transq_common::{Error, Job, JobId, JobStatus};
use transq_db::JobStore;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, JobArgs};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

fn open_store(config: &config::Config) -> Result<JobStore> {
    let path = &config.storage.database_path;
    tracing::debug!("Opening job database at {:?}", path);
    JobStore::open(path).with_context(|| format!("Failed to open job database {:?}", path))
}

fn build_converter(config: &config::Config) -> Arc<dyn Converter> {
    Arc::new(config.converter.build())
}

async fn run_service(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let store = open_store(&config)?;

    tracing::info!("Starting transq");

    if config.storage.retention_days > 0 {
        if let Err(e) = store.prune_finished(config.storage.retention_days) {
            tracing::warn!("Failed to prune job history: {}", e);
        }
    }

    let events = Arc::new(EventBus::default());
    let scheduler =
        service::start_scheduler(&config, store.clone(), build_converter(&config), events).await;

    let recovery =
        service::recover_interrupted(&store, &scheduler, config.storage.resume_interrupted)?;
    if recovery.interrupted > 0 {
        tracing::info!(
            "Recovered {} unfinished jobs, {} queued again",
            recovery.interrupted,
            recovery.resumed
        );
    }

    tracing::info!(
        "Scheduler running with {} workers, press Ctrl-C to stop",
        scheduler.worker_count()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down...");
    scheduler.shutdown().await;
    Ok(())
}

async fn submit_and_wait(args: JobArgs, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let store = open_store(&config)?;

    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let scheduler = service::start_scheduler(&config, store, build_converter(&config), events).await;

    let response = scheduler.submit_request(args.into_request(), &config.defaults)?;
    let id = response.job_id;
    if !response.accepted {
        anyhow::bail!("Job {} is already tracked", id);
    }
    println!("Queued job {}", id);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut shown_percent = None;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) if event.payload.job_id() == &id => {
                    match &event.payload {
                        EventPayload::JobStarted { attempt, .. } => {
                            println!("Attempt {} started", attempt);
                        }
                        EventPayload::JobProgress { progress, .. } => {
                            let whole = progress.floor() as u32;
                            if shown_percent != Some(whole) {
                                shown_percent = Some(whole);
                                print!("\rProgress: {:>3}%", whole);
                                std::io::stdout().flush().ok();
                            }
                        }
                        EventPayload::JobRetrying { retry_count, max_retries, error, .. } => {
                            shown_percent = None;
                            println!("\nAttempt failed ({}), retry {}/{}", error, retry_count, max_retries);
                        }
                        _ => {}
                    }
                    if event.payload.is_terminal() {
                        println!();
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Missed {} job events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                println!("\nCancelling {}", id);
                scheduler.cancel(&id)?;
                break;
            }
        }
    }

    scheduler.shutdown().await;

    let job = scheduler
        .status(&id)
        .with_context(|| format!("Job {} is no longer tracked", id))?;
    print_job(&job);

    match job.status {
        JobStatus::Completed => Ok(()),
        other => anyhow::bail!("Job {} ended {}", id, other),
    }
}

fn enqueue(args: JobArgs, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let job = args.into_request().into_job(&config.defaults)?;
    let store = open_store(&config)?;

    if store.get(&job.id)?.is_some() {
        anyhow::bail!("Job {} already exists", job.id);
    }
    store.upsert(&job)?;
    println!("{}", job.id);
    Ok(())
}

fn show_status(
    config_path: Option<&Path>,
    id: Option<String>,
    state: Option<JobStatus>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let store = open_store(&config)?;

    if let Some(id) = id {
        let job = store
            .get(&JobId::new(id.clone()))?
            .ok_or_else(|| Error::not_found(id))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&job)?);
        } else {
            print_job(&job);
        }
        return Ok(());
    }

    let jobs: Vec<Job> = match state {
        Some(state) => store.list_by_status(state, limit)?,
        None => store.list_all()?.into_iter().take(limit as usize).collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:>6}  {:>7}  {:<25}  INPUT",
        "ID", "STATUS", "DONE", "RETRIES", "CREATED"
    );
    for job in &jobs {
        println!(
            "{:<36}  {:<9}  {:>5.1}%  {:>3}/{:<3}  {:<25}  {}",
            job.id,
            job.status,
            job.progress,
            job.retry_count,
            job.max_retries,
            job.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            job.params.input_path
        );
    }

    let counts = store.count_by_status()?;
    let summary: Vec<String> = JobStatus::ALL
        .iter()
        .filter_map(|s| counts.get(s).map(|n| format!("{} {}", n, s)))
        .collect();
    println!("\n{}", summary.join(", "));
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job:        {}", job.id);
    println!("Status:     {}", job.status);
    println!("Progress:   {:.1}%", job.progress);
    println!("Input:      {}", job.params.input_path);
    println!("Output:     {}", job.params.output_path);
    println!(
        "Settings:   quality {}, {}, video {} kbps, audio {} kbps",
        job.params.quality, job.params.resolution, job.params.video_bitrate, job.params.audio_bitrate
    );
    println!("Retries:    {}/{}", job.retry_count, job.max_retries);
    println!("Created:    {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("Started:    {}", started);
    }
    if let Some(completed) = job.completed_at {
        println!("Finished:   {}", completed);
    }
    if let Some(ref error) = job.error_message {
        println!("Error:      {}", error);
    }
}

fn show_resources(config_path: Option<&Path>, json: bool) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let monitor = ResourceMonitor::system(config.resources.clone(), &config.storage.output_dir);

    let snapshot = monitor.sample_blocking();
    let admission = monitor.admission(&snapshot);
    let cores = num_cpus::get();
    let workers = monitor.optimal_concurrency(&snapshot, cores);

    if json {
        let value = serde_json::json!({
            "snapshot": snapshot,
            "can_admit": admission.is_admitted(),
            "admission": admission.to_string(),
            "cores": cores,
            "optimal_concurrency": workers,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("CPU:          {:.1}%", snapshot.cpu_percent);
    println!(
        "Memory:       {:.1}% used, {:.2} GB available",
        snapshot.memory_percent, snapshot.memory_available_gb
    );
    println!(
        "Disk:         {:.1}% used, {:.2} GB free ({})",
        snapshot.disk_percent,
        snapshot.disk_free_gb,
        config.storage.output_dir.display()
    );
    println!("Admission:    {}", admission);
    println!("Workers:      {} ({} cores)", workers, cores);
    Ok(())
}

fn prune(config_path: Option<&Path>, days: u32) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let store = open_store(&config)?;
    let removed = store.prune_finished(days)?;
    println!("Removed {} finished jobs older than {} days", removed, days);
    Ok(())
}

fn validate_config(config_path: Option<&Path>) -> Result<()> {
    match config_path {
        Some(path) => {
            config::load_config(path)?;
            println!("Configuration is valid: {}", path.display());
        }
        None => {
            let config = config::load_config_or_default(None)?;
            config::validate_config(&config)?;
            println!("Configuration is valid");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "transq=trace,transq_db=debug,transq_common=debug".to_string()
        } else {
            "transq=debug,transq_db=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_service(config_path))
        }
        Commands::Submit(args) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(submit_and_wait(args, config_path))
        }
        Commands::Enqueue(args) => enqueue(args, config_path),
        Commands::Status {
            id,
            state,
            limit,
            json,
        } => show_status(config_path, id, state, limit, json),
        Commands::Resources { json } => show_resources(config_path, json),
        Commands::Prune { days } => prune(config_path, days),
        Commands::Validate { config: path } => validate_config(path.as_deref().or(config_path)),
        Commands::Version => {
            println!("transq {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
