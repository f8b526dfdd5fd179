//! CLI entry point for clipmerge
//!
//! Drives one local session end to end: queue the given files, validate them, merge
//! with the chosen mode and deliver the result into the configured output directory.

use clap::{Args, Parser, Subcommand};
use clipmerge_core::{
    format_duration, format_eta, format_speed, init_tracing, load_records, new_shared_metrics,
    run_metrics_server, run_startup_checks, AudioPolicy, Collaborators, Config, DirectoryDelivery,
    EntryCandidate, FfmpegTool, FfprobeProbe, FpsSetting, JobStage, LocalFileFetcher, MergeMode,
    MergePipeline, MetadataProbe, PipelineConfig, ProgressEvent, ResolutionSetting, ResourcePlan,
    SessionId, SessionLimits, SessionRegistry, SettingsUpdate, SourceRef,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// clipmerge - merge video clips with automatic FAST/SAFE strategy selection
#[derive(Parser, Debug)]
#[command(name = "clipmerge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge the given files in order
    Merge(MergeArgs),
    /// Print the metadata the merger sees for one file
    Probe { file: PathBuf },
    /// List archived jobs
    History,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// fast, safe or smart
    #[arg(short, long, default_value = "smart")]
    mode: MergeMode,

    /// auto, 720p, 1080p or 4k
    #[arg(short, long, default_value = "auto")]
    resolution: ResolutionSetting,

    /// auto or a fixed frame rate
    #[arg(long, default_value = "auto")]
    fps: FpsSetting,

    /// keep or remove
    #[arg(long, default_value = "keep")]
    audio: AudioPolicy,

    /// Output file name (".mp4" is appended when missing)
    #[arg(short, long)]
    output: Option<String>,

    /// Print progress events as JSON lines
    #[arg(long)]
    json: bool,

    /// Skip startup checks (ffprobe, ffmpeg version). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Files to merge, in order
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::load(path).map_err(|e| format!("{}: {}", path.display(), e)),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

fn print_event(event: &ProgressEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to encode event: {}", e),
        }
        return;
    }

    for warning in &event.warnings {
        println!("  warning: {}", warning.detail);
    }
    match (&event.stage, &event.speed) {
        (JobStage::Downloading, Some(speed)) => {
            let eta = speed.eta_secs.map(format_eta).unwrap_or_else(|| "-".to_string());
            println!(
                "[{:<11}] {:5.1}%  {}  ETA {}",
                event.stage,
                event.percent,
                format_speed(speed.bytes_per_sec),
                eta
            );
        }
        (JobStage::Failed, _) => {
            if let Some(failure) = &event.failure {
                println!("[{:<11}] {}", event.stage, failure);
            }
        }
        _ => println!("[{:<11}] {:5.1}%", event.stage, event.percent),
    }
}

async fn run_merge(config: Config, args: MergeArgs) -> Result<(), String> {
    if args.skip_checks {
        println!("WARNING: Skipping startup checks (--skip-checks enabled)");
    } else {
        run_startup_checks(&config).map_err(|e| e.to_string())?;
    }

    let plan = ResourcePlan::derive(&config);
    let metrics = new_shared_metrics();
    if config.metrics.enabled {
        let metrics = metrics.clone();
        let bind = config.metrics.bind.clone();
        println!("Metrics on http://{}/metrics", bind);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &bind).await {
                tracing::error!(error = %e, "metrics server stopped");
            }
        });
    }

    let probe: Arc<dyn MetadataProbe> = Arc::new(FfprobeProbe::new(config.tools.ffprobe.clone()));
    let pipeline = MergePipeline::new(
        PipelineConfig::from_config(&config, &plan),
        Collaborators {
            probe: probe.clone(),
            fetcher: Arc::new(LocalFileFetcher),
            tool: Arc::new(FfmpegTool::new(
                config.tools.ffmpeg.clone(),
                Duration::from_secs(config.pipeline.cancel_grace_secs),
            )),
            delivery: Arc::new(DirectoryDelivery::new(
                config.delivery.output_dir.clone(),
                config.delivery.max_bytes,
            )),
        },
        metrics.clone(),
    );
    let registry = SessionRegistry::new(
        Arc::new(pipeline),
        probe,
        SessionLimits::from_config(&config),
        metrics,
    );

    let session = SessionId::from("cli");
    registry.open(&session).await;

    for input in &args.inputs {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        let candidate = EntryCandidate::new(SourceRef::new(input.to_string_lossy()), name);
        let entry = registry
            .add(&session, candidate)
            .await
            .map_err(|e| format!("{}: {}", input.display(), e))?;
        println!(
            "+ {} ({}x{}, {:.2} fps, {}, {})",
            entry.display_name,
            entry.metadata.width,
            entry.metadata.height,
            entry.metadata.frame_rate,
            entry.metadata.codec_id,
            format_duration(entry.metadata.duration_seconds)
        );
    }

    registry
        .update_settings(
            &session,
            SettingsUpdate {
                mode: Some(args.mode),
                resolution: Some(args.resolution),
                fps: Some(args.fps),
                audio: Some(args.audio),
                output_name: args.output.clone(),
            },
        )
        .await
        .map_err(|e| e.to_string())?;

    let summary = registry.summary(&session).await.map_err(|e| e.to_string())?;
    println!(
        "{} entries, {} total, output {}",
        summary.entries.len(),
        summary.total_duration,
        summary.output_name
    );

    let handle = registry.start_merge(&session).await.map_err(|e| e.to_string())?;
    println!("Job {} started", handle.job_id);
    let (mut events, result) = handle.split();

    let mut cancel_sent = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, args.json),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                match registry.cancel(&session).await {
                    Ok(job_id) => eprintln!("Cancelling job {}...", job_id),
                    Err(e) => eprintln!("Cannot cancel: {}", e),
                }
            }
        }
    }

    let outcome = result.take_result().await.map_err(|e| e.to_string())?;
    registry.end_session(&session).await.map_err(|e| e.to_string())?;

    match outcome {
        Ok(artifact) => {
            println!("Done: {} ({} bytes)", artifact.location.display(), artifact.size_bytes);
            Ok(())
        }
        Err(failure) => Err(failure.to_string()),
    }
}

fn run_probe(config: &Config, file: &Path) -> Result<(), String> {
    let probe = FfprobeProbe::new(config.tools.ffprobe.clone());
    let metadata = probe
        .probe(&SourceRef::new(file.to_string_lossy()))
        .map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&metadata).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

fn run_history(config: &Config) -> Result<(), String> {
    let Some(dir) = &config.storage.archive_dir else {
        println!("No archive directory configured (storage.archive_dir)");
        return Ok(());
    };

    let records = load_records(dir).map_err(|e| format!("{}: {}", dir.display(), e))?;
    if records.is_empty() {
        println!("No archived jobs in {}", dir.display());
    }
    for record in records {
        let result = match (&record.artifact, &record.failure) {
            (Some(artifact), _) => artifact.location.display().to_string(),
            (_, Some(failure)) => failure.to_string(),
            _ => String::new(),
        };
        println!(
            "{}  {:<6} {:<4} {:>2} entries  {}  {}",
            record.job_id,
            record.stage,
            record.strategy,
            record.entry_ids.len(),
            format_duration(record.total_duration_seconds),
            result
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Merge(args) => run_merge(config, args).await,
        Command::Probe { file } => run_probe(&config, &file),
        Command::History => run_history(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
