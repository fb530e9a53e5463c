mod server;

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use carvy_contracts::{cache_key, PipelineOutcome, VehicleImageRequest};
use carvy_engine::{EngineConfig, Orchestrator, PipelineError};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,carvy_engine=debug";

#[derive(Debug, Parser)]
#[command(name = "carvy", version, about = "Cached vehicle studio images")]
struct Cli {
    /// Offline backends: placeholder generator, corner-key matting, local store under --out.
    #[arg(long, global = true)]
    dryrun: bool,
    #[arg(long, global = true, default_value = "carvy-out")]
    out: PathBuf,
    /// Event journal path; overrides CARVY_EVENTS_PATH.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve(ServeArgs),
    Generate(GenerateArgs),
    Upload(UploadArgs),
    Key(KeyArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    make: String,
    #[arg(long)]
    model: String,
    #[arg(long)]
    year: i32,
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    body_type: Option<String>,
    #[arg(long)]
    background: Option<String>,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Parser)]
struct KeyArgs {
    #[arg(long)]
    make: String,
    #[arg(long)]
    model: String,
    #[arg(long)]
    year: i32,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("carvy error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();

    if let Command::Key(args) = &cli.command {
        println!("{}", cache_key(&args.make, &args.model, args.year));
        return Ok(0);
    }

    let mut config = EngineConfig::from_env();
    if let Some(events) = &cli.events {
        config.events_path = Some(events.clone());
    }
    let orchestrator = build_orchestrator(&cli, &config)?;

    match cli.command {
        Command::Serve(args) => run_serve(orchestrator, &config, args),
        Command::Generate(args) => {
            let mut request = VehicleImageRequest::new(args.make, args.model, args.year);
            if let Some(color) = args.color {
                request = request.with_color(color);
            }
            if let Some(body_type) = args.body_type {
                request = request.with_body_type(body_type);
            }
            if let Some(background) = args.background {
                request = request.with_background(background);
            }
            report(orchestrator.generate_and_process(&request))
        }
        Command::Upload(args) => {
            let file = File::open(&args.file)
                .with_context(|| format!("failed to open {}", args.file.display()))?;
            report(orchestrator.upload_and_process(&args.name, file))
        }
        Command::Key(_) => Ok(0),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_orchestrator(cli: &Cli, config: &EngineConfig) -> Result<Orchestrator> {
    if cli.dryrun {
        carvy_engine::dryrun_orchestrator(config, &cli.out)
    } else {
        carvy_engine::live_orchestrator(config)
    }
}

// Blocking HTTP clients inside the orchestrator are built before the runtime exists.
fn run_serve(orchestrator: Orchestrator, config: &EngineConfig, args: ServeArgs) -> Result<i32> {
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_addr.clone());
    let router = server::build_router(orchestrator, config.api_key_secret.clone());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(server::serve(router, &bind_addr))?;
    Ok(0)
}

fn report(result: Result<PipelineOutcome, PipelineError>) -> Result<i32> {
    match result {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(0)
        }
        Err(err) => {
            let body = json!({
                "status": "error",
                "code": err.code(),
                "stage": err.stage().as_str(),
                "message": err.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(1)
        }
    }
}
