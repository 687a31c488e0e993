use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use courier::{
    config::Settings,
    flow::{FlowConfig, validate_config},
    logger::init_tracing,
    router::TracingSink,
    runtime::Runtime,
    transport::memory::MemoryTransport,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    about = "Multi-profile messaging orchestrator",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon
    Run(RunArgs),

    /// Manage flow definitions
    Flow(FlowArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Use the in-process simulated transport instead of a real one
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Check a flow config file for graph problems
    Validate { file: PathBuf },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        simulate: false,
        log_level: None,
        data_dir: None,
    })) {
        Commands::Run(args) => run(args).await,
        Commands::Flow(args) => match args.command {
            FlowCommands::Validate { file } => validate_flow_file(&file),
        },
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut settings = Settings::from_env();
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }
    if let Some(dir) = args.data_dir {
        settings.data_dir = dir;
    }
    let _guard = init_tracing(&settings.log_level, settings.log_dir.clone())?;

    if !args.simulate {
        // Real transport adapters register themselves out of tree; without
        // one there is nothing to run against.
        bail!("no transport configured; start with --simulate for the in-process one");
    }
    info!("Running with the simulated in-process transport");

    let runtime = Runtime::start(&settings, MemoryTransport::auto(), Arc::new(TracingSink)).await?;
    runtime.run_until_shutdown().await
}

fn validate_flow_file(file: &PathBuf) -> anyhow::Result<()> {
    let raw = fs::read_to_string(file)?;
    let config: FlowConfig = serde_json::from_str(&raw)?;
    let issues = validate_config(&config);
    if issues.is_empty() {
        println!("{}: ok ({} flow(s))", file.display(), config.flows.len());
        return Ok(());
    }
    for issue in &issues {
        eprintln!("{issue}");
    }
    eprintln!("{} problem(s) found", issues.len());
    process::exit(1);
}
