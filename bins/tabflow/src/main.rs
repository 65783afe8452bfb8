use std::sync::Arc;

use clap::{Parser, Subcommand};

use tabflow_config_hcl::HclParser;
use tabflow_engine::config::TomlParser;
use tabflow_engine::{ConcurrentSink, EngineConfig, EngineError, Frame};
use tabflow_format_jsonl::JsonLinesTarget;

#[derive(Parser)]
#[command(name = "tabflow", about = "Run plans over partitioned JSON-lines data")]
struct Cli {
    /// Configuration file (.toml or .hcl). Defaults apply without one.
    #[arg(long, env = "TABFLOW_CONFIG")]
    config: Option<String>,

    /// Worker threads for count and distinct (overrides plan.workers).
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the number of rows.
    Count { pattern: String },
    /// Print each distinct row once.
    Distinct { pattern: String },
    /// Print the first row.
    Head { pattern: String },
    /// Print the merged schema, one column per line.
    Schema { pattern: String },
    /// Write every row to a JSON-lines file.
    Copy {
        pattern: String,
        dest: String,
        /// Append to an existing file with the same columns instead of
        /// replacing it.
        #[arg(long)]
        append: bool,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig, EngineError> {
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(config = %path, "loading configuration");
            EngineConfig::load_with(path, &[&TomlParser, &HclParser])?
        }
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.plan.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn frame(pattern: &str) -> Result<Frame, EngineError> {
    let parts = tabflow_format_jsonl::discover(pattern).map_err(|e| EngineError::read(pattern, e))?;
    tracing::info!(pattern, parts = parts.len(), "parts discovered");
    Frame::from_parts(parts)
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Count { pattern } => {
            let count = frame(&pattern)?.count(&config.plan).await?;
            println!("{count}");
        }
        Command::Distinct { pattern } => {
            for row in frame(&pattern)?.distinct(&config.plan).await? {
                println!("{row}");
            }
        }
        Command::Head { pattern } => {
            let frame = frame(&pattern)?;
            if let Some(row) = tokio::task::spawn_blocking(move || frame.head())
                .await
                .map_err(|e| EngineError::WorkerPanicked { worker: "head".into(), message: e.to_string() })??
            {
                println!("{row}");
            }
        }
        Command::Schema { pattern } => {
            for column in frame(&pattern)?.schema().columns() {
                match &column.data_type {
                    Some(data_type) => println!("{}\t{data_type}", column.name),
                    None => println!("{}\t?", column.name),
                }
            }
        }
        Command::Copy { pattern, dest, append } => {
            let frame = frame(&pattern)?;
            let mut sink_config = config.sink.clone();
            sink_config.create_table = !append;
            let target = Arc::new(JsonLinesTarget::new(&dest));
            let sink = ConcurrentSink::start(target, frame.schema().clone(), sink_config)?;
            let report = tabflow_engine::copy(&frame, &sink).await?;
            println!("{} rows in {} batches -> {dest}", report.rows, report.batches);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Results go to stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    tokio::select! {
        result = run(cli) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "command failed");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted");
            std::process::exit(130);
        }
    }
}
