//! Tidemark CLI - run the sliding-window sensor aggregation job.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tidemark_cli::config::Config;
use tidemark_runtime::checkpoint::{FileStore, MemoryStore, StateStore};
use tidemark_runtime::connector::{
    FileSource, KafkaSource, KafkaSourceConfig, SourceConnector, StartingOffset,
};
use tidemark_runtime::metrics::{Metrics, MetricsServer};
use tidemark_runtime::pipeline::Job;
use tidemark_runtime::sink::{DatabaseConfig, DatabaseKind, DatabaseSink, MemorySink, StatsSink};

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(version)]
#[command(about = "Sliding-window sensor statistics job", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "TIDEMARK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the aggregation job
    Run,
    /// Validate a configuration file and exit
    Check,
    /// Print an example configuration
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Example => {
            print!("{}", Config::example_yaml());
            Ok(())
        }
        Commands::Check => {
            let path = require_config_path(&cli)?;
            Config::load(&path)
                .with_context(|| format!("config {} is invalid", path.display()))?;
            println!("config {} is valid", path.display());
            Ok(())
        }
        Commands::Run => {
            let path = require_config_path(&cli)?;
            let config = Config::load(&path)?;
            init_tracing(&config)?;
            run(config).await
        }
    }
}

fn require_config_path(cli: &Cli) -> Result<PathBuf> {
    cli.config.clone().ok_or_else(|| {
        anyhow::anyhow!("no configuration file given (use --config or TIDEMARK_CONFIG)")
    })
}

fn init_tracing(config: &Config) -> Result<()> {
    let level: Level = config
        .logging
        .level
        .parse()
        .with_context(|| format!("invalid log level '{}'", config.logging.level))?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!("starting tidemark");

    let source = build_source(&config)?;
    let sink = build_sink(&config).await?;
    let store = build_store(&config)?;
    let metrics = Metrics::new();

    if config.metrics.enabled {
        let server = MetricsServer::new(metrics.clone(), config.metrics.bind.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!(error = %e, "metrics server stopped");
            }
        });
    }

    let job = Job::spawn(config.pipeline_config(), source, sink, store, metrics).await?;

    // Graceful shutdown on interrupt: stop intake, drain lanes, flush the
    // sink, commit a final snapshot.
    let shutdown = job.shutdown_trigger();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown.send(()).await;
        }
    });

    job.join().await?;
    info!("tidemark stopped");
    Ok(())
}

fn build_source(config: &Config) -> Result<Box<dyn SourceConnector>> {
    if let Some(kafka) = &config.source.kafka {
        let starting: StartingOffset = kafka
            .auto_offset_reset
            .parse()
            .map_err(anyhow::Error::msg)?;
        let mut source_config = KafkaSourceConfig::new(&kafka.bootstrap_servers, &kafka.topic)
            .with_starting_offset(starting);
        if let Some(group) = &kafka.group_id {
            source_config = source_config.with_group_id(group);
        }
        return Ok(Box::new(KafkaSource::new("kafka", source_config)));
    }
    if let Some(file) = &config.source.file {
        return Ok(Box::new(FileSource::new("file", &file.path)));
    }
    bail!("no source configured");
}

async fn build_sink(config: &Config) -> Result<Arc<dyn StatsSink>> {
    match &config.sink.database {
        Some(db) => {
            let kind: DatabaseKind = db.kind.parse().map_err(anyhow::Error::msg)?;
            let sink = DatabaseSink::connect(
                DatabaseConfig::new(kind, &db.url).with_max_connections(db.max_connections),
            )
            .await?;
            Ok(Arc::new(sink))
        }
        None => {
            warn!("no database sink configured, results stay in memory");
            Ok(Arc::new(MemorySink::new()))
        }
    }
}

fn build_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    match &config.checkpoint.dir {
        Some(dir) => Ok(Arc::new(FileStore::open(dir)?)),
        None => {
            warn!("no checkpoint directory configured, snapshots are not durable");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
