use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use imgpipe::broker::queue_depths;
use imgpipe::config::validate_config;
use imgpipe::ingress::{http, DEFAULT_RETRY_DELAY};
use imgpipe::pipeline::start_stage;
use imgpipe::storage::UploadStore;
use imgpipe::{connect_from_url, load_config, Broker, Config, Ingress, Pipeline, PipelineOptions};

#[derive(Parser)]
#[command(name = "imgpipe", version, about = "Queue-driven image processing pipeline")]
struct Cli {
    /// Path to a JSON config file. Built-in defaults are used without one.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides broker.url from the config.
    #[arg(long, global = true)]
    broker_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP upload service.
    Serve,
    /// Run replicas of one stage.
    Stage {
        name: String,
        #[arg(long, default_value_t = 1)]
        replicas: usize,
    },
    /// Run the upload service and every stage in this process.
    RunAll {
        #[arg(long, default_value_t = 1)]
        replicas: usize,
    },
    /// Enqueue a local image file.
    Submit { file: PathBuf },
    /// Print the depth of every pipeline queue.
    Queues,
    /// Print the validated pipeline topology.
    Topology,
}

fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    tracing_log::LogTracer::init().context("Failed to install log bridge")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    if let Some(url) = &cli.broker_url {
        config.broker.url = url.clone();
        validate_config(&config)?;
    }
    Ok(config)
}

/// Cancelled on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight work");
                trigger.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
    token
}

fn build_ingress(config: &Config, broker: Arc<dyn Broker>) -> Ingress {
    Ingress::new(
        broker,
        config.pipeline.head_queue.clone(),
        UploadStore::new(&config.ingress.upload_directory),
    )
    .with_publish_attempts(config.broker.publish_attempts, DEFAULT_RETRY_DELAY)
    .with_max_upload_bytes(config.ingress.max_upload_bytes)
}

fn pipeline_options(config: &Config, replicas: usize, shutdown: CancellationToken) -> PipelineOptions {
    PipelineOptions::default()
        .with_replicas(replicas)
        .with_reconnect(config.broker.reconnect_policy())
        .with_shutdown(shutdown)
}

async fn serve(config: &Config, broker: Arc<dyn Broker>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let ingress = Arc::new(build_ingress(config, broker));
    let app = http::router(ingress, config.pipeline.queues());
    let listener = TcpListener::bind(config.ingress.bind.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", config.ingress.bind))?;

    http::serve(listener, app, async move { shutdown.cancelled().await }).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    let config = load(&cli)?;
    let broker = connect_from_url(&config.broker.url)?;

    match cli.command {
        Command::Serve => {
            if config.broker.url.starts_with("memory://") {
                warn!("The in-process broker is only reachable from this process; use run-all");
            }
            serve(&config, broker, shutdown_on_ctrl_c()).await?;
        }
        Command::Stage { name, replicas } => {
            let options = pipeline_options(&config, replicas, shutdown_on_ctrl_c());
            let pool = start_stage(&config.pipeline, &name, broker, &options)?;
            pool.wait().await?;
        }
        Command::RunAll { replicas } => {
            let shutdown = shutdown_on_ctrl_c();
            let options = pipeline_options(&config, replicas, shutdown.clone());
            let pipeline = Pipeline::start(&config.pipeline, Arc::clone(&broker), options)?;

            let served = serve(&config, broker, shutdown.clone()).await;
            pipeline.shutdown();
            pipeline.wait().await?;
            served?;
        }
        Command::Submit { file } => {
            let filename = match file.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => bail!("'{}' has no file name", file.display()),
            };
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let envelope = build_ingress(&config, broker)
                .accept(Some(&filename), &bytes)
                .await?;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        Command::Queues => {
            let depths = queue_depths(broker.as_ref(), &config.pipeline.queues()).await?;
            println!("{}", serde_json::to_string_pretty(&depths)?);
        }
        Command::Topology => {
            let chain: Vec<String> = config
                .pipeline
                .ordered()?
                .iter()
                .map(|s| s.name.clone())
                .collect();
            info!("Stages: {}", chain.join(" -> "));
            println!("{}", serde_json::to_string_pretty(&config.pipeline)?);
        }
    }

    Ok(())
}
