use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use autoprice_adapters::{read_source_fixture, BackoffPolicy, LocalWarehouse, WebhookChannel};
use autoprice_storage::NotificationChannel;
use autoprice_sync::{Collaborators, LogFormat, PipelineConfig, SnapshotPipeline, TriggerEvent};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "autoprice")]
#[command(about = "AutoPrice daily summary pipeline")]
struct Cli {
    /// YAML settings file; environment variables take precedence over it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, global = true, default_value_t = Backend::default())]
    backend: Backend,

    /// JSON array of source records registered in the local backend.
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once for today.
    Run {
        /// S3 notification JSON; omitted means a manual run.
        #[arg(long)]
        event: Option<PathBuf>,
    },
    /// Accept invocations over HTTP.
    Serve,
    /// Run on the configured cron until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Aws,
    Local,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "aws") {
            Self::Aws
        } else {
            Self::Local
        }
    }
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init(),
    }
}

fn webhook_channels(config: &PipelineConfig) -> Result<Vec<Arc<dyn NotificationChannel>>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if let Some(url) = &config.webhook_url {
        let channel = WebhookChannel::new(url.as_str(), Duration::from_secs(10), BackoffPolicy::default())
            .context("building webhook channel")?;
        channels.push(Arc::new(channel));
    }
    Ok(channels)
}

async fn local_collaborators(config: &PipelineConfig, source: Option<&PathBuf>) -> Result<Collaborators> {
    let warehouse = LocalWarehouse::new();
    if let Some(path) = source {
        let records = read_source_fixture(path)?;
        info!(path = %path.display(), records = records.len(), "loaded source fixture");
        warehouse
            .register_source(&config.namespace, &config.source_table, records)
            .await;
    }
    if config.sns_topic_arn.is_some() {
        warn!("SNS_TOPIC_ARN is ignored by the local backend");
    }

    Ok(Collaborators {
        queries: warehouse.clone(),
        catalog: warehouse.clone(),
        discovery: warehouse.clone(),
        objects: warehouse,
        channels: webhook_channels(config)?,
    })
}

#[cfg(feature = "aws")]
async fn aws_collaborators(config: &PipelineConfig) -> Result<Collaborators> {
    let aws = autoprice_adapters::aws::AwsCollaborators::from_env().await;
    let mut channels = webhook_channels(config)?;
    if let Some(topic_arn) = &config.sns_topic_arn {
        channels.push(Arc::new(aws.sns_channel(topic_arn.as_str())));
    }

    Ok(Collaborators {
        queries: aws.queries.clone(),
        catalog: aws.catalog.clone(),
        discovery: aws.catalog.clone(),
        objects: aws.objects.clone(),
        channels,
    })
}

#[cfg(not(feature = "aws"))]
async fn aws_collaborators(_config: &PipelineConfig) -> Result<Collaborators> {
    bail!("this build has no AWS support; use --backend local")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::from_env()?,
    };
    init_logging(config.log_format);

    let collaborators = match cli.backend {
        Backend::Aws => aws_collaborators(&config).await?,
        Backend::Local => local_collaborators(&config, cli.source.as_ref()).await?,
    };
    let pipeline = Arc::new(SnapshotPipeline::new(config.clone(), collaborators)?);

    match cli.command.unwrap_or(Commands::Run { event: None }) {
        Commands::Run { event } => {
            let event = match event {
                Some(path) => {
                    let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                    TriggerEvent::from_slice(&bytes)
                }
                None => TriggerEvent::manual(),
            };
            let outcome = pipeline.handle(&event).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Serve => {
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.schedule_cron, "scheduler running alongside web server");
            }
            autoprice_web::serve(pipeline.clone(), config.web_port).await?;
        }
        Commands::Schedule => {
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set AUTOPRICE_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
