use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use image_infra::config::ServiceConfig;
use image_infra::{
    fingerprint, AssetPublisher, Config, ImageStack, PublishSummary, S3AssetStore,
    StackDescription, Synthesizer,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "image-infra",
    version,
    about = "Assemble and publish the image pipeline stack"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the stack template and manifest
    Synth(StackArgs),
    /// Synthesize, then upload the function bundles to the asset bucket
    Publish(StackArgs),
    /// Print the content hash of a bundle
    Fingerprint { path: PathBuf },
}

#[derive(Args, Debug)]
struct StackArgs {
    /// Output directory
    #[arg(long, default_value = "cdk.out")]
    out: PathBuf,

    /// Context value, e.g. `-c cognitoUserPoolArn=arn:...`
    #[arg(
        short = 'c',
        long = "context",
        value_name = "KEY=VALUE",
        value_parser = parse_context
    )]
    context: Vec<(String, String)>,
}

fn parse_context(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Fingerprint { path } => {
            let hash = fingerprint(&path)
                .with_context(|| format!("Failed to fingerprint {}", path.display()))?;
            println!("{}", hash);
        }
        Command::Synth(args) => {
            let config = load_config(&args)?;
            synth(&config, &args.out)?;
        }
        Command::Publish(args) => {
            let config = load_config(&args)?;
            let description = synth(&config, &args.out)?;
            publish(&config, &description).await?;
        }
    }

    Ok(())
}

fn load_config(args: &StackArgs) -> Result<Config> {
    let config = Config::load(&args.context).context("Failed to load configuration")?;
    init_tracing(&config.service)?;
    Ok(config)
}

fn synth(config: &Config, out: &Path) -> Result<StackDescription> {
    let description = ImageStack::synth(config).context("Failed to assemble stack")?;
    let output = Synthesizer::new(out)
        .apply(&description)
        .context("Failed to write stack template")?;

    println!("{}", output.template_path.display());
    Ok(description)
}

async fn publish(config: &Config, description: &StackDescription) -> Result<()> {
    let store = S3AssetStore::new(&config.assets)
        .await
        .context("Failed to initialize asset store")?;
    let publisher = AssetPublisher::new(store, config.assets.upload_concurrency);

    let outcomes = publisher
        .publish(description.artifacts())
        .await
        .context("Failed to publish assets")?;

    let summary = PublishSummary::from_outcomes(&outcomes);
    info!(
        bucket = %description.asset_bucket(),
        uploaded = summary.uploaded,
        already_present = summary.already_present,
        bytes = summary.bytes,
        "Assets published"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directives = format!("image_infra={},aws_config=warn", service.log_level);
            EnvFilter::try_new(directives).context("Invalid log level")?
        }
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    if service.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}
