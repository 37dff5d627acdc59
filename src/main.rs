//! kiln - remote image build CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use kiln::build::{BuildResult, RemoteBuilder};
use kiln::cluster::{HttpControlPlane, LogSink};
use kiln::config::Config;
use kiln::registry::OciRegistry;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Build container images on a cluster-resident build engine")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build and tag every artifact in the configuration
    Build {
        /// Configuration file path
        #[arg(short = 'f', long, default_value = "kiln.yaml")]
        filename: PathBuf,

        /// Namespace to build in, overriding the configuration
        #[arg(long, env = "KILN_NAMESPACE")]
        namespace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Build output streams to stdout, so logs go to stderr.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    match args.command {
        Command::Build {
            filename,
            namespace,
        } => build(filename, namespace).await,
    }
}

async fn build(filename: PathBuf, namespace: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::load(&filename)?;
    if let Some(namespace) = namespace {
        config.namespace = namespace;
    }
    anyhow::ensure!(
        !config.artifacts.is_empty(),
        "no artifacts configured in {}",
        filename.display()
    );
    tracing::info!(
        namespace = %config.namespace,
        artifacts = config.artifacts.len(),
        "configuration loaded"
    );

    let api = Arc::new(HttpControlPlane::new(&config.cluster)?);
    let registry = Arc::new(OciRegistry::new(config.registry.clone()));
    let builder = RemoteBuilder::new(api, registry, config.builder_config())
        .with_template(config.template());

    let sink: LogSink = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));
    let result = builder.build(sink, &config.artifacts).await?;

    report(&result);
    Ok(())
}

fn report(result: &BuildResult) {
    println!("Built {} image(s):", result.builds.len());
    for build in &result.builds {
        println!("  {} -> {}", build.image_name, build.tag);
    }
}
