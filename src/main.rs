//! draft-e2e - end-to-end runs of the draft generator against disposable kind clusters

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use draft_e2e::cluster::{sweep_stale_clusters, ClusterProvisioner, KindCli};
use draft_e2e::config::{
    ApplyStrategy, DeployType, RunOptions, ScenarioConfig, ScenarioFile, ScenarioSpec,
    DEFAULT_IMAGE_TAG, DEFAULT_RUNTIME_VERSION,
};
use draft_e2e::docker::DockerClient;
use draft_e2e::generator::Generator;
use draft_e2e::registry::{ensure_registry, RegistrySpec};
use draft_e2e::scenario::{run_isolated, SuiteSummary};
use draft_e2e::CLUSTER_PREFIX;

/// draft-e2e - provision a kind cluster, generate, publish, deploy and verify
#[derive(Parser, Debug)]
#[command(name = "draft-e2e", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single scenario described by flags
    ///
    /// Setup deletes every existing cluster under the cluster prefix. Give
    /// runs that share a host distinct `--cluster-prefix` values.
    Run(RunArgs),

    /// Run every scenario of a YAML file, one after another
    ///
    /// Each scenario gets a fresh cluster. A summary table is printed at the end
    /// and the exit status is non-zero if any scenario failed. Setup deletes
    /// every existing cluster under the cluster prefix, so concurrent suites
    /// need distinct `--cluster-prefix` values.
    Suite(SuiteArgs),

    /// Delete leftover clusters from earlier runs
    ///
    /// Clusters of a run still in progress under the same prefix are deleted too.
    Sweep {
        /// Cluster name prefix to match
        #[arg(long, env = "DRAFT_E2E_CLUSTER_PREFIX", default_value = CLUSTER_PREFIX)]
        prefix: String,

        /// kind binary
        #[arg(long, env = "KIND_BIN", default_value = "kind")]
        kind: PathBuf,
    },

    /// Make sure the local registry container is running
    Registry,
}

/// Options shared by `run` and `suite`
#[derive(Args, Debug)]
struct CommonArgs {
    /// Generator binary
    #[arg(long, env = draft_e2e::GENERATOR_BIN_ENV)]
    generator: Option<PathBuf>,

    /// kind binary
    #[arg(long, env = "KIND_BIN", default_value = "kind")]
    kind: PathBuf,

    /// Prefix of cluster names; stale clusters under it are swept at setup
    #[arg(long, env = "DRAFT_E2E_CLUSTER_PREFIX", default_value = CLUSTER_PREFIX)]
    cluster_prefix: String,

    /// kind cluster config file (defaults to a built-in config)
    #[arg(long, env = "DRAFT_E2E_KIND_CONFIG")]
    kind_config: Option<PathBuf>,

    /// kind node image
    #[arg(long, env = "DRAFT_E2E_NODE_IMAGE", default_value = draft_e2e::cluster::DEFAULT_NODE_IMAGE)]
    node_image: String,

    /// How manifests are written to the cluster
    #[arg(long, value_enum, default_value_t = ApplyStrategy::ServerSide)]
    apply_strategy: ApplyStrategy,

    /// Readiness deadline in seconds
    #[arg(long, default_value = "60")]
    readiness_timeout_secs: u64,

    /// Readiness poll interval in seconds
    #[arg(long, default_value = "2")]
    poll_interval_secs: u64,

    /// Leave the cluster running afterwards (for debugging)
    #[arg(long)]
    keep_cluster: bool,
}

impl CommonArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            cluster_prefix: self.cluster_prefix.clone(),
            kind_config: self.kind_config.clone(),
            node_image: self.node_image.clone(),
            apply_strategy: self.apply_strategy,
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            keep_cluster: self.keep_cluster,
            ..RunOptions::default()
        }
    }

    fn generator(&self) -> Generator {
        match &self.generator {
            Some(bin) => Generator::new(bin),
            None => Generator::from_env(),
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Generator language tag (e.g. gomodule)
    #[arg(long)]
    language: String,

    /// Port the application listens on
    #[arg(long)]
    port: u16,

    /// Application name
    #[arg(long)]
    app_name: String,

    /// Namespace the generated manifests target
    #[arg(long)]
    namespace: String,

    /// Deploy artifact type
    #[arg(long, value_enum, default_value_t = DeployType::Manifests)]
    deploy_type: DeployType,

    /// Sample repository as owner/name
    #[arg(long)]
    repo: String,

    /// Language runtime version
    #[arg(long, default_value = DEFAULT_RUNTIME_VERSION)]
    version: String,

    /// Image tag
    #[arg(long, default_value = DEFAULT_IMAGE_TAG)]
    image_tag: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct SuiteArgs {
    /// Scenario file
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Run(args) => {
            let config = ScenarioConfig::new(ScenarioSpec {
                language: args.language,
                port: args.port,
                app_name: args.app_name,
                namespace: args.namespace,
                deploy_type: args.deploy_type,
                repo: args.repo,
                version: args.version,
                image_tag: args.image_tag,
            })?;
            run_suite(vec![config], &args.common, &cancel).await
        }
        Commands::Suite(args) => {
            let scenarios = ScenarioFile::load(&args.file)?;
            run_suite(scenarios, &args.common, &cancel).await
        }
        Commands::Sweep { prefix, kind } => {
            let report = sweep_stale_clusters(&KindCli::new(&kind), &prefix).await?;
            for name in &report.deleted {
                println!("deleted {}", name);
            }
            for (name, reason) in &report.failed {
                eprintln!("failed to delete {}: {}", name, reason);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} cluster(s) could not be deleted", report.failed.len());
            }
            Ok(())
        }
        Commands::Registry => {
            let docker = DockerClient::connect().await?;
            let handle = ensure_registry(&docker, &RegistrySpec::default()).await?;
            println!(
                "registry {} ({}) at {}{}",
                handle.container_name,
                handle.container_id,
                handle.host,
                if handle.created { ", created" } else { "" }
            );
            Ok(())
        }
    }
}

/// Run scenarios sequentially, each in its own environment, and print the summary
async fn run_suite(
    scenarios: Vec<ScenarioConfig>,
    common: &CommonArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let options = common.options();
    let generator = common.generator();
    let provisioner: Arc<dyn ClusterProvisioner> = Arc::new(KindCli::new(&common.kind));
    let docker = DockerClient::connect().await?;

    let mut summary = SuiteSummary::default();
    for config in &scenarios {
        if cancel.is_cancelled() {
            break;
        }
        let report = run_isolated(
            config,
            provisioner.clone(),
            &docker,
            &generator,
            &options,
            cancel,
        )
        .await;
        println!("{}", report);
        summary.reports.push(report);
    }

    println!("{}", summary);
    if !summary.all_passed() || summary.reports.len() < scenarios.len() {
        anyhow::bail!(
            "{} of {} scenario(s) did not pass",
            scenarios.len() - summary.passed(),
            scenarios.len()
        );
    }
    Ok(())
}
