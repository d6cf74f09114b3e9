//! Dask Operator - runs Dask clusters and batch jobs on Kubernetes

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use dask_common::config::{OperatorDefaults, DEFAULT_IMAGE, DEFAULT_PULL_POLICY};
use dask_common::crd::{DaskCluster, DaskJob};
use dask_common::telemetry::{init_telemetry, TelemetryConfig};
use dask_common::FIELD_MANAGER;

mod controller_runner;

/// Dask Operator - reconciles DaskCluster and DaskJob resources
#[derive(Parser, Debug)]
#[command(name = "dask-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Default Dask image for clusters that do not set one
    #[arg(long, env = "IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    /// Default image pull policy for clusters that do not set one
    #[arg(long, env = "PULL_POLICY", default_value = DEFAULT_PULL_POLICY)]
    pull_policy: String,

    /// Only watch this namespace; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Do not install or update the CRDs on start-up
    #[arg(long)]
    skip_crd_install: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the DaskCluster and DaskJob controllers (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli).await,
    }
}

/// Both CRDs as one multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let cluster = serde_yaml::to_string(&DaskCluster::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize DaskCluster CRD: {}", e))?;
    let job = serde_yaml::to_string(&DaskJob::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize DaskJob CRD: {}", e))?;
    Ok(format!("{cluster}---\n{job}"))
}

/// Ensure the Dask CRDs are installed
///
/// Server-side apply keeps the installed schema in step with the operator
/// version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing DaskCluster CRD...");
    crds.patch(
        DaskCluster::crd_name(),
        &params,
        &Patch::Apply(&DaskCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install DaskCluster CRD: {}", e))?;

    tracing::info!("Installing DaskJob CRD...");
    crds.patch(DaskJob::crd_name(), &params, &Patch::Apply(&DaskJob::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install DaskJob CRD: {}", e))?;

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crds_installed(&client).await?;
    }

    let defaults = OperatorDefaults::new(cli.image, cli.pull_policy);
    let namespace = cli.namespace.as_deref();
    match namespace {
        Some(ns) => tracing::info!(namespace = %ns, "Starting controllers"),
        None => tracing::info!("Starting controllers for all namespaces"),
    }

    let cluster_controller =
        controller_runner::build_cluster_controller(client.clone(), namespace, defaults.clone());
    let job_controller = controller_runner::build_job_controller(client, namespace, defaults)
        .map_err(|e| anyhow::anyhow!("Failed to build DaskJob controller: {}", e))?;

    tokio::select! {
        _ = cluster_controller => {
            tracing::info!("DaskCluster controller completed");
        }
        _ = job_controller => {
            tracing::info!("DaskJob controller completed");
        }
    }

    Ok(())
}
