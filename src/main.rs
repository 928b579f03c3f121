//! Preview operator - TTL-bounded preview environments for pull requests

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use preview_operator::controller::{error_policy, reconcile, Context};
use preview_operator::crd::PreviewEnvironment;

/// Preview operator - ephemeral per-PR environments with TTL cleanup
#[derive(Parser, Debug)]
#[command(name = "preview-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the PreviewEnvironment CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&PreviewEnvironment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller().await
}

/// Ensure the PreviewEnvironment CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("preview-controller").force();

    tracing::info!("Installing PreviewEnvironment CRD...");
    crds.patch(
        "previewenvironments.preview.ephemeral.dev",
        &params,
        &Patch::Apply(&PreviewEnvironment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install PreviewEnvironment CRD: {}", e))?;

    tracing::info!("PreviewEnvironment CRD installed/updated");
    Ok(())
}

/// Run the PreviewEnvironment controller until shutdown
async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("Preview operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let previews: Api<PreviewEnvironment> = Api::all(client.clone());
    let ctx = Arc::new(Context::from_client(client));

    tracing::info!("Starting PreviewEnvironment controller");

    Controller::new(previews, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Preview operator shutting down");
    Ok(())
}
