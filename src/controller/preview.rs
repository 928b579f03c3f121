//! PreviewEnvironment controller implementation
//!
//! This module implements the reconciliation logic for PreviewEnvironment
//! resources. It follows the Kubernetes controller pattern: observe current
//! state, determine desired state, calculate diff, and apply changes.
//!
//! Each reconcile pass performs at most one lifecycle transition, evaluated
//! in a fixed order: deletion cleanup, finalizer registration, TTL expiry,
//! identity initialization, then child resource convergence. Convergence is
//! idempotent, so a pass interrupted between child types resumes cleanly on
//! redelivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    Condition, ConditionStatus, PreviewEnvironment, PreviewEnvironmentStatus, PreviewPhase,
};
use crate::resources::{
    build_deployment, build_ingress, build_namespace, build_service, APP_NAME,
};
use crate::{Error, PREVIEW_FINALIZER};

/// Requeue interval while an environment is healthy.
///
/// Long enough to avoid busy-polling, short enough that the minimum 1-hour
/// TTL is detected within one interval in the worst case.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Requeue interval after a convergence failure.
const RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Field manager for all API writes issued by this controller.
const FIELD_MANAGER: &str = "preview-controller";

/// Trait abstracting cluster operations for PreviewEnvironment
///
/// This is the controller's only way to reach the cluster. It allows
/// mocking the Kubernetes client in tests while using the real client in
/// production. Getters return `Ok(None)` for absent objects; absence is
/// expected state ("needs creation"), not an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of a PreviewEnvironment (merge semantics: fields
    /// absent from `status` are left untouched)
    async fn patch_status(
        &self,
        name: &str,
        status: &PreviewEnvironmentStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer token to a PreviewEnvironment
    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer token from a PreviewEnvironment
    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Delete a PreviewEnvironment by name (absent is not an error)
    async fn delete_preview(&self, name: &str) -> Result<(), Error>;

    /// Get a Namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Create a Namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Delete a Namespace by name (absent is not an error)
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;

    /// Get a Deployment by namespace and name
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<(), Error>;

    /// Replace a Deployment (carries the observed resourceVersion, so a
    /// concurrent edit surfaces as a conflict)
    async fn update_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<(), Error>;

    /// Get a Service by namespace and name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Get an Ingress by namespace and name
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    /// Create an Ingress
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        status: &PreviewEnvironmentStatus,
    ) -> Result<(), Error> {
        let api: Api<PreviewEnvironment> = Api::all(self.client.clone());
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }

    async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api: Api<PreviewEnvironment> = Api::all(self.client.clone());
        let preview = api.get(name).await?;

        let mut finalizers = preview.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|t| t == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api: Api<PreviewEnvironment> = Api::all(self.client.clone());
        let preview = api.get(name).await?;

        let finalizers: Vec<String> = preview
            .metadata
            .finalizers
            .map(|f| f.into_iter().filter(|t| t != finalizer).collect())
            .unwrap_or_default();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn delete_preview(&self, name: &str) -> Result<(), Error> {
        let api: Api<PreviewEnvironment> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(ns) => Ok(Some(ns)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(service) => Ok(Some(service)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(ingress) => Ok(Some(ingress)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), ingress).await?;
        Ok(())
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds the
/// cluster client boundary as a trait object so tests can substitute mocks.
pub struct Context {
    /// Cluster operations for reconciliation
    pub kube: Arc<dyn KubeClient>,
}

impl Context {
    /// Create a context backed by a real Kubernetes client
    pub fn from_client(client: Client) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client)),
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

/// Reconcile a PreviewEnvironment resource
///
/// Observes the current state of the environment's child resources and
/// makes incremental changes to converge on the state the spec declares.
/// Transitions are evaluated in a fixed order on every invocation:
///
/// 1. Deletion requested: clean up and release the finalizer.
/// 2. Finalizer missing: register it before creating anything.
/// 3. TTL elapsed: mark Expiring and delete the record itself.
/// 4. Identity unset: derive namespace/URL, persist, converge next pass.
/// 5. Otherwise converge children; first success completes Creating.
#[instrument(skip(preview, ctx), fields(preview = %preview.name_any()))]
pub async fn reconcile(
    preview: Arc<PreviewEnvironment>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = preview.name_any();
    info!("reconciling preview environment");

    if preview.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&preview, &ctx).await;
    }

    // Register the finalizer before any child resource exists so cleanup
    // is guaranteed a chance to run
    if !preview.has_finalizer() {
        debug!("adding finalizer");
        ctx.kube.add_finalizer(&name, PREVIEW_FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // TTL expiry: mark the record and delete it. The deletion marker path
    // above performs the actual cleanup on redelivery.
    if preview.is_expired() {
        info!("preview environment has expired, requesting deletion");
        let status = PreviewEnvironmentStatus::with_phase(PreviewPhase::Expiring)
            .message("Environment has expired and is being cleaned up")
            .condition(Condition::new(
                "Expired",
                ConditionStatus::True,
                "TTLElapsed",
                "Environment TTL has elapsed",
            ));
        if let Err(e) = ctx.kube.patch_status(&name, &status).await {
            warn!(error = %e, "failed to update status to Expiring");
        }
        ctx.kube.delete_preview(&name).await?;
        return Ok(Action::await_change());
    }

    // First pass for a fresh record: persist identity and phase only.
    // Convergence runs on the next delivery, keeping each pass to a single
    // state transition.
    if !preview.is_initialized() {
        initialize_status(&preview, &ctx).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Err(e) = converge(&preview, &ctx).await {
        warn!(error = %e, "failed to converge preview environment");
        let status = PreviewEnvironmentStatus::with_phase(PreviewPhase::Failed)
            .message(format!("Failed to create resources: {e}"))
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "ConvergenceFailed",
                e.to_string(),
            ));
        if let Err(status_err) = ctx.kube.patch_status(&name, &status).await {
            warn!(error = %status_err, "failed to update status to Failed");
        }
        return Ok(Action::requeue(RETRY_INTERVAL));
    }

    // First successful convergence completes the Creating phase
    let current_phase = preview
        .status
        .as_ref()
        .map(|s| s.phase.clone())
        .unwrap_or_default();
    if current_phase == PreviewPhase::Creating {
        info!("preview environment is ready");
        let status = PreviewEnvironmentStatus::with_phase(PreviewPhase::Ready)
            .message("Preview environment is ready")
            .condition(Condition::new(
                "Ready",
                ConditionStatus::True,
                "ResourcesReady",
                "All child resources exist",
            ));
        ctx.kube.patch_status(&name, &status).await?;
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy for the controller
///
/// Called when reconciliation returns an error. All errors reaching this
/// point are transient (API failures, status-update conflicts from
/// concurrent edits), so the resource is requeued after a short delay.
pub fn error_policy(preview: Arc<PreviewEnvironment>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        preview = %preview.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Clean up a PreviewEnvironment that is being deleted
///
/// Deleting the namespace is sufficient cleanup: every other child lives
/// inside it and is removed with it. The finalizer token is released only
/// after the namespace delete succeeds or the namespace is confirmed
/// absent; on error the token stays and the pass is retried on redelivery,
/// so the record can never vanish while its footprint might still exist.
async fn handle_deletion(
    preview: &PreviewEnvironment,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = preview.name_any();

    if !preview.has_finalizer() {
        // Nothing to clean up; the store completes the deletion
        return Ok(Action::await_change());
    }

    let ns_name = preview.namespace_name();
    match ctx.kube.get_namespace(&ns_name).await? {
        Some(_) => {
            info!(namespace = %ns_name, "deleting preview environment namespace");
            ctx.kube.delete_namespace(&ns_name).await?;
        }
        None => {
            debug!(namespace = %ns_name, "namespace already removed");
        }
    }

    ctx.kube.remove_finalizer(&name, PREVIEW_FINALIZER).await?;
    Ok(Action::await_change())
}

/// Persist derived identity and the Creating phase for a fresh record
///
/// Namespace, URL and timestamps are computed here exactly once. Later
/// status patches omit them, so they are never recomputed even if the
/// spec's derivation inputs change.
async fn initialize_status(preview: &PreviewEnvironment, ctx: &Context) -> Result<(), Error> {
    let name = preview.name_any();
    let now = Utc::now();
    let ttl_hours = preview.spec.ttl_hours();
    let namespace = preview.spec.derive_namespace();
    let url = preview.spec.derive_environment_url();

    info!(namespace = %namespace, url = %url, ttl_hours, "initializing preview environment");

    let status = PreviewEnvironmentStatus::with_phase(PreviewPhase::Creating)
        .namespace(namespace)
        .environment_url(url)
        .created_at(now)
        .expires_at(now + chrono::Duration::hours(i64::from(ttl_hours)))
        .message("Creating preview environment resources")
        .condition(Condition::new(
            "Ready",
            ConditionStatus::False,
            "Provisioning",
            "Child resources are being created",
        ));

    ctx.kube.patch_status(&name, &status).await
}

/// Converge all child resources toward the spec, in a fixed order
///
/// Each child: build the target, read current state, create if absent.
/// Creation failure aborts the pass; later child types are not attempted.
/// For an existing deployment only the container image is compared and, if
/// drifted, updated; other children are never re-synced after creation
/// (see the builder contract in [`crate::resources`]).
async fn converge(preview: &PreviewEnvironment, ctx: &Context) -> Result<(), Error> {
    let ns_name = preview.namespace_name();
    let hostname = preview.hostname();

    let namespace = build_namespace(preview, &ns_name);
    if ctx.kube.get_namespace(&ns_name).await?.is_none() {
        info!(namespace = %ns_name, "creating namespace");
        ctx.kube
            .create_namespace(&namespace)
            .await
            .map_err(|e| Error::resource(format!("namespace {ns_name}: {e}")))?;
    }

    let deployment = build_deployment(preview, &ns_name);
    match ctx.kube.get_deployment(&ns_name, APP_NAME).await? {
        None => {
            info!(namespace = %ns_name, "creating deployment");
            ctx.kube
                .create_deployment(&ns_name, &deployment)
                .await
                .map_err(|e| Error::resource(format!("deployment {APP_NAME}: {e}")))?;
        }
        Some(current) => {
            let desired_image = preview.spec.image_tag.as_str();
            if deployed_image(&current) != Some(desired_image) {
                info!(namespace = %ns_name, image = %desired_image, "updating deployment image");
                let updated = with_image(current, desired_image);
                ctx.kube
                    .update_deployment(&ns_name, &updated)
                    .await
                    .map_err(|e| Error::resource(format!("deployment {APP_NAME}: {e}")))?;
            }
        }
    }

    let service = build_service(preview, &ns_name);
    if ctx.kube.get_service(&ns_name, APP_NAME).await?.is_none() {
        info!(namespace = %ns_name, "creating service");
        ctx.kube
            .create_service(&ns_name, &service)
            .await
            .map_err(|e| Error::resource(format!("service {APP_NAME}: {e}")))?;
    }

    let ingress = build_ingress(preview, &ns_name, &hostname);
    if ctx.kube.get_ingress(&ns_name, APP_NAME).await?.is_none() {
        info!(namespace = %ns_name, host = %hostname, "creating ingress");
        ctx.kube
            .create_ingress(&ns_name, &ingress)
            .await
            .map_err(|e| Error::resource(format!("ingress {APP_NAME}: {e}")))?;
    }

    Ok(())
}

/// The image currently declared by a deployment's first container
fn deployed_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

/// Return the deployment with its first container's image replaced
///
/// The observed object is modified rather than a fresh build so the update
/// touches only the image and carries the observed resourceVersion.
fn with_image(mut deployment: Deployment, image: &str) -> Deployment {
    if let Some(container) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.first_mut())
    {
        container.image = Some(image.to_string());
    }
    deployment
}
