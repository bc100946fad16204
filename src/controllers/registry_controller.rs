//! ImageRegistry controller
//!
//! Watches ImageRegistry resources and drives the convergence loop: observe,
//! plan, publish status, fire side effects.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{error, info, instrument};

use crate::adapters::FIELD_MANAGER;
use crate::controllers::Context;
use crate::crd::{ImageRegistry, ImageRegistryStatus, ManagementState, RegistryPhase};
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::normalize;
use crate::reconcilers::registry::{plan, ClusterState, PlanInput, SideEffect};
use crate::storage::StorageState;

/// Finalizer name for ImageRegistry resources
const FINALIZER_NAME: &str = "imageregistry.atlasops.io/registry-finalizer";

/// Run the ImageRegistry controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<ImageRegistry> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("ImageRegistry CRD not installed: {}", e);
        return;
    }

    info!("Starting ImageRegistry controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(name = %obj.name, "Reconciled ImageRegistry");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["ImageRegistry"])
                        .inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any()))]
async fn reconcile(obj: Arc<ImageRegistry>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["ImageRegistry"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["ImageRegistry"])
        .inc();

    let api: Api<ImageRegistry> = Api::all(ctx.client.clone());

    // Use finalizer for proper cleanup handling
    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(registry) => apply(registry, ctx.clone()).await,
            FinalizerEvent::Cleanup(registry) => cleanup(registry, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// One convergence pass (create/update)
async fn apply(registry: Arc<ImageRegistry>, ctx: Arc<Context>) -> Result<Action> {
    let name = registry.name_any();
    let generation = registry.metadata.generation.unwrap_or(0);
    let api: Api<ImageRegistry> = Api::all(ctx.client.clone());

    info!(
        name = %name,
        generation = generation,
        "Reconciling ImageRegistry"
    );

    // Surface the transient phases: Initializing on first contact,
    // Normalizing when a new generation arrives. The Removed phase is
    // latched and never leaves it.
    let prev_phase = registry.status.as_ref().and_then(|s| s.phase);
    if prev_phase != Some(RegistryPhase::Removed)
        && registry.spec.management_state == ManagementState::Managed
    {
        match &registry.status {
            None => {
                publish_phase(&api, &name, RegistryPhase::Initializing, "Initializing registry")
                    .await?
            }
            Some(status) if status.observed_generation != registry.metadata.generation => {
                publish_phase(
                    &api,
                    &name,
                    RegistryPhase::Normalizing,
                    "Validating registry configuration",
                )
                .await?
            }
            _ => {}
        }
    }

    // Keep the data-path gates aligned with the declared limits.
    ctx.gates.apply(&registry.spec.requests);

    let platform = ctx.platform.metadata().await?;
    let normalized = normalize::normalize(&registry.spec.storage, registry.status.as_ref(), &platform);

    // Observation: storage needs a resolved target; with none the planner
    // is on a degraded path and never reads the medium state.
    let storage = match &normalized {
        Ok(target) => ctx.storage.observe(target).await?,
        Err(_) => StorageState::absent(),
    };
    let workload = ctx.workload.observe().await?;
    let cluster = ClusterState { storage, workload };

    let settings = ctx.config.operand_settings();
    let outcome = plan(PlanInput {
        registry: &registry,
        platform: &platform,
        normalized,
        cluster: &cluster,
        settings: &settings,
        now: Utc::now(),
    });

    publish_status(&api, &name, registry.status.as_ref(), &outcome.status).await?;
    execute(&outcome.effects, &ctx).await?;

    Ok(match outcome.requeue {
        Some(duration) => Action::requeue(duration),
        None => Action::await_change(),
    })
}

/// Fire planned side effects in order, stopping at the first failure
async fn execute(effects: &[SideEffect], ctx: &Context) -> Result<()> {
    for effect in effects {
        info!("Applying side effect {}", effect.kind());
        metrics::SIDE_EFFECTS.with_label_values(&[effect.kind()]).inc();
        let result = match effect {
            SideEffect::ProvisionStorage(target) => ctx.storage.provision(target).await,
            SideEffect::TagStorage(target) => ctx.storage.tag(target).await,
            SideEffect::SetStorageEncryption(target) => ctx.storage.set_encryption(target).await,
            SideEffect::EnableUploadCleanup(target) => {
                ctx.storage.enable_upload_cleanup(target).await
            }
            SideEffect::ApplyDeployment(plan) => ctx.workload.apply_deployment(plan).await,
            SideEffect::ApplyRoute(route) => ctx.workload.apply_route(route).await,
            SideEffect::RemoveRoute(name) => ctx.workload.remove_route(name).await,
            SideEffect::RemoveDeployment => ctx.workload.remove_deployment().await,
            SideEffect::RemoveStorage(target) => ctx.storage.remove(target).await,
        };
        if let Err(e) = result {
            metrics::SIDE_EFFECT_ERRORS
                .with_label_values(&[effect.kind()])
                .inc();
            return Err(e);
        }
    }
    Ok(())
}

/// Publish the planned status when it differs from the recorded one
async fn publish_status(
    api: &Api<ImageRegistry>,
    name: &str,
    current: Option<&ImageRegistryStatus>,
    next: &ImageRegistryStatus,
) -> Result<()> {
    if current == Some(next) {
        return Ok(());
    }
    if let Some(phase) = next.phase {
        if current.and_then(|s| s.phase) != Some(phase) {
            metrics::PHASE_TRANSITIONS
                .with_label_values(&[&phase.to_string()])
                .inc();
        }
    }

    let status = json!({ "status": next });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;
    Ok(())
}

/// Publish a transient phase without touching the rest of the status
async fn publish_phase(
    api: &Api<ImageRegistry>,
    name: &str,
    phase: RegistryPhase,
    message: &str,
) -> Result<()> {
    metrics::PHASE_TRANSITIONS
        .with_label_values(&[&phase.to_string()])
        .inc();
    let status = json!({ "status": { "phase": phase, "message": message } });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;
    Ok(())
}

/// Cleanup when the resource is being deleted
async fn cleanup(registry: Arc<ImageRegistry>, ctx: Arc<Context>) -> Result<Action> {
    let name = registry.name_any();
    info!(name = %name, "Cleaning up ImageRegistry");

    // Routes and workload always go. The storage medium only goes when the
    // operator provisioned it; user-supplied media are left alone.
    let workload = ctx.workload.observe().await?;
    for route in workload.routes.keys() {
        ctx.workload.remove_route(route).await?;
    }
    if workload.deployment.is_some() || workload.service_exists {
        ctx.workload.remove_deployment().await?;
    }

    if let Some(status) = &registry.status {
        if status.storage_managed {
            let platform = ctx.platform.metadata().await?;
            if let Ok(target) =
                normalize::normalize(&registry.spec.storage, Some(status), &platform)
            {
                if target.is_object_store() && ctx.storage.observe(&target).await?.exists {
                    info!(name = %name, "Removing operator-managed {} storage", target.backend());
                    ctx.storage.remove(&target).await?;
                }
            }
        }
    }

    metrics::CLEANUPS.with_label_values(&["ImageRegistry"]).inc();

    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(obj: Arc<ImageRegistry>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    // Backoff based on error class
    let requeue_duration = match error {
        Error::Kube(_) => Duration::from_secs(30),
        Error::Config(_) => Duration::from_secs(300),
        Error::Storage(_) | Error::Platform(_) => Duration::from_secs(60),
        _ => Duration::from_secs(30),
    };

    Action::requeue(requeue_duration)
}
