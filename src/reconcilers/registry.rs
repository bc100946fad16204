//! ImageRegistry reconciliation planner
//!
//! A pass takes a snapshot of the desired spec, the recorded status, and the
//! observed cluster state and produces the next status plus an ordered list
//! of side effects. The planner performs no I/O: effects are fired by the
//! controller and confirmed by the next pass's observations, never by the
//! call's return value. Planning the same inputs twice yields the same
//! status and no new effects.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::adapters::{
    desired_routes, DeploymentPlan, OperandSettings, RoutePlan, WorkloadState,
};
use crate::crd::{
    ConditionStatus, ImageRegistry, ImageRegistryStatus, ManagementState, RegistryPhase,
    StorageSpec,
};
use crate::platform::PlatformMetadata;
use crate::reconcilers::conditions::{
    rollup, Availability, ConditionSet, RollupFacts, AVAILABLE, DEGRADED, PROGRESSING, REMOVED,
    STORAGE_ENCRYPTED, STORAGE_EXISTS, STORAGE_TAGGED, STORAGE_UPLOAD_CLEANUP,
};
use crate::reconcilers::normalize::ValidationError;
use crate::storage::{NormalizedStorage, StorageState};

/// Consecutive unconfirmed provisioning passes tolerated before Degraded
pub const MAX_PROVISION_FAILURES: u32 = 5;

/// Requeue cadence while converging or tearing down
const REQUEUE_ACTIVE: Duration = Duration::from_secs(15);
/// Requeue cadence for settled or blocked resources
const REQUEUE_SETTLED: Duration = Duration::from_secs(300);

/// Observed cluster state gathered before planning
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    /// Observed storage medium state
    pub storage: StorageState,

    /// Observed registry workload
    pub workload: WorkloadState,
}

/// One cluster mutation requested by a pass
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Create the storage medium
    ProvisionStorage(NormalizedStorage),
    /// Apply operator ownership tags to the medium
    TagStorage(NormalizedStorage),
    /// Configure server-side encryption on the medium
    SetStorageEncryption(NormalizedStorage),
    /// Configure incomplete-upload cleanup on the medium
    EnableUploadCleanup(NormalizedStorage),
    /// Create or update the registry deployment and its service
    ApplyDeployment(DeploymentPlan),
    /// Create or update an external route
    ApplyRoute(RoutePlan),
    /// Delete a route that is no longer desired
    RemoveRoute(String),
    /// Delete the registry deployment and its service
    RemoveDeployment,
    /// Delete the storage medium
    RemoveStorage(NormalizedStorage),
}

impl SideEffect {
    /// Effect kind, for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SideEffect::ProvisionStorage(_) => "ProvisionStorage",
            SideEffect::TagStorage(_) => "TagStorage",
            SideEffect::SetStorageEncryption(_) => "SetStorageEncryption",
            SideEffect::EnableUploadCleanup(_) => "EnableUploadCleanup",
            SideEffect::ApplyDeployment(_) => "ApplyDeployment",
            SideEffect::ApplyRoute(_) => "ApplyRoute",
            SideEffect::RemoveRoute(_) => "RemoveRoute",
            SideEffect::RemoveDeployment => "RemoveDeployment",
            SideEffect::RemoveStorage(_) => "RemoveStorage",
        }
    }
}

/// Everything a pass needs to plan
pub struct PlanInput<'a> {
    pub registry: &'a ImageRegistry,
    pub platform: &'a PlatformMetadata,
    pub normalized: Result<NormalizedStorage, ValidationError>,
    pub cluster: &'a ClusterState,
    pub settings: &'a OperandSettings,
    pub now: DateTime<Utc>,
}

/// Outcome of a pass
#[derive(Debug)]
pub struct Reconciliation {
    /// Status to publish (only when it differs from the recorded one)
    pub status: ImageRegistryStatus,

    /// Ordered cluster mutations to fire
    pub effects: Vec<SideEffect>,

    /// When to requeue; None waits for the next watch event
    pub requeue: Option<Duration>,
}

/// Plan one reconciliation pass
pub fn plan(input: PlanInput<'_>) -> Reconciliation {
    let registry = input.registry;
    let prev = registry.status.clone().unwrap_or_default();
    let mut conditions = ConditionSet::from_conditions(&prev.conditions);

    // Removed is latched: once recorded, the resource stays torn down even
    // if the spec later flips back to Managed.
    let removal = prev.phase == Some(RegistryPhase::Removed)
        || registry.spec.management_state == ManagementState::Removed;
    if removal {
        return plan_removal(&input, &prev, conditions);
    }

    if registry.spec.management_state == ManagementState::Unmanaged {
        return plan_unmanaged(&input, &prev, conditions);
    }

    let validation = crate::reconcilers::normalize::validate(&registry.spec)
        .err()
        .or_else(|| input.normalized.as_ref().err().cloned());
    match (validation, &input.normalized) {
        (Some(err), _) => plan_invalid(&input, &prev, conditions, err),
        (None, Ok(target)) => plan_managed(&input, &prev, conditions, target.clone()),
        // `validation` already captured any normalization error, so this arm
        // only keeps the match total.
        (None, Err(err)) => {
            let err = err.clone();
            plan_invalid(&input, &prev, conditions, err)
        }
    }
}

/// Degraded plan for a spec the operator cannot act on
fn plan_invalid(
    input: &PlanInput<'_>,
    prev: &ImageRegistryStatus,
    mut conditions: ConditionSet,
    err: ValidationError,
) -> Reconciliation {
    let message = err.to_string();
    rollup(
        &mut conditions,
        &RollupFacts {
            degraded: Some((err.reason().to_string(), message.clone())),
            pending: Vec::new(),
            availability: availability_of(input.cluster),
        },
        input.now,
    );

    Reconciliation {
        status: ImageRegistryStatus {
            phase: Some(RegistryPhase::Degraded),
            message: Some(message),
            observed_generation: input.registry.metadata.generation,
            conditions: conditions.into_vec(),
            storage_managed: prev.storage_managed,
            storage: prev.storage.clone(),
            provision_failures: prev.provision_failures,
        },
        effects: Vec::new(),
        requeue: Some(REQUEUE_SETTLED),
    }
}

/// Plan for an Unmanaged resource: observe, touch nothing
fn plan_unmanaged(
    input: &PlanInput<'_>,
    prev: &ImageRegistryStatus,
    mut conditions: ConditionSet,
) -> Reconciliation {
    let now = input.now;
    for type_ in [DEGRADED, PROGRESSING, AVAILABLE] {
        conditions.update(
            type_,
            ConditionStatus::Unknown,
            "Unmanaged",
            "The registry is not managed by the operator",
            now,
        );
    }

    Reconciliation {
        status: ImageRegistryStatus {
            phase: prev.phase,
            message: Some("managementState is Unmanaged".to_string()),
            observed_generation: input.registry.metadata.generation,
            conditions: conditions.into_vec(),
            storage_managed: prev.storage_managed,
            storage: prev.storage.clone(),
            provision_failures: prev.provision_failures,
        },
        effects: Vec::new(),
        requeue: None,
    }
}

/// Teardown plan for Removed resources
fn plan_removal(
    input: &PlanInput<'_>,
    prev: &ImageRegistryStatus,
    mut conditions: ConditionSet,
) -> Reconciliation {
    let cluster = input.cluster;
    let mut effects = Vec::new();
    let mut pending = Vec::new();

    for name in cluster.workload.routes.keys() {
        effects.push(SideEffect::RemoveRoute(name.clone()));
    }
    if cluster.workload.deployment.is_some() || cluster.workload.service_exists {
        effects.push(SideEffect::RemoveDeployment);
    }

    let mut storage_managed = prev.storage_managed;
    let mut storage = prev.storage.clone();
    let mut blocked: Option<String> = None;
    if prev.storage_managed {
        match &input.normalized {
            Ok(target) if target.is_object_store() && cluster.storage.exists => {
                effects.push(SideEffect::RemoveStorage(target.clone()));
            }
            Ok(_) => {
                // Medium gone (or rides along with the deployment): drop
                // the record so nothing re-adopts it.
                storage_managed = false;
                storage = StorageSpec::default();
            }
            Err(err) => {
                // The record stays so the medium is not orphaned silently.
                blocked = Some(format!(
                    "the managed storage medium cannot be resolved for removal: {}",
                    err
                ));
            }
        }
    }

    if !effects.is_empty() {
        pending.push("tearing down the registry".to_string());
    }
    let torn_down = effects.is_empty() && blocked.is_none();

    let (removed_status, removed_reason, removed_message) = if torn_down {
        (
            ConditionStatus::True,
            "Removed",
            "The registry has been removed".to_string(),
        )
    } else if let Some(message) = &blocked {
        (ConditionStatus::False, "RemovalBlocked", message.clone())
    } else {
        (
            ConditionStatus::False,
            "Removed",
            "The registry is being removed".to_string(),
        )
    };
    conditions.update(
        REMOVED,
        removed_status,
        removed_reason,
        removed_message.clone(),
        input.now,
    );
    rollup(
        &mut conditions,
        &RollupFacts {
            degraded: None,
            pending,
            availability: Availability::Unavailable(
                "Removed".to_string(),
                "The registry has been removed".to_string(),
            ),
        },
        input.now,
    );

    // A blocked removal needs a spec correction, not a fast retry.
    let requeue = if torn_down {
        None
    } else if blocked.is_some() {
        Some(REQUEUE_SETTLED)
    } else {
        Some(REQUEUE_ACTIVE)
    };

    Reconciliation {
        status: ImageRegistryStatus {
            phase: Some(RegistryPhase::Removed),
            message: Some(if torn_down {
                "Registry removed".to_string()
            } else if blocked.is_some() {
                removed_message
            } else {
                "Removing registry".to_string()
            }),
            observed_generation: input.registry.metadata.generation,
            conditions: conditions.into_vec(),
            storage_managed,
            storage,
            provision_failures: 0,
        },
        effects,
        requeue,
    }
}

/// Convergence plan for a validated, Managed resource
fn plan_managed(
    input: &PlanInput<'_>,
    prev: &ImageRegistryStatus,
    mut conditions: ConditionSet,
    target: NormalizedStorage,
) -> Reconciliation {
    let registry = input.registry;
    let cluster = input.cluster;
    let observed = cluster.storage;
    let now = input.now;

    let mut effects = Vec::new();
    let mut pending = Vec::new();
    let mut degraded: Option<(String, String)> = None;

    // The managed flag survives only while the medium identity does.
    let target_identity = (target.backend(), target.medium_name().map(str::to_string));
    let same_identity = storage_identity(&prev.storage) == Some(target_identity);
    let mut storage_managed = same_identity && prev.storage_managed;

    let mut provision_failures = 0;
    if observed.exists {
        conditions.update(
            STORAGE_EXISTS,
            ConditionStatus::True,
            "Exists",
            format!("The {} storage medium exists", target.backend()),
            now,
        );
    } else {
        // We are about to create the medium, so the operator owns it.
        storage_managed = true;
        effects.push(SideEffect::ProvisionStorage(target.clone()));
        pending.push(format!("provisioning {} storage", target.backend()));
        conditions.update(
            STORAGE_EXISTS,
            ConditionStatus::False,
            "StorageNotFound",
            format!("The {} storage medium does not exist", target.backend()),
            now,
        );

        // The counter follows the medium: it survives the Degraded excursion
        // (so the phase does not flap back to Provisioning against unchanged
        // state) and saturates at the threshold to keep the status stable.
        // A different target identity is a fresh provisioning attempt.
        let attempted = same_identity
            && matches!(
                prev.phase,
                Some(RegistryPhase::Provisioning) | Some(RegistryPhase::Degraded)
            );
        provision_failures = if attempted {
            prev.provision_failures
                .saturating_add(1)
                .min(MAX_PROVISION_FAILURES)
        } else {
            0
        };
        if provision_failures >= MAX_PROVISION_FAILURES {
            degraded = Some((
                "ProvisioningFailed".to_string(),
                format!(
                    "storage provisioning has not succeeded after {} attempts",
                    provision_failures
                ),
            ));
        }
    }

    storage_facts(
        &mut conditions,
        &mut effects,
        &mut pending,
        &target,
        observed,
        storage_managed,
        now,
    );

    // Deployment convergence is detected through the plan hash annotation.
    let deployment_plan = DeploymentPlan::build(&registry.spec, &target, input.settings);
    let plan_hash = deployment_plan.hash();
    let deployment_current = cluster
        .workload
        .deployment
        .as_ref()
        .is_some_and(|d| d.plan_hash.as_deref() == Some(plan_hash.as_str()));
    if !deployment_current || !cluster.workload.service_exists {
        effects.push(SideEffect::ApplyDeployment(deployment_plan));
        pending.push("applying the registry deployment".to_string());
    }
    let ready_replicas = cluster
        .workload
        .deployment
        .as_ref()
        .map(|d| d.ready_replicas)
        .unwrap_or(0);
    let rollout_done = deployment_current && ready_replicas >= registry.spec.replicas;
    if deployment_current && !rollout_done {
        pending.push(format!(
            "waiting for deployment rollout ({}/{} replicas ready)",
            ready_replicas, registry.spec.replicas
        ));
    }

    let desired = desired_routes(
        &registry.spec,
        &input.settings.namespace,
        input.platform.ingress_domain.as_deref(),
    );
    for route in &desired {
        if cluster.workload.routes.get(&route.name) != Some(&route.hostname) {
            effects.push(SideEffect::ApplyRoute(route.clone()));
            pending.push(format!("exposing route {}", route.name));
        }
    }
    for name in cluster.workload.routes.keys() {
        if !desired.iter().any(|r| &r.name == name) {
            effects.push(SideEffect::RemoveRoute(name.clone()));
            pending.push(format!("removing stale route {}", name));
        }
    }

    let phase = if degraded.is_some() {
        RegistryPhase::Degraded
    } else if !observed.exists {
        RegistryPhase::Provisioning
    } else if effects.is_empty() && rollout_done {
        RegistryPhase::Steady
    } else {
        RegistryPhase::Converging
    };

    let message = match (&degraded, phase) {
        (Some((_, message)), _) => message.clone(),
        (None, RegistryPhase::Provisioning) => {
            format!("Provisioning {} storage", target.backend())
        }
        (None, RegistryPhase::Steady) => "Registry is ready".to_string(),
        _ => "Converging registry deployment".to_string(),
    };

    rollup(
        &mut conditions,
        &RollupFacts {
            degraded,
            pending,
            availability: availability_of(cluster),
        },
        now,
    );
    // A managed registry is not removed; clear any stale teardown marker.
    conditions.remove(REMOVED);

    let requeue = match phase {
        RegistryPhase::Steady | RegistryPhase::Degraded => Some(REQUEUE_SETTLED),
        _ => Some(REQUEUE_ACTIVE),
    };

    Reconciliation {
        status: ImageRegistryStatus {
            phase: Some(phase),
            message: Some(message),
            observed_generation: registry.metadata.generation,
            conditions: conditions.into_vec(),
            storage_managed,
            storage: target.to_spec(),
            provision_failures,
        },
        effects,
        requeue,
    }
}

/// Fold tag/encryption/cleanup observations into conditions and effects
fn storage_facts(
    conditions: &mut ConditionSet,
    effects: &mut Vec<SideEffect>,
    pending: &mut Vec<String>,
    target: &NormalizedStorage,
    observed: StorageState,
    managed: bool,
    now: DateTime<Utc>,
) {
    if !observed.exists {
        return;
    }

    match observed.tagged {
        Some(true) => conditions.update(
            STORAGE_TAGGED,
            ConditionStatus::True,
            "Tagged",
            "Operator tags are present on the storage medium",
            now,
        ),
        Some(false) => {
            conditions.update(
                STORAGE_TAGGED,
                ConditionStatus::False,
                "TagsMissing",
                "Operator tags are missing from the storage medium",
                now,
            );
            if managed {
                effects.push(SideEffect::TagStorage(target.clone()));
                pending.push("tagging the storage medium".to_string());
            }
        }
        None => conditions.remove(STORAGE_TAGGED),
    }

    let wants_encryption = matches!(target, NormalizedStorage::S3(s3) if s3.encrypt);
    match observed.encrypted {
        Some(true) => conditions.update(
            STORAGE_ENCRYPTED,
            ConditionStatus::True,
            "Encrypted",
            "Server-side encryption is configured",
            now,
        ),
        Some(false) => {
            conditions.update(
                STORAGE_ENCRYPTED,
                ConditionStatus::False,
                "EncryptionDisabled",
                "Server-side encryption is not configured",
                now,
            );
            if wants_encryption {
                effects.push(SideEffect::SetStorageEncryption(target.clone()));
                pending.push("configuring storage encryption".to_string());
            }
        }
        None => conditions.remove(STORAGE_ENCRYPTED),
    }

    match observed.upload_cleanup {
        Some(true) => conditions.update(
            STORAGE_UPLOAD_CLEANUP,
            ConditionStatus::True,
            "CleanupEnabled",
            "Incomplete-upload cleanup is configured",
            now,
        ),
        Some(false) => {
            conditions.update(
                STORAGE_UPLOAD_CLEANUP,
                ConditionStatus::False,
                "CleanupDisabled",
                "Incomplete-upload cleanup is not configured",
                now,
            );
            if managed && target.is_object_store() {
                effects.push(SideEffect::EnableUploadCleanup(target.clone()));
                pending.push("enabling incomplete-upload cleanup".to_string());
            }
        }
        None => conditions.remove(STORAGE_UPLOAD_CLEANUP),
    }
}

/// Availability verdict from the observed deployment
fn availability_of(cluster: &ClusterState) -> Availability {
    match &cluster.workload.deployment {
        Some(deployment) if deployment.ready_replicas >= 1 => {
            Availability::Available("The registry has minimum availability".to_string())
        }
        Some(_) => Availability::Unavailable(
            "NoReplicasAvailable".to_string(),
            "The registry deployment has no available replicas".to_string(),
        ),
        None => Availability::Unavailable(
            "DeploymentNotFound".to_string(),
            "The registry deployment does not exist".to_string(),
        ),
    }
}

/// Backend and medium identity recorded in a status storage block
fn storage_identity(spec: &StorageSpec) -> Option<(&'static str, Option<String>)> {
    if let Some(azure) = &spec.azure {
        return Some(("azure", azure.container.clone()));
    }
    if let Some(filesystem) = &spec.filesystem {
        return Some(("filesystem", filesystem.claim_name.clone()));
    }
    if let Some(gcs) = &spec.gcs {
        return Some(("gcs", gcs.bucket.clone()));
    }
    if let Some(s3) = &spec.s3 {
        return Some(("s3", s3.bucket.clone()));
    }
    if let Some(swift) = &spec.swift {
        return Some(("swift", swift.container.clone()));
    }
    None
}
