//! Integration tests for the reconciliation planner
//!
//! The planner is pure, so these tests drive it directly: desired spec plus
//! recorded status plus observed cluster state in, next status and side
//! effects out.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use image_registry_operator::adapters::{
    DeploymentPlan, DeploymentState, OperandSettings, WorkloadState,
};
use image_registry_operator::crd::{
    ConditionStatus, GcsStorageSpec, ImageRegistry, ImageRegistrySpec, ImageRegistryStatus,
    ManagementState, RegistryPhase, S3StorageSpec, StorageSpec,
};
use image_registry_operator::platform::{CloudPlatform, PlatformMetadata};
use image_registry_operator::reconcilers::conditions::{
    AVAILABLE, DEGRADED, PROGRESSING, STORAGE_EXISTS,
};
use image_registry_operator::reconcilers::normalize;
use image_registry_operator::reconcilers::registry::{
    plan, ClusterState, PlanInput, Reconciliation, SideEffect, MAX_PROVISION_FAILURES,
};
use image_registry_operator::storage::StorageState;

// ============================================================================
// Test Helpers
// ============================================================================

fn settings() -> OperandSettings {
    OperandSettings {
        namespace: "image-registry".to_string(),
        image: "docker.io/library/registry:2".to_string(),
    }
}

fn bare_metal() -> PlatformMetadata {
    PlatformMetadata {
        platform: CloudPlatform::BareMetal,
        region: None,
        cluster_name: "kubernetes".to_string(),
        ingress_domain: None,
    }
}

fn aws() -> PlatformMetadata {
    PlatformMetadata {
        platform: CloudPlatform::Aws,
        region: Some("eu-west-1".to_string()),
        cluster_name: "kubernetes".to_string(),
        ingress_domain: None,
    }
}

fn registry(spec: ImageRegistrySpec, status: Option<ImageRegistryStatus>) -> ImageRegistry {
    ImageRegistry {
        metadata: ObjectMeta {
            name: Some("instance".to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec,
        status,
    }
}

fn run_plan(
    registry: &ImageRegistry,
    platform: &PlatformMetadata,
    cluster: &ClusterState,
    now: DateTime<Utc>,
) -> Reconciliation {
    let normalized = normalize::normalize(&registry.spec.storage, registry.status.as_ref(), platform);
    plan(PlanInput {
        registry,
        platform,
        normalized,
        cluster,
        settings: &settings(),
        now,
    })
}

/// Cluster state where the workload already matches the desired spec
fn converged_cluster(registry: &ImageRegistry, platform: &PlatformMetadata) -> ClusterState {
    let target = normalize::normalize(&registry.spec.storage, registry.status.as_ref(), platform)
        .expect("spec should normalize");
    let hash = DeploymentPlan::build(&registry.spec, &target, &settings()).hash();
    ClusterState {
        storage: StorageState {
            exists: true,
            ..StorageState::default()
        },
        workload: WorkloadState {
            deployment: Some(DeploymentState {
                ready_replicas: registry.spec.replicas,
                plan_hash: Some(hash),
            }),
            service_exists: true,
            routes: Default::default(),
        },
    }
}

fn condition<'a>(
    status: &'a ImageRegistryStatus,
    type_: &str,
) -> &'a image_registry_operator::crd::Condition {
    status
        .conditions
        .iter()
        .find(|c| c.type_ == type_)
        .unwrap_or_else(|| panic!("condition {} not found", type_))
}

// ============================================================================
// Configuration errors
// ============================================================================

#[test]
fn negative_replicas_degrade_without_side_effects() {
    let spec = ImageRegistrySpec {
        replicas: -1,
        ..Default::default()
    };
    let registry = registry(spec, None);
    let outcome = run_plan(&registry, &bare_metal(), &ClusterState::default(), Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Degraded));
    assert!(outcome.effects.is_empty(), "no side effects for an invalid spec");

    let degraded = condition(&outcome.status, DEGRADED);
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason.as_deref(), Some("InvalidConfiguration"));
    assert!(degraded
        .message
        .as_deref()
        .unwrap()
        .contains("replicas must be greater than or equal to 0"));
}

#[test]
fn conflicting_backends_degrade_and_name_the_variants() {
    let spec = ImageRegistrySpec {
        storage: StorageSpec {
            gcs: Some(GcsStorageSpec::default()),
            s3: Some(S3StorageSpec::default()),
            ..Default::default()
        },
        ..Default::default()
    };
    let registry = registry(spec, None);
    let outcome = run_plan(&registry, &aws(), &ClusterState::default(), Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Degraded));
    let message = condition(&outcome.status, DEGRADED).message.clone().unwrap();
    assert!(message.contains("gcs") && message.contains("s3"));
}

#[test]
fn degraded_spec_keeps_previously_recorded_storage() {
    let prev = ImageRegistryStatus {
        storage: StorageSpec {
            s3: Some(S3StorageSpec {
                bucket: Some("assigned-bucket".to_string()),
                region: Some("eu-west-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        storage_managed: true,
        ..Default::default()
    };
    let spec = ImageRegistrySpec {
        replicas: -1,
        ..Default::default()
    };
    let registry = registry(spec, Some(prev.clone()));
    let outcome = run_plan(&registry, &aws(), &ClusterState::default(), Utc::now());

    assert_eq!(outcome.status.storage, prev.storage);
    assert!(outcome.status.storage_managed);
}

// ============================================================================
// Provisioning
// ============================================================================

#[test]
fn absent_storage_enters_provisioning() {
    let registry = registry(ImageRegistrySpec::default(), None);
    let outcome = run_plan(&registry, &aws(), &ClusterState::default(), Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Provisioning));
    assert!(matches!(outcome.effects[0], SideEffect::ProvisionStorage(_)));
    assert!(outcome.status.storage_managed);
    assert_eq!(
        outcome.status.storage.s3.as_ref().and_then(|s3| s3.bucket.as_deref()),
        Some("kubernetes-image-registry")
    );

    let exists = condition(&outcome.status, STORAGE_EXISTS);
    assert_eq!(exists.status, ConditionStatus::False);
    assert_eq!(exists.reason.as_deref(), Some("StorageNotFound"));
}

#[test]
fn repeated_provisioning_failures_degrade() {
    let target = normalize::normalize(&StorageSpec::default(), None, &aws()).unwrap();
    let prev = ImageRegistryStatus {
        phase: Some(RegistryPhase::Provisioning),
        provision_failures: MAX_PROVISION_FAILURES - 1,
        storage: target.to_spec(),
        storage_managed: true,
        ..Default::default()
    };
    let registry = registry(ImageRegistrySpec::default(), Some(prev));
    let outcome = run_plan(&registry, &aws(), &ClusterState::default(), Utc::now());

    assert_eq!(outcome.status.provision_failures, MAX_PROVISION_FAILURES);
    assert_eq!(outcome.status.phase, Some(RegistryPhase::Degraded));
    let degraded = condition(&outcome.status, DEGRADED);
    assert_eq!(degraded.reason.as_deref(), Some("ProvisioningFailed"));

    // The provisioning request still goes out; retries continue.
    assert!(outcome
        .effects
        .iter()
        .any(|e| matches!(e, SideEffect::ProvisionStorage(_))));
}

#[test]
fn degraded_provisioning_state_does_not_flap() {
    // Replay passes against a medium that never materializes: the counter
    // climbs to the threshold, the resource degrades, and from then on
    // every further pass reproduces the same Degraded status while the
    // provisioning request keeps going out.
    let cluster = ClusterState::default();
    let mut now = Utc::now();
    let mut status: Option<ImageRegistryStatus> = None;
    for _ in 0..MAX_PROVISION_FAILURES + 2 {
        let reg = registry(ImageRegistrySpec::default(), status.clone());
        status = Some(run_plan(&reg, &aws(), &cluster, now).status);
        now = now + Duration::minutes(1);
    }

    let settled = status.unwrap();
    assert_eq!(settled.phase, Some(RegistryPhase::Degraded));
    assert_eq!(settled.provision_failures, MAX_PROVISION_FAILURES);

    let reg = registry(ImageRegistrySpec::default(), Some(settled.clone()));
    let next = run_plan(&reg, &aws(), &cluster, now);
    assert_eq!(next.status, settled);
    assert!(next
        .effects
        .iter()
        .any(|e| matches!(e, SideEffect::ProvisionStorage(_))));
}

#[test]
fn confirmed_storage_resets_the_failure_count() {
    let prev = ImageRegistryStatus {
        phase: Some(RegistryPhase::Provisioning),
        provision_failures: 3,
        ..Default::default()
    };
    let registry = registry(ImageRegistrySpec::default(), Some(prev));
    let cluster = ClusterState {
        storage: StorageState {
            exists: true,
            ..StorageState::default()
        },
        ..Default::default()
    };
    let outcome = run_plan(&registry, &aws(), &cluster, Utc::now());

    assert_eq!(outcome.status.provision_failures, 0);
    assert_ne!(outcome.status.phase, Some(RegistryPhase::Provisioning));
}

// ============================================================================
// Convergence and steady state
// ============================================================================

#[test]
fn existing_storage_with_stale_workload_converges() {
    let registry = registry(ImageRegistrySpec::default(), None);
    let cluster = ClusterState {
        storage: StorageState {
            exists: true,
            ..StorageState::default()
        },
        ..Default::default()
    };
    let outcome = run_plan(&registry, &bare_metal(), &cluster, Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Converging));
    assert!(outcome
        .effects
        .iter()
        .any(|e| matches!(e, SideEffect::ApplyDeployment(_))));
    assert_eq!(
        condition(&outcome.status, PROGRESSING).status,
        ConditionStatus::True
    );
}

#[test]
fn matching_cluster_state_is_steady() {
    let registry = registry(ImageRegistrySpec::default(), None);
    let cluster = converged_cluster(&registry, &bare_metal());
    let outcome = run_plan(&registry, &bare_metal(), &cluster, Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Steady));
    assert!(outcome.effects.is_empty());
    assert_eq!(condition(&outcome.status, DEGRADED).status, ConditionStatus::False);
    assert_eq!(
        condition(&outcome.status, PROGRESSING).status,
        ConditionStatus::False
    );
    assert_eq!(condition(&outcome.status, AVAILABLE).status, ConditionStatus::True);
}

#[test]
fn steady_replan_is_idempotent() {
    let first_pass = registry(ImageRegistrySpec::default(), None);
    let cluster = converged_cluster(&first_pass, &bare_metal());
    let t1 = Utc::now();
    let first = run_plan(&first_pass, &bare_metal(), &cluster, t1);
    assert_eq!(first.status.phase, Some(RegistryPhase::Steady));

    // Replanning later against unchanged state changes nothing, including
    // every lastTransitionTime.
    let second_pass = registry(ImageRegistrySpec::default(), Some(first.status.clone()));
    let second = run_plan(&second_pass, &bare_metal(), &cluster, t1 + Duration::minutes(5));

    assert_eq!(first.status, second.status);
    assert!(second.effects.is_empty());
}

#[test]
fn zero_replicas_steady_but_unavailable() {
    let spec = ImageRegistrySpec {
        replicas: 0,
        ..Default::default()
    };
    let registry = registry(spec, None);
    let cluster = converged_cluster(&registry, &bare_metal());
    let outcome = run_plan(&registry, &bare_metal(), &cluster, Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Steady));
    let available = condition(&outcome.status, AVAILABLE);
    assert_eq!(available.status, ConditionStatus::False);
    assert_eq!(available.reason.as_deref(), Some("NoReplicasAvailable"));
}

#[test]
fn incomplete_rollout_keeps_progressing() {
    let spec = ImageRegistrySpec {
        replicas: 3,
        ..Default::default()
    };
    let registry = registry(spec, None);
    let mut cluster = converged_cluster(&registry, &bare_metal());
    cluster.workload.deployment.as_mut().unwrap().ready_replicas = 1;
    let outcome = run_plan(&registry, &bare_metal(), &cluster, Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Converging));
    let progressing = condition(&outcome.status, PROGRESSING);
    assert_eq!(progressing.status, ConditionStatus::True);
    assert!(progressing.message.as_deref().unwrap().contains("1/3"));
    // Available already: one ready replica satisfies minimum availability.
    assert_eq!(condition(&outcome.status, AVAILABLE).status, ConditionStatus::True);
}

#[test]
fn stale_routes_are_removed() {
    let registry = registry(ImageRegistrySpec::default(), None);
    let mut cluster = converged_cluster(&registry, &bare_metal());
    cluster
        .workload
        .routes
        .insert("old-route".to_string(), "old.example.com".to_string());
    let outcome = run_plan(&registry, &bare_metal(), &cluster, Utc::now());

    assert!(outcome
        .effects
        .iter()
        .any(|e| matches!(e, SideEffect::RemoveRoute(name) if name == "old-route")));
}

// ============================================================================
// Condition bookkeeping
// ============================================================================

#[test]
fn last_transition_time_moves_only_on_status_flips() {
    let t1 = Utc::now();
    let t2 = t1 + Duration::minutes(10);

    // First pass: storage absent, StorageExists=False recorded at t1.
    let first_pass = registry(ImageRegistrySpec::default(), None);
    let first = run_plan(&first_pass, &aws(), &ClusterState::default(), t1);
    assert_eq!(condition(&first.status, STORAGE_EXISTS).last_transition_time, t1);
    let degraded_t1 = condition(&first.status, DEGRADED).last_transition_time;

    // Second pass: the medium now exists, StorageExists flips at t2 while
    // the unflipped Degraded condition keeps its t1 timestamp.
    let second_pass = registry(ImageRegistrySpec::default(), Some(first.status.clone()));
    let cluster = ClusterState {
        storage: StorageState {
            exists: true,
            ..StorageState::default()
        },
        ..Default::default()
    };
    let second = run_plan(&second_pass, &aws(), &cluster, t2);

    let exists = condition(&second.status, STORAGE_EXISTS);
    assert_eq!(exists.status, ConditionStatus::True);
    assert_eq!(exists.last_transition_time, t2);
    assert_eq!(condition(&second.status, DEGRADED).last_transition_time, degraded_t1);
}

#[test]
fn unknown_condition_types_pass_through() {
    let foreign = image_registry_operator::crd::Condition {
        type_: "NodeCADaemonProgressing".to_string(),
        status: ConditionStatus::True,
        last_transition_time: Utc::now() - Duration::hours(1),
        reason: Some("External".to_string()),
        message: Some("managed by another controller".to_string()),
    };
    let prev = ImageRegistryStatus {
        conditions: vec![foreign.clone()],
        ..Default::default()
    };
    let registry = registry(ImageRegistrySpec::default(), Some(prev));
    let cluster = converged_cluster(&registry, &bare_metal());
    let outcome = run_plan(&registry, &bare_metal(), &cluster, Utc::now());

    assert_eq!(condition(&outcome.status, "NodeCADaemonProgressing"), &foreign);
}

// ============================================================================
// Management state
// ============================================================================

#[test]
fn unmanaged_observes_without_effects() {
    let spec = ImageRegistrySpec {
        management_state: ManagementState::Unmanaged,
        ..Default::default()
    };
    let registry = registry(spec, None);
    let outcome = run_plan(&registry, &bare_metal(), &ClusterState::default(), Utc::now());

    assert!(outcome.effects.is_empty());
    for type_ in [DEGRADED, PROGRESSING, AVAILABLE] {
        assert_eq!(
            condition(&outcome.status, type_).status,
            ConditionStatus::Unknown
        );
    }
}

#[test]
fn removed_tears_down_the_workload() {
    let spec = ImageRegistrySpec {
        management_state: ManagementState::Removed,
        ..Default::default()
    };
    let registry = registry(spec, None);
    let mut cluster = ClusterState::default();
    cluster.workload.deployment = Some(DeploymentState {
        ready_replicas: 1,
        plan_hash: None,
    });
    cluster.workload.service_exists = true;
    cluster
        .workload
        .routes
        .insert("default-route".to_string(), "registry.example.com".to_string());

    let outcome = run_plan(&registry, &bare_metal(), &cluster, Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Removed));
    assert!(outcome
        .effects
        .iter()
        .any(|e| matches!(e, SideEffect::RemoveRoute(_))));
    assert!(outcome.effects.contains(&SideEffect::RemoveDeployment));
    assert_eq!(condition(&outcome.status, AVAILABLE).status, ConditionStatus::False);
}

#[test]
fn removed_phase_is_latched() {
    // Flipping the spec back to Managed does not resurrect the registry.
    let prev = ImageRegistryStatus {
        phase: Some(RegistryPhase::Removed),
        ..Default::default()
    };
    let spec = ImageRegistrySpec {
        management_state: ManagementState::Managed,
        ..Default::default()
    };
    let registry = registry(spec, Some(prev));
    let outcome = run_plan(&registry, &bare_metal(), &ClusterState::default(), Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Removed));
    assert!(outcome.effects.is_empty());
}

#[test]
fn finished_teardown_reports_removed_and_stops_requeueing() {
    let spec = ImageRegistrySpec {
        management_state: ManagementState::Removed,
        ..Default::default()
    };
    let registry = registry(spec, None);
    let outcome = run_plan(&registry, &bare_metal(), &ClusterState::default(), Utc::now());

    assert!(outcome.effects.is_empty());
    assert!(outcome.requeue.is_none());
    let removed = condition(&outcome.status, "Removed");
    assert_eq!(removed.status, ConditionStatus::True);
}

#[test]
fn removal_with_unresolvable_managed_storage_stays_incomplete() {
    // The spec goes invalid while a managed medium is still recorded:
    // teardown must not report completion and must keep the record.
    let prev = ImageRegistryStatus {
        storage: StorageSpec {
            s3: Some(S3StorageSpec {
                bucket: Some("assigned-bucket".to_string()),
                region: Some("eu-west-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        storage_managed: true,
        ..Default::default()
    };
    let spec = ImageRegistrySpec {
        management_state: ManagementState::Removed,
        storage: StorageSpec {
            gcs: Some(GcsStorageSpec::default()),
            s3: Some(S3StorageSpec::default()),
            ..Default::default()
        },
        ..Default::default()
    };
    let registry = registry(spec, Some(prev.clone()));
    let outcome = run_plan(&registry, &aws(), &ClusterState::default(), Utc::now());

    assert_eq!(outcome.status.phase, Some(RegistryPhase::Removed));
    let removed = condition(&outcome.status, "Removed");
    assert_eq!(removed.status, ConditionStatus::False);
    assert_eq!(removed.reason.as_deref(), Some("RemovalBlocked"));
    assert!(outcome.status.storage_managed);
    assert_eq!(outcome.status.storage, prev.storage);
    assert!(outcome.effects.is_empty());
    assert!(outcome.requeue.is_some());
}
