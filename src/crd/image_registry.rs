//! ImageRegistry Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ImageRegistry resource specification
///
/// Cluster-scoped. By convention a single resource named `instance` drives
/// the in-cluster registry; the controller reconciles every resource it
/// sees independently.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "imageregistry.atlasops.io",
    version = "v1alpha1",
    kind = "ImageRegistry",
    plural = "imageregistries",
    singular = "imageregistry",
    shortname = "imgreg",
    status = "ImageRegistryStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Managed Storage", "type": "boolean", "jsonPath": ".status.storageManaged"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistrySpec {
    /// Whether the operator manages the registry (Managed, Unmanaged, Removed)
    #[serde(default)]
    pub management_state: ManagementState,

    /// Seed for the registry session secret (empty = operand derives its own)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_secret: Option<String>,

    /// Proxy settings forwarded to the registry pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Storage backend selection (at most one variant)
    #[serde(default)]
    pub storage: StorageSpec,

    /// Request admission limits for the registry's data path
    #[serde(default)]
    pub requests: RequestsSpec,

    /// Expose the registry through a generated default route
    #[serde(default)]
    pub default_route: bool,

    /// Additional user-defined external routes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteSpec>,

    /// Desired replica count for the registry deployment
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Registry operand log verbosity
    #[serde(default)]
    pub log_level: i64,

    /// Compute resources for the registry pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    /// Node selector for the registry pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

fn default_replicas() -> i32 {
    1
}

impl Default for ImageRegistrySpec {
    fn default() -> Self {
        Self {
            management_state: ManagementState::default(),
            http_secret: None,
            proxy: None,
            storage: StorageSpec::default(),
            requests: RequestsSpec::default(),
            default_route: false,
            routes: Vec::new(),
            replicas: default_replicas(),
            log_level: 0,
            resources: None,
            node_selector: BTreeMap::new(),
        }
    }
}

/// Whether the operator actively manages the registry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ManagementState {
    /// The operator converges the registry toward the spec
    #[default]
    Managed,
    /// The operator observes but changes nothing
    Unmanaged,
    /// The operator tears the registry down
    Removed,
}

/// Proxy settings for the registry pods
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// HTTP proxy URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    /// HTTPS proxy URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https: Option<String>,

    /// Comma-separated hosts excluded from proxying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

/// Storage backend selection
///
/// At most one variant may be set. With none set the operator picks the
/// platform default and records its choice in the status.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Azure Blob storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorageSpec>,

    /// Local or persistent-volume filesystem storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemStorageSpec>,

    /// Google Cloud Storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsStorageSpec>,

    /// Amazon S3 (or S3-compatible) storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3StorageSpec>,

    /// OpenStack Swift storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftStorageSpec>,
}

impl StorageSpec {
    /// Names of the variants that are set, in declaration order
    pub fn configured(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.azure.is_some() {
            set.push("azure");
        }
        if self.filesystem.is_some() {
            set.push("filesystem");
        }
        if self.gcs.is_some() {
            set.push("gcs");
        }
        if self.s3.is_some() {
            set.push("s3");
        }
        if self.swift.is_some() {
            set.push("swift");
        }
        set
    }

    /// True when no variant is set
    pub fn is_empty(&self) -> bool {
        self.configured().is_empty()
    }
}

/// Azure Blob storage configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureStorageSpec {
    /// Blob container name (derived from cluster metadata when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Filesystem storage configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemStorageSpec {
    /// PersistentVolumeClaim backing the registry root (unset = emptyDir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
}

/// Google Cloud Storage configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcsStorageSpec {
    /// Bucket name (derived from cluster metadata when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

/// Amazon S3 storage configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageSpec {
    /// Bucket name (derived from cluster metadata when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// AWS region (falls back to the platform region)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_endpoint: Option<String>,

    /// Enable server-side encryption
    #[serde(default)]
    pub encrypt: bool,

    /// KMS key for server-side encryption
    #[serde(rename = "keyID", skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// OpenStack Swift storage configuration
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwiftStorageSpec {
    /// Keystone authentication URL
    #[serde(rename = "authURL", skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    /// Swift container name (derived from cluster metadata when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Request admission limits, split by traffic direction
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestsSpec {
    /// Limits for pull (read) traffic
    #[serde(default)]
    pub read: RequestLimitsSpec,

    /// Limits for push (write) traffic
    #[serde(default)]
    pub write: RequestLimitsSpec,
}

/// Admission limits for one traffic direction
///
/// Zero means unset: maxRunning falls back to the operator's configured
/// default, maxInQueue to a zero-capacity queue, maxWaitInQueueSecs to the
/// default wait bound.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestLimitsSpec {
    /// Maximum in-flight requests before new arrivals queue
    #[serde(default)]
    pub max_running: i32,

    /// Maximum queued requests before arrivals are rejected
    #[serde(default)]
    pub max_in_queue: i32,

    /// Maximum seconds a request may wait in the queue
    #[serde(default)]
    pub max_wait_in_queue_secs: u64,
}

/// User-defined external route for the registry
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Route name (unique within the spec)
    pub name: String,

    /// Externally visible hostname
    pub hostname: String,

    /// TLS secret serving the hostname
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Compute resources for the registry pods
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    /// Requested resources (e.g. cpu: 100m, memory: 256Mi)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Resource limits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// ImageRegistry status
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryStatus {
    /// Current phase of the convergence state machine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RegistryPhase>,

    /// Human-readable summary of the current state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation last acted upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Whether the operator provisioned (and may delete) the storage medium
    #[serde(default)]
    pub storage_managed: bool,

    /// Storage configuration currently applied to the registry
    #[serde(default)]
    pub storage: StorageSpec,

    /// Consecutive reconcile passes with unconfirmed storage provisioning
    #[serde(default)]
    pub provision_failures: u32,
}

/// Phases of the convergence state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RegistryPhase {
    /// First pass over a resource without recorded status
    Initializing,
    /// Validating and normalizing the desired configuration
    Normalizing,
    /// Waiting for the storage medium to exist
    Provisioning,
    /// Storage confirmed, workload still converging
    Converging,
    /// Observed state matches desired state
    Steady,
    /// A fatal or configuration error blocks convergence
    Degraded,
    /// Teardown requested; terminal
    Removed,
}

impl fmt::Display for RegistryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistryPhase::Initializing => "Initializing",
            RegistryPhase::Normalizing => "Normalizing",
            RegistryPhase::Provisioning => "Provisioning",
            RegistryPhase::Converging => "Converging",
            RegistryPhase::Steady => "Steady",
            RegistryPhase::Degraded => "Degraded",
            RegistryPhase::Removed => "Removed",
        };
        f.write_str(s)
    }
}

/// Status condition
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last time the status value changed
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Tri-state condition status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}
