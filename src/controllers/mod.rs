//! Kubernetes controller for the ImageRegistry CRD
//!
//! This module contains the controller implementation that watches for CRD
//! changes and triggers reconciliation.

mod registry_controller;

pub use registry_controller::run as run_registry_controller;

use std::env;
use std::sync::Arc;

use kube::Client;

use crate::adapters::{KubeWorkloadClient, OperandSettings, WorkloadClient};
use crate::admission::{
    GateDefaults, RequestGates, DEFAULT_READ_MAX_RUNNING, DEFAULT_WRITE_MAX_RUNNING,
};
use crate::error::{Error, Result};
use crate::platform::{CloudPlatform, PlatformInfo, PlatformMetadata, StaticPlatformInfo};
use crate::storage::{DefaultStorageBackend, StorageBackend};

/// Operator configuration, read from REGISTRY_OPERATOR_* environment variables
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the registry workload runs in
    pub namespace: String,

    /// Registry container image
    pub image: String,

    /// Where the cluster runs
    pub platform: PlatformMetadata,

    /// Fallback admission bounds for specs that leave limits unset
    pub gate_defaults: GateDefaults,
}

impl OperatorConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let platform = env_or("REGISTRY_OPERATOR_PLATFORM", "baremetal")
            .parse::<CloudPlatform>()
            .map_err(Error::config)?;
        let region = env::var("REGISTRY_OPERATOR_REGION").ok().filter(|s| !s.is_empty());
        let cluster_name = env_or("REGISTRY_OPERATOR_CLUSTER_NAME", "kubernetes");
        let ingress_domain = env::var("REGISTRY_OPERATOR_INGRESS_DOMAIN")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            namespace: env_or("REGISTRY_OPERATOR_NAMESPACE", "image-registry"),
            image: env_or("REGISTRY_OPERATOR_IMAGE", "docker.io/library/registry:2"),
            platform: PlatformMetadata {
                platform,
                region,
                cluster_name,
                ingress_domain,
            },
            gate_defaults: GateDefaults {
                read_max_running: env_usize(
                    "REGISTRY_OPERATOR_READ_MAX_RUNNING",
                    DEFAULT_READ_MAX_RUNNING,
                )?,
                write_max_running: env_usize(
                    "REGISTRY_OPERATOR_WRITE_MAX_RUNNING",
                    DEFAULT_WRITE_MAX_RUNNING,
                )?,
            },
        })
    }

    /// Operand settings derived from this configuration
    pub fn operand_settings(&self) -> OperandSettings {
        OperandSettings {
            namespace: self.namespace.clone(),
            image: self.image.clone(),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| Error::config(format!("{} must be a positive integer: {}", name, raw))),
        _ => Ok(default),
    }
}

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Operator configuration
    pub config: OperatorConfig,

    /// Platform metadata source
    pub platform: Arc<dyn PlatformInfo>,

    /// Storage provider
    pub storage: Arc<dyn StorageBackend>,

    /// Workload client
    pub workload: Arc<dyn WorkloadClient>,

    /// Data-path admission gates, kept in sync with the spec
    pub gates: RequestGates,
}

impl Context {
    /// Create a context with the default collaborators
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let platform = Arc::new(StaticPlatformInfo::new(config.platform.clone()));
        let storage = Arc::new(DefaultStorageBackend::new());
        let workload = Arc::new(KubeWorkloadClient::new(client.clone(), &config.namespace));
        let gates = RequestGates::new(config.gate_defaults);
        Self {
            client,
            config,
            platform,
            storage,
            workload,
            gates,
        }
    }
}
