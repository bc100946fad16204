//! Kubernetes workload client
//!
//! Observes and mutates the registry's cluster objects: the Deployment, its
//! Service, and the Ingress routes. Mutations go through server-side apply
//! with a fixed field manager; deletes tolerate objects that are already
//! gone so teardown passes stay idempotent.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::adapters::deployment::{DeploymentPlan, PLAN_HASH_ANNOTATION, REGISTRY_APP_NAME};
use crate::adapters::routes::RoutePlan;
use crate::error::Result;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "image-registry-operator";

/// Observed registry workload
#[derive(Debug, Clone, Default)]
pub struct WorkloadState {
    /// Registry deployment, if present
    pub deployment: Option<DeploymentState>,

    /// Whether the registry service exists
    pub service_exists: bool,

    /// Operator-owned routes present, as name -> hostname
    pub routes: BTreeMap<String, String>,
}

/// Observed state of the registry deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentState {
    /// Ready replicas reported by the deployment
    pub ready_replicas: i32,

    /// Plan hash annotation stamped by the operator, if any
    pub plan_hash: Option<String>,
}

/// Cluster operations the reconciler drives the workload through
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Observe the deployment, service, and operator-owned routes
    async fn observe(&self) -> Result<WorkloadState>;

    /// Apply the registry deployment and its service
    async fn apply_deployment(&self, plan: &DeploymentPlan) -> Result<()>;

    /// Delete the registry deployment and service
    async fn remove_deployment(&self) -> Result<()>;

    /// Apply one external route
    async fn apply_route(&self, plan: &RoutePlan) -> Result<()>;

    /// Delete one external route
    async fn remove_route(&self, name: &str) -> Result<()>;
}

/// WorkloadClient backed by the cluster API
#[derive(Clone)]
pub struct KubeWorkloadClient {
    client: Client,
    namespace: String,
}

impl KubeWorkloadClient {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn ingresses(&self) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn observe(&self) -> Result<WorkloadState> {
        let deployment = self
            .deployments()
            .get_opt(REGISTRY_APP_NAME)
            .await?
            .map(|deployment| {
                let plan_hash = deployment
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|annotations| annotations.get(PLAN_HASH_ANNOTATION))
                    .cloned();
                let ready_replicas = deployment
                    .status
                    .as_ref()
                    .and_then(|status| status.ready_replicas)
                    .unwrap_or(0);
                DeploymentState {
                    ready_replicas,
                    plan_hash,
                }
            });

        let service_exists = self.services().get_opt(REGISTRY_APP_NAME).await?.is_some();

        let params = ListParams::default().labels(&format!("app={}", REGISTRY_APP_NAME));
        let mut routes = BTreeMap::new();
        for ingress in self.ingresses().list(&params).await? {
            let hostname = ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.rules.as_ref())
                .and_then(|rules| rules.first())
                .and_then(|rule| rule.host.clone())
                .unwrap_or_default();
            routes.insert(ingress.name_any(), hostname);
        }

        Ok(WorkloadState {
            deployment,
            service_exists,
            routes,
        })
    }

    async fn apply_deployment(&self, plan: &DeploymentPlan) -> Result<()> {
        debug!(
            "Applying registry deployment with {} replicas (hash {})",
            plan.replicas,
            plan.hash()
        );
        self.deployments()
            .patch(
                REGISTRY_APP_NAME,
                &Self::apply_params(),
                &Patch::Apply(&plan.to_deployment()),
            )
            .await?;
        self.services()
            .patch(
                REGISTRY_APP_NAME,
                &Self::apply_params(),
                &Patch::Apply(&plan.to_service()),
            )
            .await?;
        Ok(())
    }

    async fn remove_deployment(&self) -> Result<()> {
        match self
            .deployments()
            .delete(REGISTRY_APP_NAME, &DeleteParams::default())
            .await
        {
            Ok(_) => debug!("Deleted registry deployment"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        match self
            .services()
            .delete(REGISTRY_APP_NAME, &DeleteParams::default())
            .await
        {
            Ok(_) => debug!("Deleted registry service"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn apply_route(&self, plan: &RoutePlan) -> Result<()> {
        debug!("Applying route {} ({})", plan.name, plan.hostname);
        self.ingresses()
            .patch(
                &plan.name,
                &Self::apply_params(),
                &Patch::Apply(&plan.to_ingress(&self.namespace)),
            )
            .await?;
        Ok(())
    }

    async fn remove_route(&self, name: &str) -> Result<()> {
        match self.ingresses().delete(name, &DeleteParams::default()).await {
            Ok(_) => debug!("Deleted route {}", name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
