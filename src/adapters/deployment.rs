//! Registry workload rendering
//!
//! Converts the validated spec plus resolved storage into the operand
//! Deployment and Service. The rendered plan is content-hashed and the hash
//! stamped on the Deployment as an annotation, so a later pass detects drift
//! by comparing hashes instead of diffing live objects.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::crd::{ImageRegistrySpec, RequestLimitsSpec, ResourcesSpec};
use crate::storage::{NormalizedStorage, REGISTRY_ROOT_DIR};

/// Name shared by the registry deployment and service
pub const REGISTRY_APP_NAME: &str = "image-registry";
/// Port the registry operand listens on
pub const REGISTRY_PORT: i32 = 5000;
/// Annotation carrying the rendered plan hash
pub const PLAN_HASH_ANNOTATION: &str = "imageregistry.atlasops.io/plan-hash";

/// Operator-level settings for the operand workload
#[derive(Debug, Clone)]
pub struct OperandSettings {
    /// Namespace the registry workload runs in
    pub namespace: String,

    /// Registry container image
    pub image: String,
}

/// Volume backing the registry root directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VolumePlan {
    /// Object-store backends keep no local state
    None,
    /// Ephemeral filesystem storage
    EmptyDir,
    /// Filesystem storage on a PersistentVolumeClaim
    Claim(String),
}

/// Fully rendered desired state of the registry workload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentPlan {
    pub namespace: String,
    pub image: String,
    pub replicas: i32,
    pub env: Vec<(String, String)>,
    pub node_selector: BTreeMap<String, String>,
    pub resources: Option<ResourcesSpec>,
    pub volume: VolumePlan,
}

impl DeploymentPlan {
    /// Render the desired workload from the validated spec and resolved
    /// storage selection.
    pub fn build(
        spec: &ImageRegistrySpec,
        storage: &NormalizedStorage,
        settings: &OperandSettings,
    ) -> Self {
        let mut env = storage.operand_env();
        env.push((
            "REGISTRY_LOG_LEVEL".to_string(),
            if spec.log_level > 0 { "debug" } else { "info" }.to_string(),
        ));
        if let Some(secret) = spec.http_secret.as_deref().filter(|s| !s.is_empty()) {
            env.push(("REGISTRY_HTTP_SECRET".to_string(), secret.to_string()));
        }
        if let Some(proxy) = &spec.proxy {
            if let Some(http) = &proxy.http {
                env.push(("HTTP_PROXY".to_string(), http.clone()));
            }
            if let Some(https) = &proxy.https {
                env.push(("HTTPS_PROXY".to_string(), https.clone()));
            }
            if let Some(no_proxy) = &proxy.no_proxy {
                env.push(("NO_PROXY".to_string(), no_proxy.clone()));
            }
        }
        push_limit_env(&mut env, "READ", &spec.requests.read);
        push_limit_env(&mut env, "WRITE", &spec.requests.write);

        let volume = match storage {
            NormalizedStorage::Filesystem(fs) => match &fs.claim_name {
                Some(claim) => VolumePlan::Claim(claim.clone()),
                None => VolumePlan::EmptyDir,
            },
            _ => VolumePlan::None,
        };

        Self {
            namespace: settings.namespace.clone(),
            image: settings.image.clone(),
            replicas: spec.replicas,
            env,
            node_selector: spec.node_selector.clone(),
            resources: spec.resources.clone(),
            volume,
        }
    }

    /// Content hash of the rendered plan
    pub fn hash(&self) -> String {
        // The plan is plain owned data; serialization cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }

    /// Render the Deployment object, hash annotation included
    pub fn to_deployment(&self) -> Deployment {
        let labels = app_labels();
        let annotations =
            BTreeMap::from([(PLAN_HASH_ANNOTATION.to_string(), self.hash())]);

        let env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        let (volumes, volume_mounts) = self.storage_volume();
        let probe = Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(REGISTRY_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(REGISTRY_APP_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "registry".to_string(),
                            image: Some(self.image.clone()),
                            env: Some(env),
                            ports: Some(vec![ContainerPort {
                                name: Some("registry".to_string()),
                                container_port: REGISTRY_PORT,
                                ..Default::default()
                            }]),
                            readiness_probe: Some(probe.clone()),
                            liveness_probe: Some(probe),
                            resources: resource_requirements(self.resources.as_ref()),
                            volume_mounts,
                            ..Default::default()
                        }],
                        volumes,
                        node_selector: if self.node_selector.is_empty() {
                            None
                        } else {
                            Some(self.node_selector.clone())
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Render the ClusterIP Service fronting the registry pods
    pub fn to_service(&self) -> Service {
        let labels = app_labels();
        Service {
            metadata: ObjectMeta {
                name: Some(REGISTRY_APP_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some("registry".to_string()),
                    port: REGISTRY_PORT,
                    target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn storage_volume(&self) -> (Option<Vec<Volume>>, Option<Vec<VolumeMount>>) {
        let source = match &self.volume {
            VolumePlan::None => return (None, None),
            VolumePlan::EmptyDir => Volume {
                name: "registry-storage".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            VolumePlan::Claim(claim) => Volume {
                name: "registry-storage".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: None,
                }),
                ..Default::default()
            },
        };
        let mount = VolumeMount {
            name: "registry-storage".to_string(),
            mount_path: REGISTRY_ROOT_DIR.to_string(),
            ..Default::default()
        };
        (Some(vec![source]), Some(vec![mount]))
    }
}

/// Labels selecting the registry workload
pub fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), REGISTRY_APP_NAME.to_string())])
}

fn push_limit_env(env: &mut Vec<(String, String)>, direction: &str, limits: &RequestLimitsSpec) {
    if limits.max_running > 0 {
        env.push((
            format!("REGISTRY_REQUESTS_{}_MAXRUNNING", direction),
            limits.max_running.to_string(),
        ));
    }
    if limits.max_in_queue > 0 {
        env.push((
            format!("REGISTRY_REQUESTS_{}_MAXINQUEUE", direction),
            limits.max_in_queue.to_string(),
        ));
    }
    if limits.max_wait_in_queue_secs > 0 {
        env.push((
            format!("REGISTRY_REQUESTS_{}_MAXWAITINQUEUE", direction),
            format!("{}s", limits.max_wait_in_queue_secs),
        ));
    }
}

fn resource_requirements(resources: Option<&ResourcesSpec>) -> Option<ResourceRequirements> {
    let resources = resources?;
    let quantities = |map: &BTreeMap<String, String>| {
        if map.is_empty() {
            None
        } else {
            Some(
                map.iter()
                    .map(|(name, value)| (name.clone(), Quantity(value.clone())))
                    .collect(),
            )
        }
    };
    Some(ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FilesystemStorage, S3Storage};

    fn settings() -> OperandSettings {
        OperandSettings {
            namespace: "image-registry".to_string(),
            image: "docker.io/library/registry:2".to_string(),
        }
    }

    fn s3_storage() -> NormalizedStorage {
        NormalizedStorage::S3(S3Storage {
            bucket: "cluster-image-registry".to_string(),
            region: "eu-west-1".to_string(),
            region_endpoint: None,
            encrypt: true,
            key_id: None,
        })
    }

    #[test]
    fn s3_plan_sets_storage_env() {
        let spec = ImageRegistrySpec::default();
        let plan = DeploymentPlan::build(&spec, &s3_storage(), &settings());

        let env: BTreeMap<_, _> = plan.env.iter().cloned().collect();
        assert_eq!(env.get("REGISTRY_STORAGE").map(String::as_str), Some("s3"));
        assert_eq!(
            env.get("REGISTRY_STORAGE_S3_BUCKET").map(String::as_str),
            Some("cluster-image-registry")
        );
        assert_eq!(plan.volume, VolumePlan::None);
    }

    #[test]
    fn filesystem_claim_mounts_pvc() {
        let spec = ImageRegistrySpec::default();
        let storage = NormalizedStorage::Filesystem(FilesystemStorage {
            claim_name: Some("registry-pvc".to_string()),
        });
        let plan = DeploymentPlan::build(&spec, &storage, &settings());
        assert_eq!(plan.volume, VolumePlan::Claim("registry-pvc".to_string()));

        let deployment = plan.to_deployment();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "registry-pvc"
        );
        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, REGISTRY_ROOT_DIR);
    }

    #[test]
    fn hash_tracks_plan_content() {
        let mut spec = ImageRegistrySpec::default();
        let first = DeploymentPlan::build(&spec, &s3_storage(), &settings());
        assert_eq!(first.hash(), first.clone().hash());

        spec.replicas = 3;
        let second = DeploymentPlan::build(&spec, &s3_storage(), &settings());
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn request_limits_become_env() {
        let mut spec = ImageRegistrySpec::default();
        spec.requests.read.max_running = 50;
        spec.requests.read.max_wait_in_queue_secs = 10;
        let plan = DeploymentPlan::build(&spec, &s3_storage(), &settings());

        let env: BTreeMap<_, _> = plan.env.iter().cloned().collect();
        assert_eq!(
            env.get("REGISTRY_REQUESTS_READ_MAXRUNNING").map(String::as_str),
            Some("50")
        );
        assert_eq!(
            env.get("REGISTRY_REQUESTS_READ_MAXWAITINQUEUE").map(String::as_str),
            Some("10s")
        );
        assert!(!env.contains_key("REGISTRY_REQUESTS_WRITE_MAXRUNNING"));
    }
}
