//! Custom Resource Definitions for the Image Registry Operator

mod image_registry;

pub use image_registry::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![serde_yaml::to_string(&ImageRegistry::crd()).unwrap()]
}
