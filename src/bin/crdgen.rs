//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the custom resource
//! defined by the image-registry-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use image_registry_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
