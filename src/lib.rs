//! AtlasOps Image Registry Kubernetes Operator
//!
//! This operator manages an in-cluster container image registry through a
//! Custom Resource Definition: storage provisioning, workload convergence,
//! external routes, and data-path request admission.

pub mod adapters;
pub mod admission;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod platform;
pub mod reconcilers;
pub mod storage;

pub use error::{Error, Result};
