//! Adapters for converting planned state into Kubernetes objects

mod deployment;
mod routes;
mod workload;

pub use deployment::*;
pub use routes::*;
pub use workload::*;
