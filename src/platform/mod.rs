//! Cluster platform metadata
//!
//! Storage normalization and bucket-name derivation need to know where the
//! cluster runs. The collaborator trait keeps the lookup swappable: the
//! operator binary wires a static snapshot from its environment, cloud
//! builds can answer from instance metadata services.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::Result;

/// Cloud platform hosting the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudPlatform {
    Aws,
    Gcp,
    Azure,
    OpenStack,
    BareMetal,
}

impl fmt::Display for CloudPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloudPlatform::Aws => "aws",
            CloudPlatform::Gcp => "gcp",
            CloudPlatform::Azure => "azure",
            CloudPlatform::OpenStack => "openstack",
            CloudPlatform::BareMetal => "baremetal",
        };
        f.write_str(s)
    }
}

impl FromStr for CloudPlatform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudPlatform::Aws),
            "gcp" | "gce" => Ok(CloudPlatform::Gcp),
            "azure" => Ok(CloudPlatform::Azure),
            "openstack" => Ok(CloudPlatform::OpenStack),
            "baremetal" | "none" => Ok(CloudPlatform::BareMetal),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Metadata about the cluster's environment
#[derive(Clone, Debug)]
pub struct PlatformMetadata {
    /// Cloud platform kind
    pub platform: CloudPlatform,

    /// Cloud region, when the platform has one
    pub region: Option<String>,

    /// Cluster name, used to derive storage bucket names
    pub cluster_name: String,

    /// Base domain for generated route hostnames
    pub ingress_domain: Option<String>,
}

/// Source of platform metadata
#[async_trait]
pub trait PlatformInfo: Send + Sync {
    /// Current platform metadata
    async fn metadata(&self) -> Result<PlatformMetadata>;
}

/// Platform info answering from a fixed snapshot
pub struct StaticPlatformInfo {
    metadata: PlatformMetadata,
}

impl StaticPlatformInfo {
    /// Create a platform info source from a snapshot
    pub fn new(metadata: PlatformMetadata) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl PlatformInfo for StaticPlatformInfo {
    async fn metadata(&self) -> Result<PlatformMetadata> {
        Ok(self.metadata.clone())
    }
}
