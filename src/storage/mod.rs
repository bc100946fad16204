//! Normalized storage model
//!
//! The CRD storage spec is open-ended (any subset of variants, any field
//! omitted). Normalization turns it into exactly one fully-populated
//! variant; everything downstream (the storage backend, the deployment
//! renderer, the status echo) works from this closed form.

mod backend;

pub use backend::*;

use crate::crd::{
    AzureStorageSpec, FilesystemStorageSpec, GcsStorageSpec, S3StorageSpec, StorageSpec,
    SwiftStorageSpec,
};

/// Root directory the registry operand serves images from
pub const REGISTRY_ROOT_DIR: &str = "/registry";

/// A fully-resolved storage selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedStorage {
    /// Azure Blob storage
    Azure(AzureStorage),
    /// Local or persistent-volume filesystem storage
    Filesystem(FilesystemStorage),
    /// Google Cloud Storage
    Gcs(GcsStorage),
    /// Amazon S3 (or S3-compatible) storage
    S3(S3Storage),
    /// OpenStack Swift storage
    Swift(SwiftStorage),
}

/// Resolved Azure Blob configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureStorage {
    pub container: String,
}

/// Resolved filesystem configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemStorage {
    /// Backing PVC; None means an emptyDir volume
    pub claim_name: Option<String>,
}

/// Resolved GCS configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsStorage {
    pub bucket: String,
}

/// Resolved S3 configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Storage {
    pub bucket: String,
    pub region: String,
    pub region_endpoint: Option<String>,
    pub encrypt: bool,
    pub key_id: Option<String>,
}

/// Resolved Swift configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwiftStorage {
    pub auth_url: String,
    pub container: String,
}

impl NormalizedStorage {
    /// Backend name as it appears in the CRD and in operand configuration
    pub fn backend(&self) -> &'static str {
        match self {
            NormalizedStorage::Azure(_) => "azure",
            NormalizedStorage::Filesystem(_) => "filesystem",
            NormalizedStorage::Gcs(_) => "gcs",
            NormalizedStorage::S3(_) => "s3",
            NormalizedStorage::Swift(_) => "swift",
        }
    }

    /// Whether the medium is a remote object store (provisionable)
    pub fn is_object_store(&self) -> bool {
        !matches!(self, NormalizedStorage::Filesystem(_))
    }

    /// Identity of the storage medium (bucket or container name)
    pub fn medium_name(&self) -> Option<&str> {
        match self {
            NormalizedStorage::Azure(a) => Some(&a.container),
            NormalizedStorage::Filesystem(_) => None,
            NormalizedStorage::Gcs(g) => Some(&g.bucket),
            NormalizedStorage::S3(s3) => Some(&s3.bucket),
            NormalizedStorage::Swift(sw) => Some(&sw.container),
        }
    }

    /// Spec-shaped echo recorded in the resource status
    pub fn to_spec(&self) -> StorageSpec {
        let mut spec = StorageSpec::default();
        match self {
            NormalizedStorage::Azure(a) => {
                spec.azure = Some(AzureStorageSpec {
                    container: Some(a.container.clone()),
                });
            }
            NormalizedStorage::Filesystem(fs) => {
                spec.filesystem = Some(FilesystemStorageSpec {
                    claim_name: fs.claim_name.clone(),
                });
            }
            NormalizedStorage::Gcs(g) => {
                spec.gcs = Some(GcsStorageSpec {
                    bucket: Some(g.bucket.clone()),
                });
            }
            NormalizedStorage::S3(s3) => {
                spec.s3 = Some(S3StorageSpec {
                    bucket: Some(s3.bucket.clone()),
                    region: Some(s3.region.clone()),
                    region_endpoint: s3.region_endpoint.clone(),
                    encrypt: s3.encrypt,
                    key_id: s3.key_id.clone(),
                });
            }
            NormalizedStorage::Swift(sw) => {
                spec.swift = Some(SwiftStorageSpec {
                    auth_url: Some(sw.auth_url.clone()),
                    container: Some(sw.container.clone()),
                });
            }
        }
        spec
    }

    /// Environment variables configuring the registry operand for this medium
    pub fn operand_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("REGISTRY_STORAGE".to_string(), self.backend().to_string())];
        match self {
            NormalizedStorage::Azure(a) => {
                env.push((
                    "REGISTRY_STORAGE_AZURE_CONTAINER".to_string(),
                    a.container.clone(),
                ));
            }
            NormalizedStorage::Filesystem(_) => {
                env.push((
                    "REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY".to_string(),
                    REGISTRY_ROOT_DIR.to_string(),
                ));
            }
            NormalizedStorage::Gcs(g) => {
                env.push(("REGISTRY_STORAGE_GCS_BUCKET".to_string(), g.bucket.clone()));
            }
            NormalizedStorage::S3(s3) => {
                env.push(("REGISTRY_STORAGE_S3_BUCKET".to_string(), s3.bucket.clone()));
                env.push(("REGISTRY_STORAGE_S3_REGION".to_string(), s3.region.clone()));
                if let Some(endpoint) = &s3.region_endpoint {
                    env.push((
                        "REGISTRY_STORAGE_S3_REGIONENDPOINT".to_string(),
                        endpoint.clone(),
                    ));
                }
                env.push((
                    "REGISTRY_STORAGE_S3_ENCRYPT".to_string(),
                    s3.encrypt.to_string(),
                ));
                if let Some(key_id) = &s3.key_id {
                    env.push(("REGISTRY_STORAGE_S3_KEYID".to_string(), key_id.clone()));
                }
            }
            NormalizedStorage::Swift(sw) => {
                env.push((
                    "REGISTRY_STORAGE_SWIFT_AUTHURL".to_string(),
                    sw.auth_url.clone(),
                ));
                env.push((
                    "REGISTRY_STORAGE_SWIFT_CONTAINER".to_string(),
                    sw.container.clone(),
                ));
            }
        }
        env
    }
}
