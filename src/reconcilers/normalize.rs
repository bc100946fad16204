//! Spec validation and storage backend normalization
//!
//! Turns the open-ended desired configuration into either a fully-resolved
//! storage selection plus a validated spec, or a typed validation error the
//! planner folds into the Degraded condition. Everything here is pure and
//! deterministic: the same spec, recorded status, and platform metadata
//! always produce the same answer, and normalizing an echoed result is a
//! fixed point.

use std::collections::HashSet;

use thiserror::Error;

use crate::crd::{
    AzureStorageSpec, FilesystemStorageSpec, GcsStorageSpec, ImageRegistrySpec,
    ImageRegistryStatus, S3StorageSpec, StorageSpec, SwiftStorageSpec,
};
use crate::platform::{CloudPlatform, PlatformMetadata};
use crate::storage::{
    AzureStorage, FilesystemStorage, GcsStorage, NormalizedStorage, S3Storage, SwiftStorage,
};

/// Why a desired configuration cannot be acted on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// More than one storage variant set in the spec
    #[error("only one storage backend may be configured, found: {}", .backends.join(", "))]
    MultipleBackends { backends: Vec<&'static str> },

    /// Required fields missing and not derivable
    #[error("{backend} storage configuration is incomplete: missing {}", .missing.join(", "))]
    IncompleteStorageConfig {
        backend: &'static str,
        missing: Vec<&'static str>,
    },

    /// Backend switch that abandons a managed medium without naming a new one
    #[error(
        "unsupported storage transition from managed {from} storage to {to}: \
         the new backend does not name its storage medium"
    )]
    UnsupportedTransition { from: String, to: &'static str },

    /// Negative replica count
    #[error("replicas must be greater than or equal to 0")]
    InvalidReplicas { replicas: i32 },

    /// Malformed route entry
    #[error("route {name:?}: {problem}")]
    InvalidRoute { name: String, problem: String },
}

impl ValidationError {
    /// Condition reason token for this failure class
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::UnsupportedTransition { .. } => "UnsupportedTransition",
            _ => "InvalidConfiguration",
        }
    }
}

/// Validate the non-storage parts of the spec
pub fn validate(spec: &ImageRegistrySpec) -> Result<(), ValidationError> {
    if spec.replicas < 0 {
        return Err(ValidationError::InvalidReplicas {
            replicas: spec.replicas,
        });
    }

    let mut names = HashSet::new();
    for route in &spec.routes {
        if route.name.is_empty() {
            return Err(ValidationError::InvalidRoute {
                name: route.name.clone(),
                problem: "name must not be empty".to_string(),
            });
        }
        if route.hostname.is_empty() {
            return Err(ValidationError::InvalidRoute {
                name: route.name.clone(),
                problem: "hostname must not be empty".to_string(),
            });
        }
        if !names.insert(route.name.as_str()) {
            return Err(ValidationError::InvalidRoute {
                name: route.name.clone(),
                problem: "name is not unique".to_string(),
            });
        }
    }

    Ok(())
}

/// Normalize the storage selection
///
/// Exactly one variant comes out. Identity fields already recorded in the
/// status win over derivation so that a provisioned medium is never silently
/// renamed; with nothing configured and nothing recorded the platform
/// default backend is selected.
pub fn normalize(
    spec: &StorageSpec,
    status: Option<&ImageRegistryStatus>,
    platform: &PlatformMetadata,
) -> Result<NormalizedStorage, ValidationError> {
    let configured = spec.configured();
    if configured.len() > 1 {
        return Err(ValidationError::MultipleBackends {
            backends: configured,
        });
    }

    let empty = StorageSpec::default();
    let recorded = status.map(|s| &s.storage).unwrap_or(&empty);
    let managed = status.map(|s| s.storage_managed).unwrap_or(false);

    match selected_variant(spec) {
        Some(sel) => resolve(sel, recorded, managed, platform),
        // Nothing requested: stay on the recorded medium, else pick the
        // platform default.
        None => match selected_variant(recorded) {
            Some(rec) => resolve(rec, recorded, managed, platform),
            None => platform_default(platform),
        },
    }
}

/// A single storage variant borrowed out of a StorageSpec
enum Selected<'a> {
    Azure(&'a AzureStorageSpec),
    Filesystem(&'a FilesystemStorageSpec),
    Gcs(&'a GcsStorageSpec),
    S3(&'a S3StorageSpec),
    Swift(&'a SwiftStorageSpec),
}

fn selected_variant(spec: &StorageSpec) -> Option<Selected<'_>> {
    if let Some(azure) = &spec.azure {
        return Some(Selected::Azure(azure));
    }
    if let Some(filesystem) = &spec.filesystem {
        return Some(Selected::Filesystem(filesystem));
    }
    if let Some(gcs) = &spec.gcs {
        return Some(Selected::Gcs(gcs));
    }
    if let Some(s3) = &spec.s3 {
        return Some(Selected::S3(s3));
    }
    if let Some(swift) = &spec.swift {
        return Some(Selected::Swift(swift));
    }
    None
}

fn resolve(
    sel: Selected<'_>,
    recorded: &StorageSpec,
    managed: bool,
    platform: &PlatformMetadata,
) -> Result<NormalizedStorage, ValidationError> {
    match sel {
        Selected::Azure(azure) => {
            transition_guard("azure", value(&azure.container).is_some(), recorded, managed)?;
            let container = value(&azure.container)
                .or_else(|| recorded.azure.as_ref().and_then(|r| value(&r.container)))
                .unwrap_or_else(|| derive_medium_name(platform));
            Ok(NormalizedStorage::Azure(AzureStorage { container }))
        }
        Selected::Filesystem(filesystem) => {
            // Filesystem has no derivable identity; selecting it is always
            // an explicit choice.
            let claim_name = value(&filesystem.claim_name).or_else(|| {
                recorded
                    .filesystem
                    .as_ref()
                    .and_then(|r| value(&r.claim_name))
            });
            Ok(NormalizedStorage::Filesystem(FilesystemStorage {
                claim_name,
            }))
        }
        Selected::Gcs(gcs) => {
            transition_guard("gcs", value(&gcs.bucket).is_some(), recorded, managed)?;
            let bucket = value(&gcs.bucket)
                .or_else(|| recorded.gcs.as_ref().and_then(|r| value(&r.bucket)))
                .unwrap_or_else(|| derive_medium_name(platform));
            Ok(NormalizedStorage::Gcs(GcsStorage { bucket }))
        }
        Selected::S3(s3) => {
            transition_guard("s3", value(&s3.bucket).is_some(), recorded, managed)?;
            resolve_s3(s3, recorded.s3.as_ref(), platform)
        }
        Selected::Swift(swift) => {
            transition_guard("swift", value(&swift.container).is_some(), recorded, managed)?;
            resolve_swift(swift, recorded.swift.as_ref(), platform)
        }
    }
}

fn resolve_s3(
    s3: &S3StorageSpec,
    recorded: Option<&S3StorageSpec>,
    platform: &PlatformMetadata,
) -> Result<NormalizedStorage, ValidationError> {
    let bucket = value(&s3.bucket)
        .or_else(|| recorded.and_then(|r| value(&r.bucket)))
        .unwrap_or_else(|| derive_medium_name(platform));

    // Region and endpoint stick to the recorded bucket identity: renaming
    // the bucket is a migration, changing only the region is not.
    let recorded_same_bucket =
        recorded.filter(|r| value(&r.bucket).as_deref() == Some(bucket.as_str()));

    let region = recorded_same_bucket
        .and_then(|r| value(&r.region))
        .or_else(|| value(&s3.region))
        .or_else(|| platform.region.clone());
    let Some(region) = region else {
        return Err(ValidationError::IncompleteStorageConfig {
            backend: "s3",
            missing: vec!["region"],
        });
    };

    let region_endpoint = value(&s3.region_endpoint)
        .or_else(|| recorded_same_bucket.and_then(|r| value(&r.region_endpoint)));

    Ok(NormalizedStorage::S3(S3Storage {
        bucket,
        region,
        region_endpoint,
        encrypt: s3.encrypt,
        key_id: value(&s3.key_id),
    }))
}

fn resolve_swift(
    swift: &SwiftStorageSpec,
    recorded: Option<&SwiftStorageSpec>,
    platform: &PlatformMetadata,
) -> Result<NormalizedStorage, ValidationError> {
    let auth_url = value(&swift.auth_url).or_else(|| recorded.and_then(|r| value(&r.auth_url)));
    let Some(auth_url) = auth_url else {
        return Err(ValidationError::IncompleteStorageConfig {
            backend: "swift",
            missing: vec!["authURL"],
        });
    };

    let container = value(&swift.container)
        .or_else(|| recorded.and_then(|r| value(&r.container)))
        .unwrap_or_else(|| derive_medium_name(platform));

    Ok(NormalizedStorage::Swift(SwiftStorage {
        auth_url,
        container,
    }))
}

/// Storage selection when the spec and the status are both silent
fn platform_default(platform: &PlatformMetadata) -> Result<NormalizedStorage, ValidationError> {
    match platform.platform {
        CloudPlatform::Aws => resolve_s3(&S3StorageSpec::default(), None, platform),
        CloudPlatform::Gcp => Ok(NormalizedStorage::Gcs(GcsStorage {
            bucket: derive_medium_name(platform),
        })),
        CloudPlatform::Azure => Ok(NormalizedStorage::Azure(AzureStorage {
            container: derive_medium_name(platform),
        })),
        CloudPlatform::OpenStack => {
            resolve_swift(&SwiftStorageSpec::default(), None, platform)
        }
        CloudPlatform::BareMetal => Ok(NormalizedStorage::Filesystem(FilesystemStorage {
            claim_name: None,
        })),
    }
}

/// Refuse to walk away from a managed medium toward a derived identity
fn transition_guard(
    to: &'static str,
    identity_specified: bool,
    recorded: &StorageSpec,
    managed: bool,
) -> Result<(), ValidationError> {
    if !managed || identity_specified {
        return Ok(());
    }
    let Some(&from) = recorded.configured().first() else {
        return Ok(());
    };
    if from != to {
        return Err(ValidationError::UnsupportedTransition {
            from: from.to_string(),
            to,
        });
    }
    Ok(())
}

/// Deterministic medium name for auto-provisioned storage
fn derive_medium_name(platform: &PlatformMetadata) -> String {
    let raw = format!("{}-image-registry", platform.cluster_name);
    let sanitized: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut name = sanitized.trim_matches('-').to_string();
    name.truncate(63);
    let name = name.trim_end_matches('-').to_string();
    if name.is_empty() {
        "image-registry".to_string()
    } else {
        name
    }
}

fn value(field: &Option<String>) -> Option<String> {
    field.as_ref().filter(|v| !v.is_empty()).cloned()
}
