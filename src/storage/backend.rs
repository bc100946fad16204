//! Storage backend collaborator
//!
//! Provider SDK integrations live behind this trait. The reconciler only
//! ever asks for an observation or fires one of the idempotent mutation
//! calls; confirmation always comes from the next observation.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::storage::NormalizedStorage;

/// Observed state of a storage medium
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageState {
    /// The medium (bucket, container, volume) exists
    pub exists: bool,

    /// Operator tags are present (None = not applicable for the backend)
    pub tagged: Option<bool>,

    /// Server-side encryption is configured (None = not applicable)
    pub encrypted: Option<bool>,

    /// Incomplete-upload cleanup is configured (None = not applicable)
    pub upload_cleanup: Option<bool>,
}

impl StorageState {
    /// State of a medium that does not exist yet
    pub fn absent() -> Self {
        Self::default()
    }
}

/// Storage provider operations the reconciler relies on
///
/// Every mutation must be idempotent: re-invoking against an already
/// converged medium is a no-op.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Observe the medium backing the given storage selection
    async fn observe(&self, target: &NormalizedStorage) -> Result<StorageState>;

    /// Create the medium
    async fn provision(&self, target: &NormalizedStorage) -> Result<()>;

    /// Apply operator ownership tags to the medium
    async fn tag(&self, target: &NormalizedStorage) -> Result<()>;

    /// Configure server-side encryption on the medium
    async fn set_encryption(&self, target: &NormalizedStorage) -> Result<()>;

    /// Configure incomplete-upload cleanup on the medium
    async fn enable_upload_cleanup(&self, target: &NormalizedStorage) -> Result<()>;

    /// Delete the medium
    async fn remove(&self, target: &NormalizedStorage) -> Result<()>;
}

/// Backend used until a provider integration is injected
///
/// Filesystem storage is fully handled (the volume rides along with the
/// registry deployment, so there is nothing to provision). Object-store
/// targets observe as absent and refuse mutations, which surfaces as
/// ProvisioningFailed in the resource conditions until a real provider
/// backend is wired into the context.
pub struct DefaultStorageBackend;

impl DefaultStorageBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultStorageBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for DefaultStorageBackend {
    async fn observe(&self, target: &NormalizedStorage) -> Result<StorageState> {
        match target {
            NormalizedStorage::Filesystem(_) => Ok(StorageState {
                exists: true,
                ..StorageState::default()
            }),
            _ => Ok(StorageState::absent()),
        }
    }

    async fn provision(&self, target: &NormalizedStorage) -> Result<()> {
        match target {
            NormalizedStorage::Filesystem(_) => Ok(()),
            other => Err(no_provider(other)),
        }
    }

    async fn tag(&self, target: &NormalizedStorage) -> Result<()> {
        match target {
            NormalizedStorage::Filesystem(_) => Ok(()),
            other => Err(no_provider(other)),
        }
    }

    async fn set_encryption(&self, target: &NormalizedStorage) -> Result<()> {
        match target {
            NormalizedStorage::Filesystem(_) => Ok(()),
            other => Err(no_provider(other)),
        }
    }

    async fn enable_upload_cleanup(&self, target: &NormalizedStorage) -> Result<()> {
        match target {
            NormalizedStorage::Filesystem(_) => Ok(()),
            other => Err(no_provider(other)),
        }
    }

    async fn remove(&self, target: &NormalizedStorage) -> Result<()> {
        match target {
            NormalizedStorage::Filesystem(_) => Ok(()),
            other => Err(no_provider(other)),
        }
    }
}

fn no_provider(target: &NormalizedStorage) -> Error {
    Error::storage(format!(
        "no storage provider configured for {} backend",
        target.backend()
    ))
}
