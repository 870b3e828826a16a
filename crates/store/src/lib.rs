//! Release storage: the capability trait plus the in-memory and
//! cluster-Secret backends.

#![forbid(unsafe_code)]

use async_trait::async_trait;

use capstan_core::{Release, Status};

mod mem;
mod secret;

pub use mem::MemStore;
pub use secret::SecretStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("release {name:?} (v{version}) already exists")]
    AlreadyExists { name: String, version: u32 },
    #[error("release {name:?} not found")]
    NotFound { name: String },
    #[error("storage driver error: {0}")]
    Driver(String),
}

impl StoreError {
    pub fn not_found(name: &str) -> Self {
        StoreError::NotFound {
            name: name.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence capability for release records.
///
/// Records are immutable once written apart from status transitions, which
/// go through `update`. Backends must be safe for concurrent use, and
/// `create` must be atomic with respect to a concurrent `create` of the same
/// `(name, version)` so duplicate grants surface as `AlreadyExists`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write a new version. `AlreadyExists` if `(name, version)` is present.
    async fn create(&self, rel: Release) -> StoreResult<()>;

    /// Overwrite an existing version in place. `NotFound` if absent.
    async fn update(&self, rel: Release) -> StoreResult<()>;

    /// Exact `(name, version)` lookup.
    async fn get(&self, name: &str, version: u32) -> StoreResult<Release>;

    /// The unique DEPLOYED version under a name.
    async fn deployed(&self, name: &str) -> StoreResult<Release>;

    /// The highest version under a name, whatever its status.
    async fn last(&self, name: &str) -> StoreResult<Release>;

    /// Every version under a name, ascending.
    async fn history(&self, name: &str) -> StoreResult<Vec<Release>>;

    /// Every release matching the predicate. Order unspecified.
    async fn list(&self, pred: &(dyn for<'a> Fn(&'a Release) -> bool + Sync)) -> StoreResult<Vec<Release>>;

    /// Remove a version and hand back the removed record.
    async fn delete(&self, name: &str, version: u32) -> StoreResult<Release>;
}

pub(crate) fn is_deployed(rel: &Release) -> bool {
    rel.info.status == Status::Deployed
}
