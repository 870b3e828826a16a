//! Release naming: validation, random generation, uniqueness probing.

#![forbid(unsafe_code)]

use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use tracing::{info, warn};

use capstan_core::Status;
use capstan_store::{Storage, StoreError};

/// Release names end up in resource name fields with tight caps, so the
/// limit stays well below the usual 63.
pub const MAX_NAME_LEN: usize = 14;

const MAX_GENERATE_TRIES: usize = 5;

static NAME_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static pattern"));

const DESCRIPTORS: &[&str] = &[
    "able", "amber", "best", "bold", "brave", "calm", "clear", "crisp", "daring", "deep",
    "eager", "early", "fancy", "fast", "fine", "fond", "free", "glad", "grand", "happy",
    "hardy", "jolly", "keen", "kind", "late", "lively", "lucky", "merry", "mild", "neat",
    "noble", "plain", "proud", "quick", "quiet", "rapid", "rare", "ready", "solid", "stout",
    "sunny", "swift", "tidy", "vivid", "warm", "wise", "young", "zesty",
];

const CREATURES: &[&str] = &[
    "ant", "badger", "bat", "bee", "bison", "boar", "crab", "crane", "deer", "dove",
    "eagle", "eel", "elk", "fox", "frog", "gull", "hare", "hawk", "heron", "horse",
    "ibis", "koala", "lark", "lemur", "lynx", "mole", "moose", "moth", "mouse", "newt",
    "otter", "owl", "panda", "pony", "quail", "raven", "seal", "shark", "sloth", "snail",
    "stork", "swan", "tapir", "toad", "trout", "vole", "wasp", "wren",
];

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("release name {0:?} exceeds max length of {MAX_NAME_LEN}")]
    TooLong(String),
    #[error("release name {0:?} is not a valid name")]
    InvalidName(String),
    #[error("a release named {0:?} already exists")]
    AlreadyExists(String),
    #[error("cannot re-use name {0:?}: it is still in use")]
    InUse(String),
    #[error("no available release name found after {MAX_GENERATE_TRIES} tries")]
    Exhausted,
    #[error(transparent)]
    Store(StoreError),
}

/// A granted name, recording whether it reoccupies a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    Fresh(String),
    /// A DELETED or FAILED release holds the name; install overwrites it.
    Reused(String),
}

impl Grant {
    pub fn name(&self) -> &str {
        match self {
            Grant::Fresh(n) | Grant::Reused(n) => n,
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, Grant::Reused(_))
    }
}

/// Grants unique release names against a store.
///
/// The probe-then-grant window is racy under concurrent installs of the
/// same name; the store's atomic `create` catches the loser.
pub struct NameAllocator {
    store: Arc<dyn Storage>,
}

impl NameAllocator {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Validate a requested name or generate one when `requested` is empty.
    pub async fn reserve(&self, requested: &str, reuse: bool) -> Result<Grant, NameError> {
        if requested.is_empty() {
            return self.generate().await;
        }

        if requested.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong(requested.to_string()));
        }
        if !NAME_SHAPE.is_match(requested) {
            return Err(NameError::InvalidName(requested.to_string()));
        }

        match self.store.get(requested, 1).await {
            Err(StoreError::NotFound { .. }) => Ok(Grant::Fresh(requested.to_string())),
            Err(e) => Err(NameError::Store(e)),
            Ok(rel) => {
                let st = rel.info.status;
                if reuse && (st == Status::Deleted || st == Status::Failed) {
                    info!(name = %requested, "reusing tombstoned release name");
                    Ok(Grant::Reused(requested.to_string()))
                } else if reuse {
                    Err(NameError::InUse(requested.to_string()))
                } else {
                    Err(NameError::AlreadyExists(requested.to_string()))
                }
            }
        }
    }

    async fn generate(&self) -> Result<Grant, NameError> {
        for _ in 0..MAX_GENERATE_TRIES {
            let name = random_name();
            match self.store.get(&name, 1).await {
                Err(StoreError::NotFound { .. }) => return Ok(Grant::Fresh(name)),
                Err(e) => return Err(NameError::Store(e)),
                Ok(_) => info!(name = %name, "generated name is taken; searching again"),
            }
        }
        warn!("no available release names after {} tries", MAX_GENERATE_TRIES);
        Err(NameError::Exhausted)
    }
}

fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let d = DESCRIPTORS.choose(&mut rng).expect("non-empty list");
    let c = CREATURES.choose(&mut rng).expect("non-empty list");
    let mut name = format!("{}-{}", d, c);
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use capstan_core::{Chart, Info, Release, Values};
    use capstan_store::{MemStore, StoreResult};
    use chrono::Utc;

    use super::*;

    fn rel(name: &str, status: Status) -> Release {
        Release {
            name: name.to_string(),
            namespace: "default".to_string(),
            version: 1,
            chart: Chart::default(),
            config: Values::default(),
            manifest: String::new(),
            hooks: vec![],
            info: Info::new(status, Utc::now()),
        }
    }

    async fn allocator_with(releases: Vec<Release>) -> NameAllocator {
        let store = MemStore::new();
        for r in releases {
            store.create(r).await.unwrap();
        }
        NameAllocator::new(Arc::new(store))
    }

    #[tokio::test]
    async fn free_requested_name_is_granted_fresh() {
        let a = allocator_with(vec![]).await;
        let grant = a.reserve("web", false).await.unwrap();
        assert_eq!(grant, Grant::Fresh("web".to_string()));
    }

    #[tokio::test]
    async fn taken_name_without_reuse_conflicts() {
        let a = allocator_with(vec![rel("web", Status::Deployed)]).await;
        let err = a.reserve("web", false).await.unwrap_err();
        assert!(matches!(err, NameError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn reuse_grants_tombstoned_names_only() {
        let a = allocator_with(vec![rel("dead", Status::Deleted), rel("live", Status::Deployed)])
            .await;
        assert_eq!(
            a.reserve("dead", true).await.unwrap(),
            Grant::Reused("dead".to_string())
        );
        assert!(matches!(
            a.reserve("live", true).await.unwrap_err(),
            NameError::InUse(_)
        ));
    }

    #[tokio::test]
    async fn reuse_grants_failed_names_too() {
        let a = allocator_with(vec![rel("broken", Status::Failed)]).await;
        assert!(a.reserve("broken", true).await.unwrap().is_reused());
    }

    #[tokio::test]
    async fn fourteen_chars_pass_fifteen_fail() {
        let a = allocator_with(vec![]).await;
        let exactly = "a".repeat(14);
        assert!(a.reserve(&exactly, false).await.is_ok());
        let over = "a".repeat(15);
        assert!(matches!(
            a.reserve(&over, false).await.unwrap_err(),
            NameError::TooLong(_)
        ));
    }

    #[tokio::test]
    async fn malformed_names_are_rejected() {
        let a = allocator_with(vec![]).await;
        for bad in ["-web", "web-", "Web", "my_app"] {
            assert!(
                matches!(a.reserve(bad, false).await.unwrap_err(), NameError::InvalidName(_)),
                "expected {:?} to be invalid",
                bad
            );
        }
    }

    #[tokio::test]
    async fn generated_names_fit_the_shape() {
        let a = allocator_with(vec![]).await;
        for _ in 0..32 {
            let grant = a.reserve("", false).await.unwrap();
            let name = grant.name();
            assert!(name.len() <= MAX_NAME_LEN);
            assert!(NAME_SHAPE.is_match(name), "bad generated name {:?}", name);
        }
    }

    /// A store whose every name is taken.
    struct FullStore;

    #[async_trait]
    impl Storage for FullStore {
        async fn create(&self, _rel: Release) -> StoreResult<()> {
            unimplemented!()
        }
        async fn update(&self, _rel: Release) -> StoreResult<()> {
            unimplemented!()
        }
        async fn get(&self, name: &str, _version: u32) -> StoreResult<Release> {
            Ok(rel(name, Status::Deployed))
        }
        async fn deployed(&self, _name: &str) -> StoreResult<Release> {
            unimplemented!()
        }
        async fn last(&self, _name: &str) -> StoreResult<Release> {
            unimplemented!()
        }
        async fn history(&self, _name: &str) -> StoreResult<Vec<Release>> {
            unimplemented!()
        }
        async fn list(
            &self,
            _pred: &(dyn for<'a> Fn(&'a Release) -> bool + Sync),
        ) -> StoreResult<Vec<Release>> {
            unimplemented!()
        }
        async fn delete(&self, _name: &str, _version: u32) -> StoreResult<Release> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn exhausted_after_five_collisions() {
        let a = NameAllocator::new(Arc::new(FullStore));
        let err = a.reserve("", false).await.unwrap_err();
        assert!(matches!(err, NameError::Exhausted));
    }
}
