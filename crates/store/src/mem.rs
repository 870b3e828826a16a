//! Transient in-memory backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::RwLock;

use capstan_core::Release;

use crate::{is_deployed, Storage, StoreError, StoreResult};

/// In-memory store: name -> version -> record. The write lock makes
/// check-then-insert atomic, so concurrent creates of the same key race
/// safely.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<HashMap<String, BTreeMap<u32, Release>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStore {
    async fn create(&self, rel: Release) -> StoreResult<()> {
        let mut map = self.inner.write().await;
        let versions = map.entry(rel.name.clone()).or_default();
        if versions.contains_key(&rel.version) {
            return Err(StoreError::AlreadyExists {
                name: rel.name,
                version: rel.version,
            });
        }
        versions.insert(rel.version, rel);
        counter!("store_create_total", 1u64);
        Ok(())
    }

    async fn update(&self, rel: Release) -> StoreResult<()> {
        let mut map = self.inner.write().await;
        let slot = map
            .get_mut(&rel.name)
            .and_then(|versions| versions.get_mut(&rel.version))
            .ok_or_else(|| StoreError::not_found(&rel.name))?;
        *slot = rel;
        counter!("store_update_total", 1u64);
        Ok(())
    }

    async fn get(&self, name: &str, version: u32) -> StoreResult<Release> {
        let map = self.inner.read().await;
        map.get(name)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| StoreError::not_found(name))
    }

    async fn deployed(&self, name: &str) -> StoreResult<Release> {
        let map = self.inner.read().await;
        map.get(name)
            .and_then(|versions| versions.values().rev().find(|r| is_deployed(r)))
            .cloned()
            .ok_or_else(|| StoreError::not_found(name))
    }

    async fn last(&self, name: &str) -> StoreResult<Release> {
        let map = self.inner.read().await;
        map.get(name)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| StoreError::not_found(name))
    }

    async fn history(&self, name: &str) -> StoreResult<Vec<Release>> {
        let map = self.inner.read().await;
        let versions = map.get(name).ok_or_else(|| StoreError::not_found(name))?;
        Ok(versions.values().cloned().collect())
    }

    async fn list(&self, pred: &(dyn for<'a> Fn(&'a Release) -> bool + Sync)) -> StoreResult<Vec<Release>> {
        let map = self.inner.read().await;
        Ok(map
            .values()
            .flat_map(|versions| versions.values())
            .filter(|r| pred(r))
            .cloned()
            .collect())
    }

    async fn delete(&self, name: &str, version: u32) -> StoreResult<Release> {
        let mut map = self.inner.write().await;
        let versions = map.get_mut(name).ok_or_else(|| StoreError::not_found(name))?;
        let removed = versions
            .remove(&version)
            .ok_or_else(|| StoreError::not_found(name))?;
        if versions.is_empty() {
            map.remove(name);
        }
        counter!("store_delete_total", 1u64);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use capstan_core::{Chart, Info, Status, Values};
    use chrono::Utc;

    use super::*;

    fn rel(name: &str, version: u32, status: Status) -> Release {
        Release {
            name: name.to_string(),
            namespace: "default".to_string(),
            version,
            chart: Chart::default(),
            config: Values::default(),
            manifest: String::new(),
            hooks: vec![],
            info: Info::new(status, Utc::now()),
        }
    }

    #[tokio::test]
    async fn create_then_get() {
        let s = MemStore::new();
        s.create(rel("web", 1, Status::Deployed)).await.unwrap();
        let got = s.get("web", 1).await.unwrap();
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let s = MemStore::new();
        s.create(rel("web", 1, Status::Deployed)).await.unwrap();
        let err = s.create(rel("web", 1, Status::Deployed)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { version: 1, .. }));
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let s = MemStore::new();
        let err = s.update(rel("web", 1, Status::Deployed)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        s.create(rel("web", 1, Status::Deployed)).await.unwrap();
        s.update(rel("web", 1, Status::Superseded)).await.unwrap();
        assert_eq!(s.get("web", 1).await.unwrap().info.status, Status::Superseded);
    }

    #[tokio::test]
    async fn deployed_finds_the_single_deployed_version() {
        let s = MemStore::new();
        s.create(rel("web", 1, Status::Superseded)).await.unwrap();
        s.create(rel("web", 2, Status::Deployed)).await.unwrap();
        assert_eq!(s.deployed("web").await.unwrap().version, 2);
        assert!(s.deployed("gone").await.is_err());
    }

    #[tokio::test]
    async fn last_reaches_tombstones() {
        let s = MemStore::new();
        s.create(rel("web", 1, Status::Deleted)).await.unwrap();
        assert!(s.deployed("web").await.is_err());
        assert_eq!(s.last("web").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn history_is_ascending() {
        let s = MemStore::new();
        s.create(rel("web", 2, Status::Deployed)).await.unwrap();
        s.create(rel("web", 1, Status::Superseded)).await.unwrap();
        let hist = s.history("web").await.unwrap();
        let versions: Vec<_> = hist.iter().map(|r| r.version).collect();
        assert_eq!(versions, [1, 2]);
    }

    #[tokio::test]
    async fn delete_returns_the_removed_record() {
        let s = MemStore::new();
        s.create(rel("web", 1, Status::Deleted)).await.unwrap();
        let removed = s.delete("web", 1).await.unwrap();
        assert_eq!(removed.version, 1);
        assert!(s.get("web", 1).await.is_err());
    }

    #[tokio::test]
    async fn list_applies_the_predicate() {
        let s = MemStore::new();
        s.create(rel("a", 1, Status::Deployed)).await.unwrap();
        s.create(rel("b", 1, Status::Failed)).await.unwrap();
        let out = s
            .list(&|r: &Release| r.info.status == Status::Deployed)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "a");
    }

    #[tokio::test]
    async fn concurrent_creates_of_the_same_key_yield_one_winner() {
        let s = Arc::new(MemStore::new());
        let a = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.create(rel("web", 1, Status::Unknown)).await })
        };
        let b = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.create(rel("web", 1, Status::Unknown)).await })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
        assert!(ra.is_ok() != rb.is_ok(), "exactly one create must win");
    }
}
