//! Cluster-Secret backend: one Secret per `(name, version)` with the record
//! as an opaque blob plus labels for queryability.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use metrics::{counter, histogram};

use capstan_core::Release;

use crate::{is_deployed, Storage, StoreError, StoreResult};

const OWNER_LABEL: &str = "owner";
const OWNER: &str = "capstan";
const NAME_LABEL: &str = "name";
const VERSION_LABEL: &str = "version";
const STATUS_LABEL: &str = "status";
const RECORD_KEY: &str = "release";

/// Secret-backed store. Survives server restarts; one Secret named
/// `<name>.v<version>` per record.
pub struct SecretStore {
    api: Api<Secret>,
}

impl SecretStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn secret_name(name: &str, version: u32) -> String {
        format!("{}.v{}", name, version)
    }

    fn to_secret(rel: &Release) -> StoreResult<Secret> {
        let blob = serde_json::to_vec(rel).map_err(|e| StoreError::Driver(e.to_string()))?;
        let mut labels = BTreeMap::new();
        labels.insert(OWNER_LABEL.to_string(), OWNER.to_string());
        labels.insert(NAME_LABEL.to_string(), rel.name.clone());
        labels.insert(VERSION_LABEL.to_string(), rel.version.to_string());
        labels.insert(STATUS_LABEL.to_string(), rel.info.status.to_string());
        let mut data = BTreeMap::new();
        data.insert(RECORD_KEY.to_string(), ByteString(blob));
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(Self::secret_name(&rel.name, rel.version)),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Secret::default()
        })
    }

    fn from_secret(secret: &Secret) -> StoreResult<Release> {
        let blob = secret
            .data
            .as_ref()
            .and_then(|d| d.get(RECORD_KEY))
            .ok_or_else(|| StoreError::Driver("secret is missing the release blob".into()))?;
        serde_json::from_slice(&blob.0).map_err(|e| StoreError::Driver(e.to_string()))
    }

    async fn select(&self, selector: &str) -> StoreResult<Vec<Release>> {
        let started = std::time::Instant::now();
        let lp = ListParams::default().labels(selector);
        let secrets = self.api.list(&lp).await.map_err(driver_err)?;
        let out: StoreResult<Vec<Release>> =
            secrets.items.iter().map(Self::from_secret).collect();
        histogram!("store_secret_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        out
    }
}

fn driver_err(e: kube::Error) -> StoreError {
    StoreError::Driver(e.to_string())
}

fn status_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

#[async_trait]
impl Storage for SecretStore {
    async fn create(&self, rel: Release) -> StoreResult<()> {
        let secret = Self::to_secret(&rel)?;
        match self.api.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                counter!("store_create_total", 1u64);
                Ok(())
            }
            Err(e) if status_code(&e) == Some(409) => Err(StoreError::AlreadyExists {
                name: rel.name,
                version: rel.version,
            }),
            Err(e) => Err(driver_err(e)),
        }
    }

    async fn update(&self, rel: Release) -> StoreResult<()> {
        let key = Self::secret_name(&rel.name, rel.version);
        match self.api.get(&key).await {
            Ok(_) => {}
            Err(e) if status_code(&e) == Some(404) => {
                return Err(StoreError::not_found(&rel.name))
            }
            Err(e) => return Err(driver_err(e)),
        }
        let secret = Self::to_secret(&rel)?;
        self.api
            .patch(&key, &PatchParams::default(), &Patch::Merge(&secret))
            .await
            .map_err(driver_err)?;
        counter!("store_update_total", 1u64);
        Ok(())
    }

    async fn get(&self, name: &str, version: u32) -> StoreResult<Release> {
        match self.api.get(&Self::secret_name(name, version)).await {
            Ok(secret) => Self::from_secret(&secret),
            Err(e) if status_code(&e) == Some(404) => Err(StoreError::not_found(name)),
            Err(e) => Err(driver_err(e)),
        }
    }

    async fn deployed(&self, name: &str) -> StoreResult<Release> {
        let selector = format!(
            "{}={},{}={},{}=DEPLOYED",
            OWNER_LABEL, OWNER, NAME_LABEL, name, STATUS_LABEL
        );
        self.select(&selector)
            .await?
            .into_iter()
            .filter(|r| is_deployed(r))
            .max_by_key(|r| r.version)
            .ok_or_else(|| StoreError::not_found(name))
    }

    async fn last(&self, name: &str) -> StoreResult<Release> {
        let selector = format!("{}={},{}={}", OWNER_LABEL, OWNER, NAME_LABEL, name);
        self.select(&selector)
            .await?
            .into_iter()
            .max_by_key(|r| r.version)
            .ok_or_else(|| StoreError::not_found(name))
    }

    async fn history(&self, name: &str) -> StoreResult<Vec<Release>> {
        let selector = format!("{}={},{}={}", OWNER_LABEL, OWNER, NAME_LABEL, name);
        let mut out = self.select(&selector).await?;
        if out.is_empty() {
            return Err(StoreError::not_found(name));
        }
        out.sort_by_key(|r| r.version);
        Ok(out)
    }

    async fn list(&self, pred: &(dyn for<'a> Fn(&'a Release) -> bool + Sync)) -> StoreResult<Vec<Release>> {
        let selector = format!("{}={}", OWNER_LABEL, OWNER);
        Ok(self
            .select(&selector)
            .await?
            .into_iter()
            .filter(|r| pred(r))
            .collect())
    }

    async fn delete(&self, name: &str, version: u32) -> StoreResult<Release> {
        let removed = self.get(name, version).await?;
        self.api
            .delete(&Self::secret_name(name, version), &DeleteParams::default())
            .await
            .map_err(driver_err)?;
        counter!("store_delete_total", 1u64);
        Ok(removed)
    }
}
