//! Cluster client capability: the trait the release core drives, a kube-rs
//! adapter, and a recording mock for tests.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use capstan_manifests::VersionSet;

/// Imperative cluster operations the release lifecycle needs. Manifests are
/// multi-document YAML; operations apply per document in document order.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create every resource in the manifest.
    async fn create(&self, namespace: &str, manifest: &str) -> Result<()>;

    /// Reconcile from `current` to `target`: create missing resources,
    /// patch the rest, delete resources only `current` holds.
    async fn update(&self, namespace: &str, current: &str, target: &str) -> Result<()>;

    /// Delete every resource in the manifest.
    async fn delete(&self, namespace: &str, manifest: &str) -> Result<()>;

    /// Summarize the live state of the manifest's resources.
    async fn get(&self, namespace: &str, manifest: &str) -> Result<String>;

    /// Block until every resource in the manifest reports ready or the
    /// deadline passes.
    async fn watch_until_ready(&self, namespace: &str, manifest: &str) -> Result<()>;

    /// The api-versions the cluster serves.
    async fn api_versions(&self) -> Result<VersionSet>;
}

fn ready_timeout_secs() -> u64 {
    std::env::var("CAPSTAN_READY_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300)
}

/// One parsed manifest document plus its addressing fields.
#[derive(Debug)]
struct Doc {
    json: Json,
    gvk: GroupVersionKind,
    name: String,
}

impl Doc {
    fn key(&self) -> (String, String) {
        (self.gvk.kind.clone(), self.name.clone())
    }
}

fn is_blank(doc: &str) -> bool {
    doc.lines()
        .all(|l| l.trim().is_empty() || l.trim_start().starts_with('#'))
}

fn parse_docs(manifest: &str) -> Result<Vec<Doc>> {
    let mut docs = Vec::new();
    for raw in manifest.split("\n---\n") {
        if is_blank(raw) {
            continue;
        }
        let val: serde_yaml::Value = serde_yaml::from_str(raw).context("parsing manifest YAML")?;
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        let api_version = json
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest document missing apiVersion"))?
            .to_string();
        let kind = json
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest document missing kind"))?
            .to_string();
        let name = json
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest document missing metadata.name"))?
            .to_string();
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version),
        };
        docs.push(Doc {
            json,
            gvk: GroupVersionKind {
                group,
                version,
                kind,
            },
            name,
        });
    }
    Ok(docs)
}

/// kube-rs adapter with a per-instance discovery cache.
pub struct KubeCluster {
    client: Client,
    // GVK key -> (ApiResource, namespaced)
    discovery: RwLock<HashMap<String, (kube::core::ApiResource, bool)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(HashMap::new()),
        }
    }

    fn gvk_key(gvk: &GroupVersionKind) -> String {
        if gvk.group.is_empty() {
            format!("{}/{}", gvk.version, gvk.kind)
        } else {
            format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
        }
    }

    async fn find_api_resource(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(kube::core::ApiResource, bool)> {
        let key = Self::gvk_key(gvk);
        if let Some(hit) = self.discovery.read().expect("discovery lock").get(&key) {
            return Ok(hit.clone());
        }
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    self.discovery
                        .write()
                        .expect("discovery lock")
                        .insert(key, (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(anyhow!(
            "kind not served by the cluster: {}/{}/{}",
            gvk.group,
            gvk.version,
            gvk.kind
        ))
    }

    async fn api_for(&self, namespace: &str, doc: &Doc) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(&doc.gvk).await?;
        let api = if namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }
}

/// Kind-specific readiness: Jobs must complete, Pods must be ready or done,
/// anything else counts as ready once it exists.
fn is_ready(kind: &str, live: &Json) -> bool {
    let status = live.get("status");
    let condition_true = |want: &str| {
        status
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .map(|conds| {
                conds.iter().any(|c| {
                    c.get("type").and_then(|t| t.as_str()) == Some(want)
                        && c.get("status").and_then(|s| s.as_str()) == Some("True")
                })
            })
            .unwrap_or(false)
    };
    match kind {
        "Job" => {
            condition_true("Complete")
                || status
                    .and_then(|s| s.get("succeeded"))
                    .and_then(|v| v.as_u64())
                    .map(|n| n > 0)
                    .unwrap_or(false)
        }
        "Pod" => {
            let phase = status.and_then(|s| s.get("phase")).and_then(|p| p.as_str());
            phase == Some("Succeeded") || condition_true("Ready")
        }
        _ => true,
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create(&self, namespace: &str, manifest: &str) -> Result<()> {
        for doc in parse_docs(manifest)? {
            let api = self.api_for(namespace, &doc).await?;
            let obj: DynamicObject =
                serde_json::from_value(doc.json.clone()).context("shaping manifest document")?;
            api.create(&PostParams::default(), &obj)
                .await
                .with_context(|| format!("creating {}/{}", doc.gvk.kind, doc.name))?;
            debug!(kind = %doc.gvk.kind, name = %doc.name, ns = %namespace, "created resource");
        }
        Ok(())
    }

    async fn update(&self, namespace: &str, current: &str, target: &str) -> Result<()> {
        let target_docs = parse_docs(target)?;
        let target_keys: Vec<(String, String)> = target_docs.iter().map(Doc::key).collect();

        for doc in &target_docs {
            let api = self.api_for(namespace, doc).await?;
            let pp = PatchParams::apply("capstan").force();
            api.patch(&doc.name, &pp, &Patch::Apply(&doc.json))
                .await
                .with_context(|| format!("applying {}/{}", doc.gvk.kind, doc.name))?;
            debug!(kind = %doc.gvk.kind, name = %doc.name, ns = %namespace, "applied resource");
        }

        // Resources the old manifest held that the new one dropped.
        for doc in parse_docs(current)? {
            if target_keys.contains(&doc.key()) {
                continue;
            }
            let api = self.api_for(namespace, &doc).await?;
            match api.delete(&doc.name, &DeleteParams::default()).await {
                Ok(_) => info!(kind = %doc.gvk.kind, name = %doc.name, "pruned leftover resource"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("pruning {}/{}", doc.gvk.kind, doc.name))
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, manifest: &str) -> Result<()> {
        for doc in parse_docs(manifest)? {
            let api = self.api_for(namespace, &doc).await?;
            match api.delete(&doc.name, &DeleteParams::default()).await {
                Ok(_) => debug!(kind = %doc.gvk.kind, name = %doc.name, "deleted resource"),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    warn!(kind = %doc.gvk.kind, name = %doc.name, "resource already gone")
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("deleting {}/{}", doc.gvk.kind, doc.name))
                }
            }
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, manifest: &str) -> Result<String> {
        let mut out = String::new();
        for doc in parse_docs(manifest)? {
            let api = self.api_for(namespace, &doc).await?;
            let line = match api.get_opt(&doc.name).await? {
                Some(_) => format!("{}/{}: present\n", doc.gvk.kind, doc.name),
                None => format!("{}/{}: missing\n", doc.gvk.kind, doc.name),
            };
            out.push_str(&line);
        }
        Ok(out)
    }

    async fn watch_until_ready(&self, namespace: &str, manifest: &str) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(ready_timeout_secs());
        for doc in parse_docs(manifest)? {
            let api = self.api_for(namespace, &doc).await?;
            loop {
                match api.get_opt(&doc.name).await? {
                    Some(obj) => {
                        let live = serde_json::to_value(&obj)?;
                        if is_ready(&doc.gvk.kind, &live) {
                            debug!(kind = %doc.gvk.kind, name = %doc.name, "resource ready");
                            break;
                        }
                    }
                    None => {}
                }
                if Instant::now() >= deadline {
                    return Err(anyhow!(
                        "timed out waiting for {}/{} to become ready",
                        doc.gvk.kind,
                        doc.name
                    ));
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
        Ok(())
    }

    async fn api_versions(&self) -> Result<VersionSet> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut versions: Vec<String> = Vec::new();
        for group in discovery.groups() {
            for (ar, _) in group.recommended_resources() {
                let gv = if ar.group.is_empty() {
                    ar.version.clone()
                } else {
                    format!("{}/{}", ar.group, ar.version)
                };
                if !versions.contains(&gv) {
                    versions.push(gv);
                }
            }
        }
        if versions.is_empty() {
            return Ok(VersionSet::default());
        }
        Ok(VersionSet::new(versions))
    }
}

// ----------------- Recording mock -----------------

/// Operations the mock saw, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOp {
    Create { namespace: String, manifest: String },
    Update { namespace: String, target: String },
    Delete { namespace: String, manifest: String },
    Get { namespace: String },
    WatchUntilReady { namespace: String, manifest: String },
}

#[derive(Debug, Default)]
struct MockFailures {
    create: bool,
    update: bool,
    delete: bool,
    watch: bool,
}

/// Records every call; can be armed to fail a given operation. Serves tests
/// the way the kube adapter serves production.
#[derive(Default)]
pub struct MockCluster {
    ops: Mutex<Vec<ClusterOp>>,
    failures: Mutex<MockFailures>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(self) -> Self {
        self.failures.lock().expect("failures lock").create = true;
        self
    }

    pub fn fail_update(self) -> Self {
        self.failures.lock().expect("failures lock").update = true;
        self
    }

    pub fn fail_delete(self) -> Self {
        self.failures.lock().expect("failures lock").delete = true;
        self
    }

    pub fn fail_watch(self) -> Self {
        self.failures.lock().expect("failures lock").watch = true;
        self
    }

    pub fn ops(&self) -> Vec<ClusterOp> {
        self.ops.lock().expect("ops lock").clone()
    }

    fn record(&self, op: ClusterOp) {
        self.ops.lock().expect("ops lock").push(op);
    }

    fn should_fail(&self, pick: impl Fn(&MockFailures) -> bool) -> bool {
        pick(&self.failures.lock().expect("failures lock"))
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn create(&self, namespace: &str, manifest: &str) -> Result<()> {
        self.record(ClusterOp::Create {
            namespace: namespace.to_string(),
            manifest: manifest.to_string(),
        });
        if self.should_fail(|f| f.create) {
            return Err(anyhow!("mock create failure"));
        }
        Ok(())
    }

    async fn update(&self, namespace: &str, _current: &str, target: &str) -> Result<()> {
        self.record(ClusterOp::Update {
            namespace: namespace.to_string(),
            target: target.to_string(),
        });
        if self.should_fail(|f| f.update) {
            return Err(anyhow!("mock update failure"));
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, manifest: &str) -> Result<()> {
        self.record(ClusterOp::Delete {
            namespace: namespace.to_string(),
            manifest: manifest.to_string(),
        });
        if self.should_fail(|f| f.delete) {
            return Err(anyhow!("mock delete failure"));
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, _manifest: &str) -> Result<String> {
        self.record(ClusterOp::Get {
            namespace: namespace.to_string(),
        });
        Ok("resources: ok\n".to_string())
    }

    async fn watch_until_ready(&self, namespace: &str, manifest: &str) -> Result<()> {
        self.record(ClusterOp::WatchUntilReady {
            namespace: namespace.to_string(),
            manifest: manifest.to_string(),
        });
        if self.should_fail(|f| f.watch) {
            return Err(anyhow!("mock readiness failure"));
        }
        Ok(())
    }

    async fn api_versions(&self) -> Result<VersionSet> {
        Ok(VersionSet::default())
    }
}
