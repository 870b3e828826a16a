//! The release lifecycle state machine over injected store, engine, and
//! cluster capabilities. Transport-agnostic: handlers take serializable
//! requests and return serializable responses, so an RPC layer can sit on
//! top without touching the core.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{info, warn};

use capstan_core::{Chart, Hook, HookEvent, Info, Release, ReleaseOptions, Status, Values};
use capstan_engine::EngineYard;
use capstan_kube::ClusterClient;
use capstan_manifests::{
    join_manifests, sort_manifests, split_manifests, SortOrder, NOTES_SUFFIX,
};
use capstan_names::NameAllocator;
use capstan_store::{Storage, StoreError};

mod error;
mod hooks;
mod list;
mod requests;
mod version;

pub use error::ServiceError;
pub use requests::{
    ContentRequest, InstallRequest, ListRequest, ListResponse, ListSortBy, ListSortOrder,
    RequestContext, RollbackRequest, StatusRequest, StatusResponse, UninstallRequest,
    UpdateRequest, VersionResponse,
};
pub use version::{is_compatible, CLIENT_VERSION_HEADER, VERSION};

use hooks::exec_hooks;

/// The release server core. All collaborators are injected.
pub struct ReleaseService {
    store: Arc<dyn Storage>,
    cluster: Arc<dyn ClusterClient>,
    yard: EngineYard,
    names: NameAllocator,
}

impl ReleaseService {
    pub fn new(store: Arc<dyn Storage>, cluster: Arc<dyn ClusterClient>, yard: EngineYard) -> Self {
        let names = NameAllocator::new(Arc::clone(&store));
        Self {
            store,
            cluster,
            yard,
            names,
        }
    }

    fn check_client(&self, ctx: &RequestContext) -> Result<(), ServiceError> {
        match ctx.client_version.as_deref() {
            Some(v) if is_compatible(v, VERSION) => Ok(()),
            _ => Err(ServiceError::IncompatibleVersion),
        }
    }

    /// Render the chart and sort the output into hooks, the joined manifest
    /// document, and the notes text.
    async fn render_resources(
        &self,
        chart: &Chart,
        values: &Values,
        opts: &ReleaseOptions,
    ) -> Result<(Vec<Hook>, String, Option<String>), ServiceError> {
        let ctx = capstan_core::render_context(chart, values, opts)?;
        let engine = self.yard.select(chart);
        let mut files = engine.render(chart, &ctx)?;

        // Notes render like any other template but are not a resource; pull
        // them out so the text survives into release info.
        let notes_keys: Vec<String> = files
            .keys()
            .filter(|k| k.ends_with(NOTES_SUFFIX))
            .cloned()
            .collect();
        let mut notes = None;
        for key in notes_keys {
            notes = files.remove(&key);
        }

        let versions = self
            .cluster
            .api_versions()
            .await
            .map_err(|e| ServiceError::Orchestrator(format!("{:#}", e)))?;
        let (hooks, manifests) = sort_manifests(&files, &versions, SortOrder::Install)?;
        Ok((hooks, join_manifests(&manifests), notes))
    }

    /// Persist a FAILED record (best-effort) and surface the original error.
    async fn fail(
        &self,
        mut rel: Release,
        overwrite: bool,
        err: ServiceError,
    ) -> Result<Release, ServiceError> {
        warn!(name = %rel.name, version = rel.version, error = %err, "release failed");
        rel.info.status = Status::Failed;
        let res = if overwrite {
            self.store.update(rel).await
        } else {
            self.store.create(rel).await
        };
        if let Err(e) = res {
            warn!(error = %e, "could not record failed release");
        }
        counter!("release_failed_total", 1u64);
        Err(err)
    }

    // ---------------- install ----------------

    pub async fn install_release(
        &self,
        ctx: &RequestContext,
        req: InstallRequest,
    ) -> Result<Release, ServiceError> {
        self.check_client(ctx)?;
        let t0 = Instant::now();
        let chart = req.chart.clone().ok_or(ServiceError::MissingChart)?;

        let grant = self.names.reserve(&req.name, req.reuse_name).await?;
        let ts = Utc::now();
        let opts = ReleaseOptions {
            name: grant.name().to_string(),
            namespace: req.namespace.clone(),
            time: ts,
        };
        info!(name = %grant.name(), ns = %req.namespace, chart = %chart.metadata.name, "install: rendering");
        let (hooks, manifest, notes) = self.render_resources(&chart, &req.values, &opts).await?;

        let mut release_info = Info::new(Status::Unknown, ts);
        release_info.notes = notes;
        let rel = Release {
            name: grant.name().to_string(),
            namespace: req.namespace.clone(),
            version: 1,
            chart,
            config: req.values.clone(),
            manifest,
            hooks,
            info: release_info,
        };

        if req.dry_run {
            info!(name = %rel.name, "install: dry run; nothing recorded");
            return Ok(rel);
        }

        let out = self.perform_install(rel, &req, grant.is_reused()).await;
        histogram!("install_ms", t0.elapsed().as_secs_f64() * 1000.0);
        out
    }

    async fn perform_install(
        &self,
        mut rel: Release,
        req: &InstallRequest,
        reused: bool,
    ) -> Result<Release, ServiceError> {
        if !req.disable_hooks {
            if let Err(e) = exec_hooks(
                &self.cluster,
                &mut rel.hooks,
                &rel.name,
                &rel.namespace,
                HookEvent::PreInstall,
            )
            .await
            {
                return self.fail(rel, reused, e).await;
            }
        }

        if let Err(e) = self.cluster.create(&rel.namespace, &rel.manifest).await {
            let err = ServiceError::Orchestrator(format!("{:#}", e));
            return self.fail(rel, reused, err).await;
        }

        if !req.disable_hooks {
            if let Err(e) = exec_hooks(
                &self.cluster,
                &mut rel.hooks,
                &rel.name,
                &rel.namespace,
                HookEvent::PostInstall,
            )
            .await
            {
                return self.fail(rel, reused, e).await;
            }
        }

        rel.info.status = Status::Deployed;
        // A racing install of the same name loses right here.
        if reused {
            self.store.update(rel.clone()).await?;
        } else {
            self.store.create(rel.clone()).await?;
        }
        counter!("install_ok_total", 1u64);
        info!(name = %rel.name, version = rel.version, "install: deployed");
        Ok(rel)
    }

    // ---------------- upgrade ----------------

    pub async fn update_release(
        &self,
        ctx: &RequestContext,
        req: UpdateRequest,
    ) -> Result<Release, ServiceError> {
        self.check_client(ctx)?;
        let t0 = Instant::now();
        if req.name.is_empty() {
            return Err(ServiceError::MissingRelease);
        }
        let chart = req.chart.clone().ok_or(ServiceError::MissingChart)?;

        let current = self.store.deployed(&req.name).await?;
        let ts = Utc::now();
        let opts = ReleaseOptions {
            name: req.name.clone(),
            namespace: current.namespace.clone(),
            time: ts,
        };
        info!(name = %req.name, from = current.version, "upgrade: rendering");
        let (hooks, manifest, notes) = self.render_resources(&chart, &req.values, &opts).await?;

        let mut release_info = Info::new(Status::Unknown, ts);
        release_info.first_deployed = current.info.first_deployed;
        release_info.notes = notes;
        let updated = Release {
            name: req.name.clone(),
            namespace: current.namespace.clone(),
            version: current.version + 1,
            chart,
            config: req.values.clone(),
            manifest,
            hooks,
            info: release_info,
        };

        if req.dry_run {
            info!(name = %updated.name, "upgrade: dry run; nothing recorded");
            return Ok(updated);
        }

        let out = self
            .perform_update(
                current,
                updated,
                req.disable_hooks,
                HookEvent::PreUpgrade,
                HookEvent::PostUpgrade,
            )
            .await;
        histogram!("upgrade_ms", t0.elapsed().as_secs_f64() * 1000.0);
        out
    }

    /// Shared apply path for upgrade and rollback: hooks around a cluster
    /// update, then supersede the predecessor and record the new version.
    async fn perform_update(
        &self,
        mut current: Release,
        mut updated: Release,
        disable_hooks: bool,
        pre: HookEvent,
        post: HookEvent,
    ) -> Result<Release, ServiceError> {
        if !disable_hooks {
            if let Err(e) = exec_hooks(
                &self.cluster,
                &mut updated.hooks,
                &updated.name,
                &updated.namespace,
                pre,
            )
            .await
            {
                return self.fail(updated, false, e).await;
            }
        }

        if let Err(e) = self
            .cluster
            .update(&updated.namespace, &current.manifest, &updated.manifest)
            .await
        {
            let err = ServiceError::Orchestrator(format!("{:#}", e));
            return self.fail(updated, false, err).await;
        }

        if !disable_hooks {
            if let Err(e) = exec_hooks(
                &self.cluster,
                &mut updated.hooks,
                &updated.name,
                &updated.namespace,
                post,
            )
            .await
            {
                return self.fail(updated, false, e).await;
            }
        }

        current.info.status = Status::Superseded;
        self.store.update(current).await?;

        updated.info.status = Status::Deployed;
        self.store.create(updated.clone()).await?;
        counter!("upgrade_ok_total", 1u64);
        info!(name = %updated.name, version = updated.version, "deployed");
        Ok(updated)
    }

    // ---------------- rollback ----------------

    pub async fn rollback_release(
        &self,
        ctx: &RequestContext,
        req: RollbackRequest,
    ) -> Result<Release, ServiceError> {
        self.check_client(ctx)?;
        let t0 = Instant::now();
        if req.name.is_empty() {
            return Err(ServiceError::MissingRelease);
        }

        let current = self.store.deployed(&req.name).await?;
        if current.version < 2 {
            return Err(ServiceError::NotFound(format!(
                "release {:?} has no previous version",
                req.name
            )));
        }
        let previous = self.store.get(&req.name, current.version - 1).await?;
        info!(name = %req.name, from = current.version, to = previous.version, "rollback: preparing");

        let ts = Utc::now();
        let mut release_info = Info::new(Status::Unknown, ts);
        release_info.first_deployed = current.info.first_deployed;
        release_info.notes = previous.info.notes.clone();
        let target = Release {
            name: req.name.clone(),
            namespace: current.namespace.clone(),
            version: current.version + 1,
            chart: previous.chart.clone(),
            config: previous.config.clone(),
            manifest: previous.manifest.clone(),
            hooks: previous.hooks.clone(),
            info: release_info,
        };

        if req.dry_run {
            info!(name = %target.name, "rollback: dry run; nothing recorded");
            return Ok(target);
        }

        let out = self
            .perform_update(
                current,
                target,
                req.disable_hooks,
                HookEvent::PreRollback,
                HookEvent::PostRollback,
            )
            .await;
        histogram!("rollback_ms", t0.elapsed().as_secs_f64() * 1000.0);
        out
    }

    // ---------------- uninstall ----------------

    pub async fn uninstall_release(
        &self,
        ctx: &RequestContext,
        req: UninstallRequest,
    ) -> Result<Release, ServiceError> {
        self.check_client(ctx)?;
        let t0 = Instant::now();
        if req.name.is_empty() {
            return Err(ServiceError::MissingRelease);
        }

        // Tombstoned releases (DELETED, FAILED) are not deployed but must
        // stay reachable for purge and cleanup.
        let mut rel = match self.store.deployed(&req.name).await {
            Ok(r) => r,
            Err(StoreError::NotFound { .. }) => self.store.last(&req.name).await?,
            Err(e) => return Err(e.into()),
        };

        if rel.info.status == Status::Deleted {
            if req.purge {
                let removed = self.store.delete(&rel.name, rel.version).await?;
                info!(name = %req.name, "uninstall: purged tombstone");
                return Ok(removed);
            }
            return Err(ServiceError::NotFound(format!(
                "release {:?} is already deleted",
                req.name
            )));
        }

        info!(name = %req.name, version = rel.version, "uninstall: deleting release");
        rel.info.status = Status::Deleted;
        rel.info.deleted = Some(Utc::now());

        if !req.disable_hooks {
            exec_hooks(
                &self.cluster,
                &mut rel.hooks,
                &rel.name,
                &rel.namespace,
                HookEvent::PreDelete,
            )
            .await?;
        }

        // Re-sort the stored document under the current table so a priority
        // change applies to releases installed before it.
        let versions = self
            .cluster
            .api_versions()
            .await
            .map_err(|e| ServiceError::Orchestrator(format!("{:#}", e)))?;
        let files = split_manifests(&rel.manifest);
        let (_, manifests) = sort_manifests(&files, &versions, SortOrder::Uninstall)?;
        for m in &manifests {
            self.cluster
                .delete(&rel.namespace, &m.content)
                .await
                .map_err(|e| {
                    ServiceError::Orchestrator(format!("deleting {}: {:#}", m.name, e))
                })?;
        }

        if !req.disable_hooks {
            exec_hooks(
                &self.cluster,
                &mut rel.hooks,
                &rel.name,
                &rel.namespace,
                HookEvent::PostDelete,
            )
            .await?;
        }

        if req.purge {
            self.store.delete(&rel.name, rel.version).await?;
        } else {
            self.store.update(rel.clone()).await?;
        }
        counter!("uninstall_ok_total", 1u64);
        histogram!("uninstall_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(rel)
    }

    // ---------------- status / content / version ----------------

    pub async fn get_release_status(
        &self,
        ctx: &RequestContext,
        req: StatusRequest,
    ) -> Result<StatusResponse, ServiceError> {
        self.check_client(ctx)?;
        if req.name.is_empty() {
            return Err(ServiceError::MissingRelease);
        }
        let rel = if req.version == 0 {
            self.store.deployed(&req.name).await?
        } else {
            self.store.get(&req.name, req.version).await?
        };

        let mut release_info = rel.info.clone();
        // The stored status is the whole story for dead releases; everything
        // else gets checked against the cluster.
        if !matches!(release_info.status, Status::Deleted | Status::Failed) {
            let resources = self
                .cluster
                .get(&rel.namespace, &rel.manifest)
                .await
                .map_err(|e| {
                    warn!(name = %rel.name, error = %format!("{:#}", e), "live resource check failed");
                    ServiceError::Orchestrator(format!("{:#}", e))
                })?;
            release_info.resources = Some(resources);
        }
        Ok(StatusResponse {
            name: rel.name,
            namespace: rel.namespace,
            info: release_info,
        })
    }

    pub async fn get_release_content(
        &self,
        ctx: &RequestContext,
        req: ContentRequest,
    ) -> Result<Release, ServiceError> {
        self.check_client(ctx)?;
        if req.name.is_empty() {
            return Err(ServiceError::MissingRelease);
        }
        let rel = if req.version == 0 {
            self.store.deployed(&req.name).await?
        } else {
            self.store.get(&req.name, req.version).await?
        };
        Ok(rel)
    }

    /// No compatibility check: every client may ask for the version.
    pub fn get_version(&self) -> VersionResponse {
        VersionResponse {
            version: VERSION.to_string(),
        }
    }
}
