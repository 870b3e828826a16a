//! Sequential hook execution against the cluster.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use capstan_core::{Hook, HookEvent};
use capstan_kube::ClusterClient;

use crate::error::ServiceError;

/// Run every hook subscribed to `event`, in list order: submit the manifest,
/// then block until the resource is ready. The first failure aborts; later
/// hooks are skipped and nothing is retried.
pub(crate) async fn exec_hooks(
    cluster: &Arc<dyn ClusterClient>,
    hooks: &mut [Hook],
    release: &str,
    namespace: &str,
    event: HookEvent,
) -> Result<(), ServiceError> {
    info!(release = %release, event = %event, "executing hooks");
    for hook in hooks.iter_mut().filter(|h| h.events.contains(&event)) {
        cluster
            .create(namespace, &hook.manifest)
            .await
            .map_err(|e| ServiceError::Orchestrator(format!("hook {}: {:#}", hook.path, e)))?;
        cluster
            .watch_until_ready(namespace, &hook.manifest)
            .await
            .map_err(|e| ServiceError::HookFailed(format!("{}: {:#}", hook.path, e)))?;
        hook.last_run = Some(Utc::now());
    }
    info!(release = %release, event = %event, "hooks complete");
    Ok(())
}
