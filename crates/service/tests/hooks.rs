#![forbid(unsafe_code)]

use std::sync::Arc;

use capstan_core::{Chart, ChartMetadata, Status, Template};
use capstan_engine::EngineYard;
use capstan_kube::{ClusterOp, MockCluster};
use capstan_service::{
    InstallRequest, ReleaseService, RequestContext, ServiceError, UninstallRequest, VERSION,
};
use capstan_store::{MemStore, Storage};

const CONFIGMAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n";
const PRE_INSTALL_JOB: &str = "apiVersion: v1\nkind: Job\nmetadata:\n  name: migrate\n  annotations:\n    \"helm.sh/hook\": pre-install\n";
const DELETE_HOOKS_JOB: &str = "apiVersion: v1\nkind: Job\nmetadata:\n  name: cleanup\n  annotations:\n    \"helm.sh/hook\": pre-delete, post-delete\n";

fn chart_with(templates: &[(&str, &str)]) -> Chart {
    Chart {
        metadata: ChartMetadata {
            name: "foo".into(),
            version: "0.1.0".into(),
            engine: None,
        },
        templates: templates
            .iter()
            .map(|(name, data)| Template {
                name: name.to_string(),
                data: data.to_string(),
            })
            .collect(),
        values: None,
    }
}

fn ctx() -> RequestContext {
    RequestContext::client(VERSION)
}

fn install_req(name: &str, templates: &[(&str, &str)]) -> InstallRequest {
    InstallRequest {
        chart: Some(chart_with(templates)),
        name: name.to_string(),
        namespace: "default".to_string(),
        ..InstallRequest::default()
    }
}

#[tokio::test]
async fn hooks_are_excluded_from_the_manifest_and_run_first() {
    let store = Arc::new(MemStore::new());
    let cluster = Arc::new(MockCluster::new());
    let svc = ReleaseService::new(store, cluster.clone(), EngineYard::default());

    let rel = svc
        .install_release(
            &ctx(),
            install_req("web", &[("hook.yaml", PRE_INSTALL_JOB), ("cm.yaml", CONFIGMAP)]),
        )
        .await
        .unwrap();

    assert!(!rel.manifest.contains("kind: Job"));
    assert_eq!(rel.hooks.len(), 1);
    assert!(rel.hooks[0].last_run.is_some());

    let ops = cluster.ops();
    // hook submit, hook readiness, then the release manifest
    assert!(matches!(&ops[0], ClusterOp::Create { manifest, .. } if manifest.contains("kind: Job")));
    assert!(matches!(&ops[1], ClusterOp::WatchUntilReady { .. }));
    assert!(
        matches!(&ops[2], ClusterOp::Create { manifest, .. } if manifest.contains("kind: ConfigMap"))
    );
}

#[tokio::test]
async fn disable_hooks_skips_them() {
    let store = Arc::new(MemStore::new());
    let cluster = Arc::new(MockCluster::new());
    let svc = ReleaseService::new(store, cluster.clone(), EngineYard::default());

    let mut req = install_req("web", &[("hook.yaml", PRE_INSTALL_JOB), ("cm.yaml", CONFIGMAP)]);
    req.disable_hooks = true;
    let rel = svc.install_release(&ctx(), req).await.unwrap();

    assert_eq!(rel.info.status, Status::Deployed);
    assert!(rel.hooks[0].last_run.is_none());
    let ops = cluster.ops();
    assert_eq!(ops.len(), 1);
    assert!(matches!(&ops[0], ClusterOp::Create { manifest, .. } if manifest.contains("ConfigMap")));
}

#[tokio::test]
async fn hook_readiness_failure_records_a_failed_release() {
    let store = Arc::new(MemStore::new());
    let cluster = Arc::new(MockCluster::new().fail_watch());
    let svc = ReleaseService::new(store.clone(), cluster.clone(), EngineYard::default());

    let err = svc
        .install_release(
            &ctx(),
            install_req("web", &[("hook.yaml", PRE_INSTALL_JOB), ("cm.yaml", CONFIGMAP)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::HookFailed(_)));
    assert_eq!(store.get("web", 1).await.unwrap().info.status, Status::Failed);
    // The release manifest was never applied.
    assert!(!cluster
        .ops()
        .iter()
        .any(|op| matches!(op, ClusterOp::Create { manifest, .. } if manifest.contains("ConfigMap"))));
}

#[tokio::test]
async fn uninstall_brackets_deletion_with_delete_hooks() {
    let store = Arc::new(MemStore::new());
    let cluster = Arc::new(MockCluster::new());
    let svc = ReleaseService::new(store, cluster.clone(), EngineYard::default());

    svc.install_release(
        &ctx(),
        install_req("web", &[("hook.yaml", DELETE_HOOKS_JOB), ("cm.yaml", CONFIGMAP)]),
    )
    .await
    .unwrap();
    let before = cluster.ops().len();

    svc.uninstall_release(
        &ctx(),
        UninstallRequest {
            name: "web".into(),
            ..UninstallRequest::default()
        },
    )
    .await
    .unwrap();

    let ops = cluster.ops()[before..].to_vec();
    // pre-delete hook, resource deletion, post-delete hook
    assert!(matches!(&ops[0], ClusterOp::Create { manifest, .. } if manifest.contains("kind: Job")));
    assert!(matches!(&ops[1], ClusterOp::WatchUntilReady { .. }));
    assert!(matches!(&ops[2], ClusterOp::Delete { .. }));
    assert!(matches!(&ops[3], ClusterOp::Create { manifest, .. } if manifest.contains("kind: Job")));
    assert!(matches!(&ops[4], ClusterOp::WatchUntilReady { .. }));
}

#[tokio::test]
async fn unknown_hook_tag_fails_the_install() {
    let store = Arc::new(MemStore::new());
    let cluster = Arc::new(MockCluster::new());
    let svc = ReleaseService::new(store.clone(), cluster, EngineYard::default());

    let bad = "apiVersion: v1\nkind: Job\nmetadata:\n  name: j\n  annotations:\n    \"helm.sh/hook\": crd-install\n";
    let err = svc
        .install_release(&ctx(), install_req("web", &[("hook.yaml", bad)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnknownHookEvent(_)));
    // Nothing recorded: the sort failed before anything was applied.
    assert!(store.get("web", 1).await.is_err());
}
