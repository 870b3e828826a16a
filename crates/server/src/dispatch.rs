//! Newline-delimited JSON dispatch over the release service. One request
//! envelope per line, one tagged reply per line.

use serde::Deserialize;
use serde_json::{json, Value};

use capstan_service::{
    ContentRequest, InstallRequest, ListRequest, ReleaseService, RequestContext, RollbackRequest,
    ServiceError, StatusRequest, UninstallRequest, UpdateRequest,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
enum Request {
    InstallRelease(InstallRequest),
    UpdateRelease(UpdateRequest),
    RollbackRelease(RollbackRequest),
    UninstallRelease(UninstallRequest),
    GetReleaseStatus(StatusRequest),
    GetReleaseContent(ContentRequest),
    ListReleases(ListRequest),
    GetVersion,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    /// Equivalent of the `x-helm-api-client` metadata header.
    #[serde(default)]
    client_version: Option<String>,
    #[serde(flatten)]
    request: Request,
}

fn reply<T: serde::Serialize>(res: Result<T, ServiceError>) -> Value {
    match res {
        Ok(v) => json!({ "ok": v }),
        Err(e) => json!({ "err": { "code": e.code(), "message": e.to_string() } }),
    }
}

pub async fn dispatch(svc: &ReleaseService, line: &str) -> Value {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(e) => {
            return json!({
                "err": { "code": "invalid_argument", "message": format!("bad request: {}", e) }
            })
        }
    };
    let ctx = RequestContext {
        client_version: envelope.client_version,
    };
    match envelope.request {
        Request::InstallRelease(req) => reply(svc.install_release(&ctx, req).await),
        Request::UpdateRelease(req) => reply(svc.update_release(&ctx, req).await),
        Request::RollbackRelease(req) => reply(svc.rollback_release(&ctx, req).await),
        Request::UninstallRelease(req) => reply(svc.uninstall_release(&ctx, req).await),
        Request::GetReleaseStatus(req) => reply(svc.get_release_status(&ctx, req).await),
        Request::GetReleaseContent(req) => reply(svc.get_release_content(&ctx, req).await),
        Request::ListReleases(req) => reply(svc.list_releases(&ctx, req).await),
        Request::GetVersion => json!({ "ok": svc.get_version() }),
    }
}
