//! Wire-level request and response shapes. Framing belongs to the transport;
//! these types are the stable surface.

use serde::{Deserialize, Serialize};

use capstan_core::{Chart, Info, Release, Status, Values};

/// Per-request metadata the transport extracts for the handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// The client's reported semver, from the `x-helm-api-client` header.
    pub client_version: Option<String>,
}

impl RequestContext {
    pub fn client(version: impl Into<String>) -> Self {
        Self {
            client_version: Some(version.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallRequest {
    pub chart: Option<Chart>,
    #[serde(default)]
    pub values: Values,
    /// Empty means "generate one".
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub disable_hooks: bool,
    #[serde(default)]
    pub reuse_name: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub name: String,
    pub chart: Option<Chart>,
    #[serde(default)]
    pub values: Values,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub disable_hooks: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub name: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub disable_hooks: bool,
    /// Accepted for wire compatibility; the target is always the version
    /// directly before the deployed one.
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UninstallRequest {
    pub name: String,
    #[serde(default)]
    pub disable_hooks: bool,
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusRequest {
    pub name: String,
    /// 0 selects the deployed version.
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentRequest {
    pub name: String,
    /// 0 selects the deployed version.
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListSortBy {
    #[default]
    Name,
    LastReleased,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListSortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    /// 0 means "use the default page size".
    #[serde(default)]
    pub limit: u64,
    /// Cursor: the release name to resume from.
    #[serde(default)]
    pub offset: String,
    #[serde(default)]
    pub sort_by: ListSortBy,
    #[serde(default)]
    pub sort_order: ListSortOrder,
    /// Empty defaults to `[DEPLOYED]`.
    #[serde(default)]
    pub status_codes: Vec<Status>,
    /// Optional regex over release names.
    #[serde(default)]
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub count: u64,
    /// First name past this page; empty when the page is the last.
    pub next: String,
    pub total: u64,
    pub releases: Vec<Release>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub name: String,
    pub namespace: String,
    pub info: Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}
