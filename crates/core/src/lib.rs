//! Capstan core types: charts, values, releases, hooks.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod values;

pub use values::{render_context, ReleaseOptions, ValueError, Values};

/// Chart metadata as shipped in the bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    /// Optional render-engine selector; the default engine is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

/// A single template file: logical path plus source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub data: String,
}

/// A parameterized application bundle. Immutable within a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub templates: Vec<Template>,
    /// Default values as raw YAML, parsed at merge time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
}

/// Release status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Unknown,
    Deployed,
    Superseded,
    Deleted,
    Failed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Unknown => "UNKNOWN",
            Status::Deployed => "DEPLOYED",
            Status::Superseded => "SUPERSEDED",
            Status::Deleted => "DELETED",
            Status::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Bookkeeping attached to every release version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub first_deployed: DateTime<Utc>,
    pub last_deployed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Live resource summary; populated only on status responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<String>,
}

impl Info {
    pub fn new(status: Status, ts: DateTime<Utc>) -> Self {
        Self {
            first_deployed: ts,
            last_deployed: ts,
            deleted: None,
            status,
            notes: None,
            resources: None,
        }
    }
}

/// Lifecycle phases a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    PreInstall,
    PostInstall,
    PreDelete,
    PostDelete,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreInstall => "pre-install",
            HookEvent::PostInstall => "post-install",
            HookEvent::PreDelete => "pre-delete",
            HookEvent::PostDelete => "post-delete",
            HookEvent::PreUpgrade => "pre-upgrade",
            HookEvent::PostUpgrade => "post-upgrade",
            HookEvent::PreRollback => "pre-rollback",
            HookEvent::PostRollback => "post-rollback",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown tag in a hook annotation. The tag set is closed; anything else is
/// rejected up front rather than silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown hook event {0:?}")]
pub struct UnknownHookEvent(pub String);

impl std::str::FromStr for HookEvent {
    type Err = UnknownHookEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-install" => Ok(HookEvent::PreInstall),
            "post-install" => Ok(HookEvent::PostInstall),
            "pre-delete" => Ok(HookEvent::PreDelete),
            "post-delete" => Ok(HookEvent::PostDelete),
            "pre-upgrade" => Ok(HookEvent::PreUpgrade),
            "post-upgrade" => Ok(HookEvent::PostUpgrade),
            "pre-rollback" => Ok(HookEvent::PreRollback),
            "post-rollback" => Ok(HookEvent::PostRollback),
            other => Err(UnknownHookEvent(other.to_string())),
        }
    }
}

/// A one-shot resource tied to release lifecycle phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub name: String,
    pub kind: String,
    /// Template path the hook was rendered from.
    pub path: String,
    pub manifest: String,
    pub events: Vec<HookEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

/// A specific instantiation of a chart: the central entity.
///
/// Immutable once written except for `info.status` and `info.deleted`
/// transitions. Versions per name are gap-free starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub version: u32,
    pub chart: Chart,
    pub config: Values,
    /// The concatenated, sorted resource document.
    pub manifest: String,
    pub hooks: Vec<Hook>,
    pub info: Info,
}

pub mod prelude {
    pub use super::{
        Chart, ChartMetadata, Hook, HookEvent, Info, Release, ReleaseOptions, Status, Template,
        Values,
    };
}
