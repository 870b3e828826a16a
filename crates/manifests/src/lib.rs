//! Manifest ordering: split rendered files into hooks and resources and put
//! them in the right apply order for the cluster.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_yaml::Value as Yaml;

use capstan_core::{Hook, HookEvent, UnknownHookEvent};

/// Annotation key that marks a rendered file as a lifecycle hook.
pub const HOOK_ANNOTATION: &str = "helm.sh/hook";

/// Rendered notes files are not resources; callers pull them out, and the
/// sorter skips any stragglers.
pub const NOTES_SUFFIX: &str = "NOTES.txt";

/// The api-versions the target cluster serves.
#[derive(Debug, Clone)]
pub struct VersionSet(HashSet<String>);

impl VersionSet {
    pub fn new<I, S>(versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(versions.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, version: &str) -> bool {
        self.0.contains(version)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for VersionSet {
    /// The fallback when discovery returns nothing.
    fn default() -> Self {
        Self::new(["v1"])
    }
}

/// Direction the manifests are sorted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Install,
    Uninstall,
}

/// A resource manifest tagged with its position in the apply order.
#[derive(Debug, Clone)]
pub struct IndexedManifest {
    /// Logical file path the manifest was rendered from.
    pub name: String,
    pub content: String,
    pub kind: String,
    pub ordinal: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SortError {
    #[error("manifest {name:?}: unable to parse YAML head: {source}")]
    HeadParse {
        name: String,
        source: serde_yaml::Error,
    },
    #[error("manifest {name:?} is missing a kind")]
    MissingKind { name: String },
    #[error("manifest {name:?}: apiVersion {version:?} is not available")]
    UnknownApiVersion { name: String, version: String },
    #[error("manifest {name:?}: {source}")]
    UnknownHookEvent {
        name: String,
        source: UnknownHookEvent,
    },
}

// Infrastructure kinds first, workloads after. Unknown kinds land past the
// end of the table.
const INSTALL_ORDER: &[&str] = &[
    "Namespace",
    "Secret",
    "ConfigMap",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ServiceAccount",
    "Role",
    "RoleBinding",
    "Service",
    "Pod",
    "ReplicationController",
    "Deployment",
    "DaemonSet",
    "StatefulSet",
    "Job",
    "CronJob",
];

fn ordinal_for(kind: &str, order: SortOrder) -> usize {
    let pos = INSTALL_ORDER.iter().position(|k| *k == kind);
    match order {
        SortOrder::Install => pos.unwrap_or(INSTALL_ORDER.len()),
        // Exact reverse at the kind level: unknown kinds first.
        SortOrder::Uninstall => match pos {
            Some(p) => INSTALL_ORDER.len() - p,
            None => 0,
        },
    }
}

#[derive(Debug, Default, Deserialize)]
struct HeadMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    annotations: BTreeMap<String, Yaml>,
}

/// The fields we care about in a document head.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocHead {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    metadata: Option<HeadMetadata>,
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whitespace-or-comments-only content carries no resource.
fn is_blank(content: &str) -> bool {
    content
        .lines()
        .all(|l| l.trim().is_empty() || l.trim_start().starts_with('#'))
}

fn parse_events(raw: &str, name: &str) -> Result<Vec<HookEvent>, SortError> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<HookEvent>()
                .map_err(|source| SortError::UnknownHookEvent {
                    name: name.to_string(),
                    source,
                })
        })
        .collect()
}

/// Split rendered files into lifecycle hooks and ordered resource manifests.
///
/// Partials (`_`-prefixed basenames) and notes files are skipped; blank
/// documents are dropped. Every surviving document must carry a known kind
/// and a served api-version. Manifests come back sorted for the requested
/// direction with input file order breaking ties; hooks keep file order.
pub fn sort_manifests(
    files: &BTreeMap<String, String>,
    versions: &VersionSet,
    order: SortOrder,
) -> Result<(Vec<Hook>, Vec<IndexedManifest>), SortError> {
    let mut hooks = Vec::new();
    let mut manifests = Vec::new();

    for (name, content) in files {
        let base = basename(name);
        if base.starts_with('_') || base.ends_with(NOTES_SUFFIX) {
            continue;
        }
        if is_blank(content) {
            continue;
        }

        let head: DocHead =
            serde_yaml::from_str(content).map_err(|source| SortError::HeadParse {
                name: name.clone(),
                source,
            })?;
        let kind = head.kind.filter(|k| !k.is_empty()).ok_or_else(|| {
            SortError::MissingKind { name: name.clone() }
        })?;
        let version = head.api_version.unwrap_or_default();
        if !versions.contains(&version) {
            return Err(SortError::UnknownApiVersion {
                name: name.clone(),
                version,
            });
        }

        let meta = head.metadata.unwrap_or_default();
        let hook_tags = meta
            .annotations
            .get(HOOK_ANNOTATION)
            .and_then(|v| v.as_str());
        match hook_tags {
            Some(raw) => hooks.push(Hook {
                name: meta.name.unwrap_or_default(),
                kind,
                path: name.clone(),
                manifest: content.clone(),
                events: parse_events(raw, name)?,
                last_run: None,
            }),
            None => manifests.push(IndexedManifest {
                name: name.clone(),
                content: content.clone(),
                ordinal: ordinal_for(&kind, order),
                kind,
            }),
        }
    }

    // Stable sort: equal (ordinal, kind) keeps input file order. Unknown
    // kinds order among themselves by kind name, reversed for uninstall.
    manifests.sort_by(|a, b| {
        a.ordinal.cmp(&b.ordinal).then_with(|| match order {
            SortOrder::Install => a.kind.cmp(&b.kind),
            SortOrder::Uninstall => b.kind.cmp(&a.kind),
        })
    });

    Ok((hooks, manifests))
}

/// Concatenate sorted manifests into the single release document.
pub fn join_manifests(manifests: &[IndexedManifest]) -> String {
    let mut doc = String::new();
    for m in manifests {
        doc.push_str("\n---\n# Source: ");
        doc.push_str(&m.name);
        doc.push('\n');
        doc.push_str(&m.content);
    }
    doc
}

/// Split a stored release document back into pseudo-files so it can be
/// re-sorted under the current priority table.
pub fn split_manifests(doc: &str) -> BTreeMap<String, String> {
    doc.split("\n---\n")
        .enumerate()
        .map(|(i, d)| (format!("manifest-{}", i), d.to_string()))
        .collect()
}
