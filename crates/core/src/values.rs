//! Chart values: recursive merge and render-context construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value as Yaml};

/// Key under which the computed release sub-mapping is injected.
const RELEASE_KEY: &str = "release";

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A scalar and a table collided at the same path. User error.
    #[error("cannot merge scalar and table at {0:?}")]
    Conflict(String),
}

/// Free-form nested mapping of configuration values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub Mapping);

impl Values {
    pub fn from_yaml(src: &str) -> Result<Self, ValueError> {
        if src.trim().is_empty() {
            return Ok(Self::default());
        }
        let map: Mapping = serde_yaml::from_str(src)?;
        Ok(Self(map))
    }

    pub fn to_yaml(&self) -> Result<String, ValueError> {
        Ok(serde_yaml::to_string(&self.0)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Yaml> {
        self.0.get(Yaml::String(key.to_string()))
    }

    /// Merge `overrides` on top of `defaults`: tables merge key-wise
    /// recursively, anything else is replaced wholesale by the override.
    pub fn merge(defaults: &Values, overrides: &Values) -> Result<Values, ValueError> {
        let merged = merge_tables(&defaults.0, &overrides.0, "")?;
        Ok(Values(merged))
    }
}

fn merge_tables(base: &Mapping, over: &Mapping, path: &str) -> Result<Mapping, ValueError> {
    let mut out = base.clone();
    for (k, ov) in over {
        let key_str = k.as_str().unwrap_or("?");
        let child_path = if path.is_empty() {
            key_str.to_string()
        } else {
            format!("{}.{}", path, key_str)
        };
        match out.get(k).cloned() {
            Some(bv) => {
                let merged = merge_value(&bv, ov, &child_path)?;
                out.insert(k.clone(), merged);
            }
            None => {
                out.insert(k.clone(), ov.clone());
            }
        }
    }
    Ok(out)
}

fn merge_value(base: &Yaml, over: &Yaml, path: &str) -> Result<Yaml, ValueError> {
    match (base, over) {
        (Yaml::Mapping(b), Yaml::Mapping(o)) => Ok(Yaml::Mapping(merge_tables(b, o, path)?)),
        (Yaml::Mapping(_), _) | (_, Yaml::Mapping(_)) => Err(ValueError::Conflict(path.to_string())),
        // Scalars and lists: override wins.
        (_, o) => Ok(o.clone()),
    }
}

/// Reserved per-request release attributes injected into the render context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOptions {
    pub name: String,
    pub namespace: String,
    pub time: DateTime<Utc>,
}

/// Build the full render context for a chart: defaults merged with user
/// overrides, plus the reserved `release` sub-mapping.
pub fn render_context(
    chart: &crate::Chart,
    user: &Values,
    opts: &ReleaseOptions,
) -> Result<Values, ValueError> {
    let defaults = match chart.values.as_deref() {
        Some(src) => Values::from_yaml(src)?,
        None => Values::default(),
    };
    let mut merged = Values::merge(&defaults, user)?;

    let mut release = Mapping::new();
    release.insert(
        Yaml::String("name".into()),
        Yaml::String(opts.name.clone()),
    );
    release.insert(
        Yaml::String("namespace".into()),
        Yaml::String(opts.namespace.clone()),
    );
    release.insert(
        Yaml::String("time".into()),
        Yaml::String(opts.time.to_rfc3339()),
    );
    merged
        .0
        .insert(Yaml::String(RELEASE_KEY.into()), Yaml::Mapping(release));
    Ok(merged)
}
