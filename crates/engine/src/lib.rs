//! Render-engine capability and the named registry with default fallback.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::warn;

use capstan_core::{Chart, Values};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template {name:?} failed to render: {message}")]
    Template { name: String, message: String },
    #[error(transparent)]
    Values(#[from] capstan_core::ValueError),
}

/// A template renderer: chart plus merged context in, path -> rendered text
/// out. Implementations live outside the release core and are registered at
/// startup.
pub trait Engine: Send + Sync {
    fn render(&self, chart: &Chart, ctx: &Values) -> Result<BTreeMap<String, String>, RenderError>;
}

/// Emits template bytes unmodified. Serves charts whose templates are
/// already concrete manifests, and doubles as the test default.
#[derive(Debug, Default)]
pub struct LiteralEngine;

impl Engine for LiteralEngine {
    fn render(
        &self,
        chart: &Chart,
        _ctx: &Values,
    ) -> Result<BTreeMap<String, String>, RenderError> {
        Ok(chart
            .templates
            .iter()
            .map(|t| {
                (
                    format!("{}/{}", chart.metadata.name, t.name),
                    t.data.clone(),
                )
            })
            .collect())
    }
}

/// Registry of render engines keyed by name, with a default.
pub struct EngineYard {
    default: Arc<dyn Engine>,
    named: HashMap<String, Arc<dyn Engine>>,
}

impl EngineYard {
    pub fn new(default: Arc<dyn Engine>) -> Self {
        Self {
            default,
            named: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, engine: Arc<dyn Engine>) {
        self.named.insert(name.into(), engine);
    }

    pub fn default_engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.default)
    }

    /// Honor the chart's engine selector, falling back to the default when
    /// the named engine is absent. Never fails.
    pub fn select(&self, chart: &Chart) -> Arc<dyn Engine> {
        match chart.metadata.engine.as_deref() {
            None | Some("") => self.default_engine(),
            Some(name) => match self.named.get(name) {
                Some(engine) => Arc::clone(engine),
                None => {
                    warn!(
                        chart = %chart.metadata.name,
                        engine = %name,
                        "chart requested a non-existent template engine; using default"
                    );
                    self.default_engine()
                }
            },
        }
    }
}

impl Default for EngineYard {
    fn default() -> Self {
        Self::new(Arc::new(LiteralEngine))
    }
}
