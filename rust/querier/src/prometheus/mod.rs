//! Metric-label filters against Prometheus storage.

pub mod cache;
pub mod remote_read;

use crate::{
    error::{QuerierError, Result},
    operator::Operator,
};
use anyhow::Context;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use cache::{Clock, PrometheusSubqueryCache, SystemClock};
pub use remote_read::{remote_read_filter, resolve_target_labels, TargetLabelFilter};

pub const PROMETHEUS_DB: &str = "prometheus";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLabel {
    pub name: String,
    pub column_index: u32,
}

/// Read-only name → id snapshot published by the registry refresher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusRegistry {
    #[serde(default)]
    pub metric_name_to_id: HashMap<String, u64>,
    #[serde(default)]
    pub label_name_to_id: HashMap<String, u64>,
    #[serde(default)]
    pub metric_app_label_layout: HashMap<String, Vec<AppLabel>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    /// Stored inline in `app_label_value_id_<column_index>`.
    App { column_index: u32 },
    /// Joined through the target table.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelRef {
    pub metric_id: u64,
    pub label_name_id: u64,
    pub kind: LabelKind,
}

impl PrometheusRegistry {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prometheus registry {}", path.display()))?;
        let registry: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid prometheus registry {}", path.display()))?;
        info!(
            path = %path.display(),
            metrics = registry.metric_name_to_id.len(),
            labels = registry.label_name_to_id.len(),
            "loaded prometheus registry"
        );
        Ok(registry)
    }

    /// Resolves `label` on `metric`; either name missing is a hard error.
    pub fn lookup(&self, metric: &str, label: &str) -> Result<LabelRef> {
        let metric_id = *self
            .metric_name_to_id
            .get(metric)
            .ok_or_else(|| QuerierError::NotFound(metric.to_string()))?;
        let label_name_id = *self
            .label_name_to_id
            .get(label)
            .ok_or_else(|| QuerierError::NotFound(label.to_string()))?;

        let kind = self
            .metric_app_label_layout
            .get(metric)
            .and_then(|layout| layout.iter().find(|app| app.name == label))
            .map_or(LabelKind::Target, |app| LabelKind::App {
                column_index: app.column_index,
            });

        Ok(LabelRef {
            metric_id,
            label_name_id,
            kind,
        })
    }
}

/// Shared handle to the current registry snapshot.
#[derive(Debug, Clone, Default)]
pub struct RegistryHandle {
    current: Arc<RwLock<Arc<PrometheusRegistry>>>,
}

impl RegistryHandle {
    pub fn new(registry: PrometheusRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn snapshot(&self) -> Arc<PrometheusRegistry> {
        self.current.read().clone()
    }

    /// Swaps in a refreshed registry; in-flight compilations keep their snapshot.
    pub fn publish(&self, registry: PrometheusRegistry) {
        *self.current.write() = Arc::new(registry);
    }
}

pub(crate) fn label_comparison(op: Operator, value: &str) -> String {
    op.compare("label_value", value)
}

/// Compiles `tag.<label> <op> <value>` for `metric` into a membership subquery.
pub fn prometheus_filter(
    registry: &PrometheusRegistry,
    metric: &str,
    label: &str,
    op: Operator,
    value: &str,
) -> Result<String> {
    let label_ref = registry.lookup(metric, label)?;
    let comparison = label_comparison(op, value);
    Ok(match label_ref.kind {
        LabelKind::App { column_index } => format!(
            "toUInt64(app_label_value_id_{column_index}) IN (SELECT label_value_id FROM flow_tag.app_label_live_view WHERE label_name_id={} and {comparison})",
            label_ref.label_name_id
        ),
        LabelKind::Target => format!(
            "toUInt64(target_id) IN (SELECT target_id FROM flow_tag.target_label_live_view WHERE metric_id={} and label_name_id={} and {comparison})",
            label_ref.metric_id, label_ref.label_name_id
        ),
    })
}

#[cfg(test)]
pub(crate) fn sample_registry() -> PrometheusRegistry {
    PrometheusRegistry {
        metric_name_to_id: HashMap::from([("http_requests_total".to_string(), 7)]),
        label_name_to_id: HashMap::from([
            ("instance".to_string(), 3),
            ("job".to_string(), 4),
        ]),
        metric_app_label_layout: HashMap::from([(
            "http_requests_total".to_string(),
            vec![AppLabel {
                name: "instance".to_string(),
                column_index: 2,
            }],
        )]),
    }
}
