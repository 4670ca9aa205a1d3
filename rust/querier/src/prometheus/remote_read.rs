//! Remote-read resolution: cached app labels, batched target labels.

use super::{label_comparison, LabelKind, PrometheusRegistry, PrometheusSubqueryCache};
use crate::{
    db::{value_as_u64, QueryClient},
    error::{QuerierError, Result},
    operator::Operator,
};
use anyhow::anyhow;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// Always-false filter for an empty id set.
pub const EMPTY_FILTER: &str = "1!=1";

/// Target-label subquery waiting for the post-compilation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetLabelFilter {
    pub origin_filter: String,
    pub trans_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteReadFilter {
    Resolved(String),
    Deferred(TargetLabelFilter),
}

pub struct RemoteReadRequest<'a> {
    pub metric: &'a str,
    pub label: &'a str,
    pub op: Operator,
    pub value: &'a str,
    /// Filter text as written; the cache key together with `metric`.
    pub origin_filter: &'a str,
}

pub async fn remote_read_filter(
    registry: &PrometheusRegistry,
    cache: &PrometheusSubqueryCache,
    client: &dyn QueryClient,
    request: RemoteReadRequest<'_>,
) -> Result<RemoteReadFilter> {
    let label_ref = registry.lookup(request.metric, request.label)?;
    let comparison = label_comparison(request.op, request.value);

    let column_index = match label_ref.kind {
        LabelKind::App { column_index } => column_index,
        LabelKind::Target => {
            return Ok(RemoteReadFilter::Deferred(TargetLabelFilter {
                origin_filter: request.origin_filter.to_string(),
                trans_filter: format!(
                    "SELECT target_id FROM flow_tag.target_label_live_view WHERE metric_id={} and label_name_id={} and {comparison} GROUP BY target_id",
                    label_ref.metric_id, label_ref.label_name_id
                ),
            }));
        }
    };

    // The resolved column index depends on the metric, so the key carries it.
    let cache_key = format!("{}\u{1f}{}", request.metric, request.origin_filter);
    if let Some(filter) = cache.get_fresh(&cache_key) {
        debug!(origin = request.origin_filter, "app label filter served from cache");
        return Ok(RemoteReadFilter::Resolved(filter));
    }

    let sql = format!(
        "SELECT label_value_id FROM flow_tag.app_label_live_view WHERE label_name_id={} and {comparison} GROUP BY label_value_id",
        label_ref.label_name_id
    );
    let rows = client.query(&sql).await.map_err(QuerierError::BackingStore)?;
    let ids = rows
        .iter()
        .map(|row| {
            row.first()
                .and_then(value_as_u64)
                .ok_or_else(|| QuerierError::BackingStore(anyhow!("unexpected label_value_id row {row:?}")))
        })
        .collect::<Result<BTreeSet<_>>>()?;

    let filter = in_filter(&format!("app_label_value_id_{column_index}"), &ids);
    cache.insert(cache_key, filter.clone());
    debug!(origin = request.origin_filter, ids = ids.len(), "app label filter resolved");
    Ok(RemoteReadFilter::Resolved(filter))
}

fn in_filter(column: &str, ids: &BTreeSet<u64>) -> String {
    if ids.is_empty() {
        return EMPTY_FILTER.to_string();
    }
    let list = ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",");
    format!("{column} IN ({list})")
}

/// Resolves all queued target-label filters with one `UNION ALL` query.
///
/// Returns one filter per queued entry, in queue order. Results are not cached.
pub async fn resolve_target_labels(
    client: &dyn QueryClient,
    filters: &[TargetLabelFilter],
) -> Result<Vec<String>> {
    if filters.is_empty() {
        return Ok(Vec::new());
    }

    let sql = filters
        .iter()
        .enumerate()
        .map(|(index, filter)| {
            format!(
                "SELECT {index} AS filter_index, target_id FROM ({})",
                filter.trans_filter
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");

    let rows = client.query(&sql).await.map_err(QuerierError::BackingStore)?;
    let mut targets = vec![BTreeSet::new(); filters.len()];
    for row in &rows {
        let (index, target) = match row.as_slice() {
            [index, target, ..] => (value_as_u64(index), value_as_u64(target)),
            _ => (None, None),
        };
        match (index.and_then(|i| targets.get_mut(i as usize)), target) {
            (Some(ids), Some(target)) => {
                ids.insert(target);
            }
            _ => {
                return Err(QuerierError::BackingStore(anyhow!(
                    "unexpected target label row {row:?}"
                )))
            }
        }
    }

    debug!(filters = filters.len(), rows = rows.len(), "resolved target label filters");
    Ok(targets
        .iter()
        .map(|ids| in_filter("toUInt64(target_id)", ids))
        .collect())
}
