use crate::{
    config::AppConfig,
    db::QueryClient,
    error::{QuerierError, Result},
    filter::{compile_filters, CompileContext, CompiledFilters, FilterRequest},
    prometheus::{PrometheusRegistry, PrometheusSubqueryCache, RegistryHandle},
    tag::{AliasMap, TagRegistry},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Compiles filter requests against the loaded taxonomy and metric registry.
#[derive(Clone)]
pub struct FilterEngine {
    tags: Arc<TagRegistry>,
    registry: RegistryHandle,
    cache: Arc<PrometheusSubqueryCache>,
    client: Arc<dyn QueryClient>,
    language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub db: String,
    pub table: String,
    #[serde(default)]
    pub alias_map: AliasMap,
    #[serde(default)]
    pub remote_read: bool,
    #[serde(flatten)]
    pub filters: FilterRequest,
}

pub type TranslateResponse = CompiledFilters;

impl FilterEngine {
    /// Builds the engine from configuration, loading optional taxonomy and registry files.
    pub fn new(config: &AppConfig, client: Arc<dyn QueryClient>) -> anyhow::Result<Self> {
        let mut tags = TagRegistry::builtin();
        if let Some(path) = &config.tag_taxonomy_path {
            tags.extend_from_json(path)?;
        }

        let registry = match &config.prometheus_registry_path {
            Some(path) => PrometheusRegistry::from_json_file(path)?,
            None => PrometheusRegistry::default(),
        };

        info!(
            tags = tags.len(),
            cache_ttl_secs = config.subquery_cache_ttl.as_secs(),
            cache_entries = config.subquery_cache_entries,
            "filter engine ready"
        );

        Ok(Self::from_parts(
            tags,
            RegistryHandle::new(registry),
            PrometheusSubqueryCache::new(config.subquery_cache_ttl, config.subquery_cache_entries),
            client,
            config.language.clone(),
        ))
    }

    pub fn from_parts(
        tags: TagRegistry,
        registry: RegistryHandle,
        cache: PrometheusSubqueryCache,
        client: Arc<dyn QueryClient>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            tags: Arc::new(tags),
            registry,
            cache: Arc::new(cache),
            client,
            language: language.into(),
        }
    }

    /// Handle used by whatever refreshes the metric registry.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn cache(&self) -> &PrometheusSubqueryCache {
        &self.cache
    }

    pub async fn translate(&self, request: TranslateRequest) -> Result<TranslateResponse> {
        let db = request.db.trim();
        let table = request.table.trim();
        if db.is_empty() || table.is_empty() {
            return Err(QuerierError::InvalidRequest(
                "db and table are required".to_string(),
            ));
        }

        let prometheus = self.registry.snapshot();
        let ctx = CompileContext {
            db,
            table,
            aliases: &request.alias_map,
            remote_read: request.remote_read,
            tags: &self.tags,
            prometheus: &prometheus,
            cache: &self.cache,
            client: self.client.as_ref(),
            language: &self.language,
        };

        let compiled = compile_filters(&request.filters, &ctx).await?;
        debug!(
            db,
            table,
            where_clause = compiled.where_clause.as_deref().unwrap_or_default(),
            "compiled filters"
        );
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::RecordingClient;
    use crate::prometheus::sample_registry;
    use serde_json::json;
    use std::time::Duration;

    fn engine(client: RecordingClient) -> FilterEngine {
        FilterEngine::from_parts(
            TagRegistry::builtin(),
            RegistryHandle::new(sample_registry()),
            PrometheusSubqueryCache::new(Duration::from_secs(60), 16),
            Arc::new(client),
            "en",
        )
    }

    fn request(value: serde_json::Value) -> TranslateRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn translates_where_and_having() {
        let engine = engine(RecordingClient::default());
        let response = engine
            .translate(request(json!({
                "db": "flow_log",
                "table": "l4_flow_log",
                "alias_map": {"server": "ip_1"},
                "where": [
                    {"type": "comparison", "left": "mac_0", "op": "=", "value": "'00:00:00:00:00:0a'"}
                ],
                "having": [
                    {"type": "comparison", "left": {"expr": "Sum(byte)"}, "op": ">", "value": "0"}
                ]
            })))
            .await
            .unwrap();

        assert_eq!(response.where_clause.as_deref(), Some("mac_0 = 10"));
        assert_eq!(response.having_clause.as_deref(), Some("Sum(byte) > 0"));
        assert_eq!(response.with_clause, None);
    }

    #[tokio::test]
    async fn rejects_missing_scope() {
        let engine = engine(RecordingClient::default());
        let err = engine
            .translate(request(json!({"db": " ", "table": "l4_flow_log"})))
            .await
            .unwrap_err();
        assert!(matches!(err, QuerierError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn registry_refresh_applies_to_next_translation() {
        let engine = engine(RecordingClient::default());
        engine.registry().publish(PrometheusRegistry::default());
        let err = engine
            .translate(request(json!({
                "db": "prometheus",
                "table": "http_requests_total",
                "where": [{"type": "comparison", "left": "tag.job", "op": "=", "value": "'api'"}]
            })))
            .await
            .unwrap_err();
        assert!(matches!(err, QuerierError::NotFound(ref name) if name == "http_requests_total"));
    }

    #[tokio::test]
    async fn cache_is_shared_across_translations() {
        let engine = engine(RecordingClient::returning(vec![vec![json!(8)]]));
        let body = json!({
            "db": "prometheus",
            "table": "http_requests_total",
            "remote_read": true,
            "where": [{"type": "comparison", "left": "tag.instance", "op": "=", "value": "'a'"}]
        });
        for _ in 0..3 {
            let response = engine.translate(request(body.clone())).await.unwrap();
            assert_eq!(response.where_clause.as_deref(), Some("app_label_value_id_2 IN (8)"));
        }
        assert_eq!(engine.cache().len(), 1);
        assert_eq!(engine.cache().stats().hits.load(std::sync::atomic::Ordering::Relaxed), 2);
    }
}
