//! WHERE/HAVING compilation over a parsed condition tree.

pub mod function;

use crate::{
    db::QueryClient,
    error::{QuerierError, Result},
    operator::Operator,
    prometheus::{
        prometheus_filter,
        remote_read::{RemoteReadFilter, RemoteReadRequest},
        remote_read_filter,
        resolve_target_labels, PrometheusRegistry, PrometheusSubqueryCache, TargetLabelFilter,
        PROMETHEUS_DB,
    },
    tag::{
        family::{self, Routed, RouteScope},
        strip_tag, AliasMap, Predicate, Resolution, TagRegistry,
    },
    time::{TimeWindow, TIME_TAG},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

type CompileFuture<'a> = Pin<Box<dyn Future<Output = Result<FilterExpr>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Leaf(String),
    Binary {
        left: Box<FilterExpr>,
        op: String,
        right: Box<FilterExpr>,
    },
    Nested(Box<FilterExpr>),
    Not(Box<FilterExpr>),
    /// Target-label placeholder, filled in after the batch lookup.
    Deferred(usize),
}

impl FilterExpr {
    fn replace_deferred(&mut self, resolved: &[String]) {
        match self {
            FilterExpr::Deferred(index) => {
                if let Some(filter) = resolved.get(*index) {
                    *self = FilterExpr::Leaf(filter.clone());
                }
            }
            FilterExpr::Binary { left, right, .. } => {
                left.replace_deferred(resolved);
                right.replace_deferred(resolved);
            }
            FilterExpr::Nested(inner) | FilterExpr::Not(inner) => inner.replace_deferred(resolved),
            FilterExpr::Leaf(_) => {}
        }
    }

    /// Wraps a binary child of a different connective so precedence survives rendering.
    fn grouped(self, connective: &str) -> Self {
        match &self {
            FilterExpr::Binary { op, .. } if op != connective => FilterExpr::Nested(Box::new(self)),
            _ => self,
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::Leaf(text) => f.write_str(text),
            FilterExpr::Binary { left, op, right } => write!(f, "{left} {op} {right}"),
            FilterExpr::Nested(inner) => write!(f, "({inner})"),
            FilterExpr::Not(inner) => write!(f, "not({inner})"),
            FilterExpr::Deferred(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithClause {
    pub expr: String,
    pub alias: String,
}

impl fmt::Display for WithClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} AS `{}`", self.expr, self.alias)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub expr: String,
    #[serde(default)]
    pub withs: Vec<WithClause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Tag(String),
    Function(FunctionNode),
}

/// Parsed condition tree handed over by the statement parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Comparison {
        left: Operand,
        op: String,
        value: String,
    },
    And {
        left: Box<Condition>,
        right: Box<Condition>,
    },
    Or {
        left: Box<Condition>,
        right: Box<Condition>,
    },
    Not {
        expr: Box<Condition>,
    },
    Paren {
        expr: Box<Condition>,
    },
    TagFunction {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Everything one compilation reads.
pub struct CompileContext<'a> {
    pub db: &'a str,
    pub table: &'a str,
    pub aliases: &'a AliasMap,
    pub remote_read: bool,
    pub tags: &'a TagRegistry,
    pub prometheus: &'a PrometheusRegistry,
    pub cache: &'a PrometheusSubqueryCache,
    pub client: &'a dyn QueryClient,
    pub language: &'a str,
}

impl CompileContext<'_> {
    fn route_scope(&self) -> RouteScope<'_> {
        RouteScope {
            tags: self.tags,
            db: self.db,
            table: self.table,
            metric_labels: self.remote_read || self.db == PROMETHEUS_DB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    Where,
    Having,
}

#[derive(Debug)]
pub struct FilterClause {
    kind: ClauseKind,
    filters: Vec<FilterExpr>,
    withs: Vec<WithClause>,
    time: TimeWindow,
    target_labels: Vec<TargetLabelFilter>,
}

impl FilterClause {
    pub fn new(kind: ClauseKind) -> Self {
        Self {
            kind,
            filters: Vec::new(),
            withs: Vec::new(),
            time: TimeWindow::default(),
            target_labels: Vec::new(),
        }
    }

    pub fn kind(&self) -> ClauseKind {
        self.kind
    }

    pub fn time(&self) -> TimeWindow {
        self.time
    }

    pub fn withs(&self) -> &[WithClause] {
        &self.withs
    }

    pub fn target_label_filters(&self) -> &[TargetLabelFilter] {
        &self.target_labels
    }

    /// Compiles one top-level condition; the first error aborts it.
    pub async fn add(&mut self, condition: &Condition, ctx: &CompileContext<'_>) -> Result<()> {
        let expr = self.compile_node(condition, ctx).await?;
        self.filters.push(expr);
        Ok(())
    }

    /// Top-level filters joined with AND; `None` when nothing was added.
    pub fn render(&self) -> Option<String> {
        match self.filters.as_slice() {
            [] => None,
            [single] => Some(single.to_string()),
            many => Some(
                many.iter()
                    .map(|filter| format!("({filter})"))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            ),
        }
    }

    /// Runs the queued target-label lookups as one batch and fills their placeholders.
    pub async fn resolve_target_labels(&mut self, client: &dyn QueryClient) -> Result<()> {
        if self.target_labels.is_empty() {
            return Ok(());
        }
        let resolved = resolve_target_labels(client, &self.target_labels).await?;
        for filter in &mut self.filters {
            filter.replace_deferred(&resolved);
        }
        self.target_labels.clear();
        Ok(())
    }

    fn compile_node<'s, 'c: 's>(
        &'s mut self,
        condition: &'s Condition,
        ctx: &'s CompileContext<'c>,
    ) -> CompileFuture<'s> {
        Box::pin(async move {
            match condition {
                Condition::Comparison { left, op, value } => {
                    self.compile_comparison(left, op, value, ctx).await
                }
                Condition::And { left, right } => {
                    let left = self.compile_node(left, ctx).await?;
                    let right = self.compile_node(right, ctx).await?;
                    Ok(connect(left, "AND", right))
                }
                Condition::Or { left, right } => {
                    let left = self.compile_node(left, ctx).await?;
                    let right = self.compile_node(right, ctx).await?;
                    Ok(connect(left, "OR", right))
                }
                Condition::Not { expr } => {
                    let inner = self.compile_node(expr, ctx).await?;
                    Ok(FilterExpr::Not(Box::new(inner)))
                }
                Condition::Paren { expr } => {
                    let inner = self.compile_node(expr, ctx).await?;
                    Ok(FilterExpr::Nested(Box::new(inner)))
                }
                Condition::TagFunction { name, args } => {
                    if !name.eq_ignore_ascii_case("exist") {
                        return Err(QuerierError::UnsupportedFunction(name.clone()));
                    }
                    family::exist(ctx.route_scope(), args).map(FilterExpr::Leaf)
                }
            }
        })
    }

    async fn compile_comparison(
        &mut self,
        left: &Operand,
        op_token: &str,
        raw_value: &str,
        ctx: &CompileContext<'_>,
    ) -> Result<FilterExpr> {
        let written = match left {
            Operand::Tag(tag) => tag.as_str(),
            Operand::Function(node) => {
                let op = Operator::parse(op_token, &node.expr)?;
                let value = op.rewrite_wildcards(raw_value.trim());
                if let Some(tag) = function::enum_argument(&node.expr) {
                    if let Some(filter) = function::enum_filter(ctx, tag, op, &value)? {
                        return Ok(FilterExpr::Leaf(filter));
                    }
                }
                let (expr, withs) = function::function_filter(node, op, &value);
                self.push_withs(withs);
                return Ok(expr);
            }
        };

        let name = strip_tag(written);
        let op = Operator::parse(op_token, name)?;
        let value = op.rewrite_wildcards(raw_value.trim());

        if name == TIME_TAG {
            return self.time.extract(name, op, &value).map(FilterExpr::Leaf);
        }

        let pass_through = || FilterExpr::Leaf(op.compare(written.trim(), &value));

        match ctx.tags.resolve(written, ctx.db, ctx.table, ctx.aliases) {
            Resolution::Descriptor { tag, descriptor } => {
                let filter = descriptor.translator.translate(&Predicate {
                    tag: &tag,
                    key: None,
                    op,
                    value: &value,
                })?;
                Ok(FilterExpr::Leaf(format!("({filter})")))
            }
            Resolution::Virtual { tag, virtual_tag } => {
                match virtual_tag.route(ctx.route_scope(), &tag, op, &value)? {
                    Routed::Filter(filter) => Ok(FilterExpr::Leaf(filter)),
                    Routed::PassThrough => Ok(pass_through()),
                    Routed::Enum { tag } => Ok(function::enum_filter(ctx, &tag, op, &value)?
                        .map(FilterExpr::Leaf)
                        .unwrap_or_else(pass_through)),
                    Routed::Prometheus { label } => {
                        let origin = format!("{} {} {}", written.trim(), op_token.trim(), raw_value.trim());
                        self.compile_metric_label(ctx, &label, op, &value, &origin).await
                    }
                }
            }
            Resolution::PassThrough => Ok(pass_through()),
        }
    }

    async fn compile_metric_label(
        &mut self,
        ctx: &CompileContext<'_>,
        label: &str,
        op: Operator,
        value: &str,
        origin: &str,
    ) -> Result<FilterExpr> {
        if !ctx.remote_read {
            return prometheus_filter(ctx.prometheus, ctx.table, label, op, value).map(FilterExpr::Leaf);
        }

        let request = RemoteReadRequest {
            metric: ctx.table,
            label,
            op,
            value,
            origin_filter: origin,
        };
        match remote_read_filter(ctx.prometheus, ctx.cache, ctx.client, request).await? {
            RemoteReadFilter::Resolved(filter) => Ok(FilterExpr::Leaf(filter)),
            RemoteReadFilter::Deferred(target) => {
                debug!(origin = %target.origin_filter, "deferring target label filter");
                self.target_labels.push(target);
                Ok(FilterExpr::Deferred(self.target_labels.len() - 1))
            }
        }
    }

    fn push_withs(&mut self, withs: Vec<WithClause>) {
        for with in withs {
            if !self.withs.iter().any(|existing| existing.alias == with.alias) {
                self.withs.push(with);
            }
        }
    }
}

fn connect(left: FilterExpr, connective: &str, right: FilterExpr) -> FilterExpr {
    FilterExpr::Binary {
        left: Box::new(left.grouped(connective)),
        op: connective.to_string(),
        right: Box::new(right.grouped(connective)),
    }
}

/// WHERE and HAVING conditions of one statement; each list is AND-ed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRequest {
    #[serde(default, rename = "where")]
    pub where_conditions: Vec<Condition>,
    #[serde(default)]
    pub having: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompiledFilters {
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(rename = "having", skip_serializing_if = "Option::is_none")]
    pub having_clause: Option<String>,
    #[serde(rename = "with", skip_serializing_if = "Option::is_none")]
    pub with_clause: Option<String>,
    pub time: TimeWindow,
}

/// Compiles WHERE then HAVING, then resolves any deferred target labels.
pub async fn compile_filters(request: &FilterRequest, ctx: &CompileContext<'_>) -> Result<CompiledFilters> {
    let mut where_clause = FilterClause::new(ClauseKind::Where);
    for condition in &request.where_conditions {
        where_clause.add(condition, ctx).await?;
    }
    let mut having_clause = FilterClause::new(ClauseKind::Having);
    for condition in &request.having {
        having_clause.add(condition, ctx).await?;
    }

    where_clause.resolve_target_labels(ctx.client).await?;
    having_clause.resolve_target_labels(ctx.client).await?;

    let mut time = where_clause.time();
    let having_time = having_clause.time();
    if let Some(start) = having_time.start {
        time.add_start(start);
    }
    if let Some(end) = having_time.end {
        time.add_end(end);
    }

    let mut withs: Vec<&WithClause> = Vec::new();
    for with in where_clause.withs().iter().chain(having_clause.withs()) {
        if !withs.iter().any(|existing| existing.alias == with.alias) {
            withs.push(with);
        }
    }
    let with_clause = (!withs.is_empty()).then(|| {
        withs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    });

    Ok(CompiledFilters {
        where_clause: where_clause.render(),
        having_clause: having_clause.render(),
        with_clause,
        time,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::testing::RecordingClient;
    use crate::prometheus::sample_registry;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub(crate) tags: TagRegistry,
        pub(crate) prometheus: PrometheusRegistry,
        pub(crate) cache: PrometheusSubqueryCache,
        pub(crate) client: RecordingClient,
        pub(crate) aliases: AliasMap,
        pub(crate) db: &'static str,
        pub(crate) table: &'static str,
        pub(crate) remote_read: bool,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            Self {
                tags: TagRegistry::builtin(),
                prometheus: sample_registry(),
                cache: PrometheusSubqueryCache::new(Duration::from_secs(60), 100),
                client: RecordingClient::default(),
                aliases: AliasMap::default(),
                db: "flow_log",
                table: "l4_flow_log",
                remote_read: false,
            }
        }

        pub(crate) fn metrics(client: RecordingClient, remote_read: bool) -> Self {
            Self {
                client,
                db: PROMETHEUS_DB,
                table: "http_requests_total",
                remote_read,
                ..Self::new()
            }
        }

        pub(crate) fn context(&self) -> CompileContext<'_> {
            CompileContext {
                db: self.db,
                table: self.table,
                aliases: &self.aliases,
                remote_read: self.remote_read,
                tags: &self.tags,
                prometheus: &self.prometheus,
                cache: &self.cache,
                client: &self.client,
                language: "en",
            }
        }
    }

    fn cmp(tag: &str, op: &str, value: &str) -> Condition {
        Condition::Comparison {
            left: Operand::Tag(tag.into()),
            op: op.into(),
            value: value.into(),
        }
    }

    async fn compile_where(fixture: &Fixture, conditions: Vec<Condition>) -> Result<CompiledFilters> {
        let request = FilterRequest {
            where_conditions: conditions,
            having: Vec::new(),
        };
        compile_filters(&request, &fixture.context()).await
    }

    #[tokio::test]
    async fn unknown_tag_passes_through() {
        let fixture = Fixture::new();
        let compiled = compile_where(&fixture, vec![cmp("byte_tx", ">", "100")]).await.unwrap();
        assert_eq!(compiled.where_clause.as_deref(), Some("byte_tx > 100"));

        let compiled = compile_where(&fixture, vec![cmp("`l7_domain`", "REGEXP", "'^api'")])
            .await
            .unwrap();
        assert_eq!(compiled.where_clause.as_deref(), Some("match(`l7_domain`,'^api')"));
    }

    #[tokio::test]
    async fn empty_request_omits_clauses() {
        let fixture = Fixture::new();
        let compiled = compile_where(&fixture, Vec::new()).await.unwrap();
        assert_eq!(compiled, CompiledFilters::default());
    }

    #[tokio::test]
    async fn top_level_filters_are_and_ed() {
        let fixture = Fixture::new();
        let compiled = compile_where(
            &fixture,
            vec![cmp("is_internet_0", "in", "(0,1)"), cmp("pod_id_0", "=", "3")],
        )
        .await
        .unwrap();
        assert_eq!(
            compiled.where_clause.as_deref(),
            Some("((1=1)) AND ((pod_id_0 = 3))")
        );
    }

    #[tokio::test]
    async fn like_rewrites_wildcards_before_translation() {
        let fixture = Fixture::new();
        let compiled = compile_where(&fixture, vec![cmp("pod_service_0", "not like", "'web*'")])
            .await
            .unwrap();
        assert_eq!(
            compiled.where_clause.as_deref(),
            Some("(not(toUInt64(service_id_0) IN (SELECT id FROM flow_tag.pod_service_map WHERE name ilike 'web%')))")
        );
    }

    #[tokio::test]
    async fn alias_resolves_to_descriptor() {
        let mut fixture = Fixture::new();
        fixture.aliases.insert("client_ip", "ip_0");
        let compiled = compile_where(&fixture, vec![cmp("client_ip", "=", "'10.0.0.0/31'")])
            .await
            .unwrap();
        let sql = compiled.where_clause.unwrap();
        assert!(sql.contains("hex(ip4_0)"));
        assert!(sql.contains(">= hex(toIPv4('10.0.0.0'))"));
        assert!(sql.contains("<= hex(toIPv4('10.0.0.1'))"));
    }

    #[tokio::test]
    async fn aliased_virtual_tag_compiles_against_canonical_name() {
        let mut fixture = Fixture::new();
        fixture.aliases.insert("peer_mac", "mac_1");
        let compiled = compile_where(&fixture, vec![cmp("peer_mac", "in", "('00:00:00:00:00:01', '00:00:00:00:01:00')")])
            .await
            .unwrap();
        assert_eq!(compiled.where_clause.as_deref(), Some("mac_1 in (1,256)"));
    }

    #[tokio::test]
    async fn family_descriptor_name_written_directly_passes_through() {
        let fixture = Fixture::new();
        let compiled = compile_where(&fixture, vec![cmp("k8s_label_0", "=", "'x'")])
            .await
            .unwrap();
        assert_eq!(compiled.where_clause.as_deref(), Some("(k8s_label_0 = 'x')"));
    }

    #[tokio::test]
    async fn empty_internet_list_is_malformed() {
        let fixture = Fixture::new();
        let err = compile_where(&fixture, vec![cmp("is_internet", "in", "()")])
            .await
            .unwrap_err();
        assert!(matches!(err, QuerierError::MalformedLiteral { ref tag, .. } if tag == "is_internet"));
    }

    #[tokio::test]
    async fn boolean_connectives_keep_precedence() {
        let fixture = Fixture::new();
        let condition = Condition::And {
            left: Box::new(Condition::Or {
                left: Box::new(cmp("a", "=", "1")),
                right: Box::new(cmp("b", "=", "2")),
            }),
            right: Box::new(Condition::Not {
                expr: Box::new(cmp("c", "=", "3")),
            }),
        };
        let compiled = compile_where(&fixture, vec![condition]).await.unwrap();
        assert_eq!(
            compiled.where_clause.as_deref(),
            Some("(a = 1 OR b = 2) AND not(c = 3)")
        );
    }

    #[tokio::test]
    async fn time_comparisons_fill_window_and_stay_in_filter() {
        let fixture = Fixture::new();
        let compiled = compile_where(
            &fixture,
            vec![cmp("time", ">=", "1700000000 - 60"), cmp("time", "<=", "1700000000")],
        )
        .await
        .unwrap();
        assert_eq!(
            compiled.time,
            TimeWindow {
                start: Some(1_699_999_940),
                end: Some(1_700_000_000)
            }
        );
        assert_eq!(
            compiled.where_clause.as_deref(),
            Some("(time >= 1700000000 - 60) AND (time <= 1700000000)")
        );
    }

    #[tokio::test]
    async fn unsupported_operator_aborts_compilation() {
        let fixture = Fixture::new();
        let err = compile_where(&fixture, vec![cmp("pod_id", "~", "1")]).await.unwrap_err();
        assert!(matches!(err, QuerierError::UnsupportedOperator { ref tag, .. } if tag == "pod_id"));
    }

    #[tokio::test]
    async fn enum_function_operand() {
        let fixture = Fixture::new();
        let condition = Condition::Comparison {
            left: Operand::Function(FunctionNode {
                expr: "Enum(protocol)".into(),
                withs: Vec::new(),
            }),
            op: "=".into(),
            value: "3".into(),
        };
        let compiled = compile_where(&fixture, vec![condition]).await.unwrap();
        assert!(compiled
            .where_clause
            .unwrap()
            .contains("(toUInt64(protocol) IN (SELECT value FROM flow_tag.int_enum_map WHERE tag_name='protocol' AND name = 3)) OR (protocol = toUInt64(3))"));
    }

    #[tokio::test]
    async fn function_withs_are_collected_once() {
        let fixture = Fixture::new();
        let having = |value: &str| Condition::Comparison {
            left: Operand::Function(FunctionNode {
                expr: "Avg(rtt)".into(),
                withs: vec![WithClause {
                    expr: "sum(rtt)/count(rtt)".into(),
                    alias: "_avg_rtt".into(),
                }],
            }),
            op: ">".into(),
            value: value.into(),
        };
        let request = FilterRequest {
            where_conditions: Vec::new(),
            having: vec![having("10"), having("20")],
        };
        let compiled = compile_filters(&request, &fixture.context()).await.unwrap();
        assert_eq!(compiled.where_clause, None);
        assert_eq!(
            compiled.having_clause.as_deref(),
            Some("(Avg(rtt) > 10) AND (Avg(rtt) > 20)")
        );
        assert_eq!(compiled.with_clause.as_deref(), Some("sum(rtt)/count(rtt) AS `_avg_rtt`"));
    }

    #[tokio::test]
    async fn exist_and_unknown_tag_functions() {
        let fixture = Fixture::new();
        let compiled = compile_where(
            &fixture,
            vec![Condition::TagFunction {
                name: "EXIST".into(),
                args: vec!["router_id_1".into()],
            }],
        )
        .await
        .unwrap();
        assert_eq!(compiled.where_clause.as_deref(), Some("l3_device_type_1=5"));

        let err = compile_where(
            &fixture,
            vec![Condition::TagFunction {
                name: "missing".into(),
                args: Vec::new(),
            }],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QuerierError::UnsupportedFunction(ref name) if name == "missing"));
    }

    #[tokio::test]
    async fn prometheus_db_uses_inline_subqueries() {
        let fixture = Fixture::metrics(RecordingClient::default(), false);
        let compiled = compile_where(&fixture, vec![cmp("tag.job", "=", "'api'")]).await.unwrap();
        assert_eq!(
            compiled.where_clause.as_deref(),
            Some("toUInt64(target_id) IN (SELECT target_id FROM flow_tag.target_label_live_view WHERE metric_id=7 and label_name_id=4 and label_value = 'api')")
        );
        assert_eq!(fixture.client.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_metric_label_is_not_found() {
        let fixture = Fixture::metrics(RecordingClient::default(), false);
        let err = compile_where(&fixture, vec![cmp("tag.zone", "=", "'a'")]).await.unwrap_err();
        assert!(matches!(err, QuerierError::NotFound(ref name) if name == "zone"));
    }

    #[tokio::test]
    async fn remote_read_resolves_deferred_target_labels_in_one_batch() {
        let client = RecordingClient::returning(vec![vec![json!(0), json!(21)], vec![json!(1), json!(22)]]);
        let fixture = Fixture::metrics(client, true);
        let compiled = compile_where(
            &fixture,
            vec![cmp("tag.job", "=", "'api'"), cmp("tag.job", "!=", "'web'")],
        )
        .await
        .unwrap();
        assert_eq!(
            compiled.where_clause.as_deref(),
            Some("(toUInt64(target_id) IN (21)) AND (toUInt64(target_id) IN (22))")
        );
        assert_eq!(fixture.client.calls(), 1);
        assert!(fixture.client.queries.lock()[0].contains(" UNION ALL "));
    }

    #[tokio::test]
    async fn remote_read_app_label_hits_cache_on_repeat() {
        let client = RecordingClient::returning(vec![vec![json!(5)]]);
        let fixture = Fixture::metrics(client, true);
        for _ in 0..2 {
            let compiled = compile_where(&fixture, vec![cmp("tag.instance", "=", "'a'")])
                .await
                .unwrap();
            assert_eq!(
                compiled.where_clause.as_deref(),
                Some("app_label_value_id_2 IN (5)")
            );
        }
        assert_eq!(fixture.client.calls(), 1);
    }

    #[tokio::test]
    async fn backing_store_failure_fails_whole_compilation() {
        let fixture = Fixture::metrics(RecordingClient::failing(), true);
        let err = compile_where(
            &fixture,
            vec![cmp("pod_id", "=", "1"), cmp("tag.instance", "=", "'a'")],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QuerierError::BackingStore(_)));
    }

    #[test]
    fn conditions_deserialize_from_tagged_json() {
        let condition: Condition = serde_json::from_value(json!({
            "type": "and",
            "left": {"type": "comparison", "left": "ip_0", "op": "=", "value": "'1.1.1.1'"},
            "right": {"type": "comparison", "left": {"expr": "Enum(protocol)"}, "op": "=", "value": "'TCP'"}
        }))
        .unwrap();
        let Condition::And { right, .. } = condition else {
            panic!("expected and");
        };
        assert!(matches!(
            *right,
            Condition::Comparison { left: Operand::Function(_), .. }
        ));
    }
}
