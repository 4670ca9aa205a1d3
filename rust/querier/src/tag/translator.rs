//! Typed predicate builders attached to tag descriptors.

use crate::{
    encode::{self, CidrRange, TruthSet},
    error::{QuerierError, Result},
    operator::{negate_if, Operator},
};
use serde::{Deserialize, Serialize};

/// One comparison handed to a translator. `value` is already wildcard-rewritten.
#[derive(Debug, Clone, Copy)]
pub struct Predicate<'a> {
    pub tag: &'a str,
    /// Key carried by free-form families such as `k8s.label.<key>`.
    pub key: Option<&'a str>,
    pub op: Operator,
    pub value: &'a str,
}

/// Membership lookup into a `flow_tag` dictionary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryLookup {
    pub id_column: String,
    pub dictionary: String,
    pub match_column: String,
    #[serde(default = "default_select")]
    pub select: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// One scope of a key/value side map (e.g. pod scope of `k8s.label.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapScope {
    pub id_column: String,
    pub table: String,
    #[serde(default = "default_select")]
    pub select: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

fn default_select() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WhereTranslator {
    Column {
        column: String,
    },
    Ip {
        ipv4: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ipv6: Option<String>,
    },
    Sentinel {
        column: String,
        sentinel: i64,
    },
    IpVersion {
        column: String,
    },
    RowId,
    HasAny {
        column: String,
    },
    Dictionary {
        lookups: Vec<DictionaryLookup>,
    },
    Enum {
        column: String,
    },
    LabelMap {
        scopes: Vec<MapScope>,
    },
    KeyValue {
        names: String,
        values: String,
    },
}

impl WhereTranslator {
    pub fn column(column: impl Into<String>) -> Self {
        WhereTranslator::Column {
            column: column.into(),
        }
    }

    pub fn translate(&self, predicate: &Predicate<'_>) -> Result<String> {
        let Predicate { tag, op, value, .. } = *predicate;
        match self {
            WhereTranslator::Column { column } | WhereTranslator::Enum { column } => {
                Ok(op.compare(column, value))
            }
            WhereTranslator::Ip { ipv4, ipv6 } => translate_ip(tag, ipv4, ipv6.as_deref(), op, value),
            WhereTranslator::Sentinel { column, sentinel } => {
                translate_sentinel(tag, column, *sentinel, op, value)
            }
            WhereTranslator::IpVersion { column } => {
                Ok(op.compare(column, &encode::encode_ip_versions(tag, op, value)?))
            }
            WhereTranslator::RowId => translate_row_id(tag, op, value),
            WhereTranslator::HasAny { column } => {
                let ids = encode::parse_ids(tag, value)?
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                Ok(negate_if(op, format!("hasAny({column}, [{ids}])")))
            }
            WhereTranslator::Dictionary { lookups } => {
                let positive = op.positive();
                let joined = lookups
                    .iter()
                    .map(|lookup| lookup.render(positive, value))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                Ok(negate_if(op, joined))
            }
            WhereTranslator::LabelMap { scopes } => {
                // Without a key the family name is not a tag; compare it as written.
                let Some(key) = predicate.key else {
                    return Ok(op.compare(tag, value));
                };
                Ok(negate_if(
                    op,
                    render_scopes(scopes, key, Some((op.positive(), value))),
                ))
            }
            WhereTranslator::KeyValue { names, values } => {
                let Some(key) = predicate.key else {
                    return Ok(op.compare(tag, value));
                };
                let subject = format!("{values}[indexOf({names},{})]", encode::quote(key));
                Ok(op.compare(&subject, value))
            }
        }
    }

    /// Key-existence form used by `exist(<family>.<key>)`.
    pub fn exists(&self, key: &str) -> Option<String> {
        match self {
            WhereTranslator::LabelMap { scopes } => Some(render_scopes(scopes, key, None)),
            _ => None,
        }
    }
}

impl DictionaryLookup {
    fn render(&self, op: Operator, value: &str) -> String {
        let comparison = op.compare(&self.match_column, value);
        let filter = match &self.condition {
            Some(condition) => format!("{condition} AND {comparison}"),
            None => comparison,
        };
        format!(
            "toUInt64({}) IN (SELECT {} FROM flow_tag.{} WHERE {filter})",
            self.id_column, self.select, self.dictionary
        )
    }
}

fn render_scopes(scopes: &[MapScope], key: &str, comparison: Option<(Operator, &str)>) -> String {
    let key = encode::quote(key);
    let parts: Vec<_> = scopes
        .iter()
        .map(|scope| {
            let mut filter = format!("key={key}");
            if let Some((op, value)) = comparison {
                filter.push_str(" AND ");
                filter.push_str(&op.compare("value", value));
            }
            let subquery = format!(
                "toUInt64({}) IN (SELECT {} FROM flow_tag.{} WHERE {filter})",
                scope.id_column, scope.select, scope.table
            );
            match &scope.guard {
                Some(guard) => format!("({subquery} AND {guard})"),
                None => format!("({subquery})"),
            }
        })
        .collect();

    if parts.len() == 1 {
        parts.concat()
    } else {
        format!("({})", parts.join(" OR "))
    }
}

fn ip_subject(ipv4: &str, ipv6: Option<&str>) -> String {
    match ipv6 {
        Some(ipv6) => format!("if(is_ipv4=1, hex({ipv4}), hex({ipv6}))"),
        None => format!("hex({ipv4})"),
    }
}

fn translate_ip(tag: &str, ipv4: &str, ipv6: Option<&str>, op: Operator, value: &str) -> Result<String> {
    if op.is_like() || op.is_regexp() {
        return Err(QuerierError::unsupported_operator(op.dialect(), tag));
    }

    let subject = ip_subject(ipv4, ipv6);
    let mut cidrs = Vec::new();
    let mut ips = Vec::new();
    for item in encode::split_values(value) {
        if item.contains('/') {
            let range = CidrRange::parse(tag, &item)?;
            let bound = match op {
                Operator::Gt | Operator::Gte => format!("{subject} {op} {}", range.last_hex()),
                Operator::Lt | Operator::Lte => format!("{subject} {op} {}", range.first_hex()),
                _ => format!(
                    "({subject} >= {} AND {subject} <= {})",
                    range.first_hex(),
                    range.last_hex()
                ),
            };
            cidrs.push(bound);
        } else {
            ips.push(encode::ip_hex(tag, &item)?);
        }
    }

    let mut parts = Vec::new();
    if !cidrs.is_empty() {
        parts.push(format!("({})", cidrs.join(" OR ")));
    }
    if !ips.is_empty() {
        if op.is_range() {
            let bounds: Vec<_> = ips.iter().map(|ip| format!("{subject} {op} {ip}")).collect();
            parts.push(format!("({})", bounds.join(" OR ")));
        } else if op.is_list() {
            parts.push(format!("({subject} in ({}))", ips.join(",")));
        } else if ips.len() == 1 {
            parts.push(format!("({subject} = {})", ips[0]));
        } else {
            return Err(QuerierError::malformed(
                tag,
                value,
                format!("operator '{op}' expects a single value"),
            ));
        }
    }

    if parts.is_empty() {
        return Err(QuerierError::malformed(tag, value, "empty value list"));
    }
    Ok(negate_if(op, format!("({})", parts.join(" OR "))))
}

fn translate_sentinel(tag: &str, column: &str, sentinel: i64, op: Operator, value: &str) -> Result<String> {
    if !matches!(
        op,
        Operator::Eq | Operator::NotEq | Operator::In | Operator::NotIn
    ) {
        return Err(QuerierError::unsupported_operator(op.dialect(), tag));
    }

    let truth = TruthSet::from_values(value);
    if truth.is_empty() {
        return Err(QuerierError::malformed(tag, value, "empty value list"));
    }
    if truth.is_tautology() {
        return Ok("1=1".to_string());
    }
    let positive = matches!(op, Operator::Eq | Operator::In);
    let comparison = if truth.has_true == positive { "=" } else { "!=" };
    Ok(format!("{column} {comparison} {sentinel}"))
}

fn translate_row_id(tag: &str, op: Operator, value: &str) -> Result<String> {
    let ids = encode::parse_ids(tag, value)?;
    if ids.is_empty() {
        return Err(QuerierError::malformed(tag, value, "empty id list"));
    }

    if op.is_range() {
        let bounds: Vec<_> = ids.iter().map(|id| format!("(_id {op} {id})")).collect();
        return Ok(format!("({})", bounds.join(" OR ")));
    }
    if op.is_like() || op.is_regexp() {
        return Err(QuerierError::unsupported_operator(op.dialect(), tag));
    }

    let equal: Vec<_> = ids
        .iter()
        .map(|id| format!("(_id = {id} AND time = toDateTime(bitShiftRight({id}, 32)))"))
        .collect();
    Ok(negate_if(op, format!("({})", equal.join(" OR "))))
}
