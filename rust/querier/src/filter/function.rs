//! Filters over derived expressions: `Enum(<tag>)` and other functions.

use super::{CompileContext, FilterExpr, FunctionNode, WithClause};
use crate::{
    encode::{quote, unquote},
    error::{QuerierError, Result},
    operator::Operator,
    tag::{family::split_suffix, TagCategory, WhereTranslator},
};

const ENUM_PREFIX: &str = "Enum(";

/// Returns the tag wrapped by `Enum(...)`, if `expr` is one.
pub fn enum_argument(expr: &str) -> Option<&str> {
    expr.trim()
        .trim_matches('`')
        .strip_prefix(ENUM_PREFIX)
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|tag| tag.trim().trim_matches('`'))
}

/// Compiles `Enum(<tag>) <op> <value>`.
///
/// `None` means the tag has an enum description but no enum descriptor; the
/// caller emits the comparison as written.
pub fn enum_filter(ctx: &CompileContext<'_>, tag: &str, op: Operator, value: &str) -> Result<Option<String>> {
    let (base, _) = split_suffix(tag);
    let enum_file = ctx
        .tags
        .enum_file(base, ctx.db, ctx.table)
        .ok_or_else(|| QuerierError::NotFound(format!("tag {tag} in {}.{}", ctx.db, ctx.table)))?;
    let string_keyed = ctx.tags.is_string_enum(enum_file);

    let Some(descriptor) = ctx.tags.get(tag, ctx.db, ctx.table, TagCategory::Enum) else {
        return Ok(None);
    };
    let column = match &descriptor.translator {
        WhereTranslator::Enum { column } | WhereTranslator::Column { column } => column.as_str(),
        _ => tag,
    };

    let dictionary_name = enum_file
        .strip_suffix(&format!(".{}", ctx.language))
        .unwrap_or(enum_file);
    let dictionary = |op: Operator| {
        let name_filter = op.compare("name", value);
        let dictionary_name = quote(dictionary_name);
        if string_keyed {
            format!(
                "{column} IN (SELECT value FROM flow_tag.string_enum_map WHERE tag_name={dictionary_name} AND {name_filter})"
            )
        } else {
            format!(
                "toUInt64({column}) IN (SELECT value FROM flow_tag.int_enum_map WHERE tag_name={dictionary_name} AND {name_filter})"
            )
        }
    };

    // Raw values absent from the dictionary still match the physical column.
    let raw = if string_keyed {
        Some(value.trim().to_string())
    } else {
        unquote(value)
            .parse::<i64>()
            .ok()
            .map(|number| format!("toUInt64({number})"))
    };

    let filter = match (op, raw) {
        (Operator::Eq, Some(raw)) => format!("({}) OR ({tag} = {raw})", dictionary(Operator::Eq)),
        (Operator::NotEq, Some(raw)) => {
            format!("(not({})) AND ({tag} != {raw})", dictionary(Operator::Eq))
        }
        (Operator::NotEq, None) => format!("not({})", dictionary(Operator::Eq)),
        _ => dictionary(op),
    };
    Ok(Some(format!("({filter})")))
}

/// Function comparison emitted as written; its WITH clauses are collected by the caller.
pub fn function_filter(node: &FunctionNode, op: Operator, value: &str) -> (FilterExpr, Vec<WithClause>) {
    let expr = FilterExpr::Binary {
        left: Box::new(FilterExpr::Leaf(node.expr.trim().to_string())),
        op: op.dialect().to_string(),
        right: Box::new(FilterExpr::Leaf(value.trim().to_string())),
    };
    (expr, node.withs.clone())
}
