use std::cmp::Ordering;

use serde_json::Value;

use super::{Comparison, ComparisonOp, Filter};
use crate::{
    document::{Document, field_value},
    schema::{EntitySchema, RelationDescriptor},
    value::FieldValue,
};

/// Gives the evaluator access to the records behind a `relation.field` path.
pub trait RelatedRecords {
    /// Target schema and the records related to `source` through `relation`,
    /// or `None` when the target is unknown.
    fn related<'a>(
        &'a self,
        relation: &RelationDescriptor,
        source: &Document,
        schema: &EntitySchema,
    ) -> Option<(&'a EntitySchema, Vec<&'a Document>)>;
}

/// Evaluator context for filters without relation paths.
pub struct NoRelations;

impl RelatedRecords for NoRelations {
    fn related<'a>(
        &'a self,
        _relation: &RelationDescriptor,
        _source: &Document,
        _schema: &EntitySchema,
    ) -> Option<(&'a EntitySchema, Vec<&'a Document>)> {
        None
    }
}

/// Evaluates `filter` against one stored document.
///
/// Nulls follow SQL semantics: a null or missing value satisfies only
/// `is(None)` and `isNot(Some(_))`. The filter is expected to have passed
/// [`validate`](super::validate); unknown fields read as null.
pub fn matches(
    filter: &Filter,
    document: &Document,
    schema: &EntitySchema,
    related: &dyn RelatedRecords,
) -> bool {
    match filter {
        Filter::And(parts) => parts
            .iter()
            .all(|part| matches(part, document, schema, related)),
        Filter::Or(parts) => {
            parts.is_empty()
                || parts
                    .iter()
                    .any(|part| matches(part, document, schema, related))
        }
        Filter::Compare(comparison) => match comparison.relation_path() {
            None => compare_field(document, schema, &comparison.field, &comparison.op),
            Some((relation_name, field)) => {
                matches_related(comparison, relation_name, field, document, schema, related)
            }
        },
    }
}

fn matches_related(
    comparison: &Comparison,
    relation_name: &str,
    field: &str,
    document: &Document,
    schema: &EntitySchema,
    related: &dyn RelatedRecords,
) -> bool {
    let Some(relation) = schema.get_relation(relation_name) else {
        return false;
    };
    let Some((target, records)) = related.related(relation, document, schema) else {
        return false;
    };
    records
        .into_iter()
        .any(|record| compare_field(record, target, field, &comparison.op))
}

fn compare_field(
    document: &Document,
    schema: &EntitySchema,
    field: &str,
    op: &ComparisonOp,
) -> bool {
    let raw_null = document.get(field).is_none_or(Value::is_null);
    let Some(ty) = schema.get_field(field).map(|f| f.ty) else {
        return matches!(op, ComparisonOp::Is(None) | ComparisonOp::IsNot(Some(_)));
    };
    let value = field_value(document, schema, field);

    let cmp = |expected: &FieldValue| -> Option<Ordering> {
        if value.is_null() {
            return None;
        }
        expected.coerce(ty).and_then(|expected| value.compare(&expected))
    };

    match op {
        ComparisonOp::Eq(v) => cmp(v) == Some(Ordering::Equal),
        ComparisonOp::Neq(v) => cmp(v).is_some_and(|o| o != Ordering::Equal),
        ComparisonOp::Gt(v) => cmp(v) == Some(Ordering::Greater),
        ComparisonOp::Gte(v) => cmp(v).is_some_and(|o| o != Ordering::Less),
        ComparisonOp::Lt(v) => cmp(v) == Some(Ordering::Less),
        ComparisonOp::Lte(v) => cmp(v).is_some_and(|o| o != Ordering::Greater),
        ComparisonOp::In(values) => values.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
        ComparisonOp::NotIn(values) => {
            !value.is_null() && values.iter().all(|v| cmp(v) != Some(Ordering::Equal))
        }
        ComparisonOp::Is(None) => raw_null,
        ComparisonOp::IsNot(None) => !raw_null,
        ComparisonOp::Is(Some(b)) => value.as_bool() == Some(*b),
        ComparisonOp::IsNot(Some(b)) => value.as_bool() != Some(*b),
        ComparisonOp::Like(pattern) => {
            value.as_string().is_some_and(|s| like_matches(s, pattern, false))
        }
        ComparisonOp::NotLike(pattern) => {
            value.as_string().is_some_and(|s| !like_matches(s, pattern, false))
        }
        ComparisonOp::ILike(pattern) => {
            value.as_string().is_some_and(|s| like_matches(s, pattern, true))
        }
        ComparisonOp::NotILike(pattern) => {
            value.as_string().is_some_and(|s| !like_matches(s, pattern, true))
        }
    }
}

/// SQL `LIKE` matching: `%` matches any run of characters, `_` exactly one.
pub fn like_matches(value: &str, pattern: &str, case_insensitive: bool) -> bool {
    let (value, pattern): (Vec<char>, Vec<char>) = if case_insensitive {
        (
            value.to_lowercase().chars().collect(),
            pattern.to_lowercase().chars().collect(),
        )
    } else {
        (value.chars().collect(), pattern.chars().collect())
    };

    let (mut vi, mut pi) = (0, 0);
    // Last `%` seen and the value position it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;
    while vi < value.len() {
        if pi < pattern.len() && pattern[pi] == '%' {
            backtrack = Some((pi, vi));
            pi += 1;
        } else if pi < pattern.len() && (pattern[pi] == '_' || pattern[pi] == value[vi]) {
            vi += 1;
            pi += 1;
        } else if let Some((star, absorbed)) = backtrack {
            pi = star + 1;
            vi = absorbed + 1;
            backtrack = Some((star, absorbed + 1));
        } else {
            return false;
        }
    }
    pattern[pi..].iter().all(|c| *c == '%')
}
