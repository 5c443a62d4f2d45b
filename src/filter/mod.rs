//! Filter AST.
//!
//! A [`Filter`] is a tree of [`Comparison`] leaves joined by `And`/`Or`.
//! An empty `And`/`Or` matches every record, so `Filter::default()` is the
//! "match all" read filter. Mutations over many records refuse such filters
//! (see [`Filter::is_empty`]).

mod eval;
mod validate;

use std::collections::BTreeSet;

pub use eval::{NoRelations, RelatedRecords, like_matches, matches};
pub use validate::{validate, validate_mutation};

use crate::value::{FieldValue, ToFieldValue};

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Compare(Comparison),
}

/// `field` is either a field of the filtered entity or a one-level relation
/// path (`relation.field`).
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub field: String,
    pub op: ComparisonOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonOp {
    Eq(FieldValue),
    Neq(FieldValue),
    Gt(FieldValue),
    Gte(FieldValue),
    Lt(FieldValue),
    Lte(FieldValue),
    In(Vec<FieldValue>),
    NotIn(Vec<FieldValue>),
    /// `None` tests for null, `Some(b)` for the boolean `b`.
    Is(Option<bool>),
    IsNot(Option<bool>),
    Like(String),
    NotLike(String),
    ILike(String),
    NotILike(String),
}

impl ComparisonOp {
    pub fn name(&self) -> &'static str {
        match self {
            ComparisonOp::Eq(_) => "eq",
            ComparisonOp::Neq(_) => "neq",
            ComparisonOp::Gt(_) => "gt",
            ComparisonOp::Gte(_) => "gte",
            ComparisonOp::Lt(_) => "lt",
            ComparisonOp::Lte(_) => "lte",
            ComparisonOp::In(_) => "in",
            ComparisonOp::NotIn(_) => "notIn",
            ComparisonOp::Is(_) => "is",
            ComparisonOp::IsNot(_) => "isNot",
            ComparisonOp::Like(_) => "like",
            ComparisonOp::NotLike(_) => "notLike",
            ComparisonOp::ILike(_) => "iLike",
            ComparisonOp::NotILike(_) => "notILike",
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::all()
    }
}

impl Comparison {
    /// Splits `relation.field` into its parts; plain fields return `None`.
    pub fn relation_path(&self) -> Option<(&str, &str)> {
        self.field.split_once('.')
    }
}

impl Filter {
    /// Matches every record.
    pub fn all() -> Self {
        Filter::And(Vec::new())
    }

    pub fn compare(field: impl Into<String>, op: ComparisonOp) -> Self {
        Filter::Compare(Comparison {
            field: field.into(),
            op,
        })
    }

    pub fn eq(field: impl Into<String>, value: impl ToFieldValue) -> Self {
        Self::compare(field, ComparisonOp::Eq(value.to_field_value()))
    }

    pub fn neq(field: impl Into<String>, value: impl ToFieldValue) -> Self {
        Self::compare(field, ComparisonOp::Neq(value.to_field_value()))
    }

    pub fn gt(field: impl Into<String>, value: impl ToFieldValue) -> Self {
        Self::compare(field, ComparisonOp::Gt(value.to_field_value()))
    }

    pub fn gte(field: impl Into<String>, value: impl ToFieldValue) -> Self {
        Self::compare(field, ComparisonOp::Gte(value.to_field_value()))
    }

    pub fn lt(field: impl Into<String>, value: impl ToFieldValue) -> Self {
        Self::compare(field, ComparisonOp::Lt(value.to_field_value()))
    }

    pub fn lte(field: impl Into<String>, value: impl ToFieldValue) -> Self {
        Self::compare(field, ComparisonOp::Lte(value.to_field_value()))
    }

    pub fn is_in<V: ToFieldValue>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::compare(
            field,
            ComparisonOp::In(values.into_iter().map(|v| v.to_field_value()).collect()),
        )
    }

    pub fn not_in<V: ToFieldValue>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::compare(
            field,
            ComparisonOp::NotIn(values.into_iter().map(|v| v.to_field_value()).collect()),
        )
    }

    pub fn is(field: impl Into<String>, value: Option<bool>) -> Self {
        Self::compare(field, ComparisonOp::Is(value))
    }

    pub fn is_not(field: impl Into<String>, value: Option<bool>) -> Self {
        Self::compare(field, ComparisonOp::IsNot(value))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::is(field, None)
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::is_not(field, None)
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(field, ComparisonOp::Like(pattern.into()))
    }

    pub fn not_like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(field, ComparisonOp::NotLike(pattern.into()))
    }

    pub fn ilike(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(field, ComparisonOp::ILike(pattern.into()))
    }

    pub fn not_ilike(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(field, ComparisonOp::NotILike(pattern.into()))
    }

    pub fn all_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    /// Conjunction of `self` and `other`; empty sides drop out and nested
    /// `And`s are flattened.
    pub fn and(self, other: Filter) -> Filter {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        let mut parts = match self {
            Filter::And(parts) => parts,
            single => vec![single],
        };
        match other {
            Filter::And(more) => parts.extend(more),
            single => parts.push(single),
        }
        Filter::And(parts)
    }

    /// Disjunction of `self` and `other`. An empty side already matches
    /// everything, so the result does too.
    pub fn or(self, other: Filter) -> Filter {
        if self.is_empty() || other.is_empty() {
            return Filter::all();
        }
        let mut parts = match self {
            Filter::Or(parts) => parts,
            single => vec![single],
        };
        match other {
            Filter::Or(more) => parts.extend(more),
            single => parts.push(single),
        }
        Filter::Or(parts)
    }

    /// `true` when the tree contains no comparison at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Filter::And(parts) | Filter::Or(parts) => parts.iter().all(Filter::is_empty),
            Filter::Compare(_) => false,
        }
    }

    /// Every field or relation path referenced by the tree.
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Filter::And(parts) | Filter::Or(parts) => {
                for part in parts {
                    part.collect_fields(out);
                }
            }
            Filter::Compare(comparison) => {
                out.insert(comparison.field.as_str());
            }
        }
    }

    /// Relations reached through `relation.field` paths.
    pub fn relation_names(&self) -> BTreeSet<&str> {
        self.fields()
            .into_iter()
            .filter_map(|field| field.split_once('.').map(|(relation, _)| relation))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_empty() {
        assert!(Filter::default().is_empty());
        assert!(Filter::all_of([Filter::Or(vec![]), Filter::all()]).is_empty());
        assert!(!Filter::eq("title", "a").is_empty());
    }

    #[test]
    fn and_flattens_and_drops_empty_sides() {
        let f = Filter::eq("a", 1)
            .and(Filter::all())
            .and(Filter::all_of([Filter::eq("b", 2), Filter::eq("c", 3)]));
        let Filter::And(parts) = f else {
            panic!("expected and");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(Filter::all().and(Filter::eq("a", 1)), Filter::eq("a", 1));
    }

    #[test]
    fn collects_fields_and_relations() {
        let f = Filter::eq("title", "x")
            .or(Filter::gt("assignee.age", 3))
            .and(Filter::is_null("due"));
        let fields: Vec<_> = f.fields().into_iter().collect();
        assert_eq!(fields, vec!["assignee.age", "due", "title"]);
        assert_eq!(f.relation_names().into_iter().collect::<Vec<_>>(), vec!["assignee"]);
    }
}
