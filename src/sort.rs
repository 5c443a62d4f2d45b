use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{
    document::{Document, field_value},
    error::{Error, ValidationErrors},
    schema::EntitySchema,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortNulls {
    NullsFirst,
    NullsLast,
}

/// One key of a multi-key sort. Without `nulls`, nulls sort lowest: first
/// for `ASC`, last for `DESC`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nulls: Option<SortNulls>,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
            nulls: None,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
            nulls: None,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = Some(SortNulls::NullsFirst);
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(SortNulls::NullsLast);
        self
    }

    /// Whether nulls come before non-null values in the final order.
    pub fn nulls_come_first(&self) -> bool {
        match self.nulls {
            Some(SortNulls::NullsFirst) => true,
            Some(SortNulls::NullsLast) => false,
            None => self.direction == SortDirection::Asc,
        }
    }

    /// The same key walking the opposite way, nulls included.
    pub fn reversed(&self) -> Self {
        Self {
            field: self.field.clone(),
            direction: match self.direction {
                SortDirection::Asc => SortDirection::Desc,
                SortDirection::Desc => SortDirection::Asc,
            },
            nulls: self.nulls.map(|nulls| match nulls {
                SortNulls::NullsFirst => SortNulls::NullsLast,
                SortNulls::NullsLast => SortNulls::NullsFirst,
            }),
        }
    }
}

/// Every key must name a declared, sortable field of the entity itself.
pub fn validate(sorting: &[SortField], schema: &EntitySchema) -> Result<(), Error> {
    let mut errors = ValidationErrors::new();
    for (i, sort) in sorting.iter().enumerate() {
        let path = format!("sorting[{}].{}", i, sort.field);
        match schema.get_field(&sort.field) {
            Some(field) if field.sortable => {}
            Some(_) => errors.push(path, "field is not sortable"),
            None if sort.field.contains('.') => {
                errors.push(path, "sorting by relation fields is not supported")
            }
            None => errors.push(path, format!("unknown field on {}", schema.name())),
        }
    }
    errors.into_result()
}

/// `sorting` with the id field appended when absent, so every position in
/// the order is unique.
pub fn with_tiebreaker(sorting: &[SortField], schema: &EntitySchema) -> Vec<SortField> {
    let mut out = sorting.to_vec();
    if !out.iter().any(|sort| sort.field == schema.id_field()) {
        out.push(SortField::asc(schema.id_field()));
    }
    out
}

pub fn reversed(sorting: &[SortField]) -> Vec<SortField> {
    sorting.iter().map(SortField::reversed).collect()
}

/// Comparator applying `sorting` left to right.
pub fn compare_documents(
    a: &Document,
    b: &Document,
    sorting: &[SortField],
    schema: &EntitySchema,
) -> Ordering {
    for sort in sorting {
        let left = field_value(a, schema, &sort.field);
        let right = field_value(b, schema, &sort.field);
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if sort.nulls_come_first() => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if sort.nulls_come_first() => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ordering = left.compare(&right).unwrap_or(Ordering::Equal);
                match sort.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldType;
    use serde_json::json;

    fn schema() -> EntitySchema {
        EntitySchema::new("TodoItem")
            .field("title", FieldType::String)
            .nullable_field("priority", FieldType::Int)
            .field("completed", FieldType::Bool)
    }

    fn rows() -> Vec<Document> {
        [
            json!({"title": "b", "priority": 2}),
            json!({"title": "a", "priority": null}),
            json!({"title": "c", "priority": 1}),
            json!({"title": "d", "priority": 2}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    fn titles(sorting: &[SortField]) -> Vec<String> {
        let schema = schema();
        let mut rows = rows();
        rows.sort_by(|a, b| compare_documents(a, b, sorting, &schema));
        rows.iter()
            .map(|row| row["title"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn nulls_sort_lowest_by_default() {
        assert_eq!(titles(&[SortField::asc("priority")]), ["a", "c", "b", "d"]);
        assert_eq!(titles(&[SortField::desc("priority")]), ["b", "d", "c", "a"]);
    }

    #[test]
    fn explicit_null_placement_and_secondary_key() {
        assert_eq!(
            titles(&[SortField::asc("priority").nulls_last(), SortField::desc("title")]),
            ["c", "d", "b", "a"]
        );
    }

    #[test]
    fn reversed_walks_the_exact_opposite_order() {
        let sorting = [SortField::asc("priority"), SortField::asc("title")];
        let mut forward = titles(&sorting);
        forward.reverse();
        assert_eq!(titles(&reversed(&sorting)), forward);
    }

    #[test]
    fn rejects_unknown_and_unsortable_fields() {
        let Error::Validation(errors) = validate(
            &[
                SortField::asc("nope"),
                SortField::asc("completed"),
                SortField::asc("assignee.name"),
            ],
            &schema(),
        )
        .unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn deserializes_transport_shape() {
        let sort: SortField =
            serde_json::from_value(json!({"field": "title", "direction": "DESC", "nulls": "NULLS_FIRST"}))
                .unwrap();
        assert_eq!(sort, SortField::desc("title").nulls_first());
    }
}
