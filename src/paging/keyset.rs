//! Keyset cursors.
//!
//! A keyset cursor pins the sort-key values of one record instead of its
//! offset, so paging stays stable when rows are inserted ahead of the
//! window. Wire form: `base64({"type":"keyset","fields":[{field,value}...]})`.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    document::Document,
    error::Error,
    filter::Filter,
    schema::EntitySchema,
    sort::{SortDirection, SortField},
    value::FieldValue,
};

const KEYSET_TYPE: &str = "keyset";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeysetPin {
    pub field: String,
    pub value: Value,
}

#[derive(Serialize, Deserialize)]
struct KeysetCursor {
    #[serde(rename = "type")]
    kind: String,
    fields: Vec<KeysetPin>,
}

pub fn encode(pins: &[KeysetPin]) -> Result<String, Error> {
    let cursor = KeysetCursor {
        kind: KEYSET_TYPE.to_string(),
        fields: pins.to_vec(),
    };
    let json = serde_json::to_vec(&cursor).map_err(|e| Error::Serialize(e.to_string()))?;
    Ok(STANDARD.encode(json))
}

pub fn decode(cursor: &str, path: &str) -> Result<Vec<KeysetPin>, Error> {
    let invalid = || Error::validation(path, "invalid cursor");
    let bytes = STANDARD.decode(cursor).map_err(|_| invalid())?;
    let cursor: KeysetCursor = serde_json::from_slice(&bytes).map_err(|_| invalid())?;
    if cursor.kind != KEYSET_TYPE {
        return Err(invalid());
    }
    Ok(cursor.fields)
}

/// Pins `document` at its position under `sorting`.
pub fn pins_for(document: &Document, sorting: &[SortField]) -> Vec<KeysetPin> {
    sorting
        .iter()
        .map(|sort| KeysetPin {
            field: sort.field.clone(),
            value: document.get(&sort.field).cloned().unwrap_or(Value::Null),
        })
        .collect()
}

/// Filter selecting the records strictly after the pinned position when
/// walking `sorting`. To page backward, pass the reversed sort.
///
/// `sorting` must end in a unique key (see
/// [`with_tiebreaker`](crate::sort::with_tiebreaker)) and the pins must
/// name the same fields in the same order.
pub fn keyset_filter(
    sorting: &[SortField],
    pins: &[KeysetPin],
    schema: &EntitySchema,
    path: &str,
) -> Result<Filter, Error> {
    let mismatch = || Error::validation(path, "cursor does not match the requested sort");
    if sorting.len() != pins.len() {
        return Err(mismatch());
    }

    let mut disjuncts = Vec::with_capacity(sorting.len());
    let mut equal_prefix = Vec::with_capacity(sorting.len());
    for (sort, pin) in sorting.iter().zip(pins) {
        if sort.field != pin.field {
            return Err(mismatch());
        }
        let field = schema.get_field(&sort.field).ok_or_else(mismatch)?;
        let value = FieldValue::from_json(&pin.value, field.ty);

        if let Some(beyond) = beyond(sort, &value) {
            let mut parts = equal_prefix.clone();
            parts.push(beyond);
            disjuncts.push(Filter::all_of(parts));
        }
        equal_prefix.push(if value.is_null() {
            Filter::is_null(&sort.field)
        } else {
            Filter::eq(&sort.field, value)
        });
    }

    if disjuncts.is_empty() {
        return Err(mismatch());
    }
    Ok(Filter::any_of(disjuncts))
}

/// Records strictly past `value` on this key alone, or `None` when nothing
/// can follow it.
fn beyond(sort: &SortField, value: &FieldValue) -> Option<Filter> {
    let field = sort.field.as_str();
    if value.is_null() {
        return sort.nulls_come_first().then(|| Filter::is_not_null(field));
    }
    let past = match sort.direction {
        SortDirection::Asc => Filter::gt(field, value.clone()),
        SortDirection::Desc => Filter::lt(field, value.clone()),
    };
    if sort.nulls_come_first() {
        Some(past)
    } else {
        Some(Filter::any_of([past, Filter::is_null(field)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::{NoRelations, matches},
        sort::{compare_documents, with_tiebreaker},
        value::FieldType,
    };
    use serde_json::json;
    use uuid::Uuid;

    fn schema() -> EntitySchema {
        EntitySchema::new("TodoItem")
            .field("title", FieldType::String)
            .nullable_field("priority", FieldType::Int)
    }

    fn rows() -> Vec<Document> {
        [(1, Some(2)), (2, None), (3, Some(1)), (4, Some(2)), (5, None)]
            .into_iter()
            .map(|(n, priority)| {
                json!({"id": Uuid::from_u128(n), "title": format!("t{n}"), "priority": priority})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    fn walk(sorting: &[SortField]) -> Vec<String> {
        let schema = schema();
        let sorting = with_tiebreaker(sorting, &schema);
        let mut rows = rows();
        rows.sort_by(|a, b| compare_documents(a, b, &sorting, &schema));

        // Every row must be followed by exactly the rows after it.
        for (i, row) in rows.iter().enumerate() {
            let pins = decode(&encode(&pins_for(row, &sorting)).unwrap(), "after").unwrap();
            let filter = keyset_filter(&sorting, &pins, &schema, "after").unwrap();
            let after: Vec<_> = rows
                .iter()
                .filter(|r| matches(&filter, r, &schema, &NoRelations))
                .collect();
            assert_eq!(after, rows[i + 1..].iter().collect::<Vec<_>>(), "{row:?}");
        }
        rows.iter()
            .map(|row| row["title"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn filter_selects_exactly_the_following_rows() {
        assert_eq!(
            walk(&[SortField::asc("priority")]),
            ["t2", "t5", "t3", "t1", "t4"]
        );
        assert_eq!(
            walk(&[SortField::desc("priority")]),
            ["t1", "t4", "t3", "t2", "t5"]
        );
        walk(&[SortField::asc("priority").nulls_last()]);
        walk(&[SortField::desc("priority").nulls_first(), SortField::desc("title")]);
    }

    #[test]
    fn rejects_foreign_cursors() {
        assert!(decode(&crate::paging::cursor::encode(3), "after").is_err());
        let schema = schema();
        let pins = vec![KeysetPin {
            field: "title".into(),
            value: json!("t1"),
        }];
        let err = keyset_filter(&[SortField::asc("id")], &pins, &schema, "after").unwrap_err();
        assert!(err.is_validation());
    }
}
