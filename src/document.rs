use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{Error, ValidationErrors},
    schema::EntitySchema,
    value::{FieldType, FieldValue},
};

/// Storage shape of a record: one JSON object per entity instance.
pub type Document = serde_json::Map<String, Value>;

/// A typed entity served by the engine.
///
/// `TYPE` names the [`EntitySchema`] registered for it. The serialized form
/// must be a JSON object whose keys are the schema's fields.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

pub fn to_document<T: Serialize + ?Sized>(value: &T) -> Result<Document, Error> {
    match serde_json::to_value(value).map_err(|e| Error::Serialize(e.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Serialize(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, Error> {
    serde_json::from_value(Value::Object(document)).map_err(|e| Error::Deserialize(e.to_string()))
}

/// Typed value of `field` in `document`; missing fields read as null.
pub fn field_value(document: &Document, schema: &EntitySchema, field: &str) -> FieldValue {
    match (document.get(field), schema.get_field(field)) {
        (Some(value), Some(descriptor)) => FieldValue::from_json(value, descriptor.ty),
        _ => FieldValue::Null,
    }
}

pub fn document_id(document: &Document, schema: &EntitySchema) -> Option<Uuid> {
    field_value(document, schema, schema.id_field()).as_uuid()
}

/// Ids stored in a `UuidList` field; entries that are not ids are skipped.
pub fn id_list(document: &Document, field: &str) -> Vec<Uuid> {
    match document.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().and_then(|s| Uuid::parse_str(s).ok()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Checks a create/update payload: the id field must be absent (or null),
/// every key must be a declared field, and every value must fit its type.
pub(crate) fn validate_input(document: &Document, schema: &EntitySchema) -> Result<(), Error> {
    let mut errors = ValidationErrors::new();
    for (key, value) in document {
        let path = format!("input.{}", key);
        if key == schema.id_field() {
            if !value.is_null() {
                errors.push(path, "id cannot be specified");
            }
            continue;
        }
        let Some(field) = schema.get_field(key) else {
            errors.push(path, format!("unknown field on {}", schema.name()));
            continue;
        };
        if value.is_null() {
            if !field.nullable {
                errors.push(path, "field is not nullable");
            }
            continue;
        }
        if !json_fits(value, field.ty) {
            errors.push(path, format!("expected a {:?} value", field.ty));
        }
    }
    errors.into_result()
}

/// Rewrites validated input into the form serde writes for the typed entity:
/// ids as lowercase hyphenated text, timestamps as UTC RFC 3339. Stored
/// documents then compare equal across adapters however the caller spelled
/// a value.
pub(crate) fn normalize_input(document: Document, schema: &EntitySchema) -> Document {
    document
        .into_iter()
        .map(|(key, value)| {
            let value = match schema.get_field(&key).map(|field| field.ty) {
                Some(FieldType::UuidList) => match value {
                    Value::Array(items) => Value::Array(
                        items
                            .into_iter()
                            .map(|item| {
                                match item.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                                    Some(id) => Value::String(id.to_string()),
                                    None => item,
                                }
                            })
                            .collect(),
                    ),
                    other => other,
                },
                Some(ty @ (FieldType::Uuid | FieldType::Timestamp)) => {
                    match FieldValue::from_json(&value, ty) {
                        FieldValue::Null => value,
                        typed => typed.to_json(),
                    }
                }
                _ => value,
            };
            (key, value)
        })
        .collect()
}

fn json_fits(value: &Value, ty: FieldType) -> bool {
    match ty {
        FieldType::UuidList => match value {
            Value::Array(items) => items
                .iter()
                .all(|item| item.as_str().is_some_and(|s| Uuid::parse_str(s).is_ok())),
            _ => false,
        },
        FieldType::Int => value.is_i64() || value.is_u64(),
        _ => !FieldValue::from_json(value, ty).is_null(),
    }
}
