use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// Storage type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Uuid,
    Timestamp,
    /// List of ids; the join key of an owned MANY relation.
    UuidList,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }

    pub fn is_orderable(&self) -> bool {
        !matches!(self, FieldType::Bool | FieldType::UuidList)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldType::String)
    }
}

/// Typed scalar carried by filters, cursors and aggregate results.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            FieldValue::Uuid(u) => Some(*u),
            FieldValue::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            FieldValue::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Reads a stored JSON value as `ty`. Values that do not fit the type
    /// read as `Null`, which no comparison other than a null test matches.
    pub fn from_json(value: &Value, ty: FieldType) -> FieldValue {
        match (ty, value) {
            (_, Value::Null) => FieldValue::Null,
            (FieldType::String, Value::String(s)) => FieldValue::String(s.clone()),
            (FieldType::Int, Value::Number(n)) => n
                .as_i64()
                .map(FieldValue::Int)
                .or_else(|| n.as_f64().map(FieldValue::Float))
                .unwrap_or(FieldValue::Null),
            (FieldType::Float, Value::Number(n)) => {
                n.as_f64().map(FieldValue::Float).unwrap_or(FieldValue::Null)
            }
            (FieldType::Bool, Value::Bool(b)) => FieldValue::Bool(*b),
            (FieldType::Uuid, Value::String(s)) => Uuid::parse_str(s)
                .map(FieldValue::Uuid)
                .unwrap_or(FieldValue::Null),
            (FieldType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| FieldValue::Timestamp(t.with_timezone(&Utc)))
                .unwrap_or(FieldValue::Null),
            _ => FieldValue::Null,
        }
    }

    /// JSON form as written by serde for the same Rust type.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => Value::from(*f),
            FieldValue::String(s) => Value::String(s.clone()),
            FieldValue::Uuid(u) => Value::String(u.to_string()),
            FieldValue::Timestamp(t) => Value::String(timestamp_string(t)),
        }
    }

    /// Converts a caller-supplied value into the representation stored for
    /// `ty`, or `None` when it cannot be one.
    pub fn coerce(&self, ty: FieldType) -> Option<FieldValue> {
        match (ty, self) {
            (_, FieldValue::Null) => Some(FieldValue::Null),
            (FieldType::String, FieldValue::String(_)) => Some(self.clone()),
            (FieldType::Int, FieldValue::Int(_)) => Some(self.clone()),
            (FieldType::Float, FieldValue::Float(_)) => Some(self.clone()),
            (FieldType::Float, FieldValue::Int(i)) => Some(FieldValue::Float(*i as f64)),
            (FieldType::Bool, FieldValue::Bool(_)) => Some(self.clone()),
            (FieldType::Uuid, _) => self.as_uuid().map(FieldValue::Uuid),
            (FieldType::Timestamp, _) => self.as_timestamp().map(FieldValue::Timestamp),
            _ => None,
        }
    }

    /// Grouping key shared by every adapter: the plain text of the value.
    pub fn key_string(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Int(i) => Some(i.to_string()),
            FieldValue::Float(f) => Some(f.to_string()),
            FieldValue::String(s) => Some(s.clone()),
            FieldValue::Uuid(u) => Some(u.to_string()),
            FieldValue::Timestamp(t) => Some(timestamp_string(t)),
        }
    }

    /// Ordering between two non-null values of compatible types.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (Uuid(a), String(b)) => Some(a.to_string().cmp(b)),
            (String(a), Uuid(b)) => Some(a.cmp(&b.to_string())),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting: null lowest, then by `compare`, with
    /// incomparable pairs treated as equal so the sort stays stable.
    pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.compare(other).unwrap_or(Ordering::Equal),
        }
    }
}

pub(crate) fn timestamp_string(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

pub trait ToFieldValue {
    fn to_field_value(&self) -> FieldValue;
}

impl ToFieldValue for FieldValue {
    fn to_field_value(&self) -> FieldValue {
        self.clone()
    }
}

impl ToFieldValue for String {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::String(self.clone())
    }
}

impl ToFieldValue for &str {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::String(self.to_string())
    }
}

impl ToFieldValue for i64 {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Int(*self)
    }
}

impl ToFieldValue for i32 {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Int(*self as i64)
    }
}

impl ToFieldValue for u32 {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Int(*self as i64)
    }
}

impl ToFieldValue for f64 {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Float(*self)
    }
}

impl ToFieldValue for bool {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Bool(*self)
    }
}

impl ToFieldValue for Uuid {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Uuid(*self)
    }
}

impl ToFieldValue for DateTime<Utc> {
    fn to_field_value(&self) -> FieldValue {
        FieldValue::Timestamp(*self)
    }
}

impl<T: ToFieldValue> ToFieldValue for Option<T> {
    fn to_field_value(&self) -> FieldValue {
        match self {
            Some(v) => v.to_field_value(),
            None => FieldValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_stored_json_by_type() {
        let id = Uuid::now_v7();
        assert_eq!(
            FieldValue::from_json(&json!(id.to_string()), FieldType::Uuid),
            FieldValue::Uuid(id)
        );
        assert_eq!(
            FieldValue::from_json(&json!(3), FieldType::Float),
            FieldValue::Float(3.0)
        );
        assert_eq!(
            FieldValue::from_json(&json!("nope"), FieldType::Uuid),
            FieldValue::Null
        );
    }

    #[test]
    fn numeric_types_compare_across_int_and_float() {
        assert_eq!(
            FieldValue::Int(2).compare(&FieldValue::Float(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(FieldValue::Bool(true).compare(&FieldValue::Int(1)), None);
    }

    #[test]
    fn nulls_sort_lowest() {
        assert_eq!(
            FieldValue::Null.sort_cmp(&FieldValue::Int(i64::MIN)),
            Ordering::Less
        );
    }

    #[test]
    fn coerce_accepts_uuid_strings() {
        let id = Uuid::now_v7();
        assert_eq!(
            FieldValue::String(id.to_string()).coerce(FieldType::Uuid),
            Some(FieldValue::Uuid(id))
        );
        assert_eq!(FieldValue::Bool(true).coerce(FieldType::Int), None);
    }
}
