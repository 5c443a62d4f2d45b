//! Aggregation engine.
//!
//! An [`AggregateQuery`] lists, per function, the fields to aggregate. The
//! [`AggregateResponse`] mirrors it with one scalar per requested field:
//! `count` is never null, every other function is null when no non-null
//! value was seen.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    document::{Document, field_value},
    error::{Error, ValidationErrors},
    schema::EntitySchema,
    value::FieldValue,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateQuery {
    pub count: Vec<String>,
    pub sum: Vec<String>,
    pub avg: Vec<String>,
    pub min: Vec<String>,
    pub max: Vec<String>,
}

impl AggregateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(mut self, field: impl Into<String>) -> Self {
        self.count.push(field.into());
        self
    }

    pub fn sum(mut self, field: impl Into<String>) -> Self {
        self.sum.push(field.into());
        self
    }

    pub fn avg(mut self, field: impl Into<String>) -> Self {
        self.avg.push(field.into());
        self
    }

    pub fn min(mut self, field: impl Into<String>) -> Self {
        self.min.push(field.into());
        self
    }

    pub fn max(mut self, field: impl Into<String>) -> Self {
        self.max.push(field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count.is_empty()
            && self.sum.is_empty()
            && self.avg.is_empty()
            && self.min.is_empty()
            && self.max.is_empty()
    }

    /// Every field must be declared; sum/avg need numeric fields and min/max
    /// orderable ones.
    pub fn validate(&self, schema: &EntitySchema) -> Result<(), Error> {
        let mut errors = ValidationErrors::new();
        let sections: [(&str, &Vec<String>); 5] = [
            ("count", &self.count),
            ("sum", &self.sum),
            ("avg", &self.avg),
            ("min", &self.min),
            ("max", &self.max),
        ];
        for (function, fields) in sections {
            for name in fields {
                let path = format!("aggregate.{}.{}", function, name);
                let Some(field) = schema.get_field(name) else {
                    errors.push(path, format!("unknown field on {}", schema.name()));
                    continue;
                };
                match function {
                    "sum" | "avg" if !field.ty.is_numeric() => {
                        errors.push(path, "requires a numeric field")
                    }
                    "min" | "max" if !field.ty.is_orderable() => {
                        errors.push(path, "requires an orderable field")
                    }
                    _ => {}
                }
            }
        }
        errors.into_result()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateResponse {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub count: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sum: BTreeMap<String, Option<f64>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub avg: BTreeMap<String, Option<f64>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub min: BTreeMap<String, Option<FieldValue>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub max: BTreeMap<String, Option<FieldValue>>,
}

impl AggregateResponse {
    /// The response over zero rows: counts of 0, everything else null.
    pub fn empty(query: &AggregateQuery) -> Self {
        Aggregator::new(query).finish()
    }
}

/// Aggregate of one group. `key` is the text form of the grouping value
/// (see [`FieldValue::key_string`]); ungrouped aggregates use `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateGroup {
    pub key: Option<String>,
    pub response: AggregateResponse,
}

/// Streaming accumulator behind in-memory aggregation.
#[derive(Debug, Clone)]
pub struct Aggregator {
    query: AggregateQuery,
    counts: Vec<u64>,
    sums: Vec<Option<f64>>,
    avgs: Vec<(f64, u64)>,
    mins: Vec<Option<FieldValue>>,
    maxs: Vec<Option<FieldValue>>,
}

impl Aggregator {
    pub fn new(query: &AggregateQuery) -> Self {
        Self {
            counts: vec![0; query.count.len()],
            sums: vec![None; query.sum.len()],
            avgs: vec![(0.0, 0); query.avg.len()],
            mins: vec![None; query.min.len()],
            maxs: vec![None; query.max.len()],
            query: query.clone(),
        }
    }

    pub fn push(&mut self, document: &Document, schema: &EntitySchema) {
        for (i, field) in self.query.count.iter().enumerate() {
            let present = match schema.get_field(field) {
                Some(_) => document.get(field).is_some_and(|v| !v.is_null()),
                None => false,
            };
            if present {
                self.counts[i] += 1;
            }
        }
        for (i, field) in self.query.sum.iter().enumerate() {
            if let Some(n) = field_value(document, schema, field).as_float() {
                self.sums[i] = Some(self.sums[i].unwrap_or(0.0) + n);
            }
        }
        for (i, field) in self.query.avg.iter().enumerate() {
            if let Some(n) = field_value(document, schema, field).as_float() {
                self.avgs[i].0 += n;
                self.avgs[i].1 += 1;
            }
        }
        for (i, field) in self.query.min.iter().enumerate() {
            let value = field_value(document, schema, field);
            if value.is_null() {
                continue;
            }
            let replace = match &self.mins[i] {
                Some(current) => value.sort_cmp(current).is_lt(),
                None => true,
            };
            if replace {
                self.mins[i] = Some(value);
            }
        }
        for (i, field) in self.query.max.iter().enumerate() {
            let value = field_value(document, schema, field);
            if value.is_null() {
                continue;
            }
            let replace = match &self.maxs[i] {
                Some(current) => value.sort_cmp(current).is_gt(),
                None => true,
            };
            if replace {
                self.maxs[i] = Some(value);
            }
        }
    }

    pub fn finish(self) -> AggregateResponse {
        let Aggregator {
            query,
            counts,
            sums,
            avgs,
            mins,
            maxs,
        } = self;
        AggregateResponse {
            count: query.count.into_iter().zip(counts).collect(),
            sum: query.sum.into_iter().zip(sums).collect(),
            avg: query
                .avg
                .into_iter()
                .zip(avgs)
                .map(|(field, (total, n))| (field, (n > 0).then(|| total / n as f64)))
                .collect(),
            min: query.min.into_iter().zip(mins).collect(),
            max: query.max.into_iter().zip(maxs).collect(),
        }
    }
}

/// Aggregates `documents`, optionally grouped by the value of `group_by`.
///
/// Without grouping exactly one group (key `None`) comes back, even for no
/// documents. Grouped results come in first-seen order; documents whose
/// grouping value is null are skipped.
pub fn aggregate_documents<'a>(
    documents: impl IntoIterator<Item = &'a Document>,
    query: &AggregateQuery,
    schema: &EntitySchema,
    group_by: Option<&str>,
) -> Vec<AggregateGroup> {
    let Some(group_by) = group_by else {
        let mut aggregator = Aggregator::new(query);
        for document in documents {
            aggregator.push(document, schema);
        }
        return vec![AggregateGroup {
            key: None,
            response: aggregator.finish(),
        }];
    };

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Aggregator> = HashMap::new();
    for document in documents {
        let Some(key) = field_value(document, schema, group_by).key_string() else {
            continue;
        };
        let aggregator = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Aggregator::new(query)
        });
        aggregator.push(document, schema);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let aggregator = groups.remove(&key)?;
            Some(AggregateGroup {
                key: Some(key),
                response: aggregator.finish(),
            })
        })
        .collect()
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

    fn docs() -> Vec<Document> {
        [
            json!({"title": "b", "priority": 2, "completed": true}),
            json!({"title": "a", "priority": null, "completed": false}),
            json!({"title": "c", "priority": 4, "completed": true}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    fn query() -> AggregateQuery {
        AggregateQuery::new()
            .count("priority")
            .sum("priority")
            .avg("priority")
            .min("title")
            .max("priority")
    }

    #[test]
    fn aggregates_ignore_nulls() {
        let groups = aggregate_documents(&docs(), &query(), &schema(), None);
        assert_eq!(groups.len(), 1);
        let response = &groups[0].response;
        assert_eq!(response.count["priority"], 2);
        assert_eq!(response.sum["priority"], Some(6.0));
        assert_eq!(response.avg["priority"], Some(3.0));
        assert_eq!(response.min["title"], Some(FieldValue::String("a".into())));
        assert_eq!(response.max["priority"], Some(FieldValue::Int(4)));
    }

    #[test]
    fn empty_input_yields_zero_counts_and_nulls() {
        let groups = aggregate_documents(&Vec::<Document>::new(), &query(), &schema(), None);
        assert_eq!(groups[0].key, None);
        assert_eq!(groups[0].response, AggregateResponse::empty(&query()));

        let empty = AggregateResponse::empty(&AggregateQuery::new().count("id").min("id"));
        assert_eq!(
            serde_json::to_value(&empty).unwrap(),
            json!({"count": {"id": 0}, "min": {"id": null}})
        );
    }

    #[test]
    fn groups_in_first_seen_order() {
        let groups = aggregate_documents(
            &docs(),
            &AggregateQuery::new().count("title"),
            &schema(),
            Some("completed"),
        );
        let keys: Vec<_> = groups.iter().map(|g| g.key.clone().unwrap()).collect();
        assert_eq!(keys, ["true", "false"]);
        assert_eq!(groups[0].response.count["title"], 2);
    }

    #[test]
    fn validation_checks_function_types() {
        let query = AggregateQuery::new()
            .sum("title")
            .min("completed")
            .avg("missing")
            .count("completed");
        let Error::Validation(errors) = query.validate(&schema()).unwrap_err() else {
            panic!("expected validation error");
        };
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            ["aggregate.sum.title", "aggregate.avg.missing", "aggregate.min.completed"]
        );
    }

    #[test]
    fn deserializes_partial_queries() {
        let query: AggregateQuery = serde_json::from_value(json!({"count": ["id"]})).unwrap();
        assert_eq!(query, AggregateQuery::new().count("id"));
    }
}
