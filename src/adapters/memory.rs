use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    adapters::Adapter,
    aggregate::{AggregateGroup, AggregateQuery, aggregate_documents},
    document::{Document, document_id, field_value, id_list},
    error::Error,
    filter::{Filter, RelatedRecords, matches},
    query::QueryPlan,
    schema::{Cardinality, EntitySchema, RelationDescriptor, RelationKind, SchemaRegistry},
    sort::compare_documents,
};

type Store = HashMap<String, Vec<Document>>;

/// Document-collection backend kept in process memory.
///
/// Each entity type is a collection of JSON documents in insertion order.
/// Filters, sorts and aggregates are evaluated in Rust against the schema
/// registry, so behaviour matches the SQL adapters without a database.
pub struct MemoryAdapter {
    registry: Arc<SchemaRegistry>,
    store: RwLock<Store>,
}

impl MemoryAdapter {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            store: RwLock::new(HashMap::new()),
        }
    }

    fn schema(&self, entity: &str) -> Result<&EntitySchema, Error> {
        self.registry.entity(entity).map(Arc::as_ref)
    }
}

/// Read view resolving relation paths against the other collections.
struct StoreView<'s> {
    registry: &'s SchemaRegistry,
    store: &'s Store,
}

impl StoreView<'_> {
    fn rows(&self, entity: &str) -> &[Document] {
        self.store.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Positions of the records of `entity` matching `filter`.
    fn matching(&self, entity: &str, schema: &EntitySchema, filter: &Filter) -> Vec<usize> {
        self.rows(entity)
            .iter()
            .enumerate()
            .filter(|(_, row)| matches(filter, row, schema, self))
            .map(|(i, _)| i)
            .collect()
    }
}

impl RelatedRecords for StoreView<'_> {
    fn related<'a>(
        &'a self,
        relation: &RelationDescriptor,
        source: &Document,
        schema: &EntitySchema,
    ) -> Option<(&'a EntitySchema, Vec<&'a Document>)> {
        let target = self.registry.get(&relation.target)?.as_ref();
        let rows = self.rows(&relation.target);

        let related = match (&relation.kind, relation.cardinality) {
            (RelationKind::Owned { join_key }, Cardinality::One) => {
                match field_value(source, schema, join_key).as_uuid() {
                    Some(fk) => rows
                        .iter()
                        .filter(|row| document_id(row, target) == Some(fk))
                        .collect(),
                    None => Vec::new(),
                }
            }
            (RelationKind::Owned { join_key }, Cardinality::Many) => {
                let ids = id_list(source, join_key);
                rows.iter()
                    .filter(|row| document_id(row, target).is_some_and(|id| ids.contains(&id)))
                    .collect()
            }
            (RelationKind::Virtual { lookup_key }, _) => match document_id(source, schema) {
                Some(id) => rows
                    .iter()
                    .filter(|row| field_value(row, target, lookup_key).as_uuid() == Some(id))
                    .collect(),
                None => Vec::new(),
            },
        };
        Some((target, related))
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn query(&self, entity: &str, plan: &QueryPlan) -> Result<Vec<Document>, Error> {
        let schema = self.schema(entity)?;
        let store = self.store.read().await;
        let view = StoreView {
            registry: &self.registry,
            store: &*store,
        };

        let rows = view.rows(entity);
        let mut hits: Vec<&Document> = view
            .matching(entity, schema, &plan.filter)
            .into_iter()
            .map(|i| &rows[i])
            .collect();
        // `sort_by` is stable, so insertion order breaks ties.
        hits.sort_by(|a, b| compare_documents(a, b, &plan.sorting, schema));

        let offset = plan.offset.unwrap_or(0) as usize;
        let limit = plan.limit.map_or(usize::MAX, |limit| limit as usize);
        Ok(hits
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self, entity: &str, filter: &Filter) -> Result<u64, Error> {
        let schema = self.schema(entity)?;
        let store = self.store.read().await;
        let view = StoreView {
            registry: &self.registry,
            store: &*store,
        };
        Ok(view.matching(entity, schema, filter).len() as u64)
    }

    async fn aggregate(
        &self,
        entity: &str,
        filter: &Filter,
        query: &AggregateQuery,
        group_by: Option<&str>,
    ) -> Result<Vec<AggregateGroup>, Error> {
        let schema = self.schema(entity)?;
        let store = self.store.read().await;
        let view = StoreView {
            registry: &self.registry,
            store: &*store,
        };
        let rows = view.rows(entity);
        let hits = view.matching(entity, schema, filter);
        Ok(aggregate_documents(
            hits.into_iter().map(|i| &rows[i]),
            query,
            schema,
            group_by,
        ))
    }

    async fn insert(
        &self,
        entity: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Document>, Error> {
        self.schema(entity)?;
        let mut store = self.store.write().await;
        store
            .entry(entity.to_string())
            .or_default()
            .extend(documents.iter().cloned());
        Ok(documents)
    }

    async fn update(&self, entity: &str, filter: &Filter, patch: &Document) -> Result<u64, Error> {
        let schema = self.schema(entity)?;
        let mut store = self.store.write().await;
        let hits = StoreView {
            registry: &self.registry,
            store: &*store,
        }
        .matching(entity, schema, filter);

        if let Some(rows) = store.get_mut(entity) {
            for &i in &hits {
                for (key, value) in patch {
                    rows[i].insert(key.clone(), value.clone());
                }
            }
        }
        Ok(hits.len() as u64)
    }

    async fn delete(&self, entity: &str, filter: &Filter) -> Result<u64, Error> {
        let schema = self.schema(entity)?;
        let mut store = self.store.write().await;
        let hits = StoreView {
            registry: &self.registry,
            store: &*store,
        }
        .matching(entity, schema, filter);

        if let Some(rows) = store.get_mut(entity) {
            for &i in hits.iter().rev() {
                rows.remove(i);
            }
        }
        Ok(hits.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema::RelationDescriptor, sort::SortField, value::FieldType};
    use serde_json::json;
    use uuid::Uuid;

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::builder()
                .entity(
                    EntitySchema::new("TodoItem")
                        .field("title", FieldType::String)
                        .nullable_field("priority", FieldType::Int)
                        .relation(
                            RelationDescriptor::virtual_many("subTasks", "SubTask", "todo_item_id")
                                .filterable(),
                        ),
                )
                .entity(
                    EntitySchema::new("SubTask")
                        .field("title", FieldType::String)
                        .field("todo_item_id", FieldType::Uuid),
                )
                .build()
                .unwrap(),
        )
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    async fn seeded() -> (MemoryAdapter, Vec<Uuid>) {
        let adapter = MemoryAdapter::new(registry());
        let ids: Vec<Uuid> = (1..=4).map(Uuid::from_u128).collect();
        let todos = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                doc(json!({
                    "id": id,
                    "title": format!("todo {}", i + 1),
                    "priority": (i % 2) as i64,
                }))
            })
            .collect();
        adapter.insert("TodoItem", todos).await.unwrap();
        adapter
            .insert(
                "SubTask",
                vec![doc(json!({
                    "id": Uuid::from_u128(10),
                    "title": "urgent",
                    "todo_item_id": ids[2],
                }))],
            )
            .await
            .unwrap();
        (adapter, ids)
    }

    fn titles(rows: &[Document]) -> Vec<&str> {
        rows.iter().map(|r| r["title"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn sorts_stably_and_windows() {
        let (adapter, _) = seeded().await;
        let plan = QueryPlan::new(Filter::all())
            .sorted(vec![SortField::desc("priority")])
            .window(Some(2), Some(1));
        let rows = adapter.query("TodoItem", &plan).await.unwrap();
        assert_eq!(titles(&rows), ["todo 4", "todo 1"]);
    }

    #[tokio::test]
    async fn filters_through_virtual_relations() {
        let (adapter, ids) = seeded().await;
        let filter = Filter::eq("subTasks.title", "urgent");
        let rows = adapter
            .query("TodoItem", &QueryPlan::new(filter.clone()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(ids[2]));
        assert_eq!(adapter.count("TodoItem", &filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_merges_and_delete_removes() {
        let (adapter, _) = seeded().await;
        let patch = doc(json!({"priority": null}));
        let updated = adapter
            .update("TodoItem", &Filter::eq("priority", 1), &patch)
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(
            adapter
                .count("TodoItem", &Filter::is_null("priority"))
                .await
                .unwrap(),
            2
        );

        let deleted = adapter
            .delete("TodoItem", &Filter::is_null("priority"))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        let rows = adapter
            .query("TodoItem", &QueryPlan::default())
            .await
            .unwrap();
        assert_eq!(titles(&rows), ["todo 1", "todo 3"]);
    }

    #[tokio::test]
    async fn unknown_entities_are_schema_errors() {
        let adapter = MemoryAdapter::new(registry());
        let err = adapter.count("Nope", &Filter::all()).await.unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
