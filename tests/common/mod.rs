#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use taxis::{
    Adapter, AggregateGroup, AggregateQuery, Document, Engine, Entity, EntitySchema, Error,
    FieldType, Filter, MemoryAdapter, QueryPlan, QueryService, RelationDescriptor, SchemaRegistry,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: Uuid,
    pub title: String,
    pub completed: bool,
    pub priority: Option<i64>,
    pub tag_ids: Vec<Uuid>,
    pub assignee_id: Option<Uuid>,
}

impl Entity for TodoItem {
    const TYPE: &'static str = "TodoItem";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: Uuid,
    pub title: String,
    pub completed: bool,
    pub todo_item_id: Uuid,
}

impl Entity for SubTask {
    const TYPE: &'static str = "SubTask";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
}

impl Entity for Tag {
    const TYPE: &'static str = "Tag";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
}

impl Entity for User {
    const TYPE: &'static str = "User";
}

pub fn registry() -> Arc<SchemaRegistry> {
    Arc::new(
        SchemaRegistry::builder()
            .entity(
                EntitySchema::new("TodoItem")
                    .field("title", FieldType::String)
                    .field("completed", FieldType::Bool)
                    .nullable_field("priority", FieldType::Int)
                    .field("tag_ids", FieldType::UuidList)
                    .nullable_field("assignee_id", FieldType::Uuid)
                    .relation(
                        RelationDescriptor::virtual_many("subTasks", "SubTask", "todo_item_id")
                            .filterable(),
                    )
                    .relation(RelationDescriptor::owned_many("tags", "Tag", "tag_ids").filterable())
                    .relation(RelationDescriptor::owned_one("assignee", "User", "assignee_id")),
            )
            .entity(
                EntitySchema::new("SubTask")
                    .field("title", FieldType::String)
                    .field("completed", FieldType::Bool)
                    .field("todo_item_id", FieldType::Uuid)
                    .relation(RelationDescriptor::owned_one(
                        "todoItem",
                        "TodoItem",
                        "todo_item_id",
                    )),
            )
            .entity(EntitySchema::new("Tag").field("name", FieldType::String))
            .entity(
                EntitySchema::new("User")
                    .field("name", FieldType::String)
                    .relation(RelationDescriptor::virtual_one(
                        "assignedTodo",
                        "TodoItem",
                        "assignee_id",
                    )),
            )
            .build()
            .unwrap(),
    )
}

/// Which backend a parity test runs against.
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite,
}

pub async fn adapter(backend: Backend, registry: Arc<SchemaRegistry>) -> Box<dyn Adapter> {
    match backend {
        Backend::Memory => Box::new(MemoryAdapter::new(registry)),
        #[cfg(feature = "sqlite")]
        Backend::Sqlite => {
            let adapter = taxis::adapters::SqliteAdapter::new_memory(registry)
                .await
                .unwrap();
            adapter.init_schema().await.unwrap();
            Box::new(adapter)
        }
    }
}

pub async fn engine(backend: Backend) -> Engine {
    let registry = registry();
    Engine::new(adapter(backend, registry.clone()).await, registry)
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

pub fn todo_input(title: &str, completed: bool, priority: Option<i64>) -> Document {
    doc(json!({
        "title": title,
        "completed": completed,
        "priority": priority,
        "tag_ids": [],
        "assignee_id": null,
    }))
}

/// Five todo items, "todo 1" to "todo 5", with priorities 1 to 5; the even
/// ones are completed.
pub async fn seed_todos(engine: &Engine) -> Vec<TodoItem> {
    let todos = engine.service::<TodoItem>().unwrap();
    let inputs = (1..=5)
        .map(|i| todo_input(&format!("todo {}", i), i % 2 == 0, Some(i)))
        .collect();
    todos.create_many(inputs).await.unwrap()
}

pub fn titles(todos: &[TodoItem]) -> Vec<&str> {
    todos.iter().map(|t| t.title.as_str()).collect()
}

/// Adapter wrapper counting the calls that reach the backend.
pub struct CountingAdapter {
    inner: Box<dyn Adapter>,
    calls: Arc<AtomicUsize>,
}

impl CountingAdapter {
    pub fn new(inner: Box<dyn Adapter>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                calls: calls.clone(),
            },
            calls,
        )
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Adapter for CountingAdapter {
    async fn query(&self, entity: &str, plan: &QueryPlan) -> Result<Vec<Document>, Error> {
        self.hit();
        self.inner.query(entity, plan).await
    }

    async fn count(&self, entity: &str, filter: &Filter) -> Result<u64, Error> {
        self.hit();
        self.inner.count(entity, filter).await
    }

    async fn aggregate(
        &self,
        entity: &str,
        filter: &Filter,
        query: &AggregateQuery,
        group_by: Option<&str>,
    ) -> Result<Vec<AggregateGroup>, Error> {
        self.hit();
        self.inner.aggregate(entity, filter, query, group_by).await
    }

    async fn insert(
        &self,
        entity: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Document>, Error> {
        self.hit();
        self.inner.insert(entity, documents).await
    }

    async fn update(&self, entity: &str, filter: &Filter, patch: &Document) -> Result<u64, Error> {
        self.hit();
        self.inner.update(entity, filter, patch).await
    }

    async fn delete(&self, entity: &str, filter: &Filter) -> Result<u64, Error> {
        self.hit();
        self.inner.delete(entity, filter).await
    }
}

/// Generates one `#[tokio::test]` per backend for each listed check.
macro_rules! parity_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(crate::common::Backend::Memory).await;
                }
            )*
        }

        #[cfg(feature = "sqlite")]
        mod sqlite {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(crate::common::Backend::Sqlite).await;
                }
            )*
        }
    };
}
