//! # Taxis
//!
//! *τάξις, Ancient Greek for "arrangement" or "order".*
//!
//! Taxis is a backend-agnostic query layer. Application code describes data
//! access once (filter these records, sort them, page them, aggregate them,
//! resolve their relations) and the same description runs against any
//! storage adapter.
//!
//! ## What's inside
//!
//! ### Filters, sorts and paging
//! A [`Filter`] is a tree of typed comparisons over the fields of an entity
//! or, one level deep, over the fields of a related entity. Sorting is an
//! ordered list of [`SortField`]s. Paging is either cursor based
//! (`first`/`after`, `last`/`before`) or a plain `limit`/`offset`; both are
//! validated and resolved into a window before the store is touched.
//!
//! ### Batched relations
//! Relations are declared on the [`SchemaRegistry`]: *owned* relations keep
//! the join key on the source, *virtual* ones are found by reverse lookup.
//! Resolving a relation for many sources costs one backend query where the
//! relation kind allows it, and the result stays keyed by source.
//!
//! ### Aggregates
//! `count`, `sum`, `avg`, `min` and `max` over filtered records, and over
//! the related records of every source.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use taxis::{Engine, EntitySchema, FieldType, Query, QueryService, SchemaRegistry};
//! use taxis::adapters::sqlite::SqliteAdapter;
//!
//! let registry = Arc::new(
//!     SchemaRegistry::builder()
//!         .entity(EntitySchema::new("TodoItem").field("title", FieldType::String))
//!         .build()?,
//! );
//! let adapter = SqliteAdapter::new_memory(registry.clone()).await?;
//! adapter.init_schema().await?;
//!
//! let engine = Engine::new(Box::new(adapter), registry);
//! let todos = engine.service::<TodoItem>()?;
//! let page = todos.query(&Query::new().sort_asc("title").first(10)).await?;
//! ```
//!
//! ## Feature flags
//!
//! | Flag     | Default | Description                          |
//! |----------|---------|--------------------------------------|
//! | `sqlite` | ✓       | SQLite adapter via sqlx              |
//!
//! The in-memory adapter is always available.

pub mod adapters;
pub mod aggregate;
pub mod config;
pub mod document;
pub mod error;
pub mod filter;
pub mod paging;
pub mod query;
pub mod relation;
pub mod schema;
pub mod service;
pub mod sort;
pub mod value;

use std::sync::Arc;

pub use crate::adapters::{Adapter, MemoryAdapter};
pub use crate::aggregate::{AggregateGroup, AggregateQuery, AggregateResponse};
pub use crate::config::EngineConfig;
pub use crate::document::{Document, Entity};
pub use crate::error::{Error, ValidationError, ValidationErrors};
pub use crate::filter::{Comparison, ComparisonOp, Filter};
pub use crate::paging::{CursorPaging, OffsetPaging, Paging};
pub use crate::query::{Query, QueryPlan};
pub use crate::relation::{ModifyRelationOptions, RelationMap, RelationResolver};
pub use crate::schema::{
    Cardinality, EntitySchema, FieldDescriptor, RelationDescriptor, RelationKind, SchemaRegistry,
};
pub use crate::service::{
    Connection, ConnectionEdge, DeleteManyResponse, EntityService, PageInfo, Pager,
    PagingStrategy, QueryService, UpdateManyResponse,
};
pub use crate::sort::{SortDirection, SortField, SortNulls};
pub use crate::value::{FieldType, FieldValue, ToFieldValue};

/// The Engine binds a storage adapter to the schema registry and hands out
/// typed services per entity.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Taxis>,
}

pub struct Taxis {
    adapter: Arc<dyn Adapter>,
    registry: Arc<SchemaRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(adapter: Box<dyn Adapter>, registry: Arc<SchemaRegistry>) -> Self {
        Self::with_config(adapter, registry, EngineConfig::default())
    }

    pub fn with_config(
        adapter: Box<dyn Adapter>,
        registry: Arc<SchemaRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Taxis {
                adapter: Arc::from(adapter),
                registry,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The query service for `T`. Fails with [`Error::Schema`] when
    /// `T::TYPE` was never registered.
    pub fn service<T: Entity>(&self) -> Result<EntityService<T>, Error> {
        EntityService::new(
            self.inner.adapter.clone(),
            self.inner.registry.clone(),
            self.inner.config.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct User {
        id: Uuid,
        name: String,
    }

    impl Entity for User {
        const TYPE: &'static str = "User";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Ghost {
        id: Uuid,
    }

    impl Entity for Ghost {
        const TYPE: &'static str = "Ghost";
    }

    fn engine() -> Engine {
        let registry = Arc::new(
            SchemaRegistry::builder()
                .entity(EntitySchema::new("User").field("name", FieldType::String))
                .build()
                .unwrap(),
        );
        Engine::with_config(
            Box::new(MemoryAdapter::new(registry.clone())),
            registry,
            EngineConfig::default().with_max_page_size(10),
        )
    }

    #[test]
    fn services_need_a_registered_type() {
        let engine = engine();
        assert!(engine.service::<User>().is_ok());
        assert!(matches!(engine.service::<Ghost>(), Err(Error::Schema(_))));
    }

    #[tokio::test]
    async fn config_reaches_the_services() {
        let users = engine().service::<User>().unwrap();
        let err = users.query(&Query::new().first(11)).await.unwrap_err();
        assert!(err.is_validation());
    }
}
