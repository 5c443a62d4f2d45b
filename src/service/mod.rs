//! Typed query service.

pub mod pager;

use std::{marker::PhantomData, sync::Arc, time::Instant};

use async_trait::async_trait;
use metrics::histogram;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    adapters::Adapter,
    aggregate::{AggregateQuery, AggregateResponse},
    config::EngineConfig,
    document::{
        Document, Entity, document_id, from_document, normalize_input, to_document,
        validate_input,
    },
    error::{Error, ValidationErrors},
    filter::{self, Filter},
    query::{Query, QueryPlan},
    relation::{ModifyRelationOptions, RelationMap, RelationResolver},
    schema::{EntitySchema, SchemaRegistry},
    sort,
};

pub use pager::{Connection, ConnectionEdge, PageInfo, Pager, PagingStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManyResponse {
    pub updated_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteManyResponse {
    pub deleted_count: u64,
}

/// -----------------------------
/// Query service contract
/// -----------------------------
///
/// Every operation validates its whole request before the store is touched;
/// a rejected request never reaches the adapter.
#[async_trait]
pub trait QueryService<T: Entity>: Send + Sync {
    /// Records matching `query.filter`, ordered by `query.sorting` and
    /// windowed by `query.paging`.
    async fn query(&self, query: &Query) -> Result<Vec<T>, Error>;

    async fn count(&self, filter: &Filter) -> Result<u64, Error>;

    async fn aggregate(
        &self,
        filter: &Filter,
        query: &AggregateQuery,
    ) -> Result<AggregateResponse, Error>;

    async fn find_by_id(&self, id: Uuid, filter: Option<&Filter>) -> Result<Option<T>, Error>;

    /// Like [`QueryService::find_by_id`], failing with
    /// [`Error::NotFound`] instead of returning `None`.
    async fn get_by_id(&self, id: Uuid, filter: Option<&Filter>) -> Result<T, Error>;

    /// Stores a new record. The input must not carry an id; one is assigned.
    async fn create_one(&self, input: Document) -> Result<T, Error>;

    async fn create_many(&self, input: Vec<Document>) -> Result<Vec<T>, Error>;

    async fn update_one(
        &self,
        id: Uuid,
        update: Document,
        filter: Option<&Filter>,
    ) -> Result<T, Error>;

    /// Applies `update` to every record matching `filter`, which must not be
    /// empty.
    async fn update_many(
        &self,
        update: Document,
        filter: &Filter,
    ) -> Result<UpdateManyResponse, Error>;

    /// Deletes one record and returns it as it was before deletion.
    async fn delete_one(&self, id: Uuid, filter: Option<&Filter>) -> Result<T, Error>;

    async fn delete_many(&self, filter: &Filter) -> Result<DeleteManyResponse, Error>;
}

/// Operations on one entity type, bound to an adapter and the registry.
///
/// Obtained from [`Engine::service`](crate::Engine::service). Cheap to
/// clone.
pub struct EntityService<T: Entity> {
    adapter: Arc<dyn Adapter>,
    registry: Arc<SchemaRegistry>,
    schema: Arc<EntitySchema>,
    config: EngineConfig,
    relations: RelationResolver,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for EntityService<T> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            registry: self.registry.clone(),
            schema: self.schema.clone(),
            config: self.config.clone(),
            relations: self.relations.clone(),
            _entity: PhantomData,
        }
    }
}

/// Merges the validation failures of independent checks so a request
/// reports all of them at once. Other errors pass through.
fn collect_validation(results: impl IntoIterator<Item = Result<(), Error>>) -> Result<(), Error> {
    let mut errors = ValidationErrors::new();
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::Validation(more)) => errors.extend(more),
            Err(other) => return Err(other),
        }
    }
    errors.into_result()
}

impl<T: Entity> EntityService<T> {
    pub(crate) fn new(
        adapter: Arc<dyn Adapter>,
        registry: Arc<SchemaRegistry>,
        config: EngineConfig,
    ) -> Result<Self, Error> {
        let schema = registry.entity(T::TYPE)?.clone();
        let relations = RelationResolver::new(adapter.clone(), registry.clone(), config.clone());
        Ok(Self {
            adapter,
            registry,
            schema,
            config,
            relations,
            _entity: PhantomData,
        })
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub fn relations(&self) -> &RelationResolver {
        &self.relations
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    /* ---------------- VALIDATION ---------------- */

    pub(crate) fn validate_filter(&self, filter: &Filter) -> Result<(), Error> {
        filter::validate(filter, &self.schema, &self.registry)
    }

    /// Validates filter, sort and paging together and resolves the window.
    pub(crate) fn plan(&self, query: &Query) -> Result<QueryPlan, Error> {
        collect_validation([
            self.validate_filter(&query.filter),
            sort::validate(&query.sorting, &self.schema),
            query.plan(self.config.max_page_size).map(|_| ()),
        ])?;
        query.plan(self.config.max_page_size)
    }

    fn by_id(&self, id: Uuid, filter: Option<&Filter>) -> Result<Filter, Error> {
        let extra = filter.cloned().unwrap_or_default();
        self.validate_filter(&extra)?;
        Ok(Filter::eq(self.schema.id_field(), id).and(extra))
    }

    /// Fills in a fresh id and checks the result reads back as `T`.
    fn prepare_create(&self, input: Document) -> Result<Document, Error> {
        validate_input(&input, &self.schema)?;
        let mut document = input;
        document.insert(
            self.schema.id_field().to_string(),
            Value::String(Uuid::now_v7().to_string()),
        );
        let entity: T = from_document(document).map_err(|e| Error::validation("input", e.to_string()))?;
        to_document(&entity)
    }

    /* ---------------- RAW ACCESS ---------------- */

    pub(crate) async fn fetch(&self, plan: &QueryPlan) -> Result<Vec<Document>, Error> {
        let start = Instant::now();
        let documents = self.adapter.query(T::TYPE, plan).await;
        histogram!("taxis.query.duration_ms", "entity" => T::TYPE, "op" => "query")
            .record(start.elapsed().as_millis() as f64);
        documents
    }

    async fn fetch_one(&self, filter: Filter) -> Result<Option<Document>, Error> {
        let plan = QueryPlan::new(filter).window(Some(1), None);
        Ok(self.fetch(&plan).await?.into_iter().next())
    }

    async fn fetch_existing(&self, id: Uuid, filter: Option<&Filter>) -> Result<Document, Error> {
        let filter = self.by_id(id, filter)?;
        self.fetch_one(filter)
            .await?
            .ok_or_else(|| Error::not_found(T::TYPE, id))
    }

    /* ---------------- RELATIONS ---------------- */

    pub async fn find_relation<R: Entity>(
        &self,
        name: &str,
        source: &T,
        filter: Option<&Filter>,
    ) -> Result<Option<R>, Error> {
        self.relations.find_relation::<T, R>(name, source, filter).await
    }

    pub async fn find_relations<'s, R: Entity>(
        &self,
        name: &str,
        sources: &'s [T],
        filter: Option<&Filter>,
    ) -> Result<RelationMap<'s, T, Option<R>>, Error> {
        self.relations.find_relations::<T, R>(name, sources, filter).await
    }

    pub async fn query_relations<R: Entity>(
        &self,
        name: &str,
        source: &T,
        query: &Query,
    ) -> Result<Vec<R>, Error> {
        self.relations.query_relations::<T, R>(name, source, query).await
    }

    pub async fn query_relations_batch<'s, R: Entity>(
        &self,
        name: &str,
        sources: &'s [T],
        query: &Query,
    ) -> Result<RelationMap<'s, T, Vec<R>>, Error> {
        self.relations
            .query_relations_batch::<T, R>(name, sources, query)
            .await
    }

    pub async fn count_relations<R: Entity>(
        &self,
        name: &str,
        source: &T,
        filter: &Filter,
    ) -> Result<u64, Error> {
        self.relations.count_relations::<T, R>(name, source, filter).await
    }

    pub async fn count_relations_batch<'s, R: Entity>(
        &self,
        name: &str,
        sources: &'s [T],
        filter: &Filter,
    ) -> Result<RelationMap<'s, T, u64>, Error> {
        self.relations
            .count_relations_batch::<T, R>(name, sources, filter)
            .await
    }

    pub async fn aggregate_relations<R: Entity>(
        &self,
        name: &str,
        source: &T,
        filter: &Filter,
        query: &AggregateQuery,
    ) -> Result<AggregateResponse, Error> {
        self.relations
            .aggregate_relations::<T, R>(name, source, filter, query)
            .await
    }

    pub async fn aggregate_relations_batch<'s, R: Entity>(
        &self,
        name: &str,
        sources: &'s [T],
        filter: &Filter,
        query: &AggregateQuery,
    ) -> Result<RelationMap<'s, T, AggregateResponse>, Error> {
        self.relations
            .aggregate_relations_batch::<T, R>(name, sources, filter, query)
            .await
    }

    pub async fn add_relations(
        &self,
        name: &str,
        id: Uuid,
        relation_ids: &[Uuid],
        options: &ModifyRelationOptions,
    ) -> Result<T, Error> {
        self.relations
            .add_relations::<T>(name, id, relation_ids, options)
            .await
    }

    pub async fn set_relations(
        &self,
        name: &str,
        id: Uuid,
        relation_ids: &[Uuid],
        options: &ModifyRelationOptions,
    ) -> Result<T, Error> {
        self.relations
            .set_relations::<T>(name, id, relation_ids, options)
            .await
    }

    pub async fn remove_relations(
        &self,
        name: &str,
        id: Uuid,
        relation_ids: &[Uuid],
        options: &ModifyRelationOptions,
    ) -> Result<T, Error> {
        self.relations
            .remove_relations::<T>(name, id, relation_ids, options)
            .await
    }

    pub async fn set_relation(
        &self,
        name: &str,
        id: Uuid,
        relation_id: Uuid,
        options: &ModifyRelationOptions,
    ) -> Result<T, Error> {
        self.relations
            .set_relation::<T>(name, id, relation_id, options)
            .await
    }

    pub async fn remove_relation(
        &self,
        name: &str,
        id: Uuid,
        relation_id: Uuid,
        options: &ModifyRelationOptions,
    ) -> Result<T, Error> {
        self.relations
            .remove_relation::<T>(name, id, relation_id, options)
            .await
    }
}

#[async_trait]
impl<T: Entity> QueryService<T> for EntityService<T> {
    async fn query(&self, query: &Query) -> Result<Vec<T>, Error> {
        let plan = self.plan(query)?;
        let documents = self.fetch(&plan).await?;
        documents.into_iter().map(from_document).collect()
    }

    async fn count(&self, filter: &Filter) -> Result<u64, Error> {
        self.validate_filter(filter)?;
        let start = Instant::now();
        let count = self.adapter.count(T::TYPE, filter).await;
        histogram!("taxis.query.duration_ms", "entity" => T::TYPE, "op" => "count")
            .record(start.elapsed().as_millis() as f64);
        count
    }

    async fn aggregate(
        &self,
        filter: &Filter,
        query: &AggregateQuery,
    ) -> Result<AggregateResponse, Error> {
        collect_validation([self.validate_filter(filter), query.validate(&self.schema)])?;
        let start = Instant::now();
        let groups = self.adapter.aggregate(T::TYPE, filter, query, None).await;
        histogram!("taxis.query.duration_ms", "entity" => T::TYPE, "op" => "aggregate")
            .record(start.elapsed().as_millis() as f64);
        Ok(groups?
            .into_iter()
            .next()
            .map(|group| group.response)
            .unwrap_or_else(|| AggregateResponse::empty(query)))
    }

    async fn find_by_id(&self, id: Uuid, filter: Option<&Filter>) -> Result<Option<T>, Error> {
        let filter = self.by_id(id, filter)?;
        self.fetch_one(filter).await?.map(from_document).transpose()
    }

    async fn get_by_id(&self, id: Uuid, filter: Option<&Filter>) -> Result<T, Error> {
        from_document(self.fetch_existing(id, filter).await?)
    }

    async fn create_one(&self, input: Document) -> Result<T, Error> {
        let document = self.prepare_create(input)?;
        let stored = self.adapter.insert(T::TYPE, vec![document]).await?;
        stored
            .into_iter()
            .next()
            .ok_or_else(|| Error::Storage(format!("{} insert returned no record", T::TYPE)))
            .and_then(from_document)
    }

    async fn create_many(&self, input: Vec<Document>) -> Result<Vec<T>, Error> {
        let mut errors = ValidationErrors::new();
        let mut documents = Vec::with_capacity(input.len());
        for (i, item) in input.into_iter().enumerate() {
            match self.prepare_create(item) {
                Ok(document) => documents.push(document),
                Err(Error::Validation(found)) => {
                    for mut error in found.0 {
                        error.path = error.path.replacen("input", &format!("input[{}]", i), 1);
                        errors.0.push(error);
                    }
                }
                Err(other) => return Err(other),
            }
        }
        errors.into_result()?;
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let stored = self.adapter.insert(T::TYPE, documents).await?;
        stored.into_iter().map(from_document).collect()
    }

    async fn update_one(
        &self,
        id: Uuid,
        update: Document,
        filter: Option<&Filter>,
    ) -> Result<T, Error> {
        validate_input(&update, &self.schema)?;
        let update = normalize_input(update, &self.schema);
        let mut merged = self.fetch_existing(id, filter).await?;
        for (key, value) in &update {
            if key != self.schema.id_field() {
                merged.insert(key.clone(), value.clone());
            }
        }
        let entity: T =
            from_document(merged).map_err(|e| Error::validation("input", e.to_string()))?;

        let mut patch = update;
        patch.remove(self.schema.id_field());
        let by_id = Filter::eq(self.schema.id_field(), id);
        self.adapter.update(T::TYPE, &by_id, &patch).await?;
        Ok(entity)
    }

    async fn update_many(
        &self,
        update: Document,
        filter: &Filter,
    ) -> Result<UpdateManyResponse, Error> {
        collect_validation([
            validate_input(&update, &self.schema),
            filter::validate_mutation(filter, &self.schema, &self.registry),
        ])?;
        let mut patch = normalize_input(update, &self.schema);
        patch.remove(self.schema.id_field());
        let updated_count = self.adapter.update(T::TYPE, filter, &patch).await?;
        Ok(UpdateManyResponse { updated_count })
    }

    async fn delete_one(&self, id: Uuid, filter: Option<&Filter>) -> Result<T, Error> {
        let snapshot = self.fetch_existing(id, filter).await?;
        let stored_id = document_id(&snapshot, &self.schema).unwrap_or(id);
        self.adapter
            .delete(T::TYPE, &Filter::eq(self.schema.id_field(), stored_id))
            .await?;
        from_document(snapshot)
    }

    async fn delete_many(&self, filter: &Filter) -> Result<DeleteManyResponse, Error> {
        filter::validate_mutation(filter, &self.schema, &self.registry)?;
        let deleted_count = self.adapter.delete(T::TYPE, filter).await?;
        Ok(DeleteManyResponse { deleted_count })
    }
}
