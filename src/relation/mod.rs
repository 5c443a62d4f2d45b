//! Relation resolution.
//!
//! Every read here takes a slice of sources and answers with one entry per
//! source, while talking to the adapter as few times as the relation kind
//! allows:
//!
//! | relation            | find / unpaged query | count            | aggregate                   |
//! |---------------------|----------------------|------------------|-----------------------------|
//! | owned ONE           | 1 query (`id IN`)    | 1 grouped by id  | 1 grouped by id             |
//! | owned MANY          | 1 query (`id IN`)    | 1 query          | 1 per distinct id set       |
//! | virtual             | 1 query (lookup IN)  | 1 grouped by key | 1 grouped by key            |
//!
//! Paged relation queries apply the window per source, so they fan out one
//! query per distinct source key, bounded by
//! [`EngineConfig::fan_out_concurrency`].

pub mod mutate;

use std::{
    collections::{HashMap, HashSet},
    ptr,
    sync::Arc,
    time::Instant,
};

use futures_util::{StreamExt, TryStreamExt, stream};
use metrics::{counter, histogram};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    adapters::Adapter,
    aggregate::{AggregateGroup, AggregateQuery, AggregateResponse},
    config::EngineConfig,
    document::{Document, Entity, document_id, field_value, from_document, id_list, to_document},
    error::Error,
    filter::{self, Filter},
    query::{Query, QueryPlan},
    schema::{Cardinality, EntitySchema, RelationDescriptor, RelationKind, SchemaRegistry},
    sort,
};

pub use mutate::ModifyRelationOptions;

/// Relation results keyed by the source they were resolved for.
///
/// Entries are keyed by the address of the source reference passed in, not
/// by its value, so two equal sources stay separately addressable. There is
/// exactly one entry per input source, in input order.
#[derive(Debug)]
pub struct RelationMap<'s, S, V> {
    entries: Vec<(&'s S, V)>,
    /// Source address to position in `entries`.
    index: HashMap<usize, usize>,
}

fn address<S>(source: &S) -> usize {
    ptr::from_ref(source) as usize
}

impl<'s, S, V> RelationMap<'s, S, V> {
    fn new(entries: Vec<(&'s S, V)>) -> Self {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, (source, _)) in entries.iter().enumerate() {
            index.entry(address(*source)).or_insert(position);
        }
        Self { entries, index }
    }

    /// The value resolved for this exact source reference.
    pub fn get(&self, source: &S) -> Option<&V> {
        self.index
            .get(&address(source))
            .map(|&position| &self.entries[position].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'s S, &V)> {
        self.entries.iter().map(|(s, v)| (*s, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn into_values(self) -> impl Iterator<Item = V> {
        self.entries.into_iter().map(|(_, v)| v)
    }
}

impl<'s, S, V> IntoIterator for RelationMap<'s, S, V> {
    type Item = (&'s S, V);
    type IntoIter = std::vec::IntoIter<(&'s S, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// What a source contributes to a relation lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SourceKey {
    /// Owned ONE: the foreign key. Virtual: the source's own id.
    Single(Option<Uuid>),
    /// Owned MANY: the stored id list, deduplicated.
    Set(Vec<Uuid>),
}

impl SourceKey {
    fn ids(&self) -> &[Uuid] {
        match self {
            SourceKey::Single(Some(id)) => std::slice::from_ref(id),
            SourceKey::Single(None) => &[],
            SourceKey::Set(ids) => ids,
        }
    }
}

/// A relation of a source schema together with both ends.
#[derive(Clone, Copy)]
struct Link<'r> {
    source: &'r EntitySchema,
    relation: &'r RelationDescriptor,
    target: &'r EntitySchema,
}

impl Link<'_> {
    /// Target field the source keys are matched against.
    fn target_key(&self) -> &str {
        match &self.relation.kind {
            RelationKind::Owned { .. } => self.target.id_field(),
            RelationKind::Virtual { lookup_key } => lookup_key,
        }
    }

    fn source_key(&self, document: &Document) -> SourceKey {
        match (&self.relation.kind, self.relation.cardinality) {
            (RelationKind::Owned { join_key }, Cardinality::One) => {
                SourceKey::Single(field_value(document, self.source, join_key).as_uuid())
            }
            (RelationKind::Owned { join_key }, Cardinality::Many) => {
                let mut ids = id_list(document, join_key);
                dedup(&mut ids);
                SourceKey::Set(ids)
            }
            (RelationKind::Virtual { .. }, _) => {
                SourceKey::Single(document_id(document, self.source))
            }
        }
    }

    /// The value a target record carries in [`Link::target_key`].
    fn target_value(&self, document: &Document) -> Option<Uuid> {
        field_value(document, self.target, self.target_key()).as_uuid()
    }

    /// Records of the target matching any of `ids`, narrowed by `filter`.
    fn keyed_filter(&self, ids: &[Uuid], filter: &Filter) -> Filter {
        Filter::is_in(self.target_key(), ids.iter().copied()).and(filter.clone())
    }

    fn name(&self) -> String {
        format!("{}.{}", self.source.name(), self.relation.name)
    }
}

fn dedup(ids: &mut Vec<Uuid>) {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.retain(|id| seen.insert(*id));
}

/// Distinct ids over every key, in first-seen order.
fn distinct_ids(keys: &[SourceKey]) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = keys.iter().flat_map(|key| key.ids().iter().copied()).collect();
    dedup(&mut ids);
    ids
}

/// Resolves relations for batches of sources.
///
/// Composed into every [`EntityService`](crate::service::EntityService);
/// usually reached through its relation methods.
#[derive(Clone)]
pub struct RelationResolver {
    adapter: Arc<dyn Adapter>,
    registry: Arc<SchemaRegistry>,
    config: EngineConfig,
}

impl RelationResolver {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        registry: Arc<SchemaRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            adapter,
            registry,
            config,
        }
    }

    /// Looks up relation `name` of `S` and checks that `R` is its target.
    fn link<S: Entity, R: Entity>(&self, name: &str) -> Result<Link<'_>, Error> {
        let source = self.registry.entity(S::TYPE)?;
        let relation = source.relation_or_err(name)?;
        if relation.target != R::TYPE {
            return Err(Error::TypeMismatch {
                expected: relation.target.clone(),
                found: R::TYPE.to_string(),
            });
        }
        let target = self.registry.entity(&relation.target)?;
        Ok(Link {
            source,
            relation,
            target,
        })
    }

    fn expect_cardinality(link: &Link<'_>, expected: Cardinality) -> Result<(), Error> {
        if link.relation.cardinality == expected {
            return Ok(());
        }
        let message = match expected {
            Cardinality::One => "is a MANY relation; use the plural relation operations",
            Cardinality::Many => "is a ONE relation; use the singular relation operations",
        };
        Err(Error::validation(
            format!("relation.{}", link.relation.name),
            message,
        ))
    }

    fn source_keys<S: Entity>(link: &Link<'_>, sources: &[S]) -> Result<Vec<SourceKey>, Error> {
        sources
            .iter()
            .map(|source| to_document(source).map(|doc| link.source_key(&doc)))
            .collect()
    }

    fn validate_filter(&self, filter: &Filter, target: &EntitySchema) -> Result<(), Error> {
        filter::validate(filter, target, &self.registry)
    }

    /* ---------------- BACKEND CALLS ---------------- */

    async fn fetch(
        &self,
        link: &Link<'_>,
        plan: &QueryPlan,
    ) -> Result<Vec<Document>, Error> {
        counter!("taxis.relation.backend_calls", "relation" => link.name()).increment(1);
        self.adapter.query(link.target.name(), plan).await
    }

    async fn aggregate_groups(
        &self,
        link: &Link<'_>,
        filter: &Filter,
        query: &AggregateQuery,
        group_by: Option<&str>,
    ) -> Result<Vec<AggregateGroup>, Error> {
        counter!("taxis.relation.backend_calls", "relation" => link.name()).increment(1);
        self.adapter
            .aggregate(link.target.name(), filter, query, group_by)
            .await
    }

    fn record(link: &Link<'_>, op: &'static str, start: Instant) {
        histogram!("taxis.relation.duration_ms", "relation" => link.name(), "op" => op)
            .record(start.elapsed().as_millis() as f64);
    }

    /* ---------------- ONE ---------------- */

    /// The related record of a ONE relation for a single source.
    pub async fn find_relation<S: Entity, R: Entity>(
        &self,
        name: &str,
        source: &S,
        filter: Option<&Filter>,
    ) -> Result<Option<R>, Error> {
        let found = self
            .find_relations::<S, R>(name, std::slice::from_ref(source), filter)
            .await?;
        Ok(found.into_values().next().flatten())
    }

    /// The related record of a ONE relation for every source, with a single
    /// backend query.
    pub async fn find_relations<'s, S: Entity, R: Entity>(
        &self,
        name: &str,
        sources: &'s [S],
        filter: Option<&Filter>,
    ) -> Result<RelationMap<'s, S, Option<R>>, Error> {
        let link = self.link::<S, R>(name)?;
        Self::expect_cardinality(&link, Cardinality::One)?;
        let filter = filter.cloned().unwrap_or_default();
        self.validate_filter(&filter, link.target)?;

        let start = Instant::now();
        let keys = Self::source_keys(&link, sources)?;
        let ids = distinct_ids(&keys);
        debug!(
            relation = %link.name(),
            sources = sources.len(),
            distinct_keys = ids.len(),
            "resolving ONE relation"
        );

        let mut by_key: HashMap<Uuid, Document> = HashMap::new();
        if !ids.is_empty() {
            let plan = QueryPlan::new(link.keyed_filter(&ids, &filter));
            for document in self.fetch(&link, &plan).await? {
                if let Some(key) = link.target_value(&document) {
                    // First match wins when a virtual ONE has several.
                    by_key.entry(key).or_insert(document);
                }
            }
        }

        let mut entries = Vec::with_capacity(sources.len());
        for (source, key) in sources.iter().zip(&keys) {
            let related = match key.ids().first().and_then(|id| by_key.get(id)) {
                Some(document) => Some(from_document(document.clone())?),
                None => None,
            };
            entries.push((source, related));
        }
        Self::record(&link, "find", start);
        Ok(RelationMap::new(entries))
    }

    /* ---------------- MANY ---------------- */

    /// Related records of a MANY relation for a single source.
    pub async fn query_relations<S: Entity, R: Entity>(
        &self,
        name: &str,
        source: &S,
        query: &Query,
    ) -> Result<Vec<R>, Error> {
        let found = self
            .query_relations_batch::<S, R>(name, std::slice::from_ref(source), query)
            .await?;
        Ok(found.into_values().next().unwrap_or_default())
    }

    /// Related records of a MANY relation for every source.
    ///
    /// Without paging this is one backend query whose sorted result is
    /// partitioned per source. With paging the window applies to each source
    /// separately, so one query per distinct source key runs concurrently.
    pub async fn query_relations_batch<'s, S: Entity, R: Entity>(
        &self,
        name: &str,
        sources: &'s [S],
        query: &Query,
    ) -> Result<RelationMap<'s, S, Vec<R>>, Error> {
        let link = self.link::<S, R>(name)?;
        Self::expect_cardinality(&link, Cardinality::Many)?;
        self.validate_filter(&query.filter, link.target)?;
        sort::validate(&query.sorting, link.target)?;
        let window = query.plan(self.config.max_page_size)?;

        let start = Instant::now();
        let keys = Self::source_keys(&link, sources)?;
        let paged = window.limit.is_some() || window.offset.is_some();

        let per_key: HashMap<SourceKey, Vec<Document>> = if paged {
            self.fetch_per_key(&link, &keys, &window).await?
        } else {
            self.fetch_partitioned(&link, &keys, &window).await?
        };

        let mut entries = Vec::with_capacity(sources.len());
        for (source, key) in sources.iter().zip(&keys) {
            let related = per_key
                .get(key)
                .map(|documents| {
                    documents
                        .iter()
                        .cloned()
                        .map(from_document)
                        .collect::<Result<Vec<R>, _>>()
                })
                .transpose()?
                .unwrap_or_default();
            entries.push((source, related));
        }
        Self::record(&link, "query", start);
        Ok(RelationMap::new(entries))
    }

    /// One sorted query over every source's keys, split back per key.
    async fn fetch_partitioned(
        &self,
        link: &Link<'_>,
        keys: &[SourceKey],
        window: &QueryPlan,
    ) -> Result<HashMap<SourceKey, Vec<Document>>, Error> {
        let ids = distinct_ids(keys);
        debug!(
            relation = %link.name(),
            sources = keys.len(),
            distinct_keys = ids.len(),
            queries = usize::from(!ids.is_empty()),
            "resolving MANY relation"
        );
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let plan = QueryPlan::new(link.keyed_filter(&ids, &window.filter))
            .sorted(window.sorting.clone());
        let documents = self.fetch(link, &plan).await?;

        let mut per_key: HashMap<SourceKey, Vec<Document>> = HashMap::new();
        for key in keys {
            if per_key.contains_key(key) {
                continue;
            }
            let wanted: HashSet<&Uuid> = key.ids().iter().collect();
            let matching = documents
                .iter()
                .filter(|doc| link.target_value(doc).is_some_and(|v| wanted.contains(&v)))
                .cloned()
                .collect();
            per_key.insert(key.clone(), matching);
        }
        Ok(per_key)
    }

    /// One windowed query per distinct source key, run concurrently.
    async fn fetch_per_key(
        &self,
        link: &Link<'_>,
        keys: &[SourceKey],
        window: &QueryPlan,
    ) -> Result<HashMap<SourceKey, Vec<Document>>, Error> {
        let mut distinct: Vec<&SourceKey> = Vec::new();
        for key in keys {
            if !key.ids().is_empty() && !distinct.contains(&key) {
                distinct.push(key);
            }
        }
        debug!(
            relation = %link.name(),
            sources = keys.len(),
            queries = distinct.len(),
            concurrency = self.config.fan_out_concurrency,
            "resolving paged MANY relation per source"
        );

        let fetched: Vec<(SourceKey, Vec<Document>)> = stream::iter(distinct)
            .map(|key| async move {
                let plan = QueryPlan {
                    filter: link.keyed_filter(key.ids(), &window.filter),
                    ..window.clone()
                };
                let documents = self.fetch(link, &plan).await?;
                Ok::<_, Error>((key.clone(), documents))
            })
            .buffered(self.config.fan_out_concurrency.max(1))
            .try_collect()
            .await?;

        Ok(fetched.into_iter().collect())
    }

    /* ---------------- COUNT ---------------- */

    pub async fn count_relations<S: Entity, R: Entity>(
        &self,
        name: &str,
        source: &S,
        filter: &Filter,
    ) -> Result<u64, Error> {
        let counts = self
            .count_relations_batch::<S, R>(name, std::slice::from_ref(source), filter)
            .await?;
        Ok(counts.into_values().next().unwrap_or_default())
    }

    /// Number of related records matching `filter`, per source.
    pub async fn count_relations_batch<'s, S: Entity, R: Entity>(
        &self,
        name: &str,
        sources: &'s [S],
        filter: &Filter,
    ) -> Result<RelationMap<'s, S, u64>, Error> {
        let link = self.link::<S, R>(name)?;
        self.validate_filter(filter, link.target)?;

        let start = Instant::now();
        let keys = Self::source_keys(&link, sources)?;
        let ids = distinct_ids(&keys);
        debug!(
            relation = %link.name(),
            sources = sources.len(),
            distinct_keys = ids.len(),
            "counting relation"
        );

        let mut entries = Vec::with_capacity(sources.len());
        if ids.is_empty() {
            entries.extend(sources.iter().map(|source| (source, 0)));
            return Ok(RelationMap::new(entries));
        }

        let keyed = link.keyed_filter(&ids, filter);
        match (&link.relation.kind, link.relation.cardinality) {
            (RelationKind::Owned { .. }, Cardinality::Many) => {
                // Grouping cannot follow an id list, so fetch the matching
                // targets once and count membership per source.
                let present: HashSet<Uuid> = self
                    .fetch(&link, &QueryPlan::new(keyed))
                    .await?
                    .iter()
                    .filter_map(|doc| link.target_value(doc))
                    .collect();
                for (source, key) in sources.iter().zip(&keys) {
                    let n = key.ids().iter().filter(|id| present.contains(id)).count();
                    entries.push((source, n as u64));
                }
            }
            _ => {
                let target_key = link.target_key();
                let groups = self
                    .aggregate_groups(
                        &link,
                        &keyed,
                        &AggregateQuery::new().count(link.target.id_field()),
                        Some(target_key),
                    )
                    .await?;
                let counts: HashMap<String, u64> = groups
                    .into_iter()
                    .filter_map(|group| {
                        let n = group
                            .response
                            .count
                            .get(link.target.id_field())
                            .copied()
                            .unwrap_or_default();
                        group.key.map(|key| (key, n))
                    })
                    .collect();
                for (source, key) in sources.iter().zip(&keys) {
                    let n = key
                        .ids()
                        .first()
                        .and_then(|id| counts.get(&id.to_string()))
                        .copied()
                        .unwrap_or_default();
                    entries.push((source, n));
                }
            }
        }
        Self::record(&link, "count", start);
        Ok(RelationMap::new(entries))
    }

    /* ---------------- AGGREGATE ---------------- */

    pub async fn aggregate_relations<S: Entity, R: Entity>(
        &self,
        name: &str,
        source: &S,
        filter: &Filter,
        query: &AggregateQuery,
    ) -> Result<AggregateResponse, Error> {
        let responses = self
            .aggregate_relations_batch::<S, R>(name, std::slice::from_ref(source), filter, query)
            .await?;
        Ok(responses
            .into_values()
            .next()
            .unwrap_or_else(|| AggregateResponse::empty(query)))
    }

    /// Aggregates the related records matching `filter`, per source. Sources
    /// without related records get [`AggregateResponse::empty`].
    pub async fn aggregate_relations_batch<'s, S: Entity, R: Entity>(
        &self,
        name: &str,
        sources: &'s [S],
        filter: &Filter,
        query: &AggregateQuery,
    ) -> Result<RelationMap<'s, S, AggregateResponse>, Error> {
        let link = self.link::<S, R>(name)?;
        self.validate_filter(filter, link.target)?;
        query.validate(link.target)?;

        let start = Instant::now();
        let keys = Self::source_keys(&link, sources)?;
        let ids = distinct_ids(&keys);

        let mut per_key: HashMap<SourceKey, AggregateResponse> = HashMap::new();
        match (&link.relation.kind, link.relation.cardinality) {
            (RelationKind::Owned { .. }, Cardinality::Many) => {
                let mut sets: Vec<&SourceKey> = Vec::new();
                for key in &keys {
                    if !key.ids().is_empty() && !sets.contains(&key) {
                        sets.push(key);
                    }
                }
                warn!(
                    relation = %link.name(),
                    sources = sources.len(),
                    queries = sets.len(),
                    "owned MANY aggregate falls back to one query per id set"
                );
                let link = &link;
                let responses: Vec<(SourceKey, AggregateResponse)> = stream::iter(sets)
                    .map(|key| async move {
                        let groups = self
                            .aggregate_groups(link, &link.keyed_filter(key.ids(), filter), query, None)
                            .await?;
                        let response = groups
                            .into_iter()
                            .next()
                            .map(|group| group.response)
                            .unwrap_or_else(|| AggregateResponse::empty(query));
                        Ok::<_, Error>((key.clone(), response))
                    })
                    .buffered(self.config.fan_out_concurrency.max(1))
                    .try_collect()
                    .await?;
                per_key.extend(responses);
            }
            _ => {
                debug!(
                    relation = %link.name(),
                    sources = sources.len(),
                    distinct_keys = ids.len(),
                    "aggregating relation"
                );
                if !ids.is_empty() {
                    let groups = self
                        .aggregate_groups(
                            &link,
                            &link.keyed_filter(&ids, filter),
                            query,
                            Some(link.target_key()),
                        )
                        .await?;
                    for group in groups {
                        let key = group
                            .key
                            .as_deref()
                            .and_then(|key| Uuid::parse_str(key).ok());
                        if let Some(id) = key {
                            per_key.insert(SourceKey::Single(Some(id)), group.response);
                        }
                    }
                }
            }
        }

        let entries = sources
            .iter()
            .zip(&keys)
            .map(|(source, key)| {
                let response = per_key
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| AggregateResponse::empty(query));
                (source, response)
            })
            .collect();
        Self::record(&link, "aggregate", start);
        Ok(RelationMap::new(entries))
    }
}
