use serde_json::Value;
use uuid::Uuid;

use crate::{
    document::{Document, Entity, field_value, from_document, id_list},
    error::Error,
    filter::{self, Filter},
    query::QueryPlan,
    relation::{Link, RelationResolver, dedup},
    schema::{Cardinality, RelationKind},
};

/// Extra conditions on a relation mutation.
///
/// `filter` must hold for the source record and `relation_filter` for every
/// related record named; otherwise the mutation fails without writing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifyRelationOptions {
    pub filter: Option<Filter>,
    pub relation_filter: Option<Filter>,
}

impl ModifyRelationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn relation_filter(mut self, filter: Filter) -> Self {
        self.relation_filter = Some(filter);
        self
    }
}

/// New value of a join key, computed from the stored one.
enum Change<'a> {
    Add(&'a [Uuid]),
    Set(&'a [Uuid]),
    Remove(&'a [Uuid]),
}

impl RelationResolver {
    /// Adds `relation_ids` to an owned MANY relation; ids already present
    /// are kept once.
    pub async fn add_relations<S: Entity>(
        &self,
        name: &str,
        id: Uuid,
        relation_ids: &[Uuid],
        options: &ModifyRelationOptions,
    ) -> Result<S, Error> {
        self.modify::<S>(name, id, Cardinality::Many, Change::Add(relation_ids), options)
            .await
    }

    /// Replaces the whole set of an owned MANY relation.
    pub async fn set_relations<S: Entity>(
        &self,
        name: &str,
        id: Uuid,
        relation_ids: &[Uuid],
        options: &ModifyRelationOptions,
    ) -> Result<S, Error> {
        self.modify::<S>(name, id, Cardinality::Many, Change::Set(relation_ids), options)
            .await
    }

    /// Removes `relation_ids` from an owned MANY relation. Ids that are not
    /// related are ignored.
    pub async fn remove_relations<S: Entity>(
        &self,
        name: &str,
        id: Uuid,
        relation_ids: &[Uuid],
        options: &ModifyRelationOptions,
    ) -> Result<S, Error> {
        self.modify::<S>(name, id, Cardinality::Many, Change::Remove(relation_ids), options)
            .await
    }

    /// Points an owned ONE relation at `relation_id`.
    pub async fn set_relation<S: Entity>(
        &self,
        name: &str,
        id: Uuid,
        relation_id: Uuid,
        options: &ModifyRelationOptions,
    ) -> Result<S, Error> {
        let ids = [relation_id];
        self.modify::<S>(name, id, Cardinality::One, Change::Set(&ids), options)
            .await
    }

    /// Clears an owned ONE relation when it currently points at
    /// `relation_id`.
    pub async fn remove_relation<S: Entity>(
        &self,
        name: &str,
        id: Uuid,
        relation_id: Uuid,
        options: &ModifyRelationOptions,
    ) -> Result<S, Error> {
        let ids = [relation_id];
        self.modify::<S>(name, id, Cardinality::One, Change::Remove(&ids), options)
            .await
    }

    async fn modify<S: Entity>(
        &self,
        name: &str,
        id: Uuid,
        cardinality: Cardinality,
        change: Change<'_>,
        options: &ModifyRelationOptions,
    ) -> Result<S, Error> {
        let source = self.registry.entity(S::TYPE)?;
        let relation = source.relation_or_err(name)?;
        let RelationKind::Owned { join_key } = &relation.kind else {
            return Err(Error::UnsupportedOperation(format!(
                "{}.{} is a virtual relation and cannot be modified",
                source.name(),
                relation.name
            )));
        };
        let target = self.registry.entity(&relation.target)?;
        let link = Link {
            source,
            relation,
            target,
        };
        Self::expect_cardinality(&link, cardinality)?;

        let source_filter = options.filter.clone().unwrap_or_default();
        let relation_filter = options.relation_filter.clone().unwrap_or_default();
        filter::validate(&source_filter, source, &self.registry)?;
        filter::validate(&relation_filter, target, &self.registry)?;

        let by_id = Filter::eq(source.id_field(), id);
        let current = self
            .fetch_source(source.name(), by_id.clone().and(source_filter))
            .await?
            .ok_or_else(|| Error::not_found(source.name(), id))?;

        let mut requested = match &change {
            Change::Add(ids) | Change::Set(ids) | Change::Remove(ids) => ids.to_vec(),
        };
        dedup(&mut requested);
        if !requested.is_empty() {
            let found = self
                .adapter
                .count(
                    target.name(),
                    &link.keyed_filter(&requested, &relation_filter),
                )
                .await?;
            if found != requested.len() as u64 {
                return Err(Error::validation(
                    "relation_ids",
                    format!(
                        "unable to find all {} to modify on {}",
                        relation.name,
                        source.name()
                    ),
                ));
            }
        }

        let value = match cardinality {
            Cardinality::Many => {
                let stored = id_list(&current, join_key);
                let ids = match change {
                    Change::Add(_) => {
                        let mut ids = stored;
                        ids.extend(requested);
                        dedup(&mut ids);
                        ids
                    }
                    Change::Set(_) => requested,
                    Change::Remove(_) => stored
                        .into_iter()
                        .filter(|id| !requested.contains(id))
                        .collect(),
                };
                Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect())
            }
            Cardinality::One => {
                let stored = field_value(&current, source, join_key).as_uuid();
                let next = match change {
                    Change::Remove(_) if stored.is_some_and(|fk| requested.contains(&fk)) => None,
                    Change::Remove(_) => stored,
                    Change::Add(_) | Change::Set(_) => requested.first().copied(),
                };
                next.map_or(Value::Null, |fk| Value::String(fk.to_string()))
            }
        };

        let mut patch = Document::new();
        patch.insert(join_key.clone(), value);
        self.adapter.update(source.name(), &by_id, &patch).await?;

        let updated = self
            .fetch_source(source.name(), by_id)
            .await?
            .ok_or_else(|| Error::not_found(source.name(), id))?;
        from_document(updated)
    }

    async fn fetch_source(&self, entity: &str, filter: Filter) -> Result<Option<Document>, Error> {
        let plan = QueryPlan::new(filter).window(Some(1), None);
        Ok(self.adapter.query(entity, &plan).await?.into_iter().next())
    }
}
