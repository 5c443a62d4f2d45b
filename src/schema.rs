//! Explicit entity registry.
//!
//! Every entity type the engine serves is described once, at startup, by an
//! [`EntitySchema`]: its fields with their storage types and capabilities, and
//! its relations. The [`SchemaRegistry`] collecting them is validated as a
//! whole when built and then shared read-only (`Arc<SchemaRegistry>`) with the
//! adapters and the [`Engine`](crate::Engine).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{error::Error, value::FieldType};

pub const DEFAULT_ID_FIELD: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub nullable: bool,
    pub filterable: bool,
    pub sortable: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            filterable: true,
            sortable: ty.is_orderable(),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn not_filterable(mut self) -> Self {
        self.filterable = false;
        self
    }

    pub fn not_sortable(mut self) -> Self {
        self.sortable = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Where the link between a source and its related records lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// The source record stores the target id (ONE) or id list (MANY) in
    /// `join_key`. Mutable through add/set/remove.
    Owned { join_key: String },
    /// Target records store the source id in `lookup_key`. Read only.
    Virtual { lookup_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub name: String,
    pub cardinality: Cardinality,
    pub target: String,
    pub kind: RelationKind,
    /// Whether filters on the source may reach through this relation
    /// (`relation.field`).
    pub filterable: bool,
}

impl RelationDescriptor {
    pub fn owned_one(
        name: impl Into<String>,
        target: impl Into<String>,
        join_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::One,
            target: target.into(),
            kind: RelationKind::Owned {
                join_key: join_key.into(),
            },
            filterable: false,
        }
    }

    pub fn owned_many(
        name: impl Into<String>,
        target: impl Into<String>,
        join_key: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::owned_one(name, target, join_key)
        }
    }

    pub fn virtual_one(
        name: impl Into<String>,
        target: impl Into<String>,
        lookup_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cardinality: Cardinality::One,
            target: target.into(),
            kind: RelationKind::Virtual {
                lookup_key: lookup_key.into(),
            },
            filterable: false,
        }
    }

    pub fn virtual_many(
        name: impl Into<String>,
        target: impl Into<String>,
        lookup_key: impl Into<String>,
    ) -> Self {
        Self {
            cardinality: Cardinality::Many,
            ..Self::virtual_one(name, target, lookup_key)
        }
    }

    pub fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.kind, RelationKind::Owned { .. })
    }
}

#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    id_field: String,
    fields: BTreeMap<String, FieldDescriptor>,
    relations: BTreeMap<String, RelationDescriptor>,
}

impl EntitySchema {
    /// New schema with a `Uuid` id field named `id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id_field(name, DEFAULT_ID_FIELD)
    }

    pub fn with_id_field(name: impl Into<String>, id_field: impl Into<String>) -> Self {
        let id_field = id_field.into();
        let mut fields = BTreeMap::new();
        fields.insert(
            id_field.clone(),
            FieldDescriptor::new(id_field.clone(), FieldType::Uuid),
        );
        Self {
            name: name.into(),
            id_field,
            fields,
            relations: BTreeMap::new(),
        }
    }

    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with_field(FieldDescriptor::new(name, ty))
    }

    pub fn nullable_field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with_field(FieldDescriptor::new(name, ty).nullable())
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.insert(relation.name.clone(), relation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationDescriptor> {
        self.relations.values()
    }

    /// Looks up a relation by name, failing with a validation error naming it.
    pub fn relation_or_err(&self, name: &str) -> Result<&RelationDescriptor, Error> {
        self.relations.get(name).ok_or_else(|| {
            Error::validation(
                format!("relation.{}", name),
                format!("unknown relation on {}", self.name),
            )
        })
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntitySchema>> {
        self.entities.get(name)
    }

    /// Looks up an entity schema, failing when the type was never registered.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntitySchema>, Error> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::Schema(format!("entity {} is not registered", name)))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.values()
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    entities: Vec<EntitySchema>,
}

impl SchemaRegistryBuilder {
    pub fn entity(mut self, schema: EntitySchema) -> Self {
        self.entities.push(schema);
        self
    }

    /// Validates every entity and relation and freezes the registry.
    pub fn build(self) -> Result<SchemaRegistry, Error> {
        let mut entities = BTreeMap::new();
        for schema in self.entities {
            if entities.contains_key(&schema.name) {
                return Err(Error::Schema(format!(
                    "entity {} registered twice",
                    schema.name
                )));
            }
            entities.insert(schema.name.clone(), schema);
        }

        for schema in entities.values() {
            check_identifier(&schema.name)?;
            for field in schema.fields.values() {
                check_identifier(&field.name)?;
            }
            match schema.fields.get(&schema.id_field) {
                Some(field) if field.ty == FieldType::Uuid => {}
                _ => {
                    return Err(Error::Schema(format!(
                        "{}.{} must be a uuid field",
                        schema.name, schema.id_field
                    )));
                }
            }
            for relation in schema.relations.values() {
                check_identifier(&relation.name)?;
                check_relation(schema, relation, &entities)?;
            }
        }

        Ok(SchemaRegistry {
            entities: entities
                .into_iter()
                .map(|(name, schema)| (name, Arc::new(schema)))
                .collect(),
        })
    }
}

fn check_identifier(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Schema(format!("invalid identifier {:?}", name)))
    }
}

fn check_relation(
    schema: &EntitySchema,
    relation: &RelationDescriptor,
    entities: &BTreeMap<String, EntitySchema>,
) -> Result<(), Error> {
    let target = entities.get(&relation.target).ok_or_else(|| {
        Error::Schema(format!(
            "{}.{} targets unregistered entity {}",
            schema.name, relation.name, relation.target
        ))
    })?;

    if schema.fields.contains_key(&relation.name) {
        return Err(Error::Schema(format!(
            "{}.{} is declared as both a field and a relation",
            schema.name, relation.name
        )));
    }

    match &relation.kind {
        RelationKind::Owned { join_key } => {
            let expected = match relation.cardinality {
                Cardinality::One => FieldType::Uuid,
                Cardinality::Many => FieldType::UuidList,
            };
            match schema.fields.get(join_key) {
                Some(field) if field.ty == expected => Ok(()),
                _ => Err(Error::Schema(format!(
                    "{}.{} join key {} must be a declared {:?} field",
                    schema.name, relation.name, join_key, expected
                ))),
            }
        }
        RelationKind::Virtual { lookup_key } => match target.fields.get(lookup_key) {
            Some(field) if field.ty == FieldType::Uuid => Ok(()),
            _ => Err(Error::Schema(format!(
                "{}.{} lookup key {}.{} must be a declared Uuid field",
                schema.name, relation.name, target.name, lookup_key
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn todo() -> EntitySchema {
        EntitySchema::new("TodoItem")
            .field("title", FieldType::String)
            .nullable_field("assignee_id", FieldType::Uuid)
            .relation(RelationDescriptor::owned_one("assignee", "User", "assignee_id"))
            .relation(RelationDescriptor::virtual_many("subTasks", "SubTask", "todo_item_id"))
    }

    fn sub_task() -> EntitySchema {
        EntitySchema::new("SubTask")
            .field("title", FieldType::String)
            .field("todo_item_id", FieldType::Uuid)
    }

    #[test]
    fn builds_a_consistent_registry() {
        let registry = SchemaRegistry::builder()
            .entity(todo())
            .entity(sub_task())
            .entity(EntitySchema::new("User").field("name", FieldType::String))
            .build()
            .unwrap();

        let todo = registry.entity("TodoItem").unwrap();
        assert_eq!(todo.id_field(), "id");
        assert!(todo.get_relation("assignee").unwrap().is_owned());
        assert!(!todo.get_relation("subTasks").unwrap().is_owned());
    }

    #[test]
    fn rejects_relation_to_unregistered_entity() {
        let err = SchemaRegistry::builder()
            .entity(todo())
            .entity(sub_task())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn rejects_mistyped_join_key() {
        let err = SchemaRegistry::builder()
            .entity(
                EntitySchema::new("TodoItem")
                    .field("tag_ids", FieldType::Uuid)
                    .relation(RelationDescriptor::owned_many("tags", "Tag", "tag_ids")),
            )
            .entity(EntitySchema::new("Tag"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn rejects_non_identifier_names() {
        let err = SchemaRegistry::builder()
            .entity(EntitySchema::new("Todo").field("title'; --", FieldType::String))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
