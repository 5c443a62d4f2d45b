use super::{Comparison, ComparisonOp, Filter};
use crate::{
    error::{Error, ValidationErrors},
    schema::{EntitySchema, FieldDescriptor, SchemaRegistry},
    value::{FieldType, FieldValue},
};

/// Checks every comparison in `filter` against `schema`, collecting one error
/// per offending node.
pub fn validate(
    filter: &Filter,
    schema: &EntitySchema,
    registry: &SchemaRegistry,
) -> Result<(), Error> {
    let mut errors = ValidationErrors::new();
    visit(filter, schema, registry, &mut errors);
    errors.into_result()
}

/// Like [`validate`], but also refuses a filter without any comparison so a
/// many-record mutation can never silently hit the whole collection.
pub fn validate_mutation(
    filter: &Filter,
    schema: &EntitySchema,
    registry: &SchemaRegistry,
) -> Result<(), Error> {
    let mut errors = ValidationErrors::new();
    if filter.is_empty() {
        errors.push(
            "filter",
            "a non-empty filter is required to update or delete many records",
        );
    }
    visit(filter, schema, registry, &mut errors);
    errors.into_result()
}

fn visit(
    filter: &Filter,
    schema: &EntitySchema,
    registry: &SchemaRegistry,
    errors: &mut ValidationErrors,
) {
    match filter {
        Filter::And(parts) | Filter::Or(parts) => {
            for part in parts {
                visit(part, schema, registry, errors);
            }
        }
        Filter::Compare(comparison) => check_comparison(comparison, schema, registry, errors),
    }
}

fn check_comparison(
    comparison: &Comparison,
    schema: &EntitySchema,
    registry: &SchemaRegistry,
    errors: &mut ValidationErrors,
) {
    let path = format!("filter.{}", comparison.field);
    let field = match resolve_field(comparison, schema, registry) {
        Ok(field) => field,
        Err(message) => {
            errors.push(path, message);
            return;
        }
    };

    if !field.filterable {
        errors.push(path, "field is not filterable");
        return;
    }

    if let Some(message) = check_operator(&comparison.op, field.ty) {
        errors.push(path, format!("{}: {}", comparison.op.name(), message));
    }
}

fn resolve_field<'a>(
    comparison: &Comparison,
    schema: &'a EntitySchema,
    registry: &'a SchemaRegistry,
) -> Result<&'a FieldDescriptor, String> {
    let Some((relation_name, field_name)) = comparison.relation_path() else {
        return schema
            .get_field(&comparison.field)
            .ok_or_else(|| format!("unknown field on {}", schema.name()));
    };

    let relation = schema
        .get_relation(relation_name)
        .ok_or_else(|| format!("unknown relation on {}", schema.name()))?;
    if !relation.filterable {
        return Err(format!("relation {} is not filterable", relation_name));
    }
    if field_name.contains('.') {
        return Err("only one level of relation nesting is supported".to_string());
    }
    let target = registry
        .get(&relation.target)
        .ok_or_else(|| format!("relation target {} is not registered", relation.target))?;
    target
        .get_field(field_name)
        .ok_or_else(|| format!("unknown field on {}", target.name()))
}

fn check_operator(op: &ComparisonOp, ty: FieldType) -> Option<String> {
    match op {
        ComparisonOp::Eq(value) | ComparisonOp::Neq(value) => {
            if ty == FieldType::UuidList {
                return Some("not supported on id lists".to_string());
            }
            check_value(value, ty)
        }
        ComparisonOp::Gt(value)
        | ComparisonOp::Gte(value)
        | ComparisonOp::Lt(value)
        | ComparisonOp::Lte(value) => {
            if !ty.is_orderable() {
                return Some(format!("{:?} fields are not orderable", ty));
            }
            check_value(value, ty)
        }
        ComparisonOp::In(values) | ComparisonOp::NotIn(values) => {
            if ty == FieldType::UuidList {
                return Some("not supported on id lists".to_string());
            }
            if values.is_empty() {
                return Some("expected a non-empty list".to_string());
            }
            values.iter().find_map(|value| check_value(value, ty))
        }
        ComparisonOp::Is(None) | ComparisonOp::IsNot(None) => None,
        ComparisonOp::Is(Some(_)) | ComparisonOp::IsNot(Some(_)) => {
            if ty == FieldType::Bool {
                None
            } else {
                Some("boolean tests need a Bool field".to_string())
            }
        }
        ComparisonOp::Like(_)
        | ComparisonOp::NotLike(_)
        | ComparisonOp::ILike(_)
        | ComparisonOp::NotILike(_) => {
            if ty.is_text() {
                None
            } else {
                Some("pattern matching needs a String field".to_string())
            }
        }
    }
}

fn check_value(value: &FieldValue, ty: FieldType) -> Option<String> {
    if value.is_null() {
        return Some("null is only allowed with is/isNot".to_string());
    }
    match value.coerce(ty) {
        Some(_) => None,
        None => Some(format!("value {:?} does not fit a {:?} field", value, ty)),
    }
}
