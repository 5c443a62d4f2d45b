use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{
    Row, Sqlite,
    query::Query as SqlxQuery,
    sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use uuid::Uuid;

use crate::{
    adapters::Adapter,
    aggregate::{AggregateGroup, AggregateQuery, AggregateResponse},
    document::{Document, document_id},
    error::Error,
    filter::{ComparisonOp, Filter},
    query::QueryPlan,
    schema::{Cardinality, EntitySchema, RelationKind, SchemaRegistry},
    sort::{SortDirection, SortField},
    value::{FieldType, FieldValue, timestamp_string},
};

/// SQLite adapter storing every record as a JSON document.
///
/// Schema:
/// ```sql
/// CREATE TABLE entities (
///     id TEXT PRIMARY KEY,
///     type TEXT NOT NULL,
///     data TEXT NOT NULL
/// );
///
/// CREATE INDEX idx_entities_type ON entities(type);
/// ```
///
/// Filters, sorts and aggregates compile to SQL over
/// `json_extract(data, '$.field')`. Field and relation names are plain
/// identifiers (checked when the registry is built) and are inlined; every
/// value is bound.
pub struct SqliteAdapter {
    pub(crate) pool: SqlitePool,
    registry: Arc<SchemaRegistry>,
}

impl SqliteAdapter {
    /// Create a new SQLite adapter with a file-based database
    pub async fn new_file(path: &str, registry: Arc<SchemaRegistry>) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}", path))
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self { pool, registry })
    }

    /// Create a new SQLite adapter with an in-memory database
    pub async fn new_memory(registry: Arc<SchemaRegistry>) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self { pool, registry })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: SqlitePool, registry: Arc<SchemaRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(())
    }

    fn schema(&self, entity: &str) -> Result<&EntitySchema, Error> {
        self.registry.entity(entity).map(Arc::as_ref)
    }

    fn map_row_to_document(row: SqliteRow) -> Result<Document, Error> {
        let data_str: String = row
            .try_get("data")
            .map_err(|e| Error::Deserialize(e.to_string()))?;

        serde_json::from_str(&data_str).map_err(|e| Error::Deserialize(e.to_string()))
    }

    /// `o.type = ? AND <filter>` with its parameters, for the `o` alias.
    fn where_clause(&self, entity: &str, filter: &Filter) -> Result<SqlBuilder<'_>, Error> {
        let schema = self.schema(entity)?;
        let mut sql = SqlBuilder::new(&self.registry);
        let type_param = sql.bind(SqlValue::Text(entity.to_string()));
        let condition = sql.filter(filter, schema, "o")?;
        sql.text = format!("WHERE o.type = {} AND {}", type_param, condition);
        Ok(sql)
    }
}

/// Value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Storage form of a filter value: the same representation serde writes
    /// into the JSON documents (uuids and timestamps as text, booleans as
    /// the 0/1 that `json_extract` yields).
    fn from_field(value: &FieldValue) -> Self {
        match value {
            FieldValue::Null => SqlValue::Null,
            FieldValue::Bool(b) => SqlValue::Int(*b as i64),
            FieldValue::Int(i) => SqlValue::Int(*i),
            FieldValue::Float(f) => SqlValue::Float(*f),
            FieldValue::String(s) => SqlValue::Text(s.clone()),
            FieldValue::Uuid(u) => SqlValue::Text(u.to_string()),
            FieldValue::Timestamp(t) => SqlValue::Text(timestamp_string(t)),
        }
    }
}

fn bind_params<'q>(
    mut query: SqlxQuery<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlValue],
) -> SqlxQuery<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

/// Accumulates SQL text and the parameters for its placeholders, in order.
struct SqlBuilder<'r> {
    registry: &'r SchemaRegistry,
    text: String,
    params: Vec<SqlValue>,
}

impl<'r> SqlBuilder<'r> {
    fn new(registry: &'r SchemaRegistry) -> Self {
        Self {
            registry,
            text: String::new(),
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: SqlValue) -> &'static str {
        self.params.push(value);
        "?"
    }

    fn filter(
        &mut self,
        filter: &Filter,
        schema: &EntitySchema,
        alias: &str,
    ) -> Result<String, Error> {
        match filter {
            Filter::And(parts) | Filter::Or(parts) if parts.is_empty() => Ok("1".to_string()),
            Filter::And(parts) => self.join(parts, " AND ", schema, alias),
            Filter::Or(parts) => self.join(parts, " OR ", schema, alias),
            Filter::Compare(comparison) => match comparison.relation_path() {
                None => {
                    let field = schema.get_field(&comparison.field).ok_or_else(|| {
                        Error::validation(format!("filter.{}", comparison.field), "unknown field")
                    })?;
                    Ok(self.comparison(&json_path(alias, &field.name), field.ty, &comparison.op))
                }
                Some((relation, field)) => {
                    self.relation_comparison(schema, relation, field, &comparison.op, alias)
                }
            },
        }
    }

    fn join(
        &mut self,
        parts: &[Filter],
        separator: &str,
        schema: &EntitySchema,
        alias: &str,
    ) -> Result<String, Error> {
        let compiled = parts
            .iter()
            .map(|part| self.filter(part, schema, alias))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", compiled.join(separator)))
    }

    /// `EXISTS` over the related records of the row aliased `alias`.
    fn relation_comparison(
        &mut self,
        schema: &EntitySchema,
        relation_name: &str,
        field_name: &str,
        op: &ComparisonOp,
        alias: &str,
    ) -> Result<String, Error> {
        let path = || format!("filter.{}.{}", relation_name, field_name);
        let relation = schema
            .get_relation(relation_name)
            .ok_or_else(|| Error::validation(path(), "unknown relation"))?;
        let target = self.registry.entity(&relation.target)?;
        let field = target
            .get_field(field_name)
            .ok_or_else(|| Error::validation(path(), "unknown field"))?;

        let type_param = self.bind(SqlValue::Text(relation.target.clone()));
        let link = match (&relation.kind, relation.cardinality) {
            (RelationKind::Owned { join_key }, Cardinality::One) => {
                format!("r.id = {}", json_path(alias, join_key))
            }
            (RelationKind::Owned { join_key }, Cardinality::Many) => format!(
                "r.id IN (SELECT value FROM json_each({}.data, '$.{}'))",
                alias, join_key
            ),
            (RelationKind::Virtual { lookup_key }, _) => {
                format!("{} = {}.id", json_path("r", lookup_key), alias)
            }
        };
        let condition = self.comparison(&json_path("r", &field.name), field.ty, op);
        Ok(format!(
            "EXISTS (SELECT 1 FROM entities r WHERE r.type = {} AND {} AND {})",
            type_param, link, condition
        ))
    }

    fn comparison(&mut self, expr: &str, ty: FieldType, op: &ComparisonOp) -> String {
        match op {
            ComparisonOp::Eq(v) => self.binary(expr, "=", v, ty),
            ComparisonOp::Neq(v) => self.binary(expr, "<>", v, ty),
            ComparisonOp::Gt(v) => self.binary(expr, ">", v, ty),
            ComparisonOp::Gte(v) => self.binary(expr, ">=", v, ty),
            ComparisonOp::Lt(v) => self.binary(expr, "<", v, ty),
            ComparisonOp::Lte(v) => self.binary(expr, "<=", v, ty),
            ComparisonOp::In(values) => match self.list(values, ty) {
                Some(list) => format!("{} IN ({})", expr, list),
                None => "0".to_string(),
            },
            ComparisonOp::NotIn(values) => match self.list(values, ty) {
                Some(list) => format!("{} NOT IN ({})", expr, list),
                None => format!("{} IS NOT NULL", expr),
            },
            ComparisonOp::Is(None) => format!("{} IS NULL", expr),
            ComparisonOp::IsNot(None) => format!("{} IS NOT NULL", expr),
            ComparisonOp::Is(Some(b)) => format!("{} = {}", expr, *b as i64),
            ComparisonOp::IsNot(Some(b)) => format!("{} IS NOT {}", expr, *b as i64),
            ComparisonOp::Like(pattern) => {
                let p = self.bind(SqlValue::Text(like_to_glob(pattern)));
                format!("{} GLOB {}", expr, p)
            }
            ComparisonOp::NotLike(pattern) => {
                let p = self.bind(SqlValue::Text(like_to_glob(pattern)));
                format!("NOT ({} GLOB {})", expr, p)
            }
            ComparisonOp::ILike(pattern) => {
                let p = self.bind(SqlValue::Text(pattern.clone()));
                format!("{} LIKE {}", expr, p)
            }
            ComparisonOp::NotILike(pattern) => {
                let p = self.bind(SqlValue::Text(pattern.clone()));
                format!("{} NOT LIKE {}", expr, p)
            }
        }
    }

    fn binary(&mut self, expr: &str, operator: &str, value: &FieldValue, ty: FieldType) -> String {
        match value.coerce(ty).filter(|v| !v.is_null()) {
            Some(value) => {
                let p = self.bind(SqlValue::from_field(&value));
                format!("{} {} {}", expr, operator, p)
            }
            None => "0".to_string(),
        }
    }

    fn list(&mut self, values: &[FieldValue], ty: FieldType) -> Option<String> {
        let placeholders: Vec<&str> = values
            .iter()
            .filter_map(|value| value.coerce(ty).filter(|v| !v.is_null()))
            .map(|value| self.bind(SqlValue::from_field(&value)))
            .collect();
        (!placeholders.is_empty()).then(|| placeholders.join(", "))
    }
}

fn json_path(alias: &str, field: &str) -> String {
    format!("json_extract({}.data, '$.{}')", alias, field)
}

/// Case-sensitive `LIKE` as a `GLOB` pattern: `%` becomes `*`, `_` becomes
/// `?`, and characters special to `GLOB` are bracketed.
fn like_to_glob(pattern: &str) -> String {
    let mut glob = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => glob.push('*'),
            '_' => glob.push('?'),
            '*' | '?' | '[' => {
                glob.push('[');
                glob.push(c);
                glob.push(']');
            }
            _ => glob.push(c),
        }
    }
    glob
}

fn order_clause(sorting: &[SortField]) -> String {
    let mut terms: Vec<String> = sorting
        .iter()
        .map(|sort| {
            let direction = match sort.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            let nulls = if sort.nulls_come_first() {
                "NULLS FIRST"
            } else {
                "NULLS LAST"
            };
            format!("{} {} {}", json_path("o", &sort.field), direction, nulls)
        })
        .collect();
    terms.push("o.rowid ASC".to_string());
    format!("ORDER BY {}", terms.join(", "))
}

/// `expr` cast to the SQLite storage class matching `ty`, so the value
/// decodes back into the right Rust type.
fn typed_expr(expr: &str, ty: FieldType) -> String {
    let class = match ty {
        FieldType::Int | FieldType::Bool => "INTEGER",
        FieldType::Float => "REAL",
        _ => "TEXT",
    };
    format!("CAST({} AS {})", expr, class)
}

fn read_typed(row: &SqliteRow, column: &str, ty: FieldType) -> Result<FieldValue, Error> {
    let storage = |e: sqlx::Error| Error::Storage(e.to_string());
    let value = match ty {
        FieldType::Int => row
            .try_get::<Option<i64>, _>(column)
            .map_err(storage)?
            .map(FieldValue::Int),
        FieldType::Bool => row
            .try_get::<Option<i64>, _>(column)
            .map_err(storage)?
            .map(|v| FieldValue::Bool(v != 0)),
        FieldType::Float => row
            .try_get::<Option<f64>, _>(column)
            .map_err(storage)?
            .map(FieldValue::Float),
        FieldType::String => row
            .try_get::<Option<String>, _>(column)
            .map_err(storage)?
            .map(FieldValue::String),
        FieldType::Uuid => row
            .try_get::<Option<String>, _>(column)
            .map_err(storage)?
            .and_then(|s| Uuid::parse_str(&s).ok())
            .map(FieldValue::Uuid),
        FieldType::Timestamp => row
            .try_get::<Option<String>, _>(column)
            .map_err(storage)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| FieldValue::Timestamp(t.with_timezone(&Utc))),
        FieldType::UuidList => None,
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

fn aggregate_columns(query: &AggregateQuery, schema: &EntitySchema) -> Vec<String> {
    let ty = |field: &str| {
        schema
            .get_field(field)
            .map_or(FieldType::String, |f| f.ty)
    };
    let mut columns = Vec::new();
    for (i, field) in query.count.iter().enumerate() {
        columns.push(format!("COUNT({}) AS count_{}", json_path("o", field), i));
    }
    for (i, field) in query.sum.iter().enumerate() {
        columns.push(format!("CAST(SUM({}) AS REAL) AS sum_{}", json_path("o", field), i));
    }
    for (i, field) in query.avg.iter().enumerate() {
        columns.push(format!("CAST(AVG({}) AS REAL) AS avg_{}", json_path("o", field), i));
    }
    for (i, field) in query.min.iter().enumerate() {
        let min = format!("MIN({})", json_path("o", field));
        columns.push(format!("{} AS min_{}", typed_expr(&min, ty(field)), i));
    }
    for (i, field) in query.max.iter().enumerate() {
        let max = format!("MAX({})", json_path("o", field));
        columns.push(format!("{} AS max_{}", typed_expr(&max, ty(field)), i));
    }
    columns
}

fn map_row_to_aggregate(
    row: &SqliteRow,
    query: &AggregateQuery,
    schema: &EntitySchema,
) -> Result<AggregateResponse, Error> {
    let storage = |e: sqlx::Error| Error::Storage(e.to_string());
    let ty = |field: &str| {
        schema
            .get_field(field)
            .map_or(FieldType::String, |f| f.ty)
    };
    let mut response = AggregateResponse::default();
    for (i, field) in query.count.iter().enumerate() {
        let n: i64 = row.try_get(format!("count_{}", i).as_str()).map_err(storage)?;
        response.count.insert(field.clone(), n as u64);
    }
    for (i, field) in query.sum.iter().enumerate() {
        let sum: Option<f64> = row.try_get(format!("sum_{}", i).as_str()).map_err(storage)?;
        response.sum.insert(field.clone(), sum);
    }
    for (i, field) in query.avg.iter().enumerate() {
        let avg: Option<f64> = row.try_get(format!("avg_{}", i).as_str()).map_err(storage)?;
        response.avg.insert(field.clone(), avg);
    }
    for (i, field) in query.min.iter().enumerate() {
        let min = read_typed(row, &format!("min_{}", i), ty(field))?;
        response
            .min
            .insert(field.clone(), (!min.is_null()).then_some(min));
    }
    for (i, field) in query.max.iter().enumerate() {
        let max = read_typed(row, &format!("max_{}", i), ty(field))?;
        response
            .max
            .insert(field.clone(), (!max.is_null()).then_some(max));
    }
    Ok(response)
}

#[async_trait::async_trait]
impl Adapter for SqliteAdapter {
    async fn query(&self, entity: &str, plan: &QueryPlan) -> Result<Vec<Document>, Error> {
        let mut sql = self.where_clause(entity, &plan.filter)?;
        let mut text = format!(
            "SELECT o.data FROM entities o {} {}",
            sql.text,
            order_clause(&plan.sorting)
        );
        if plan.limit.is_some() || plan.offset.is_some() {
            let limit = plan.limit.map_or(-1, |limit| limit.min(i64::MAX as u64) as i64);
            let offset = plan.offset.unwrap_or(0).min(i64::MAX as u64) as i64;
            let limit_param = sql.bind(SqlValue::Int(limit));
            let offset_param = sql.bind(SqlValue::Int(offset));
            text.push_str(&format!(" LIMIT {} OFFSET {}", limit_param, offset_param));
        }

        let pool = self.pool.clone();
        let rows = bind_params(sqlx::query(&text), &sql.params)
            .fetch_all(&pool)
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;

        rows.into_iter().map(Self::map_row_to_document).collect()
    }

    async fn count(&self, entity: &str, filter: &Filter) -> Result<u64, Error> {
        let sql = self.where_clause(entity, filter)?;
        let text = format!("SELECT COUNT(*) AS n FROM entities o {}", sql.text);

        let pool = self.pool.clone();
        let row = bind_params(sqlx::query(&text), &sql.params)
            .fetch_one(&pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        let count: i64 = row.try_get("n").map_err(|e| Error::Storage(e.to_string()))?;

        Ok(count as u64)
    }

    async fn aggregate(
        &self,
        entity: &str,
        filter: &Filter,
        query: &AggregateQuery,
        group_by: Option<&str>,
    ) -> Result<Vec<AggregateGroup>, Error> {
        let schema = self.schema(entity)?;
        let sql = self.where_clause(entity, filter)?;
        let mut columns = aggregate_columns(query, schema);

        let group_ty = match group_by {
            Some(field) => Some(
                schema
                    .get_field(field)
                    .map(|f| f.ty)
                    .ok_or_else(|| Error::validation(format!("group_by.{}", field), "unknown field"))?,
            ),
            None => None,
        };

        let text = match (group_by, group_ty) {
            (Some(field), Some(ty)) => {
                columns.insert(
                    0,
                    format!("{} AS group_key", typed_expr(&json_path("o", field), ty)),
                );
                format!(
                    "SELECT {} FROM entities o {} AND {} IS NOT NULL GROUP BY group_key ORDER BY MIN(o.rowid)",
                    columns.join(", "),
                    sql.text,
                    json_path("o", field)
                )
            }
            _ => {
                // SQLite rejects an empty select list.
                if columns.is_empty() {
                    columns.push("COUNT(*) AS n".to_string());
                }
                format!("SELECT {} FROM entities o {}", columns.join(", "), sql.text)
            }
        };

        let pool = self.pool.clone();
        let rows = bind_params(sqlx::query(&text), &sql.params)
            .fetch_all(&pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = match group_ty {
                Some(ty) => read_typed(row, "group_key", ty)?.key_string(),
                None => None,
            };
            groups.push(AggregateGroup {
                key,
                response: map_row_to_aggregate(row, query, schema)?,
            });
        }
        if group_by.is_none() && groups.is_empty() {
            groups.push(AggregateGroup {
                key: None,
                response: AggregateResponse::empty(query),
            });
        }
        Ok(groups)
    }

    async fn insert(
        &self,
        entity: &str,
        documents: Vec<Document>,
    ) -> Result<Vec<Document>, Error> {
        let schema = self.schema(entity)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;

        for document in &documents {
            let id = document_id(document, schema).ok_or_else(|| {
                Error::Storage(format!("{} document without an id", schema.name()))
            })?;
            sqlx::query(
                r#"
                INSERT INTO entities (id, type, data)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(entity)
            .bind(serde_json::to_string(document).map_err(|e| Error::Serialize(e.to_string()))?)
            .execute(&mut *tx)
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(documents)
    }

    async fn update(&self, entity: &str, filter: &Filter, patch: &Document) -> Result<u64, Error> {
        if patch.is_empty() {
            return self.count(entity, filter).await;
        }

        // `json_set` keeps explicit nulls, which `json_patch` would drop.
        let mut assignments = Vec::with_capacity(patch.len());
        let mut params = Vec::with_capacity(patch.len());
        for (key, value) in patch {
            assignments.push(format!("'$.{}', json(?)", key));
            params.push(SqlValue::Text(
                serde_json::to_string(value).map_err(|e| Error::Serialize(e.to_string()))?,
            ));
        }

        let sql = self.where_clause(entity, filter)?;
        params.extend(sql.params);
        let text = format!(
            "UPDATE entities AS o SET data = json_set(o.data, {}) {}",
            assignments.join(", "),
            sql.text
        );

        let pool = self.pool.clone();
        let result = bind_params(sqlx::query(&text), &params)
            .execute(&pool)
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn delete(&self, entity: &str, filter: &Filter) -> Result<u64, Error> {
        let sql = self.where_clause(entity, filter)?;
        let text = format!("DELETE FROM entities AS o {}", sql.text);

        let pool = self.pool.clone();
        let result = bind_params(sqlx::query(&text), &sql.params)
            .execute(&pool)
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;

        Ok(result.rows_affected())
    }
}
