pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;

use crate::{
    aggregate::{AggregateGroup, AggregateQuery},
    document::Document,
    error::Error,
    filter::Filter,
    query::QueryPlan,
};

pub use memory::MemoryAdapter;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAdapter;

/// -----------------------------
/// Adapter contract
/// -----------------------------
///
/// Record-level storage every backend implements. Entities are addressed by
/// their registered schema name and exchanged as JSON documents. Filters,
/// sorts and windows arrive already validated against the schema registry
/// the adapter was built with; the adapter only executes them.
///
/// Null semantics are those of SQL: a null field satisfies no comparison
/// except a null test. Sorting is stable, nulls sort lowest unless the sort
/// key says otherwise.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /* ---------------- READS ---------------- */

    /// Records matching `plan.filter`, ordered by `plan.sorting` (insertion
    /// order breaks ties) and windowed by `plan.limit`/`plan.offset`.
    async fn query(&self, entity: &str, plan: &QueryPlan) -> Result<Vec<Document>, Error>;

    async fn count(&self, entity: &str, filter: &Filter) -> Result<u64, Error>;

    /// Aggregates the records matching `filter`. Without `group_by` exactly
    /// one group with key `None` comes back, even when nothing matched.
    /// Grouped, one group per distinct non-null value of `group_by`.
    async fn aggregate(
        &self,
        entity: &str,
        filter: &Filter,
        query: &AggregateQuery,
        group_by: Option<&str>,
    ) -> Result<Vec<AggregateGroup>, Error>;

    /* ---------------- WRITES ---------------- */

    /// Stores complete documents (ids already assigned) and returns them as
    /// stored.
    async fn insert(&self, entity: &str, documents: Vec<Document>)
    -> Result<Vec<Document>, Error>;

    /// Merges `patch` into every record matching `filter`; keys set to null
    /// are stored as null. Returns the number of records touched.
    async fn update(&self, entity: &str, filter: &Filter, patch: &Document) -> Result<u64, Error>;

    async fn delete(&self, entity: &str, filter: &Filter) -> Result<u64, Error>;
}
