use serde::Serialize;

use crate::{
    document::{Document, Entity, from_document},
    error::Error,
    paging::{CursorPaging, Paging, PagingDirection, cursor, keyset},
    query::{Query, QueryPlan},
    service::{EntityService, QueryService},
    sort::{self, SortField},
};

/// How edge cursors are minted and read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PagingStrategy {
    /// `arrayconnection:<offset>` cursors.
    #[default]
    Offset,
    /// Cursors pinning the sort-key values of the edge's record.
    Keyset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEdge<T> {
    pub node: T,
    pub cursor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

/// One page of records with the cursors to move from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    pub edges: Vec<ConnectionEdge<T>>,
    pub page_info: PageInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

impl<T> Connection<T> {
    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|edge| &edge.node)
    }
}

/// Builds [`Connection`]s out of a service and a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pager {
    pub strategy: PagingStrategy,
    pub with_total_count: bool,
}

/// Rows fetched for a page plus the flags derived while fetching.
struct Page {
    rows: Vec<Document>,
    /// Offset of the first row, for offset cursors.
    offset: u64,
    has_next_page: bool,
    has_previous_page: bool,
}

impl Pager {
    pub fn offset() -> Self {
        Self::default()
    }

    pub fn keyset() -> Self {
        Self {
            strategy: PagingStrategy::Keyset,
            ..Self::default()
        }
    }

    pub fn with_total_count(mut self) -> Self {
        self.with_total_count = true;
        self
    }

    pub async fn page<T: Entity>(
        &self,
        service: &EntityService<T>,
        query: &Query,
    ) -> Result<Connection<T>, Error> {
        let (page, sorting) = match self.strategy {
            PagingStrategy::Offset => (self.offset_page(service, query).await?, Vec::new()),
            PagingStrategy::Keyset => {
                let sorting = sort::with_tiebreaker(&query.sorting, service.schema());
                (self.keyset_page(service, query, &sorting).await?, sorting)
            }
        };

        let mut edges = Vec::with_capacity(page.rows.len());
        for (i, row) in page.rows.into_iter().enumerate() {
            let cursor = match self.strategy {
                PagingStrategy::Offset => {
                    let offset = page.offset.saturating_add(i as u64);
                    cursor::encode(i64::try_from(offset).unwrap_or(i64::MAX))
                }
                PagingStrategy::Keyset => keyset::encode(&keyset::pins_for(&row, &sorting))?,
            };
            edges.push(ConnectionEdge {
                node: from_document(row)?,
                cursor,
            });
        }

        let total_count = if self.with_total_count {
            Some(service.count(&query.filter).await?)
        } else {
            None
        };

        Ok(Connection {
            page_info: PageInfo {
                has_next_page: page.has_next_page,
                has_previous_page: page.has_previous_page,
                start_cursor: edges.first().map(|edge| edge.cursor.clone()),
                end_cursor: edges.last().map(|edge| edge.cursor.clone()),
            },
            edges,
            total_count,
        })
    }

    /* ---------------- OFFSET ---------------- */

    async fn offset_page<T: Entity>(
        &self,
        service: &EntityService<T>,
        query: &Query,
    ) -> Result<Page, Error> {
        let plan = service.plan(query)?;
        let offset = plan.offset.unwrap_or(0);
        let backward = matches!(
            &query.paging,
            Some(Paging::Cursor(paging)) if paging.direction() == Some(PagingDirection::Backward)
        );

        if backward {
            let rows = service.fetch(&plan).await?;
            return Ok(Page {
                rows,
                offset,
                has_next_page: true,
                has_previous_page: offset > 0,
            });
        }

        let Some(limit) = plan.limit else {
            let rows = service.fetch(&plan).await?;
            return Ok(Page {
                rows,
                offset,
                has_next_page: false,
                has_previous_page: offset > 0,
            });
        };

        // One extra row tells whether another page follows.
        let lookahead = QueryPlan {
            limit: Some(limit + 1),
            ..plan
        };
        let mut rows = service.fetch(&lookahead).await?;
        let has_next_page = rows.len() as u64 > limit;
        rows.truncate(limit as usize);
        Ok(Page {
            rows,
            offset,
            has_next_page,
            has_previous_page: offset > 0,
        })
    }

    /* ---------------- KEYSET ---------------- */

    async fn keyset_page<T: Entity>(
        &self,
        service: &EntityService<T>,
        query: &Query,
        sorting: &[SortField],
    ) -> Result<Page, Error> {
        let paging = match &query.paging {
            Some(Paging::Cursor(paging)) => paging.clone(),
            // Offset windows have no keyset form; page them by offset and
            // still hand out keyset cursors.
            Some(Paging::Offset(_)) => return self.offset_page(service, query).await,
            None => CursorPaging::default(),
        };
        paging.validate(service.config().max_page_size)?;
        sort::validate(sorting, service.schema())?;

        match paging.direction() {
            None => {
                let plan = service.plan(&Query {
                    sorting: sorting.to_vec(),
                    paging: None,
                    ..query.clone()
                })?;
                Ok(Page {
                    rows: service.fetch(&plan).await?,
                    offset: 0,
                    has_next_page: false,
                    has_previous_page: false,
                })
            }
            Some(PagingDirection::Forward) => {
                let first = paging.first.unwrap_or_default() as u64;
                let mut filter = query.filter.clone();
                if let Some(after) = &paging.after {
                    let pins = keyset::decode(after, "paging.after")?;
                    let past = keyset::keyset_filter(sorting, &pins, service.schema(), "paging.after")?;
                    filter = filter.and(past);
                }
                service.validate_filter(&filter)?;

                let plan = QueryPlan::new(filter)
                    .sorted(sorting.to_vec())
                    .window(Some(first + 1), None);
                let mut rows = service.fetch(&plan).await?;
                let has_next_page = rows.len() as u64 > first;
                rows.truncate(first as usize);
                Ok(Page {
                    rows,
                    offset: 0,
                    has_next_page,
                    has_previous_page: paging.after.is_some(),
                })
            }
            Some(PagingDirection::Backward) => {
                let last = paging.last.unwrap_or_default() as u64;
                let reversed = sort::reversed(sorting);
                let mut filter = query.filter.clone();
                if let Some(before) = &paging.before {
                    let pins = keyset::decode(before, "paging.before")?;
                    let ahead =
                        keyset::keyset_filter(&reversed, &pins, service.schema(), "paging.before")?;
                    filter = filter.and(ahead);
                }
                service.validate_filter(&filter)?;

                let plan = QueryPlan::new(filter)
                    .sorted(reversed)
                    .window(Some(last + 1), None);
                let mut rows = service.fetch(&plan).await?;
                let has_previous_page = rows.len() as u64 > last;
                rows.truncate(last as usize);
                rows.reverse();
                Ok(Page {
                    rows,
                    offset: 0,
                    has_next_page: true,
                    has_previous_page,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::MemoryAdapter,
        config::EngineConfig,
        schema::{EntitySchema, SchemaRegistry},
        value::FieldType,
    };
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: Uuid,
        n: i64,
    }

    impl Entity for Row {
        const TYPE: &'static str = "Row";
    }

    async fn service() -> EntityService<Row> {
        let registry = Arc::new(
            SchemaRegistry::builder()
                .entity(EntitySchema::new("Row").field("n", FieldType::Int))
                .build()
                .unwrap(),
        );
        let adapter = Arc::new(MemoryAdapter::new(registry.clone()));
        let service = EntityService::new(adapter, registry, EngineConfig::default()).unwrap();
        for n in 1..=5 {
            service
                .create_one(json!({"n": n}).as_object().cloned().unwrap())
                .await
                .unwrap();
        }
        service
    }

    fn ns(connection: &Connection<Row>) -> Vec<i64> {
        connection.nodes().map(|row| row.n).collect()
    }

    #[tokio::test]
    async fn offset_cursors_walk_forward_and_back() {
        let service = service().await;
        let pager = Pager::offset().with_total_count();

        let page = pager
            .page(&service, &Query::new().sort_asc("n").first(2))
            .await
            .unwrap();
        assert_eq!(ns(&page), [1, 2]);
        assert!(page.page_info.has_next_page);
        assert!(!page.page_info.has_previous_page);
        assert_eq!(page.total_count, Some(5));

        let end = page.page_info.end_cursor.clone().unwrap();
        assert_eq!(end, cursor::encode(1));
        let page = pager
            .page(&service, &Query::new().sort_asc("n").first(2).after(end))
            .await
            .unwrap();
        assert_eq!(ns(&page), [3, 4]);
        assert!(page.page_info.has_next_page && page.page_info.has_previous_page);

        let start = page.page_info.start_cursor.clone().unwrap();
        let page = pager
            .page(&service, &Query::new().sort_asc("n").last(2).before(start))
            .await
            .unwrap();
        assert_eq!(ns(&page), [1, 2]);
        assert!(!page.page_info.has_previous_page);
    }

    #[tokio::test]
    async fn keyset_cursors_walk_forward_and_back() {
        let service = service().await;
        let pager = Pager::keyset();

        let page = pager
            .page(&service, &Query::new().sort_desc("n").first(2))
            .await
            .unwrap();
        assert_eq!(ns(&page), [5, 4]);

        let end = page.page_info.end_cursor.clone().unwrap();
        let page = pager
            .page(&service, &Query::new().sort_desc("n").first(2).after(end))
            .await
            .unwrap();
        assert_eq!(ns(&page), [3, 2]);
        assert!(page.page_info.has_next_page && page.page_info.has_previous_page);

        let end = page.page_info.end_cursor.clone().unwrap();
        let page = pager
            .page(&service, &Query::new().sort_desc("n").first(2).after(end))
            .await
            .unwrap();
        assert_eq!(ns(&page), [1]);
        assert!(!page.page_info.has_next_page);

        let start = page.page_info.start_cursor.clone().unwrap();
        let page = pager
            .page(&service, &Query::new().sort_desc("n").last(2).before(start))
            .await
            .unwrap();
        assert_eq!(ns(&page), [3, 2]);
        assert!(page.page_info.has_previous_page);
    }

    #[tokio::test]
    async fn keyset_cursor_must_match_the_sort() {
        let service = service().await;
        let pager = Pager::keyset();
        let page = pager
            .page(&service, &Query::new().sort_desc("n").first(1))
            .await
            .unwrap();
        let end = page.page_info.end_cursor.unwrap();
        let err = pager
            .page(&service, &Query::new().first(1).after(end))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }
}
