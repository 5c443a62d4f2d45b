use crate::{
    error::Error,
    filter::Filter,
    paging::{CursorPaging, LimitOffset, OffsetPaging, Paging},
    sort::SortField,
};

/// A read request: which records, in which order, which window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub sorting: Vec<SortField>,
    pub paging: Option<Paging>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// ANDs `filter` into the query's filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(filter);
        self
    }

    pub fn sort(mut self, sort: SortField) -> Self {
        self.sorting.push(sort);
        self
    }

    pub fn sort_asc(self, field: impl Into<String>) -> Self {
        self.sort(SortField::asc(field))
    }

    pub fn sort_desc(self, field: impl Into<String>) -> Self {
        self.sort(SortField::desc(field))
    }

    pub fn paging(mut self, paging: Paging) -> Self {
        self.paging = Some(paging);
        self
    }

    pub fn first(self, first: i64) -> Self {
        self.with_cursor(|paging| paging.first = Some(first))
    }

    pub fn after(self, cursor: impl Into<String>) -> Self {
        let cursor = cursor.into();
        self.with_cursor(|paging| paging.after = Some(cursor))
    }

    pub fn last(self, last: i64) -> Self {
        self.with_cursor(|paging| paging.last = Some(last))
    }

    pub fn before(self, cursor: impl Into<String>) -> Self {
        let cursor = cursor.into();
        self.with_cursor(|paging| paging.before = Some(cursor))
    }

    pub fn limit(self, limit: i64) -> Self {
        self.with_offset(|paging| paging.limit = Some(limit))
    }

    pub fn offset(self, offset: i64) -> Self {
        self.with_offset(|paging| paging.offset = Some(offset))
    }

    // Switching between cursor and offset arguments starts a fresh paging.
    fn with_cursor(mut self, set: impl FnOnce(&mut CursorPaging)) -> Self {
        let mut paging = match self.paging.take() {
            Some(Paging::Cursor(paging)) => paging,
            _ => CursorPaging::default(),
        };
        set(&mut paging);
        self.paging = Some(Paging::Cursor(paging));
        self
    }

    fn with_offset(mut self, set: impl FnOnce(&mut OffsetPaging)) -> Self {
        let mut paging = match self.paging.take() {
            Some(Paging::Offset(paging)) => paging,
            _ => OffsetPaging::default(),
        };
        set(&mut paging);
        self.paging = Some(Paging::Offset(paging));
        self
    }

    /// Resolves paging into the window an adapter executes.
    pub fn plan(&self, max_page_size: Option<u64>) -> Result<QueryPlan, Error> {
        let window = match &self.paging {
            Some(paging) => paging.resolve(max_page_size)?,
            None => LimitOffset::default(),
        };
        Ok(QueryPlan {
            filter: self.filter.clone(),
            sorting: self.sorting.clone(),
            limit: window.limit,
            offset: window.offset,
        })
    }
}

/// What an adapter executes: an already validated filter and sort and a
/// plain `LIMIT`/`OFFSET` window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    pub filter: Filter,
    pub sorting: Vec<SortField>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryPlan {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn sorted(mut self, sorting: Vec<SortField>) -> Self {
        self.sorting = sorting;
        self
    }

    pub fn window(mut self, limit: Option<u64>, offset: Option<u64>) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::cursor;

    #[test]
    fn builder_collects_filter_sort_and_paging() {
        let query = Query::new()
            .filter(Filter::eq("completed", true))
            .filter(Filter::like("title", "Create%"))
            .sort_desc("priority")
            .first(2)
            .after(cursor::encode(1));

        let Filter::And(parts) = &query.filter else {
            panic!("expected and");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(
            query.paging,
            Some(Paging::Cursor(CursorPaging::forward(2, Some(cursor::encode(1)))))
        );

        let plan = query.plan(None).unwrap();
        assert_eq!((plan.limit, plan.offset), (Some(2), Some(2)));
    }

    #[test]
    fn switching_paging_mode_starts_fresh() {
        let query = Query::new().first(2).limit(5).offset(10);
        let plan = query.plan(None).unwrap();
        assert_eq!((plan.limit, plan.offset), (Some(5), Some(10)));
    }

    #[test]
    fn plan_without_paging_is_unbounded() {
        let plan = Query::new().plan(Some(10)).unwrap();
        assert_eq!((plan.limit, plan.offset), (None, None));
    }
}
