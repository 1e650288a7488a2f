use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use exochat_storage::{ConversationStore, QueryId, QueryResponseStore, RowSet};
use exochat_transport::{PageSource, TransportError};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

/// Rows per page served by the answering service; inline results hold at most one page.
pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PagerError {
    #[snafu(display("query {query_id} has no stored result"))]
    UnknownQuery {
        stage: &'static str,
        query_id: QueryId,
    },
    #[snafu(display(
        "page {page_index} of query {query_id} is not reachable yet (furthest reachable page is {reachable})"
    ))]
    PageNotReachable {
        stage: &'static str,
        query_id: QueryId,
        page_index: u32,
        reachable: u32,
    },
    #[snafu(display("failed to fetch page {page_index} of query {query_id}: {source}"))]
    Source {
        stage: &'static str,
        query_id: QueryId,
        page_index: u32,
        source: TransportError,
    },
}

pub type PagerResult<T> = Result<T, PagerError>;

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub query_id: QueryId,
    pub page_index: u32,
    pub rows: RowSet,
    pub has_next: bool,
}

/// Forward-only pagination over stored query results.
///
/// Page 0 comes from the rows delivered inline with the answer when present.
/// Page N is only requested after page N-1 reported `has_next`.
#[derive(Clone)]
pub struct QueryPager {
    store: ConversationStore,
    source: Arc<dyn PageSource>,
    page_size: usize,
    reachable: Arc<Mutex<HashMap<QueryId, u32>>>,
}

impl QueryPager {
    pub fn new(store: ConversationStore, source: Arc<dyn PageSource>) -> Self {
        Self {
            store,
            source,
            page_size: DEFAULT_PAGE_SIZE,
            reachable: Arc::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Highest page index that may currently be requested for `query_id`.
    pub fn reachable_page(&self, query_id: QueryId) -> u32 {
        self.reachable_pages()
            .get(&query_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn fetch_page(&self, query_id: QueryId, page_index: u32) -> PagerResult<Page> {
        let response = self
            .store
            .query_response(query_id)
            .context(UnknownQuerySnafu {
                stage: "fetch-page-lookup",
                query_id,
            })?;

        let reachable = self.reachable_page(query_id);
        ensure!(
            page_index <= reachable,
            PageNotReachableSnafu {
                stage: "fetch-page-order",
                query_id,
                page_index,
                reachable,
            }
        );

        let (rows, has_next) = match response.inline_rows {
            Some(rows) if page_index == 0 => {
                let has_next = rows.len() == self.page_size;
                tracing::debug!(query_id = %query_id, rows = rows.len(), has_next, "serving inline page");
                (rows, has_next)
            }
            _ => {
                let page = self
                    .source
                    .fetch_page(query_id, page_index)
                    .await
                    .context(SourceSnafu {
                        stage: "fetch-page-remote",
                        query_id,
                        page_index,
                    })?;
                (page.data, page.has_next)
            }
        };

        if has_next {
            let mut reachable = self.reachable_pages();
            let next = reachable.entry(query_id).or_default();
            *next = (*next).max(page_index + 1);
        }

        Ok(Page {
            query_id,
            page_index,
            rows,
            has_next,
        })
    }

    fn reachable_pages(&self) -> std::sync::MutexGuard<'_, HashMap<QueryId, u32>> {
        self.reachable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use exochat_storage::{
        Dataset, Message, MessageId, MessageStore, NewQueryResponse, Row,
    };
    use exochat_transport::{BoxFuture, ClientConfig, HttpPageSource, RemotePage, TransportResult};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    /// Serves `total_rows` synthetic rows in pages of `page_size` and counts calls.
    struct CountingSource {
        calls: AtomicUsize,
        total_rows: usize,
        page_size: usize,
    }

    impl CountingSource {
        fn new(total_rows: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                total_rows,
                page_size: DEFAULT_PAGE_SIZE,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PageSource for CountingSource {
        fn fetch_page<'a>(
            &'a self,
            _query_id: QueryId,
            page_index: u32,
        ) -> BoxFuture<'a, TransportResult<RemotePage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = page_index as usize * self.page_size;
            let end = (start + self.page_size).min(self.total_rows);
            let data = (start..end).map(row).collect::<Vec<_>>();
            let has_next = end < self.total_rows;
            Box::pin(async move { Ok(RemotePage { data, has_next }) })
        }
    }

    fn row(index: usize) -> Row {
        let mut row = Row::new();
        row.insert("pl_name".to_string(), json!(format!("TOI-{index}.01")));
        row
    }

    fn store_with_result(inline_rows: Option<usize>) -> (ConversationStore, QueryId) {
        let store = ConversationStore::new();
        let id = store.next_message_id();
        store
            .append_message(Message::assistant_streaming(id, "Found planets."))
            .unwrap();
        let query_id = store
            .append_query_response(NewQueryResponse {
                message_id: id,
                dataset: Dataset::Toi,
                response_text: "Found planets.".to_string(),
                inline_rows: inline_rows.map(|count| (0..count).map(row).collect()),
                plot: None,
            })
            .unwrap();
        (store, query_id)
    }

    #[tokio::test]
    async fn first_page_is_served_inline_without_remote_call() {
        let (store, query_id) = store_with_result(Some(12));
        let source = CountingSource::new(40);
        let pager = QueryPager::new(store, source.clone());

        let page = pager.fetch_page(query_id, 0).await.unwrap();
        assert_eq!(page.rows.len(), 12);
        assert!(!page.has_next);
        assert_eq!(source.calls(), 0);

        let error = pager.fetch_page(query_id, 1).await.unwrap_err();
        assert!(matches!(
            error,
            PagerError::PageNotReachable { page_index: 1, reachable: 0, .. }
        ));
    }

    #[tokio::test]
    async fn full_inline_page_unlocks_the_next_one() {
        let (store, query_id) = store_with_result(Some(DEFAULT_PAGE_SIZE));
        let source = CountingSource::new(25);
        let pager = QueryPager::new(store, source.clone());

        assert!(pager.fetch_page(query_id, 0).await.unwrap().has_next);
        assert_eq!(pager.reachable_page(query_id), 1);

        let second = pager.fetch_page(query_id, 1).await.unwrap();
        assert_eq!(second.rows.len(), 10);
        assert!(second.has_next);
        assert_eq!(second.rows[0]["pl_name"], json!("TOI-10.01"));

        let third = pager.fetch_page(query_id, 2).await.unwrap();
        assert_eq!(third.rows.len(), 5);
        assert!(!third.has_next);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn pages_cannot_be_skipped_but_can_be_revisited() {
        let (store, query_id) = store_with_result(Some(DEFAULT_PAGE_SIZE));
        let pager = QueryPager::new(store, CountingSource::new(30));

        assert!(matches!(
            pager.fetch_page(query_id, 2).await,
            Err(PagerError::PageNotReachable { .. })
        ));

        pager.fetch_page(query_id, 0).await.unwrap();
        pager.fetch_page(query_id, 1).await.unwrap();
        let again = pager.fetch_page(query_id, 0).await.unwrap();
        assert_eq!(again.page_index, 0);
        assert_eq!(pager.reachable_page(query_id), 2);
    }

    #[tokio::test]
    async fn result_without_inline_rows_fetches_first_page_remotely() {
        let (store, query_id) = store_with_result(None);
        let source = CountingSource::new(4);
        let pager = QueryPager::new(store, source.clone());

        let page = pager.fetch_page(query_id, 0).await.unwrap();
        assert_eq!(page.rows.len(), 4);
        assert!(!page.has_next);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_query_is_rejected() {
        let pager = QueryPager::new(ConversationStore::new(), CountingSource::new(0));
        let error = pager.fetch_page(QueryId::new(7), 0).await.unwrap_err();
        assert!(matches!(error, PagerError::UnknownQuery { .. }));
    }

    #[tokio::test]
    async fn remote_failure_is_reported_with_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query/data/0"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"error": "Query not found or expired"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (store, query_id) = store_with_result(Some(DEFAULT_PAGE_SIZE));
        assert_eq!(query_id, QueryId::from(MessageId::new(0)));
        let source = HttpPageSource::new(&ClientConfig::new(server.uri())).unwrap();
        let pager = QueryPager::new(store, Arc::new(source));

        pager.fetch_page(query_id, 0).await.unwrap();
        let error = pager.fetch_page(query_id, 1).await.unwrap_err();
        match error {
            PagerError::Source {
                page_index, source, ..
            } => {
                assert_eq!(page_index, 1);
                assert!(matches!(source, TransportError::Status { status: 404, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(pager.reachable_page(query_id), 1);
    }

    #[tokio::test]
    async fn custom_page_size_changes_inline_has_next() {
        let (store, query_id) = store_with_result(Some(12));
        let pager = QueryPager::new(store, CountingSource::new(0)).with_page_size(12);
        assert!(pager.fetch_page(query_id, 0).await.unwrap().has_next);
    }
}
