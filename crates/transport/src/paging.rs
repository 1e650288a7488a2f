use exochat_storage::{QueryId, RowSet};
use serde::Deserialize;
use snafu::ResultExt;

use super::client::{BoxFuture, ClientConfig};
use super::error::{DecodeBodySnafu, ReadBodySnafu, RequestSnafu, StatusSnafu, TransportResult};

/// One page as served by the paginated data endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemotePage {
    #[serde(default)]
    pub data: RowSet,
    #[serde(default)]
    pub has_next: bool,
}

/// Source of result pages that are not available locally.
pub trait PageSource: Send + Sync {
    fn fetch_page<'a>(
        &'a self,
        query_id: QueryId,
        page_index: u32,
    ) -> BoxFuture<'a, TransportResult<RemotePage>>;
}

#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPageSource {
    pub fn new(config: &ClientConfig) -> TransportResult<Self> {
        Ok(Self {
            http: config.build_http_client("page-source-new")?,
            base_url: config.base_url.clone(),
        })
    }

    async fn get_page(&self, query_id: QueryId, page_index: u32) -> TransportResult<RemotePage> {
        let response = self
            .http
            .get(format!("{}/query/data/{query_id}", self.base_url))
            .query(&[("page", page_index)])
            .send()
            .await
            .context(RequestSnafu {
                stage: "query-page-send",
            })?;

        let status = response.status();
        let body = response.text().await.context(ReadBodySnafu {
            stage: "query-page-read",
        })?;

        if !status.is_success() {
            return StatusSnafu {
                stage: "query-page-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let page: RemotePage = serde_json::from_str(&body).context(DecodeBodySnafu {
            stage: "query-page-decode",
        })?;
        tracing::debug!(
            query_id = %query_id,
            page_index,
            rows = page.data.len(),
            has_next = page.has_next,
            "fetched query page"
        );
        Ok(page)
    }
}

impl PageSource for HttpPageSource {
    fn fetch_page<'a>(
        &'a self,
        query_id: QueryId,
        page_index: u32,
    ) -> BoxFuture<'a, TransportResult<RemotePage>> {
        Box::pin(self.get_page(query_id, page_index))
    }
}
