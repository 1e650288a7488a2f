use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use snafu::ResultExt;

use super::decoder::LineDecoder;
use super::error::{BuildClientSnafu, ProtocolError, RequestSnafu, StatusSnafu, TransportResult};
use super::event::{StreamEvent, StreamFailure, decode_record};
use super::request::ChatRequest;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback receiving decoded events in wire order.
pub type EventSink<'a> = dyn FnMut(StreamEvent) + Send + 'a;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub(crate) fn build_http_client(&self, stage: &'static str) -> TransportResult<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .context(BuildClientSnafu { stage })
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalKind {
    Completed,
    Failed(StreamFailure),
}

/// Summary of one `send` call. Exactly one terminal event was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Events handed to the callback, terminal event included.
    pub delivered: usize,
    /// Record lines dropped as protocol errors.
    pub skipped: usize,
    pub terminal: TerminalKind,
}

impl StreamOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.terminal, TerminalKind::Completed)
    }
}

/// Sends one question and streams the answer into a callback.
///
/// Implementations must deliver exactly one terminal event per call, whatever fails.
pub trait ChatTransport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        on_event: &'a mut EventSink<'_>,
    ) -> BoxFuture<'a, StreamOutcome>;
}

/// Folds decoded lines into events and enforces the single-terminal rule.
#[derive(Debug, Default)]
struct StreamDriver {
    decoder: LineDecoder,
    delivered: usize,
    skipped: usize,
    terminal: Option<TerminalKind>,
}

impl StreamDriver {
    fn feed(&mut self, bytes: &[u8], on_event: &mut EventSink<'_>) {
        for (line_number, line) in self.decoder.push(bytes) {
            self.handle_line(line_number, line, on_event);
            if self.terminal.is_some() {
                break;
            }
        }
    }

    fn handle_line(
        &mut self,
        line_number: usize,
        line: Result<String, ProtocolError>,
        on_event: &mut EventSink<'_>,
    ) {
        match line.and_then(|text| decode_record(&text, line_number)) {
            Ok(Some(event)) => self.deliver(event, on_event),
            Ok(None) => {}
            Err(error) => {
                self.skipped += 1;
                tracing::warn!(line_number, error = %error, "skipping undecodable stream line");
            }
        }
    }

    fn deliver(&mut self, event: StreamEvent, on_event: &mut EventSink<'_>) {
        if let Some(terminal) = &self.terminal {
            tracing::debug!(?terminal, "dropping event received after the terminal record");
            return;
        }

        match &event {
            StreamEvent::Fragment { .. } => {}
            StreamEvent::Complete { .. } => self.terminal = Some(TerminalKind::Completed),
            StreamEvent::Failed { failure, .. } => {
                self.terminal = Some(TerminalKind::Failed(failure.clone()));
            }
        }
        self.delivered += 1;
        on_event(event);
    }

    /// Clean end of body: flush the tail, then synthesize a terminal event if none arrived.
    fn finish(mut self, on_event: &mut EventSink<'_>) -> StreamOutcome {
        if self.terminal.is_none()
            && let Some((line_number, line)) = self.decoder.finish()
        {
            self.handle_line(line_number, line, on_event);
        }

        if self.terminal.is_none() {
            tracing::warn!(
                delivered = self.delivered,
                "stream ended without a terminal record"
            );
            self.deliver(StreamEvent::truncated(), on_event);
        }
        self.into_outcome()
    }

    /// Connection-level failure: synthesize the connection-error terminal event.
    fn abort(mut self, on_event: &mut EventSink<'_>) -> StreamOutcome {
        if self.terminal.is_none() {
            self.deliver(StreamEvent::connection_failure(), on_event);
        }
        self.into_outcome()
    }

    fn into_outcome(self) -> StreamOutcome {
        StreamOutcome {
            delivered: self.delivered,
            skipped: self.skipped,
            terminal: self.terminal.unwrap_or(TerminalKind::Failed(StreamFailure::Truncated)),
        }
    }
}

/// Reads `body` to its end (or first terminal record) and reports every event.
///
/// A read error is treated as a connection failure, before or after partial delivery.
pub async fn drive_stream<S, E>(body: S, on_event: &mut EventSink<'_>) -> StreamOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut driver = StreamDriver::default();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                driver.feed(&bytes, on_event);
                if driver.terminal.is_some() {
                    return driver.into_outcome();
                }
            }
            Err(error) => {
                tracing::warn!(
                    delivered = driver.delivered,
                    error = %error,
                    "stream read failed"
                );
                return driver.abort(on_event);
            }
        }
    }

    driver.finish(on_event)
}

/// HTTP client for the answering service's streaming endpoint.
#[derive(Debug, Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl StreamClient {
    pub fn new(config: &ClientConfig) -> TransportResult<Self> {
        Ok(Self {
            http: config.build_http_client("stream-client-new")?,
            base_url: config.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn stream_answer(
        &self,
        request: &ChatRequest,
        on_event: &mut EventSink<'_>,
    ) -> StreamOutcome {
        tracing::debug!(
            correlation_id = request.correlation_id(),
            dataset = request.dataset().wire_name(),
            "opening answer stream"
        );

        match self.open(request).await {
            Ok(response) => drive_stream(response.bytes_stream(), on_event).await,
            Err(error) => {
                tracing::warn!(
                    correlation_id = request.correlation_id(),
                    error = %error,
                    "failed to open answer stream"
                );
                StreamDriver::default().abort(on_event)
            }
        }
    }

    async fn open(&self, request: &ChatRequest) -> TransportResult<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/chat/stream", self.base_url))
            .header(ACCEPT, "text/plain")
            .json(&request.wire_body())
            .send()
            .await
            .context(RequestSnafu {
                stage: "chat-stream-send",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage: "chat-stream-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }
        Ok(response)
    }
}

impl ChatTransport for StreamClient {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        on_event: &'a mut EventSink<'_>,
    ) -> BoxFuture<'a, StreamOutcome> {
        Box::pin(self.stream_answer(request, on_event))
    }
}

/// Replays a recorded byte stream instead of calling the service.
///
/// `failing_after(n)` cuts the connection after `n` chunks, as a dropped socket would.
#[derive(Debug, Clone, Default)]
pub struct ReplayTransport {
    chunks: Vec<Bytes>,
    fail_after: Option<usize>,
}

impl ReplayTransport {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            fail_after: None,
        }
    }

    pub fn failing_after(mut self, chunk_count: usize) -> Self {
        self.fail_after = Some(chunk_count);
        self
    }
}

impl ChatTransport for ReplayTransport {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
        on_event: &'a mut EventSink<'_>,
    ) -> BoxFuture<'a, StreamOutcome> {
        let delivered = self.fail_after.unwrap_or(self.chunks.len());
        let mut items = self
            .chunks
            .iter()
            .take(delivered)
            .cloned()
            .map(Ok::<Bytes, &'static str>)
            .collect::<Vec<_>>();
        if self.fail_after.is_some() {
            items.push(Err("connection reset by peer"));
        }

        tracing::debug!(
            correlation_id = request.correlation_id(),
            chunks = items.len(),
            "replaying recorded answer stream"
        );
        Box::pin(drive_stream(futures::stream::iter(items), on_event))
    }
}
