use std::sync::Arc;

use exochat_storage::{
    ConversationStore, Dataset, Message, MessageId, MessagePatch, MessageStore, NewQueryResponse,
    PatchOutcome, PlotSpec, QueryId, QueryResponseStore, RowSet,
};
use exochat_transport::{ChatRequest, ChatTransport, StreamEvent, StreamOutcome, ValidationResult};

use crate::navigation::{NavigationBridge, ViewKind};

/// Ids produced by one question/answer round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    /// Set when the answer materialized a structured result.
    pub query_id: Option<QueryId>,
    pub outcome: StreamOutcome,
}

/// Sends questions and folds the streamed answers into the conversation store.
#[derive(Clone)]
pub struct ChatSession {
    store: ConversationStore,
    transport: Arc<dyn ChatTransport>,
    navigation: Option<NavigationBridge>,
}

impl ChatSession {
    pub fn new(store: ConversationStore, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            store,
            transport,
            navigation: None,
        }
    }

    /// Focuses the results view whenever an answer asks for it.
    pub fn with_navigation(mut self, navigation: NavigationBridge) -> Self {
        self.navigation = Some(navigation);
        self
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Validates `text`, records it, and streams the answer into the store.
    ///
    /// Validation failures return before any store mutation or network activity.
    /// Transport failures never surface here: they end the answer with an inline
    /// error and are reported through [`Exchange::outcome`].
    pub async fn send_message(&self, text: &str, dataset: Dataset) -> ValidationResult<Exchange> {
        let request = ChatRequest::new(text, dataset, 0)?;

        let user_message_id = self.store.next_message_id();
        if let Err(error) = self.store.append_message(Message::user(user_message_id, text)) {
            tracing::error!(message_id = %user_message_id, error = %error, "failed to record user message");
        }

        let assistant_message_id = self.store.next_message_id();
        let request = request.with_correlation_id(assistant_message_id.as_u64());
        tracing::info!(
            message_id = %assistant_message_id,
            dataset = dataset.wire_name(),
            "sending question"
        );

        let mut assembly = AnswerAssembly::new(&self.store, assistant_message_id, dataset);
        let outcome = self
            .transport
            .send(&request, &mut |event| assembly.apply(event))
            .await;
        let query_id = assembly.query_id;
        let open_result_view = assembly.open_result_view;

        tracing::info!(
            message_id = %assistant_message_id,
            delivered = outcome.delivered,
            skipped = outcome.skipped,
            completed = outcome.is_completed(),
            "answer stream finished"
        );

        if open_result_view
            && let (Some(query_id), Some(navigation)) = (query_id, &self.navigation)
        {
            navigation.focus(ViewKind::Results, query_id);
        }

        Ok(Exchange {
            user_message_id,
            assistant_message_id,
            query_id,
            outcome,
        })
    }
}

/// Running state of one assistant answer while its stream is open.
struct AnswerAssembly<'a> {
    store: &'a ConversationStore,
    message_id: MessageId,
    dataset: Dataset,
    text: String,
    created: bool,
    query_id: Option<QueryId>,
    open_result_view: bool,
}

impl<'a> AnswerAssembly<'a> {
    fn new(store: &'a ConversationStore, message_id: MessageId, dataset: Dataset) -> Self {
        Self {
            store,
            message_id,
            dataset,
            text: String::new(),
            created: false,
            query_id: None,
            open_result_view: false,
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Fragment { text } => {
                self.text.push_str(&text);
                self.patch(MessagePatch::text(self.text.clone()));
            }
            StreamEvent::Complete {
                fragment,
                rows,
                plot,
                open_result_view,
            } => {
                if let Some(fragment) = fragment {
                    self.text.push_str(&fragment);
                }
                self.patch(MessagePatch::finished(self.text.clone()));
                if open_result_view && (rows.is_some() || plot.is_some()) {
                    self.materialize(rows, plot);
                    self.open_result_view = true;
                }
            }
            StreamEvent::Failed { failure, .. } => {
                tracing::warn!(
                    message_id = %self.message_id,
                    failure = failure.label(),
                    received_chars = self.text.chars().count(),
                    "answer stream failed"
                );
                self.patch(MessagePatch::failed(failure.label()));
            }
        }
    }

    /// The first event creates the assistant message; later ones patch it.
    fn patch(&mut self, patch: MessagePatch) {
        if !self.created {
            let message = Message::assistant_streaming(self.message_id, String::new());
            if let Err(error) = self.store.append_message(message) {
                tracing::error!(message_id = %self.message_id, error = %error, "failed to create assistant message");
            }
            self.created = true;
        }

        if self.store.patch_message(self.message_id, patch) != PatchOutcome::Applied {
            tracing::warn!(message_id = %self.message_id, "assistant message patch was not applied");
        }
    }

    fn materialize(&mut self, rows: Option<RowSet>, plot: Option<PlotSpec>) {
        let fields = NewQueryResponse {
            message_id: self.message_id,
            dataset: self.dataset,
            response_text: self.text.clone(),
            inline_rows: rows,
            plot,
        };

        match self.store.append_query_response(fields) {
            Ok(query_id) => {
                self.store
                    .patch_message(self.message_id, MessagePatch::attach_query(query_id));
                self.query_id = Some(query_id);
            }
            Err(error) => {
                tracing::error!(message_id = %self.message_id, error = %error, "failed to record query response");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use exochat_storage::Sender;
    use exochat_transport::{ReplayTransport, StreamFailure, TerminalKind, ValidationError};
    use serde_json::{Value, json};

    use super::*;
    use crate::navigation::FocusId;

    fn record(value: Value) -> String {
        format!("data: {value}\n\n")
    }

    fn planets(count: usize) -> Vec<Value> {
        (0..count)
            .map(|index| json!({"pl_name": format!("K2-{index} b"), "pl_rade": 1.5}))
            .collect()
    }

    fn session(transport: ReplayTransport) -> ChatSession {
        ChatSession::new(ConversationStore::new(), Arc::new(transport))
    }

    fn transiting_planets_answer() -> ReplayTransport {
        ReplayTransport::new(vec![
            record(json!({"chunk": "Found ", "done": false})),
            record(json!({"chunk": "12 ", "done": false})),
            record(json!({
                "chunk": "planets.",
                "done": true,
                "data": planets(12),
                "open_new_tab": true
            })),
        ])
    }

    #[tokio::test]
    async fn completed_answer_materializes_one_query_response() {
        let session = session(transiting_planets_answer());
        let exchange = session
            .send_message("List transiting planets", Dataset::K2)
            .await
            .unwrap();

        assert!(exchange.outcome.is_completed());
        let store = session.store();
        let messages = store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sender, Sender::User);
        assert_eq!(messages[0].text, "List transiting planets");

        let answer = store.message(exchange.assistant_message_id).unwrap();
        assert_eq!(answer.text, "Found 12 planets.");
        assert!(!answer.streaming);
        assert_eq!(answer.error, None);

        let responses = store.query_responses();
        assert_eq!(responses.len(), 1);
        let query_id = exchange.query_id.unwrap();
        assert_eq!(query_id.as_u64(), exchange.assistant_message_id.as_u64());
        assert_eq!(answer.query_id, Some(query_id));
        assert_eq!(responses[0].dataset, Dataset::K2);
        assert_eq!(responses[0].inline_rows.as_ref().map(Vec::len), Some(12));
        assert_eq!(responses[0].response_text, "Found 12 planets.");
    }

    #[tokio::test]
    async fn network_failure_keeps_received_fragments() {
        let transport = ReplayTransport::new(vec![
            record(json!({"chunk": "Found "})),
            record(json!({"chunk": "12 "})),
            record(json!({"chunk": "planets.", "done": true})),
        ])
        .failing_after(2);
        let session = session(transport);

        let exchange = session
            .send_message("List transiting planets", Dataset::Toi)
            .await
            .unwrap();

        assert_eq!(
            exchange.outcome.terminal,
            TerminalKind::Failed(StreamFailure::Transport)
        );
        let answer = session.store().message(exchange.assistant_message_id).unwrap();
        assert_eq!(answer.text, "Found 12 ");
        assert!(!answer.streaming);
        assert_eq!(answer.error.as_deref(), Some("network"));
        assert_eq!(exchange.query_id, None);
        assert!(session.store().query_responses().is_empty());
    }

    #[tokio::test]
    async fn malformed_line_has_no_visible_effect() {
        let body = [
            record(json!({"chunk": "Kepler-22 b "})),
            "data: {\"chunk\": \"broken\"\n".to_string(),
            record(json!({"chunk": "is in the habitable zone.", "done": true})),
        ]
        .concat();
        let session = session(ReplayTransport::new(vec![body]));

        let exchange = session
            .send_message("Is Kepler-22 b habitable?", Dataset::Cumulative)
            .await
            .unwrap();

        assert_eq!(exchange.outcome.skipped, 1);
        let answer = session.store().message(exchange.assistant_message_id).unwrap();
        assert_eq!(answer.text, "Kepler-22 b is in the habitable zone.");
        assert_eq!(answer.error, None);
    }

    #[tokio::test]
    async fn application_error_is_shown_inline() {
        let transport = ReplayTransport::new(vec![
            record(json!({"chunk": "Looking up "})),
            record(json!({"chunk": "", "error": "table toi is unavailable"})),
        ]);
        let session = session(transport);

        let exchange = session
            .send_message("Count TOI candidates", Dataset::Toi)
            .await
            .unwrap();

        let answer = session.store().message(exchange.assistant_message_id).unwrap();
        assert_eq!(answer.text, "Looking up ");
        assert_eq!(answer.error.as_deref(), Some("table toi is unavailable"));
        assert!(!answer.streaming);
    }

    #[tokio::test]
    async fn invalid_question_touches_nothing() {
        let session = session(transiting_planets_answer());

        let error = session.send_message("   ", Dataset::K2).await.unwrap_err();
        assert!(matches!(error, ValidationError::EmptyMessage { .. }));

        let too_long = "a".repeat(1001);
        let error = session.send_message(&too_long, Dataset::K2).await.unwrap_err();
        assert!(matches!(error, ValidationError::MessageTooLong { .. }));

        assert!(session.store().messages().is_empty());
        assert_eq!(session.store().revision(), 0);
    }

    #[tokio::test]
    async fn result_without_view_request_is_not_materialized() {
        let transport = ReplayTransport::new(vec![record(json!({
            "chunk": "Here are the rows.",
            "done": true,
            "data": planets(3),
            "open_new_tab": false
        }))]);
        let session = session(transport);

        let exchange = session.send_message("Show rows", Dataset::K2).await.unwrap();
        assert_eq!(exchange.query_id, None);
        assert!(session.store().query_responses().is_empty());
    }

    #[tokio::test]
    async fn results_view_is_focused_on_the_new_query() {
        let navigation = NavigationBridge::new();
        let focused = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&focused);
        navigation.register(ViewKind::Results, move |id| sink.lock().unwrap().push(id));

        let session = session(transiting_planets_answer()).with_navigation(navigation);
        let exchange = session
            .send_message("List transiting planets", Dataset::K2)
            .await
            .unwrap();

        let query_id = exchange.query_id.unwrap();
        assert_eq!(*focused.lock().unwrap(), vec![FocusId::from(query_id)]);
    }

    #[tokio::test]
    async fn listeners_see_the_answer_grow() {
        let session = session(transiting_planets_answer());
        let store = session.store().clone();
        let notifications = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&notifications);
        let texts = Arc::clone(&observed);
        let view = store.clone();
        let _subscription = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(answer) = view.messages().iter().rev().find(|message| message.is_assistant()) {
                texts.lock().unwrap().push(answer.text.clone());
            }
        });

        session
            .send_message("List transiting planets", Dataset::K2)
            .await
            .unwrap();

        let texts = observed.lock().unwrap();
        assert!(texts.contains(&"Found ".to_string()));
        assert!(texts.contains(&"Found 12 ".to_string()));
        assert_eq!(texts.last().map(String::as_str), Some("Found 12 planets."));
        assert!(notifications.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn consecutive_questions_get_distinct_ids() {
        let session = session(transiting_planets_answer());
        let first = session.send_message("first", Dataset::K2).await.unwrap();
        let second = session.send_message("second", Dataset::K2).await.unwrap();

        assert_eq!(first.user_message_id, MessageId::new(0));
        assert_eq!(first.assistant_message_id, MessageId::new(1));
        assert_eq!(second.user_message_id, MessageId::new(2));
        assert_eq!(second.query_id.map(|id| id.as_u64()), Some(3));
        assert_eq!(session.store().query_responses().len(), 2);
    }
}
