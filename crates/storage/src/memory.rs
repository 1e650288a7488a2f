use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ensure};
use tokio::sync::watch;

use super::error::{ConflictSnafu, InvariantViolationSnafu, NotFoundSnafu, StorageResult};
use super::ids::{MessageId, QueryId};
use super::notify::{Listener, Notifier, Subscription, lock};
use super::types::{Message, MessagePatch, NewQueryResponse, PatchOutcome, QueryResponse};
use super::{MessageStore, QueryResponseStore};

#[derive(Default)]
struct StoreState {
    messages: Arc<Vec<Message>>,
    query_responses: Arc<Vec<QueryResponse>>,
    next_message_id: u64,
    revision: u64,
}

impl StoreState {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// In-process conversation state shared by every view.
///
/// Cloning is cheap and yields another handle to the same state. Collections are
/// copy-on-write, so a snapshot returned by `messages()` stays valid after later
/// mutations.
#[derive(Clone)]
pub struct ConversationStore {
    state: Arc<Mutex<StoreState>>,
    notifier: Arc<Notifier>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            notifier: Arc::new(Notifier::new()),
        }
    }

    /// Registers a change listener invoked with the store revision after mutations.
    ///
    /// Several mutations may collapse into one call; the payload is a change signal,
    /// not a diff. Re-read the collections inside the listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.notifier.register(listener)
    }

    /// Revision channel for async consumers; `changed()` coalesces bursts of mutations.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.notifier.watch()
    }

    pub fn revision(&self) -> u64 {
        lock(&self.state).revision
    }

    pub fn subscriber_count(&self) -> usize {
        self.notifier.listener_count()
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut StoreState) -> (T, bool)) -> T {
        let (result, revision) = {
            let mut state = lock(&self.state);
            let (result, changed) = apply(&mut state);
            let revision = changed.then(|| state.bump());
            (result, revision)
        };

        // Flush boundary: the state lock is released before listeners run.
        if let Some(revision) = revision {
            self.notifier.publish(revision);
        }
        result
    }
}

impl MessageStore for ConversationStore {
    fn next_message_id(&self) -> MessageId {
        let mut state = lock(&self.state);
        let id = MessageId::new(state.next_message_id);
        state.next_message_id += 1;
        id
    }

    fn append_message(&self, message: Message) -> StorageResult<()> {
        self.mutate(|state| {
            if state.messages.iter().any(|existing| existing.id == message.id) {
                let result = ConflictSnafu {
                    stage: "append-message",
                    entity: "message",
                    details: format!("message id {} is already present", message.id),
                }
                .fail();
                return (result, false);
            }

            // Ids handed out by `next_message_id` are always below the allocator cursor.
            if message.id.as_u64() >= state.next_message_id {
                state.next_message_id = message.id.as_u64() + 1;
            }

            tracing::debug!(message_id = %message.id, sender = ?message.sender, "append message");
            Arc::make_mut(&mut state.messages).push(message);
            (Ok(()), true)
        })
    }

    fn patch_message(&self, id: MessageId, patch: MessagePatch) -> PatchOutcome {
        self.mutate(|state| {
            let Some(index) = state.messages.iter().position(|message| message.id == id) else {
                tracing::debug!(message_id = %id, "patch for unknown message ignored");
                return (PatchOutcome::Missing, false);
            };

            let current = &state.messages[index];
            let mut next = current.clone();
            let mut frozen = false;

            if current.streaming {
                if let Some(text) = patch.text {
                    next.text = text;
                }
                if let Some(streaming) = patch.streaming {
                    next.streaming = streaming;
                }
                if let Some(error) = patch.error {
                    next.error = Some(error);
                }
            } else {
                frozen |= patch.text.is_some_and(|text| text != current.text);
                frozen |= patch.streaming.is_some_and(|streaming| streaming);
                frozen |= patch
                    .error
                    .is_some_and(|error| current.error.as_deref() != Some(error.as_str()));
            }

            // A result id may be attached once, even after streaming finished.
            if let Some(query_id) = patch.query_id {
                match current.query_id {
                    None => next.query_id = Some(query_id),
                    Some(existing) if existing == query_id => {}
                    Some(_) => frozen = true,
                }
            }

            if frozen {
                tracing::warn!(message_id = %id, "patch touched frozen fields of a finished message");
            }

            let changed = next != *current;
            if changed {
                Arc::make_mut(&mut state.messages)[index] = next;
            }

            let outcome = if frozen {
                PatchOutcome::Frozen
            } else {
                PatchOutcome::Applied
            };
            (outcome, changed)
        })
    }

    fn messages(&self) -> Arc<Vec<Message>> {
        Arc::clone(&lock(&self.state).messages)
    }

    fn message(&self, id: MessageId) -> Option<Message> {
        lock(&self.state)
            .messages
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }
}

impl QueryResponseStore for ConversationStore {
    fn append_query_response(&self, fields: NewQueryResponse) -> StorageResult<QueryId> {
        self.mutate(|state| {
            let result = insert_query_response(state, fields);
            let changed = result.is_ok();
            (result, changed)
        })
    }

    fn query_responses(&self) -> Arc<Vec<QueryResponse>> {
        Arc::clone(&lock(&self.state).query_responses)
    }

    fn query_response(&self, query_id: QueryId) -> Option<QueryResponse> {
        lock(&self.state)
            .query_responses
            .iter()
            .find(|response| response.query_id == query_id)
            .cloned()
    }
}

fn insert_query_response(state: &mut StoreState, fields: NewQueryResponse) -> StorageResult<QueryId> {
    let message = state
        .messages
        .iter()
        .find(|message| message.id == fields.message_id)
        .context(NotFoundSnafu {
            stage: "append-query-response-find-message",
            entity: "message",
            id: fields.message_id.to_string(),
        })?;

    ensure!(
        message.is_assistant(),
        InvariantViolationSnafu {
            stage: "append-query-response-check-sender",
            details: format!(
                "query responses must belong to an assistant message, {} is a user message",
                fields.message_id
            ),
        }
    );

    let query_id = QueryId::from(fields.message_id);
    ensure!(
        !state
            .query_responses
            .iter()
            .any(|response| response.query_id == query_id),
        ConflictSnafu {
            stage: "append-query-response-unique",
            entity: "query-response",
            details: format!("query {query_id} already has a response"),
        }
    );

    tracing::debug!(
        query_id = %query_id,
        dataset = fields.dataset.wire_name(),
        inline_rows = fields.inline_rows.as_ref().map_or(0, Vec::len),
        has_plot = fields.plot.is_some(),
        "append query response"
    );

    Arc::make_mut(&mut state.query_responses).push(QueryResponse {
        query_id,
        dataset: fields.dataset,
        response_text: fields.response_text,
        inline_rows: fields.inline_rows,
        plot: fields.plot,
        created_at_unix_seconds: current_unix_timestamp_seconds(),
    });
    Ok(query_id)
}

fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
