use std::sync::Arc;

pub mod error;
pub mod ids;
pub mod memory;
mod notify;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, QueryId};
pub use memory::ConversationStore;
pub use notify::{Listener, Subscription};
pub use types::{
    Dataset, Message, MessagePatch, NewQueryResponse, PatchOutcome, PlotSpec, QueryResponse, Row,
    RowSet, Sender,
};

pub trait MessageStore: Send + Sync {
    /// Allocates the next message id; ids start at 0 and never repeat.
    fn next_message_id(&self) -> MessageId;
    fn append_message(&self, message: Message) -> StorageResult<()>;
    /// Shallow-merges `patch` into the message with `id`. Unknown ids are a no-op.
    fn patch_message(&self, id: MessageId, patch: MessagePatch) -> PatchOutcome;
    fn messages(&self) -> Arc<Vec<Message>>;
    fn message(&self, id: MessageId) -> Option<Message>;
}

pub trait QueryResponseStore: Send + Sync {
    /// Materializes the structured result of a finished assistant message.
    fn append_query_response(&self, fields: NewQueryResponse) -> StorageResult<QueryId>;
    fn query_responses(&self) -> Arc<Vec<QueryResponse>>;
    fn query_response(&self, query_id: QueryId) -> Option<QueryResponse>;
}

pub trait ConversationState: MessageStore + QueryResponseStore {}

impl<T> ConversationState for T where T: MessageStore + QueryResponseStore {}
