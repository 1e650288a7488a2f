use serde::{Deserialize, Serialize};

use super::ids::{MessageId, QueryId};

/// One result row: column name to JSON cell value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Ordered rows as delivered by the answering service.
pub type RowSet = Vec<Row>;

/// Opaque plot description; the service sends a serialized figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlotSpec(pub serde_json::Value);

/// Tabular dataset a conversation turn is asked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dataset {
    #[serde(rename = "k2")]
    K2,
    #[serde(rename = "toi")]
    Toi,
    #[serde(rename = "cum", alias = "kepler")]
    Cumulative,
}

impl Dataset {
    pub const ALL: [Dataset; 3] = [Dataset::K2, Dataset::Toi, Dataset::Cumulative];

    /// Table name used on the wire.
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::K2 => "k2",
            Self::Toi => "toi",
            Self::Cumulative => "cum",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::K2 => "K2 Mission Data",
            Self::Toi => "TESS Objects of Interest",
            Self::Cumulative => "Cumulative Exoplanet Data",
        }
    }

    /// Accepts the wire names plus the `kepler` alias for the cumulative table.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "k2" => Some(Self::K2),
            "toi" => Some(Self::Toi),
            "cum" | "kepler" => Some(Self::Cumulative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub sender: Sender,
    pub streaming: bool,
    pub query_id: Option<QueryId>,
    pub error: Option<String>,
}

impl Message {
    /// A finished user message; user turns never stream.
    pub fn user(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            sender: Sender::User,
            streaming: false,
            query_id: None,
            error: None,
        }
    }

    /// An assistant message that is still receiving fragments.
    pub fn assistant_streaming(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            sender: Sender::Assistant,
            streaming: true,
            query_id: None,
            error: None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self.sender, Sender::Assistant)
    }
}

/// Shallow merge-patch; `None` fields leave the record untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub streaming: Option<bool>,
    pub query_id: Option<QueryId>,
    pub error: Option<String>,
}

impl MessagePatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            streaming: Some(false),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            streaming: Some(false),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn attach_query(query_id: QueryId) -> Self {
        Self {
            query_id: Some(query_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.streaming.is_none()
            && self.query_id.is_none()
            && self.error.is_none()
    }
}

/// Result of [`crate::ConversationStore::patch_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    /// No message with that id; the patch was dropped.
    Missing,
    /// The message already finished streaming and the patch touched frozen fields.
    Frozen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub query_id: QueryId,
    pub dataset: Dataset,
    pub response_text: String,
    pub inline_rows: Option<RowSet>,
    pub plot: Option<PlotSpec>,
    pub created_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewQueryResponse {
    pub message_id: MessageId,
    pub dataset: Dataset,
    pub response_text: String,
    pub inline_rows: Option<RowSet>,
    pub plot: Option<PlotSpec>,
}
