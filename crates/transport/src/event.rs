use exochat_storage::{PlotSpec, RowSet};
use serde::Deserialize;
use snafu::ResultExt;

use super::error::{EmptyRecordSnafu, MalformedRecordSnafu, ProtocolError};

/// Prefix marking stream lines that carry a record.
pub const RECORD_PREFIX: &str = "data: ";

/// Fragment text of the event synthesized for connection failures.
pub const CONNECTION_ERROR_FRAGMENT: &str = "connection error";

/// Why a stream ended without a successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    /// Connection-level failure: connect error, bad status, or a broken body.
    Transport,
    /// The body ended without a terminal record.
    Truncated,
    /// The service reported an error of its own.
    Application(String),
}

impl StreamFailure {
    /// Short label surfaced inline next to the failed message.
    pub fn label(&self) -> &str {
        match self {
            Self::Transport => "network",
            Self::Truncated => "stream ended unexpectedly",
            Self::Application(message) => message,
        }
    }
}

/// A decoded stream record.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment {
        text: String,
    },
    Complete {
        fragment: Option<String>,
        rows: Option<RowSet>,
        plot: Option<PlotSpec>,
        open_result_view: bool,
    },
    Failed {
        fragment: Option<String>,
        failure: StreamFailure,
    },
}

impl StreamEvent {
    pub(crate) fn connection_failure() -> Self {
        Self::Failed {
            fragment: Some(CONNECTION_ERROR_FRAGMENT.to_string()),
            failure: StreamFailure::Transport,
        }
    }

    pub(crate) fn truncated() -> Self {
        Self::Failed {
            fragment: None,
            failure: StreamFailure::Truncated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Fragment { .. })
    }

    pub fn fragment(&self) -> Option<&str> {
        match self {
            Self::Fragment { text } => Some(text),
            Self::Complete { fragment, .. } | Self::Failed { fragment, .. } => fragment.as_deref(),
        }
    }
}

/// Wire shape of one record; every field is optional and `null` means absent.
#[derive(Debug, Default, Deserialize)]
struct WireRecord {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    data: Option<RowSet>,
    #[serde(default)]
    plot: Option<serde_json::Value>,
    #[serde(default)]
    open_new_tab: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

impl WireRecord {
    fn into_event(self, line_number: usize) -> Result<StreamEvent, ProtocolError> {
        let fragment = self.chunk.filter(|chunk| !chunk.is_empty());

        if let Some(error) = self.error {
            return Ok(StreamEvent::Failed {
                fragment,
                failure: StreamFailure::Application(error),
            });
        }

        if self.done.unwrap_or(false) {
            return Ok(StreamEvent::Complete {
                fragment,
                rows: self.data,
                plot: self.plot.filter(|plot| !plot.is_null()).map(PlotSpec),
                open_result_view: self.open_new_tab.unwrap_or(false),
            });
        }

        match fragment {
            Some(text) => Ok(StreamEvent::Fragment { text }),
            None => EmptyRecordSnafu {
                stage: "decode-record-classify",
                line_number,
            }
            .fail(),
        }
    }
}

/// Decodes one stream line.
///
/// Returns `Ok(None)` for lines without the record prefix; those are not records.
pub fn decode_record(line: &str, line_number: usize) -> Result<Option<StreamEvent>, ProtocolError> {
    let Some(payload) = line.strip_prefix(RECORD_PREFIX) else {
        return Ok(None);
    };

    let record: WireRecord = serde_json::from_str(payload).context(MalformedRecordSnafu {
        stage: "decode-record-parse",
        line_number,
    })?;
    record.into_event(line_number).map(Some)
}
