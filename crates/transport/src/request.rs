use exochat_storage::Dataset;
use serde::Serialize;
use snafu::{OptionExt, ensure};

use super::error::{
    EmptyMessageSnafu, MessageTooLongSnafu, UnknownDatasetSnafu, ValidationResult,
};

pub const MAX_MESSAGE_CHARS: usize = 1000;

/// Characters the answering service never receives.
const STRIPPED_CHARACTERS: [char; 5] = ['<', '>', '"', '\'', '&'];

/// A validated, sanitized question ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    text: String,
    dataset: Dataset,
    correlation_id: u64,
}

impl ChatRequest {
    /// Validates `text` and strips markup-sensitive characters.
    ///
    /// `correlation_id` is echoed by the service as the query id of any result it caches.
    pub fn new(
        text: impl AsRef<str>,
        dataset: Dataset,
        correlation_id: u64,
    ) -> ValidationResult<Self> {
        let text = text.as_ref();
        ensure!(
            !text.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "chat-request-validate"
            }
        );

        let length = text.chars().count();
        ensure!(
            length <= MAX_MESSAGE_CHARS,
            MessageTooLongSnafu {
                stage: "chat-request-validate",
                length,
                max: MAX_MESSAGE_CHARS,
            }
        );

        let sanitized = text
            .chars()
            .filter(|character| !STRIPPED_CHARACTERS.contains(character))
            .collect::<String>();
        ensure!(
            !sanitized.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "chat-request-sanitize"
            }
        );

        Ok(Self {
            text: sanitized,
            dataset,
            correlation_id,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Rebinds an already validated request to another correlation id.
    pub fn with_correlation_id(mut self, correlation_id: u64) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub(crate) fn wire_body(&self) -> ChatRequestBody<'_> {
        ChatRequestBody {
            message: &self.text,
            table: self.dataset.wire_name(),
            query_id: self.correlation_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequestBody<'a> {
    pub message: &'a str,
    pub table: &'static str,
    pub query_id: u64,
}

/// Parses a user-supplied dataset selector (`k2`, `toi`, `cum` or `kepler`).
pub fn parse_dataset(raw: &str) -> ValidationResult<Dataset> {
    Dataset::from_wire(raw).context(UnknownDatasetSnafu {
        stage: "parse-dataset",
        raw: raw.to_string(),
    })
}
